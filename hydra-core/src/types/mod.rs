//! Strongly-typed identifiers and log positions.

mod ids;
mod version;

pub use ids::MutationId;
pub use version::Version;
