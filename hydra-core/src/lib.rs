//! Hydra Core Library
//!
//! Shared primitives for the hydra replicated automaton. Everything in this
//! crate is independent of how the automaton itself is driven, so that stores,
//! tooling and the automaton can agree on the same log vocabulary.
//!
//! # Key Components
//!
//! - **Version**: a `(segment_id, record_id)` position in the mutation log
//! - **Record**: the on-disk framing of a single changelog record
//! - **Providers**: clock and RNG abstractions used to capture deterministic
//!   timestamps and random seeds at log time
//! - **Logging**: tracing subscriber setup
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use hydra_core::record::{MutationHeader, MutationRecord};
//! use hydra_core::Version;
//!
//! let record = MutationRecord::new(
//!     MutationHeader::new("SetKey", None, 1_700_000_000_000, 42),
//!     Bytes::from_static(b"payload"),
//! );
//! let bytes = record.to_bytes().unwrap();
//! let decoded = MutationRecord::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded.header.mutation_type, "SetKey");
//!
//! assert!(Version::new(1, 5) < Version::new(2, 0));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod logging;
pub mod providers;
pub mod record;
pub mod types;

pub use error::{HydraError, Result};
pub use record::{MutationHeader, MutationRecord};
pub use types::{MutationId, Version};
