//! Hydra Automaton
//!
//! A replicated state machine built from composable parts and driven by a
//! totally ordered, segmented mutation log.
//!
//! # Overview
//!
//! Business logic lives in [`AutomatonPart`]s registered with a
//! [`CompositeAutomaton`]. The [`DecoratedAutomaton`] wraps the composite and
//! owns the log pipeline: mutations are logged at the leader (or received at
//! a follower), queued as pending, and applied in log order once committed.
//! Snapshots bound the replay performed by [`Recovery`].
//!
//! # Key Components
//!
//! - **Composite**: part registry, snapshot save/load, mutation dispatch
//! - **Decorated**: versions, peer state machine, commit loop, rotation
//! - **Stores**: file-backed changelogs and snapshots
//! - **Gate**: user/system exclusion with guarded invokers
//! - **Response keeper**: idempotent retries keyed by mutation id
//!
//! # Example
//!
//! ```ignore
//! use hydra_automaton::prelude::*;
//!
//! let mut composite = CompositeAutomaton::new();
//! composite.register_part(Arc::new(MyPart::default()))?;
//!
//! let automaton = DecoratedAutomaton::builder(config, composite).build()?;
//! automaton.start_leading()?;
//! Recovery::new(Arc::clone(&automaton)).run().await?;
//! automaton.leader_recovery_complete()?;
//!
//! let logged = automaton.log_mutation_at_leader(MutationRequest::json("Put", &entry)?)?;
//! logged.log_future.await?;
//! automaton.commit_mutations(automaton.logged_version())?;
//! let response = await_commit(logged.commit).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composite;
pub mod config;
pub mod decorated;
pub mod error;
pub mod invoker;
pub mod lock;
pub mod metrics;
pub mod mutation;
pub mod prelude;
pub mod recovery;
pub mod response_keeper;
pub mod serialize;
pub mod store;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by asynchronous automaton operations.
pub type AutomatonFuture<'a, T> = Pin<Box<dyn Future<Output = error::Result<T>> + Send + 'a>>;

// Re-export key types at crate root for convenience
pub use composite::{AsyncSaveContinuation, AutomatonPart, CompositeAutomaton, PartEvent, PartRegistrar};
pub use config::AutomatonConfig;
pub use decorated::{DecoratedAutomaton, LoggedMutation, PeerState, RemoteSnapshotParams};
pub use error::{AutomatonError, Result};
pub use invoker::{GuardedUserInvoker, Invoker, SerialInvoker, SystemInvoker};
pub use lock::UserSystemGate;
pub use metrics::AutomatonMetrics;
pub use mutation::{CommitReceiver, MutationContext, MutationRequest, MutationResponse, await_commit};
pub use recovery::Recovery;
pub use response_keeper::ResponseKeeper;
