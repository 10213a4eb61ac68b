//! Prelude for convenient imports.
//!
//! ```ignore
//! use hydra_automaton::prelude::*;
//! ```

// Log vocabulary
pub use hydra_core::{MutationId, Version};

// Error handling
pub use crate::error::{AutomatonError, Result};

// Parts
pub use crate::composite::{
    AsyncSaveContinuation, AutomatonPart, CompositeAutomaton, PartEvent, PartRegistrar,
};
pub use crate::serialize::{
    AsyncSerializationPriority, EntitySerializationKey, LoadContext, SaveContext,
    SyncSerializationPriority,
};

// Pipeline
pub use crate::config::AutomatonConfig;
pub use crate::decorated::{DecoratedAutomaton, LoggedMutation, PeerState, RemoteSnapshotParams};
pub use crate::mutation::{
    CommitReceiver, MutationContext, MutationRequest, MutationResponse, await_commit,
};
pub use crate::recovery::Recovery;

// Concurrency
pub use crate::invoker::{GuardedUserInvoker, Invoker, SerialInvoker, SystemInvoker, run_via};
pub use crate::lock::UserSystemGate;

pub use std::sync::Arc;
