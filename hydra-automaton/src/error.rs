//! Error types for automaton operations.

use crate::decorated::PeerState;
use hydra_core::{HydraError, Version};
use thiserror::Error;

/// Result type for automaton operations.
pub type Result<T> = std::result::Result<T, AutomatonError>;

/// Errors raised while driving the automaton.
///
/// Errors for which [`AutomatonError::is_fatal`] holds mean this replica may
/// have diverged from its peers; the decorated automaton refuses further work
/// after observing one until it is cleared.
#[derive(Debug, Error)]
pub enum AutomatonError {
    /// Changelog, snapshot store or record codec failure.
    #[error("{0}")]
    Storage(#[from] HydraError),

    // =========================================================================
    // Snapshot Errors (H300-H399)
    // =========================================================================
    /// The snapshot build did not finish in time.
    #[error("H305: Snapshot {snapshot_id} build timed out after {timeout_ms}ms")]
    SnapshotTimeout {
        /// The snapshot being built.
        snapshot_id: u64,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The snapshot stream is malformed.
    #[error("H306: Malformed snapshot: {cause}")]
    SnapshotFormat {
        /// Description of the problem.
        cause: String,
    },

    /// A part refused the snapshot format version.
    #[error("H307: Snapshot format version {version} rejected by part '{part}'")]
    SnapshotVersionUnsupported {
        /// The format version found in the snapshot.
        version: u32,
        /// The part that rejected it.
        part: String,
    },

    /// The automaton moved past a snapshot's version before it was scheduled.
    #[error("H308: Automaton version {automaton} is past snapshot version {version}")]
    SnapshotVersionPassed {
        /// The version the snapshot would capture.
        version: Version,
        /// The automaton version at scheduling time.
        automaton: Version,
    },

    // =========================================================================
    // Consistency Errors (H400-H499)
    // =========================================================================
    /// No handler is registered for the mutation type.
    #[error("H401: No handler registered for mutation type '{mutation_type}'")]
    UnknownMutationType {
        /// The unknown type.
        mutation_type: String,
    },

    /// A pending mutation does not follow the automaton version.
    #[error("H402: Mutation at version {actual} does not follow automaton version {expected}")]
    OutOfOrderMutation {
        /// The automaton version the mutation should have continued from.
        expected: Version,
        /// The version recorded for the mutation.
        actual: Version,
    },

    /// A mutation context was created while another was still active.
    #[error("H403: Mutation context is already active at version {version}")]
    ReentrantMutationContext {
        /// Version of the context that was being created.
        version: Version,
    },

    /// The automaton version did not reach the commit target.
    #[error("H404: Automaton version {automaton} is behind commit target {target}")]
    VersionRegression {
        /// The automaton version after the commit.
        automaton: Version,
        /// The requested commit version.
        target: Version,
    },

    /// Rotation observed a logged version outside the changelog being rotated.
    #[error("H405: Logged version {logged} does not belong to changelog {changelog_id}")]
    ChangelogMismatch {
        /// The logged version at rotation time.
        logged: Version,
        /// The changelog that was rotated.
        changelog_id: u64,
    },

    /// A changelog does not continue where its predecessor ends.
    #[error(
        "H406: Changelog {changelog_id} follows {expected} records but its predecessor holds {actual}"
    )]
    ChangelogChainBroken {
        /// The changelog whose link is broken.
        changelog_id: u64,
        /// Record count of the predecessor as recorded by this changelog.
        expected: u64,
        /// Actual record count of the predecessor.
        actual: u64,
    },

    // =========================================================================
    // Peer State Errors (H500-H599)
    // =========================================================================
    /// The requested peer state transition is not allowed.
    #[error("H501: Invalid peer state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: PeerState,
        /// Requested state.
        to: PeerState,
    },

    /// The operation is not allowed in the current peer state.
    #[error("H502: Operation '{operation}' is not allowed in state {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The current state.
        state: PeerState,
    },

    /// The automaton stopped after a fatal error.
    #[error("H503: Automaton is faulted: {cause}")]
    Faulted {
        /// The fatal error that faulted the automaton.
        cause: String,
    },

    /// The operation was abandoned before completing.
    #[error("H504: Operation cancelled: {reason}")]
    Cancelled {
        /// Why the operation was abandoned.
        reason: String,
    },

    // =========================================================================
    // Part Errors (H600-H699)
    // =========================================================================
    /// A mutation handler failed.
    #[error("H601: Handler for mutation type '{mutation_type}' failed: {cause}")]
    HandlerFailed {
        /// The mutation type being applied.
        mutation_type: String,
        /// The handler's error.
        cause: String,
    },

    /// A snapshot saver failed.
    #[error("H602: Saver '{name}' failed: {cause}")]
    SaverFailed {
        /// The saver name.
        name: String,
        /// The saver's error.
        cause: String,
    },

    /// A snapshot loader failed.
    #[error("H603: Loader '{name}' failed: {cause}")]
    LoaderFailed {
        /// The loader name.
        name: String,
        /// The loader's error.
        cause: String,
    },

    /// Two registrations used the same key.
    #[error("H604: Duplicate {kind} registration '{name}' by part '{part}'")]
    DuplicateRegistration {
        /// The kind of registration (saver, loader, method).
        kind: &'static str,
        /// The duplicated key.
        name: String,
        /// The part attempting the registration.
        part: String,
    },

    /// Error raised by part business logic.
    #[error("H605: {0}")]
    Part(String),

    /// An entity key did not resolve during load.
    #[error("H606: Entity key {key} is not registered{detail}")]
    UnresolvedEntity {
        /// The unresolved key.
        key: i32,
        /// Extra detail, e.g. a type mismatch.
        detail: String,
    },

    // =========================================================================
    // Configuration and Runtime Errors (H700-H799)
    // =========================================================================
    /// Invalid configuration.
    #[error("H701: Invalid configuration: {cause}")]
    Config {
        /// Why the configuration was rejected.
        cause: String,
    },

    /// Async runtime failure.
    #[error("H702: Runtime error: {cause}")]
    Runtime {
        /// Description of the failure.
        cause: String,
    },

    /// Serialization/deserialization error.
    #[error("H903: Serialization error: {0}")]
    Serialization(String),
}

impl AutomatonError {
    /// Create an error from part business logic.
    pub fn part(message: impl Into<String>) -> Self {
        Self::Part(message.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Get the error code (e.g., "H401").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.code(),
            Self::SnapshotTimeout { .. } => "H305",
            Self::SnapshotFormat { .. } => "H306",
            Self::SnapshotVersionUnsupported { .. } => "H307",
            Self::SnapshotVersionPassed { .. } => "H308",
            Self::UnknownMutationType { .. } => "H401",
            Self::OutOfOrderMutation { .. } => "H402",
            Self::ReentrantMutationContext { .. } => "H403",
            Self::VersionRegression { .. } => "H404",
            Self::ChangelogMismatch { .. } => "H405",
            Self::ChangelogChainBroken { .. } => "H406",
            Self::InvalidTransition { .. } => "H501",
            Self::InvalidState { .. } => "H502",
            Self::Faulted { .. } => "H503",
            Self::Cancelled { .. } => "H504",
            Self::HandlerFailed { .. } => "H601",
            Self::SaverFailed { .. } => "H602",
            Self::LoaderFailed { .. } => "H603",
            Self::DuplicateRegistration { .. } => "H604",
            Self::Part(_) => "H605",
            Self::UnresolvedEntity { .. } => "H606",
            Self::Config { .. } => "H701",
            Self::Runtime { .. } => "H702",
            Self::Serialization(_) => "H903",
        }
    }

    /// Check if this error means the replica can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownMutationType { .. }
                | Self::OutOfOrderMutation { .. }
                | Self::ReentrantMutationContext { .. }
                | Self::VersionRegression { .. }
                | Self::ChangelogMismatch { .. }
                | Self::ChangelogChainBroken { .. }
                | Self::InvalidTransition { .. }
                | Self::HandlerFailed { .. }
        )
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retriable(),
            Self::SnapshotTimeout { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for AutomatonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<prometheus::Error> for AutomatonError {
    fn from(err: prometheus::Error) -> Self {
        Self::Runtime {
            cause: format!("metrics: {}", err),
        }
    }
}

impl From<tokio::task::JoinError> for AutomatonError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Runtime {
            cause: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(
            AutomatonError::UnknownMutationType {
                mutation_type: "Nope".to_string()
            }
            .is_fatal()
        );
        assert!(
            AutomatonError::OutOfOrderMutation {
                expected: Version::new(1, 3),
                actual: Version::new(1, 5),
            }
            .is_fatal()
        );
        assert!(
            AutomatonError::ChangelogChainBroken {
                changelog_id: 3,
                expected: 5,
                actual: 2,
            }
            .is_fatal()
        );
        assert!(
            !AutomatonError::SnapshotVersionPassed {
                version: Version::new(1, 2),
                automaton: Version::new(2, 1),
            }
            .is_fatal()
        );
        assert!(!AutomatonError::cancelled("stopped").is_fatal());
        assert!(!AutomatonError::Storage(HydraError::ChangelogSealed { changelog_id: 1 }).is_fatal());
    }

    #[test]
    fn storage_errors_keep_their_code() {
        let err = AutomatonError::from(HydraError::ChangelogNotFound { changelog_id: 7 });
        assert_eq!(err.code(), "H201");
        assert!(err.to_string().starts_with("H201"));
    }

    #[test]
    fn retriable_errors() {
        let err = AutomatonError::from(HydraError::ChangelogFlush {
            changelog_id: 1,
            cause: "disk full".to_string(),
        });
        assert!(err.is_retriable());
        assert!(
            AutomatonError::SnapshotTimeout {
                snapshot_id: 2,
                timeout_ms: 10
            }
            .is_retriable()
        );
        assert!(!AutomatonError::part("bad input").is_retriable());
    }

    #[test]
    fn transition_error_message() {
        let err = AutomatonError::InvalidTransition {
            from: PeerState::Stopped,
            to: PeerState::Leading,
        };
        assert_eq!(err.code(), "H501");
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Leading"));
    }
}
