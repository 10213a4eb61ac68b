//! Error types for the hydra storage layer.
//!
//! Every variant carries an error code (e.g. `H201`) and enough context to
//! locate the failing changelog, snapshot or file.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by records, changelogs and snapshot stores.
#[derive(Error, Debug)]
pub enum HydraError {
    // =========================================================================
    // Record Errors (H100-H199)
    // =========================================================================
    /// A record failed its integrity check.
    #[error("H101: Record corruption: {cause}")]
    RecordCorruption {
        /// Description of the corruption.
        cause: String,
    },

    /// A record could not be encoded.
    #[error("H102: Record encoding failed: {cause}")]
    RecordEncode {
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Changelog Errors (H200-H299)
    // =========================================================================
    /// The requested changelog does not exist.
    #[error("H201: Changelog {changelog_id} not found")]
    ChangelogNotFound {
        /// The missing changelog.
        changelog_id: u64,
    },

    /// A changelog with this id already exists.
    #[error("H202: Changelog {changelog_id} already exists")]
    ChangelogExists {
        /// The conflicting changelog.
        changelog_id: u64,
    },

    /// Appending to a changelog failed.
    #[error("H203: Append to changelog {changelog_id} failed: {cause}")]
    ChangelogAppend {
        /// The changelog being appended to.
        changelog_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// Flushing a changelog failed.
    #[error("H204: Flush of changelog {changelog_id} failed: {cause}")]
    ChangelogFlush {
        /// The changelog being flushed.
        changelog_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// Sealing a changelog failed.
    #[error("H205: Seal of changelog {changelog_id} failed: {cause}")]
    ChangelogSeal {
        /// The changelog being sealed.
        changelog_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// The changelog is sealed and accepts no more records.
    #[error("H206: Changelog {changelog_id} is sealed")]
    ChangelogSealed {
        /// The sealed changelog.
        changelog_id: u64,
    },

    /// Reading a changelog failed.
    #[error("H207: Read of changelog {changelog_id} failed: {cause}")]
    ChangelogRead {
        /// The changelog being read.
        changelog_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Snapshot Errors (H300-H399)
    // =========================================================================
    /// Snapshot creation failed.
    #[error("H301: Snapshot {snapshot_id} creation failed: {cause}")]
    SnapshotCreation {
        /// The snapshot being created.
        snapshot_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// Snapshot load failed.
    #[error("H302: Snapshot {snapshot_id} load failed: {cause}")]
    SnapshotLoad {
        /// The snapshot being loaded.
        snapshot_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    /// The requested snapshot does not exist.
    #[error("H303: Snapshot {snapshot_id} not found")]
    SnapshotNotFound {
        /// The missing snapshot.
        snapshot_id: u64,
    },

    /// Confirming a written snapshot failed.
    #[error("H304: Snapshot {snapshot_id} confirmation failed: {cause}")]
    SnapshotConfirm {
        /// The snapshot being confirmed.
        snapshot_id: u64,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // I/O Errors (H900-H999)
    // =========================================================================
    /// File I/O error.
    #[error("H901: I/O error at {path}: {cause}")]
    Io {
        /// The path where the I/O error occurred.
        path: PathBuf,
        /// Description of the I/O error.
        cause: String,
    },

    /// Serialization/deserialization error.
    #[error("H902: Serialization error: {0}")]
    Serialization(
        /// The serialization error message.
        String,
    ),
}

impl HydraError {
    /// Get the error code (e.g., "H201").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RecordCorruption { .. } => "H101",
            Self::RecordEncode { .. } => "H102",
            Self::ChangelogNotFound { .. } => "H201",
            Self::ChangelogExists { .. } => "H202",
            Self::ChangelogAppend { .. } => "H203",
            Self::ChangelogFlush { .. } => "H204",
            Self::ChangelogSeal { .. } => "H205",
            Self::ChangelogSealed { .. } => "H206",
            Self::ChangelogRead { .. } => "H207",
            Self::SnapshotCreation { .. } => "H301",
            Self::SnapshotLoad { .. } => "H302",
            Self::SnapshotNotFound { .. } => "H303",
            Self::SnapshotConfirm { .. } => "H304",
            Self::Io { .. } => "H901",
            Self::Serialization(_) => "H902",
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ChangelogFlush { .. } | Self::SnapshotCreation { .. } | Self::Io { .. }
        )
    }

    /// Check if this error indicates on-disk data that cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::RecordCorruption { .. })
    }

    /// Build an I/O error for a path.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            cause: err.to_string(),
        }
    }
}

/// Result type alias using `HydraError`.
pub type Result<T> = std::result::Result<T, HydraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let err = HydraError::ChangelogNotFound { changelog_id: 3 };
        assert_eq!(err.code(), "H201");
        assert!(err.to_string().contains("H201"));
        assert!(err.to_string().contains('3'));

        let err = HydraError::Serialization("bad".to_string());
        assert_eq!(err.code(), "H902");
    }

    #[test]
    fn retriable_errors() {
        assert!(
            HydraError::ChangelogFlush {
                changelog_id: 1,
                cause: "disk".to_string()
            }
            .is_retriable()
        );
        assert!(!HydraError::ChangelogSealed { changelog_id: 1 }.is_retriable());
    }

    #[test]
    fn corruption_errors() {
        assert!(
            HydraError::RecordCorruption {
                cause: "crc".to_string()
            }
            .is_corruption()
        );
        assert!(!HydraError::SnapshotNotFound { snapshot_id: 2 }.is_corruption());
    }
}
