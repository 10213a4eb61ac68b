//! Automaton configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a decorated automaton and its file stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomatonConfig {
    /// Root directory for changelogs and snapshots.
    pub data_dir: PathBuf,

    /// Upper bound for building a snapshot, in milliseconds.
    pub snapshot_timeout_ms: u64,

    /// Response keeper configuration.
    pub response_keeper: ResponseKeeperConfig,

    /// Changelog configuration.
    pub changelog: ChangelogConfig,

    /// Snapshot store configuration.
    pub snapshot: SnapshotStoreConfig,
}

/// Response keeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseKeeperConfig {
    /// How long a kept response survives, in milliseconds of mutation time.
    pub expiration_time_ms: u64,
}

/// Changelog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogConfig {
    /// Whether flushes fsync the changelog file.
    pub sync_on_flush: bool,
}

/// Snapshot store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStoreConfig {
    /// Number of confirmed snapshots to keep.
    pub retention_count: usize,
}

impl Default for AutomatonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./hydra-data"),
            // 5 minutes
            snapshot_timeout_ms: 300_000,
            response_keeper: ResponseKeeperConfig::default(),
            changelog: ChangelogConfig::default(),
            snapshot: SnapshotStoreConfig::default(),
        }
    }
}

impl Default for ResponseKeeperConfig {
    fn default() -> Self {
        Self {
            expiration_time_ms: 300_000,
        }
    }
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            sync_on_flush: true,
        }
    }
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self { retention_count: 3 }
    }
}

impl AutomatonConfig {
    /// Create a new configuration builder.
    pub fn builder() -> AutomatonConfigBuilder {
        AutomatonConfigBuilder::default()
    }

    /// Directory holding changelog segments.
    pub fn changelog_dir(&self) -> PathBuf {
        self.data_dir.join("changelogs")
    }

    /// Directory holding snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Get the snapshot timeout as a Duration.
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("data_dir is required".to_string());
        }

        if self.snapshot_timeout_ms == 0 {
            return Err("snapshot_timeout_ms must be > 0".to_string());
        }

        if self.response_keeper.expiration_time_ms == 0 {
            return Err("response_keeper.expiration_time_ms must be > 0".to_string());
        }

        if self.snapshot.retention_count == 0 {
            return Err("snapshot.retention_count must be > 0".to_string());
        }

        Ok(())
    }
}

/// Builder for AutomatonConfig.
#[derive(Debug, Default)]
pub struct AutomatonConfigBuilder {
    config: AutomatonConfig,
}

impl AutomatonConfigBuilder {
    /// Set the data directory.
    pub fn data_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Set the snapshot build timeout in milliseconds.
    pub fn snapshot_timeout_ms(mut self, ms: u64) -> Self {
        self.config.snapshot_timeout_ms = ms;
        self
    }

    /// Set how long kept responses survive, in milliseconds.
    pub fn response_expiration_ms(mut self, ms: u64) -> Self {
        self.config.response_keeper.expiration_time_ms = ms;
        self
    }

    /// Set whether changelog flushes fsync.
    pub fn sync_on_flush(mut self, sync: bool) -> Self {
        self.config.changelog.sync_on_flush = sync;
        self
    }

    /// Set the number of snapshots to retain.
    pub fn snapshot_retention(mut self, count: usize) -> Self {
        self.config.snapshot.retention_count = count;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> AutomatonConfig {
        self.config
    }
}
