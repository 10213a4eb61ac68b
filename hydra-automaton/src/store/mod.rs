//! Changelog and snapshot storage.
//!
//! The automaton only talks to storage through the [`ChangelogStore`] and
//! [`SnapshotStore`] traits. File-backed implementations live in the
//! submodules.

mod changelog;
mod snapshot;

pub use changelog::{FileChangelog, FileChangelogStore};
pub use snapshot::{FileSnapshotStore, FileSnapshotWriter};

use bytes::Bytes;
use hydra_core::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Parameters for creating a changelog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogCreateParams {
    /// Record count of the preceding changelog.
    pub prev_record_count: u64,
}

/// Parameters for creating a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotCreateParams {
    /// Number of records of the preceding changelog covered by the snapshot.
    pub prev_record_count: u64,
}

/// Description of a finished snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Number of records of the preceding changelog covered by the snapshot.
    pub prev_record_count: u64,
    /// CRC32 of the snapshot file contents.
    pub checksum: u32,
    /// Size of the snapshot file in bytes.
    pub data_size: u64,
}

/// An append-only, sealable record log.
///
/// Appends are ordered at call time; the returned future only reports
/// durability of the appended record.
pub trait Changelog: Send + Sync {
    /// Identifier of this changelog (its segment id).
    fn id(&self) -> u64;

    /// Record count of the preceding changelog.
    fn prev_record_count(&self) -> u64;

    /// Number of records appended so far.
    fn record_count(&self) -> u64;

    /// Total size of appended records in bytes.
    fn data_size(&self) -> u64;

    /// Whether the changelog accepts no more records.
    fn is_sealed(&self) -> bool;

    /// Append a record.
    ///
    /// Fails immediately if the changelog is sealed or the record cannot be
    /// buffered. Otherwise the returned future resolves once the record is
    /// durable.
    fn append(&self, record: Bytes) -> Result<StoreFuture<'static, ()>>;

    /// Make all appended records durable.
    fn flush(&self) -> StoreFuture<'static, ()>;

    /// Seal the changelog at `record_count` records, dropping any beyond it.
    fn seal(&self, record_count: u64) -> StoreFuture<'static, ()>;

    /// Read up to `max_records` records starting at `first_record_id`.
    fn read(&self, first_record_id: u64, max_records: usize) -> Result<Vec<Bytes>>;
}

/// A collection of changelogs addressed by segment id.
pub trait ChangelogStore: Send + Sync {
    /// Open an existing changelog.
    fn open_changelog(&self, id: u64) -> Result<Arc<dyn Changelog>>;

    /// Create a new, empty changelog.
    fn create_changelog(&self, id: u64, params: ChangelogCreateParams)
    -> Result<Arc<dyn Changelog>>;

    /// The largest existing changelog id.
    fn latest_changelog_id(&self) -> Result<Option<u64>>;
}

/// Output side of a snapshot being written.
pub trait SnapshotWriter: Send {
    /// The stream snapshot contents are written to.
    fn stream(&mut self) -> &mut (dyn Write + Send);

    /// Finish writing. The snapshot stays invisible until confirmed.
    fn close(self: Box<Self>) -> StoreFuture<'static, ()>;
}

/// A collection of snapshots addressed by snapshot id.
pub trait SnapshotStore: Send + Sync {
    /// Start writing snapshot `id`.
    fn create_writer(
        &self,
        id: u64,
        params: SnapshotCreateParams,
    ) -> Result<Box<dyn SnapshotWriter>>;

    /// Open a confirmed snapshot for reading.
    fn open_reader(&self, id: u64) -> Result<Box<dyn Read + Send>>;

    /// Parameters of a confirmed snapshot.
    fn snapshot_params(&self, id: u64) -> Result<SnapshotParams>;

    /// Publish a closed snapshot, making it visible to readers.
    fn confirm_snapshot(&self, id: u64) -> StoreFuture<'static, SnapshotParams>;

    /// Throw away an unconfirmed snapshot.
    fn discard_snapshot(&self, id: u64) -> Result<()>;

    /// The largest confirmed snapshot id not exceeding `max_snapshot_id`.
    fn latest_snapshot_id(&self, max_snapshot_id: u64) -> Result<Option<u64>>;
}
