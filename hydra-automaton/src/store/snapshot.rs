//! File-backed snapshot store.
//!
//! A snapshot is written into `snapshot_<id>.snap.tmp`. Closing the writer
//! makes the file durable, and confirming renames it to `snapshot_<id>.snap`
//! next to a `snapshot_<id>.params` JSON file. Only confirmed snapshots are
//! ever listed or opened.

use super::{SnapshotCreateParams, SnapshotParams, SnapshotStore, SnapshotWriter, StoreFuture};
use crate::config::AutomatonConfig;
use hydra_core::{HydraError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A directory of file-backed snapshots.
#[derive(Clone)]
pub struct FileSnapshotStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    directory: PathBuf,
    retention_count: usize,
    /// Closed but unconfirmed snapshots.
    pending: Mutex<HashMap<u64, PendingSnapshot>>,
}

struct PendingSnapshot {
    guard: TempFileGuard,
    params: SnapshotParams,
}

impl FileSnapshotStore {
    /// Open (or create) a snapshot store in `directory`.
    pub fn new(directory: impl Into<PathBuf>, retention_count: usize) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| HydraError::io(&directory, e))?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                directory,
                retention_count: retention_count.max(1),
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Open the snapshot store configured by `config`.
    pub fn from_config(config: &AutomatonConfig) -> Result<Self> {
        Self::new(config.snapshot_dir(), config.snapshot.retention_count)
    }

    /// Get the directory for this store.
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Ids of all confirmed snapshots, ascending.
    pub fn list_snapshots(&self) -> Result<Vec<u64>> {
        self.inner.list_snapshots()
    }
}

impl StoreInner {
    fn snapshot_path(&self, id: u64) -> PathBuf {
        self.directory.join(format!("snapshot_{:012}.snap", id))
    }

    fn temp_path(&self, id: u64) -> PathBuf {
        self.directory.join(format!("snapshot_{:012}.snap.tmp", id))
    }

    fn params_path(&self, id: u64) -> PathBuf {
        self.directory.join(format!("snapshot_{:012}.params", id))
    }

    fn list_snapshots(&self) -> Result<Vec<u64>> {
        let entries =
            fs::read_dir(&self.directory).map_err(|e| HydraError::io(&self.directory, e))?;

        let mut ids: Vec<u64> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                name.to_str()
                    .and_then(|s| s.strip_prefix("snapshot_"))
                    .and_then(|s| s.strip_suffix(".snap"))
                    .and_then(|s| s.parse().ok())
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn confirm_blocking(&self, id: u64, pending: PendingSnapshot) -> Result<SnapshotParams> {
        let confirm_err = |cause: String| HydraError::SnapshotConfirm {
            snapshot_id: id,
            cause,
        };

        let params_data =
            serde_json::to_vec(&pending.params).map_err(|e| confirm_err(e.to_string()))?;
        let params_path = self.params_path(id);
        let params_temp = params_path.with_extension("params.tmp");
        fs::write(&params_temp, &params_data)
            .and_then(|_| fs::rename(&params_temp, &params_path))
            .map_err(|e| confirm_err(e.to_string()))?;

        fs::rename(pending.guard.path(), self.snapshot_path(id))
            .map_err(|e| confirm_err(e.to_string()))?;
        pending.guard.disarm();

        tracing::info!(
            snapshot_id = id,
            data_size = pending.params.data_size,
            checksum = pending.params.checksum,
            "Confirmed snapshot"
        );

        self.cleanup_old_snapshots()?;
        Ok(pending.params)
    }

    fn cleanup_old_snapshots(&self) -> Result<()> {
        let snapshots = self.list_snapshots()?;
        if snapshots.len() <= self.retention_count {
            return Ok(());
        }

        let to_remove = snapshots.len() - self.retention_count;
        for id in snapshots.iter().take(to_remove) {
            let _ = fs::remove_file(self.params_path(*id));
            if let Err(e) = fs::remove_file(self.snapshot_path(*id)) {
                tracing::warn!(snapshot_id = id, error = %e, "Failed to remove old snapshot");
            } else {
                tracing::debug!(snapshot_id = id, "Removed old snapshot");
            }
        }

        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create_writer(
        &self,
        id: u64,
        params: SnapshotCreateParams,
    ) -> Result<Box<dyn SnapshotWriter>> {
        let create_err = |cause: String| HydraError::SnapshotCreation {
            snapshot_id: id,
            cause,
        };

        if self.inner.snapshot_path(id).exists() {
            return Err(create_err("snapshot already exists".to_string()));
        }
        self.inner.pending.lock().remove(&id);

        let temp_path = self.inner.temp_path(id);
        let file = File::create(&temp_path).map_err(|e| create_err(e.to_string()))?;

        Ok(Box::new(FileSnapshotWriter {
            id,
            params,
            writer: ChecksumWriter::new(BufWriter::new(file)),
            guard: TempFileGuard::new(temp_path),
            store: Arc::clone(&self.inner),
        }))
    }

    fn open_reader(&self, id: u64) -> Result<Box<dyn Read + Send>> {
        let path = self.inner.snapshot_path(id);
        let file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HydraError::SnapshotNotFound { snapshot_id: id },
            _ => HydraError::SnapshotLoad {
                snapshot_id: id,
                cause: e.to_string(),
            },
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn snapshot_params(&self, id: u64) -> Result<SnapshotParams> {
        let path = self.inner.params_path(id);
        let data = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HydraError::SnapshotNotFound { snapshot_id: id },
            _ => HydraError::io(&path, e),
        })?;
        serde_json::from_slice(&data).map_err(|e| HydraError::Serialization(e.to_string()))
    }

    fn confirm_snapshot(&self, id: u64) -> StoreFuture<'static, SnapshotParams> {
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let pending =
                inner
                    .pending
                    .lock()
                    .remove(&id)
                    .ok_or_else(|| HydraError::SnapshotConfirm {
                        snapshot_id: id,
                        cause: "snapshot was not written or already confirmed".to_string(),
                    })?;

            tokio::task::spawn_blocking(move || inner.confirm_blocking(id, pending))
                .await
                .map_err(|e| HydraError::SnapshotConfirm {
                    snapshot_id: id,
                    cause: e.to_string(),
                })?
        })
    }

    fn discard_snapshot(&self, id: u64) -> Result<()> {
        if self.inner.pending.lock().remove(&id).is_some() {
            tracing::debug!(snapshot_id = id, "Discarded unconfirmed snapshot");
        }
        Ok(())
    }

    fn latest_snapshot_id(&self, max_snapshot_id: u64) -> Result<Option<u64>> {
        Ok(self
            .inner
            .list_snapshots()?
            .into_iter()
            .filter(|id| *id <= max_snapshot_id)
            .max())
    }
}

/// Writer for a snapshot that has not been confirmed yet.
///
/// Dropping the writer without closing it removes the partial file.
pub struct FileSnapshotWriter {
    id: u64,
    params: SnapshotCreateParams,
    writer: ChecksumWriter<BufWriter<File>>,
    guard: TempFileGuard,
    store: Arc<StoreInner>,
}

impl SnapshotWriter for FileSnapshotWriter {
    fn stream(&mut self) -> &mut (dyn Write + Send) {
        &mut self.writer
    }

    fn close(self: Box<Self>) -> StoreFuture<'static, ()> {
        let FileSnapshotWriter {
            id,
            params,
            writer,
            guard,
            store,
        } = *self;

        Box::pin(async move {
            let (checksum, data_size) = tokio::task::spawn_blocking(move || {
                let (mut file, checksum, data_size) = writer.finish();
                file.flush()?;
                file.get_ref().sync_all()?;
                Ok::<_, std::io::Error>((checksum, data_size))
            })
            .await
            .map_err(|e| HydraError::SnapshotCreation {
                snapshot_id: id,
                cause: e.to_string(),
            })?
            .map_err(|e| HydraError::SnapshotCreation {
                snapshot_id: id,
                cause: e.to_string(),
            })?;

            store.pending.lock().insert(
                id,
                PendingSnapshot {
                    guard,
                    params: SnapshotParams {
                        prev_record_count: params.prev_record_count,
                        checksum,
                        data_size,
                    },
                },
            );

            tracing::debug!(snapshot_id = id, data_size, "Closed snapshot writer");
            Ok(())
        })
    }
}

/// Write adapter tracking the CRC32 and length of everything written.
struct ChecksumWriter<W> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, u32, u64) {
        (self.inner, self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Removes a temp file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temp snapshot");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_snapshot(store: &FileSnapshotStore, id: u64, data: &[u8]) -> SnapshotParams {
        let mut writer = store
            .create_writer(id, SnapshotCreateParams { prev_record_count: id * 10 })
            .unwrap();
        writer.stream().write_all(data).unwrap();
        writer.close().await.unwrap();
        store.confirm_snapshot(id).await.unwrap()
    }

    #[tokio::test]
    async fn write_confirm_and_read() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();

        let params = write_snapshot(&store, 2, b"state").await;
        assert_eq!(params.prev_record_count, 20);
        assert_eq!(params.data_size, 5);
        assert_eq!(params.checksum, crc32fast::hash(b"state"));

        let mut contents = Vec::new();
        store.open_reader(2).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"state");
        assert_eq!(store.snapshot_params(2).unwrap(), params);
    }

    #[tokio::test]
    async fn unconfirmed_snapshots_are_invisible() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();

        let mut writer = store
            .create_writer(4, SnapshotCreateParams::default())
            .unwrap();
        writer.stream().write_all(b"partial").unwrap();
        writer.close().await.unwrap();

        assert_eq!(store.latest_snapshot_id(u64::MAX).unwrap(), None);
        assert!(matches!(
            store.open_reader(4).err().unwrap(),
            HydraError::SnapshotNotFound { snapshot_id: 4 }
        ));

        store.discard_snapshot(4).unwrap();
        assert!(store.confirm_snapshot(4).await.is_err());
        assert!(!dir.path().join("snapshot_000000000004.snap.tmp").exists());
    }

    #[tokio::test]
    async fn dropped_writer_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();

        let mut writer = store
            .create_writer(1, SnapshotCreateParams::default())
            .unwrap();
        writer.stream().write_all(b"abandoned").unwrap();
        drop(writer);

        assert!(!dir.path().join("snapshot_000000000001.snap.tmp").exists());
    }

    #[tokio::test]
    async fn retention_and_latest() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 2).unwrap();

        for id in 1..=4 {
            write_snapshot(&store, id, b"x").await;
        }

        assert_eq!(store.list_snapshots().unwrap(), vec![3, 4]);
        assert_eq!(store.latest_snapshot_id(10).unwrap(), Some(4));
        assert_eq!(store.latest_snapshot_id(3).unwrap(), Some(3));
        assert_eq!(store.latest_snapshot_id(2).unwrap(), None);
    }
}
