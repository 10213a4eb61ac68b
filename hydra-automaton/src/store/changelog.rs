//! File-backed changelogs.
//!
//! Each changelog is a pair of files in the store directory:
//! `changelog_<id>.log` holds the records, each framed as
//! `[u32 len][u32 crc32][record]`, and `changelog_<id>.meta` is a JSON
//! document with the creation parameters and the sealed record count.

use super::{Changelog, ChangelogCreateParams, ChangelogStore, StoreFuture};
use crate::config::AutomatonConfig;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use hydra_core::{HydraError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Size of the per-record frame header.
const FRAME_HEADER_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ChangelogMeta {
    prev_record_count: u64,
    sealed_record_count: Option<u64>,
}

/// A directory of file-backed changelogs.
pub struct FileChangelogStore {
    directory: PathBuf,
    sync_on_flush: bool,
    open: Mutex<HashMap<u64, Weak<FileChangelog>>>,
}

impl FileChangelogStore {
    /// Open (or create) a changelog store in `directory`.
    pub fn new(directory: impl Into<PathBuf>, sync_on_flush: bool) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| HydraError::io(&directory, e))?;

        Ok(Self {
            directory,
            sync_on_flush,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Open the changelog store configured by `config`.
    pub fn from_config(config: &AutomatonConfig) -> Result<Self> {
        Self::new(config.changelog_dir(), config.changelog.sync_on_flush)
    }

    /// Get the directory for this store.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn log_filename(id: u64) -> String {
        format!("changelog_{:012}.log", id)
    }

    fn parse_log_filename(filename: &str) -> Option<u64> {
        filename
            .strip_prefix("changelog_")
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.parse().ok())
    }

    fn log_path(&self, id: u64) -> PathBuf {
        self.directory.join(Self::log_filename(id))
    }

    fn meta_path(&self, id: u64) -> PathBuf {
        self.directory.join(format!("changelog_{:012}.meta", id))
    }

    fn cached(&self, id: u64) -> Option<Arc<FileChangelog>> {
        self.open.lock().get(&id).and_then(Weak::upgrade)
    }

    fn remember(&self, changelog: &Arc<FileChangelog>) {
        let mut open = self.open.lock();
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(changelog.id, Arc::downgrade(changelog));
    }
}

impl ChangelogStore for FileChangelogStore {
    fn open_changelog(&self, id: u64) -> Result<Arc<dyn Changelog>> {
        if let Some(changelog) = self.cached(id) {
            return Ok(changelog);
        }

        let log_path = self.log_path(id);
        if !log_path.exists() {
            return Err(HydraError::ChangelogNotFound { changelog_id: id });
        }

        let changelog = Arc::new(FileChangelog::open(
            id,
            log_path,
            self.meta_path(id),
            self.sync_on_flush,
        )?);
        self.remember(&changelog);
        Ok(changelog)
    }

    fn create_changelog(
        &self,
        id: u64,
        params: ChangelogCreateParams,
    ) -> Result<Arc<dyn Changelog>> {
        let log_path = self.log_path(id);
        if log_path.exists() {
            return Err(HydraError::ChangelogExists { changelog_id: id });
        }

        let meta = ChangelogMeta {
            prev_record_count: params.prev_record_count,
            sealed_record_count: None,
        };
        let meta_path = self.meta_path(id);
        write_meta(&meta_path, &meta)?;

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| HydraError::io(&log_path, e))?;

        let changelog = Arc::new(FileChangelog {
            id,
            prev_record_count: params.prev_record_count,
            sync_on_flush: self.sync_on_flush,
            log_path,
            meta_path,
            inner: Arc::new(Mutex::new(ChangelogInner {
                writer: BufWriter::new(file),
                offsets: Vec::new(),
                file_len: 0,
                sealed: false,
            })),
        });
        self.remember(&changelog);

        tracing::debug!(
            changelog_id = id,
            prev_record_count = params.prev_record_count,
            "Created changelog"
        );

        Ok(changelog)
    }

    fn latest_changelog_id(&self) -> Result<Option<u64>> {
        let entries =
            fs::read_dir(&self.directory).map_err(|e| HydraError::io(&self.directory, e))?;

        Ok(entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(Self::parse_log_filename)
            })
            .max())
    }
}

struct ChangelogInner {
    writer: BufWriter<File>,
    /// Start offset of every record frame.
    offsets: Vec<u64>,
    /// Logical file length, including buffered bytes.
    file_len: u64,
    sealed: bool,
}

impl ChangelogInner {
    fn record_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    fn data_size(&self) -> u64 {
        self.file_len - FRAME_HEADER_SIZE * self.record_count()
    }

    fn flush(&mut self, sync: bool) -> std::io::Result<()> {
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

/// A single file-backed changelog.
pub struct FileChangelog {
    id: u64,
    prev_record_count: u64,
    sync_on_flush: bool,
    log_path: PathBuf,
    meta_path: PathBuf,
    inner: Arc<Mutex<ChangelogInner>>,
}

impl FileChangelog {
    fn open(id: u64, log_path: PathBuf, meta_path: PathBuf, sync_on_flush: bool) -> Result<Self> {
        let meta = read_meta(&meta_path)?;

        let data = fs::read(&log_path).map_err(|e| HydraError::io(&log_path, e))?;
        let (offsets, valid_len) = scan_frames(&data);

        if let Some(sealed_count) = meta.sealed_record_count {
            if offsets.len() as u64 != sealed_count {
                return Err(HydraError::ChangelogRead {
                    changelog_id: id,
                    cause: format!(
                        "sealed at {} records but {} are readable",
                        sealed_count,
                        offsets.len()
                    ),
                });
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&log_path)
            .map_err(|e| HydraError::io(&log_path, e))?;

        if valid_len < data.len() as u64 {
            tracing::warn!(
                changelog_id = id,
                valid_len,
                file_len = data.len(),
                "Truncating torn changelog tail"
            );
            file.set_len(valid_len)
                .map_err(|e| HydraError::io(&log_path, e))?;
        }

        tracing::debug!(
            changelog_id = id,
            record_count = offsets.len(),
            sealed = meta.sealed_record_count.is_some(),
            "Opened changelog"
        );

        Ok(Self {
            id,
            prev_record_count: meta.prev_record_count,
            sync_on_flush,
            log_path,
            meta_path,
            inner: Arc::new(Mutex::new(ChangelogInner {
                writer: BufWriter::new(file),
                offsets,
                file_len: valid_len,
                sealed: meta.sealed_record_count.is_some(),
            })),
        })
    }

    /// Path of the record file.
    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

impl Changelog for FileChangelog {
    fn id(&self) -> u64 {
        self.id
    }

    fn prev_record_count(&self) -> u64 {
        self.prev_record_count
    }

    fn record_count(&self) -> u64 {
        self.inner.lock().record_count()
    }

    fn data_size(&self) -> u64 {
        self.inner.lock().data_size()
    }

    fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    fn append(&self, record: Bytes) -> Result<StoreFuture<'static, ()>> {
        let id = self.id;
        {
            let mut inner = self.inner.lock();
            if inner.sealed {
                return Err(HydraError::ChangelogSealed { changelog_id: id });
            }

            let frame = encode_frame(&record).map_err(|e| HydraError::ChangelogAppend {
                changelog_id: id,
                cause: e.to_string(),
            })?;
            inner
                .writer
                .write_all(&frame)
                .map_err(|e| HydraError::ChangelogAppend {
                    changelog_id: id,
                    cause: e.to_string(),
                })?;

            let offset = inner.file_len;
            inner.offsets.push(offset);
            inner.file_len += frame.len() as u64;
        }

        Ok(self.flush())
    }

    fn flush(&self) -> StoreFuture<'static, ()> {
        let inner = Arc::clone(&self.inner);
        let sync = self.sync_on_flush;
        let id = self.id;

        Box::pin(async move {
            tokio::task::spawn_blocking(move || inner.lock().flush(sync))
                .await
                .map_err(|e| HydraError::ChangelogFlush {
                    changelog_id: id,
                    cause: e.to_string(),
                })?
                .map_err(|e| HydraError::ChangelogFlush {
                    changelog_id: id,
                    cause: e.to_string(),
                })
        })
    }

    fn seal(&self, record_count: u64) -> StoreFuture<'static, ()> {
        let inner = Arc::clone(&self.inner);
        let meta_path = self.meta_path.clone();
        let prev_record_count = self.prev_record_count;
        let id = self.id;

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                seal_blocking(&inner, id, prev_record_count, record_count, &meta_path)
            })
            .await
            .map_err(|e| HydraError::ChangelogSeal {
                changelog_id: id,
                cause: e.to_string(),
            })?
        })
    }

    fn read(&self, first_record_id: u64, max_records: usize) -> Result<Vec<Bytes>> {
        let id = self.id;
        let read_err = |cause: String| HydraError::ChangelogRead {
            changelog_id: id,
            cause,
        };

        let (start, end, count) = {
            let mut inner = self.inner.lock();
            let total = inner.record_count();
            if first_record_id >= total || max_records == 0 {
                return Ok(Vec::new());
            }
            inner.writer.flush().map_err(|e| read_err(e.to_string()))?;

            let last = total.min(first_record_id + max_records as u64);
            let start = inner.offsets[first_record_id as usize];
            let end = if last == total {
                inner.file_len
            } else {
                inner.offsets[last as usize]
            };
            (start, end, (last - first_record_id) as usize)
        };

        let mut file = File::open(&self.log_path).map_err(|e| HydraError::io(&self.log_path, e))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| read_err(e.to_string()))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .map_err(|e| read_err(e.to_string()))?;

        let mut cursor = Cursor::new(buf.as_slice());
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let record = read_frame(&mut cursor)
                .ok_or_else(|| read_err("corrupted record frame".to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

fn seal_blocking(
    inner: &Mutex<ChangelogInner>,
    id: u64,
    prev_record_count: u64,
    record_count: u64,
    meta_path: &Path,
) -> Result<()> {
    let seal_err = |cause: String| HydraError::ChangelogSeal {
        changelog_id: id,
        cause,
    };

    let mut inner = inner.lock();
    if inner.sealed {
        return Err(HydraError::ChangelogSealed { changelog_id: id });
    }
    if record_count > inner.record_count() {
        return Err(seal_err(format!(
            "cannot seal at {} records, only {} appended",
            record_count,
            inner.record_count()
        )));
    }

    inner.flush(true).map_err(|e| seal_err(e.to_string()))?;

    if record_count < inner.record_count() {
        let new_len = inner.offsets[record_count as usize];
        inner
            .writer
            .get_ref()
            .set_len(new_len)
            .and_then(|_| inner.writer.get_ref().sync_all())
            .map_err(|e| seal_err(e.to_string()))?;
        inner.offsets.truncate(record_count as usize);
        inner.file_len = new_len;
    }

    write_meta(
        meta_path,
        &ChangelogMeta {
            prev_record_count,
            sealed_record_count: Some(record_count),
        },
    )?;
    inner.sealed = true;

    tracing::debug!(changelog_id = id, record_count, "Sealed changelog");
    Ok(())
}

/// Walk record frames, returning their offsets and the length of the valid prefix.
fn scan_frames(data: &[u8]) -> (Vec<u64>, u64) {
    let mut cursor = Cursor::new(data);
    let mut offsets = Vec::new();

    loop {
        let offset = cursor.position();
        if read_frame(&mut cursor).is_none() {
            return (offsets, offset);
        }
        offsets.push(offset);
    }
}

fn encode_frame(record: &[u8]) -> std::io::Result<Vec<u8>> {
    let len = u32::try_from(record.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("record of {} bytes is too large", record.len()),
        )
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + record.len());
    frame.write_u32::<LittleEndian>(len)?;
    frame.write_u32::<LittleEndian>(crc32fast::hash(record))?;
    frame.write_all(record)?;
    Ok(frame)
}

fn read_frame(cursor: &mut Cursor<&[u8]>) -> Option<Bytes> {
    let len = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let crc = cursor.read_u32::<LittleEndian>().ok()?;
    let mut record = vec![0u8; len];
    cursor.read_exact(&mut record).ok()?;
    (crc32fast::hash(&record) == crc).then(|| Bytes::from(record))
}

fn read_meta(path: &Path) -> Result<ChangelogMeta> {
    let data = fs::read(path).map_err(|e| HydraError::io(path, e))?;
    serde_json::from_slice(&data).map_err(|e| HydraError::Serialization(e.to_string()))
}

fn write_meta(path: &Path, meta: &ChangelogMeta) -> Result<()> {
    let data = serde_json::to_vec(meta).map_err(|e| HydraError::Serialization(e.to_string()))?;
    let temp_path = path.with_extension("meta.tmp");

    let mut file = File::create(&temp_path).map_err(|e| HydraError::io(&temp_path, e))?;
    file.write_all(&data)
        .and_then(|_| file.sync_all())
        .map_err(|e| HydraError::io(&temp_path, e))?;

    fs::rename(&temp_path, path).map_err(|e| HydraError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileChangelogStore {
        FileChangelogStore::new(dir.path().join("changelogs"), false).unwrap()
    }

    #[tokio::test]
    async fn append_read_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let changelog = store
            .create_changelog(1, ChangelogCreateParams::default())
            .unwrap();
        for i in 0..5u8 {
            changelog.append(Bytes::from(vec![i; 3])).unwrap().await.unwrap();
        }

        assert_eq!(changelog.record_count(), 5);
        assert_eq!(changelog.data_size(), 15);

        let records = changelog.read(2, 10).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].as_ref(), &[2, 2, 2]);

        drop(changelog);
        let reopened = store.open_changelog(1).unwrap();
        assert_eq!(reopened.record_count(), 5);
        assert_eq!(reopened.read(4, 1).unwrap()[0].as_ref(), &[4, 4, 4]);
    }

    #[tokio::test]
    async fn open_returns_shared_handle() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let created = store
            .create_changelog(3, ChangelogCreateParams::default())
            .unwrap();
        let opened = store.open_changelog(3).unwrap();
        created.append(Bytes::from_static(b"x")).unwrap().await.unwrap();
        assert_eq!(opened.record_count(), 1);
    }

    #[tokio::test]
    async fn seal_rejects_appends_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let changelog = store
            .create_changelog(1, ChangelogCreateParams { prev_record_count: 9 })
            .unwrap();
        for _ in 0..4 {
            changelog.append(Bytes::from_static(b"rec")).unwrap().await.unwrap();
        }
        changelog.seal(3).await.unwrap();

        assert!(changelog.is_sealed());
        assert_eq!(changelog.record_count(), 3);
        let err = changelog.append(Bytes::from_static(b"late")).err().unwrap();
        assert!(matches!(err, HydraError::ChangelogSealed { changelog_id: 1 }));
        assert!(changelog.seal(3).await.is_err());

        drop(changelog);
        let reopened = store.open_changelog(1).unwrap();
        assert!(reopened.is_sealed());
        assert_eq!(reopened.record_count(), 3);
        assert_eq!(reopened.prev_record_count(), 9);
    }

    #[tokio::test]
    async fn torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let changelog = store
            .create_changelog(1, ChangelogCreateParams::default())
            .unwrap();
        changelog.append(Bytes::from_static(b"good")).unwrap().await.unwrap();
        drop(changelog);

        let path = store.directory().join(FileChangelogStore::log_filename(1));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[10, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let reopened = store.open_changelog(1).unwrap();
        assert_eq!(reopened.record_count(), 1);
        reopened.append(Bytes::from_static(b"next")).unwrap().await.unwrap();
        assert_eq!(reopened.read(1, 1).unwrap()[0].as_ref(), b"next");
    }

    #[test]
    fn missing_and_duplicate_changelogs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(matches!(
            store.open_changelog(7).err().unwrap(),
            HydraError::ChangelogNotFound { changelog_id: 7 }
        ));

        store
            .create_changelog(7, ChangelogCreateParams::default())
            .unwrap();
        assert!(matches!(
            store
                .create_changelog(7, ChangelogCreateParams::default())
                .err()
                .unwrap(),
            HydraError::ChangelogExists { changelog_id: 7 }
        ));
    }

    #[test]
    fn latest_changelog_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.latest_changelog_id().unwrap(), None);

        for id in [2, 10, 4] {
            store
                .create_changelog(id, ChangelogCreateParams::default())
                .unwrap();
        }
        assert_eq!(store.latest_changelog_id().unwrap(), Some(10));
    }
}
