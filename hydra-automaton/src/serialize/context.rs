//! Save and load contexts.

use super::checkpoint::{self, Section};
use super::{EntitySerializationKey, SectionKind};
use crate::error::{AutomatonError, Result};
use crate::store::SnapshotWriter;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

struct OpenSection {
    name: String,
    kind: SectionKind,
    buffer: Vec<u8>,
}

/// Serialization session for one snapshot save pass.
///
/// The same context is carried from the synchronous phase into the
/// asynchronous one, so entity keys stay unique across the whole snapshot.
pub struct SaveContext {
    writer: Box<dyn SnapshotWriter>,
    section: Option<OpenSection>,
    next_key: i32,
}

impl SaveContext {
    pub(crate) fn new(mut writer: Box<dyn SnapshotWriter>, version: u32) -> Result<Self> {
        checkpoint::write_header(writer.stream(), version)?;
        Ok(Self {
            writer,
            section: None,
            next_key: 0,
        })
    }

    pub(crate) fn begin_section(&mut self, name: &str, kind: SectionKind) -> Result<()> {
        if let Some(open) = &self.section {
            return Err(AutomatonError::SnapshotFormat {
                cause: format!(
                    "cannot open section '{}' while '{}' is open",
                    name, open.name
                ),
            });
        }
        self.section = Some(OpenSection {
            name: name.to_string(),
            kind,
            buffer: Vec::new(),
        });
        Ok(())
    }

    pub(crate) fn end_section(&mut self) -> Result<()> {
        let open = self.section.take().ok_or_else(|| AutomatonError::SnapshotFormat {
            cause: "no open section".to_string(),
        })?;
        checkpoint::write_section(self.writer.stream(), &open.name, open.kind, &open.buffer)
    }

    pub(crate) fn finish(mut self) -> Result<Box<dyn SnapshotWriter>> {
        if let Some(open) = &self.section {
            return Err(AutomatonError::SnapshotFormat {
                cause: format!("section '{}' was never closed", open.name),
            });
        }
        checkpoint::write_terminator(self.writer.stream())?;
        Ok(self.writer)
    }

    /// Name of the section being written.
    pub fn section_name(&self) -> Option<&str> {
        self.section.as_ref().map(|s| s.name.as_str())
    }

    /// Allocate the next entity key.
    pub fn generate_key(&mut self) -> EntitySerializationKey {
        let key = EntitySerializationKey(self.next_key);
        self.next_key += 1;
        key
    }

    fn buffer(&mut self) -> Result<&mut Vec<u8>> {
        self.section
            .as_mut()
            .map(|s| &mut s.buffer)
            .ok_or_else(|| AutomatonError::SnapshotFormat {
                cause: "write outside of a section".to_string(),
            })
    }

    /// Write a byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.buffer()?.push(value);
        Ok(())
    }

    /// Write a bool.
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.buffer()?.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian u64.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.buffer()?.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian i64.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.buffer()?.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        let buffer = self.buffer()?;
        buffer
            .write_u64::<LittleEndian>(value.len() as u64)
            .map_err(|e| AutomatonError::Serialization(e.to_string()))?;
        buffer.extend_from_slice(value);
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write an entity key.
    pub fn write_key(&mut self, key: EntitySerializationKey) -> Result<()> {
        self.buffer()?.extend_from_slice(&key.0.to_le_bytes());
        Ok(())
    }

    /// Write a value as length-prefixed JSON.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.write_bytes(&data)
    }
}

impl Write for SaveContext {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer()
            .map_err(|e| io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Deserialization session for one snapshot load pass.
///
/// Entities registered by one loader stay resolvable by every later loader of
/// the same pass.
pub struct LoadContext {
    version: u32,
    section_name: String,
    payload: Cursor<Vec<u8>>,
    entities: HashMap<EntitySerializationKey, Arc<dyn Any + Send + Sync>>,
}

impl LoadContext {
    pub(crate) fn new(version: u32) -> Self {
        Self {
            version,
            section_name: String::new(),
            payload: Cursor::new(Vec::new()),
            entities: HashMap::new(),
        }
    }

    pub(crate) fn enter_section(&mut self, section: Section) {
        self.section_name = section.name;
        self.payload = Cursor::new(section.payload);
    }

    pub(crate) fn leave_section(&mut self) {
        let remaining = self.remaining();
        if remaining > 0 {
            tracing::debug!(
                section = %self.section_name,
                remaining,
                "Loader left unread bytes in section"
            );
        }
        self.payload = Cursor::new(Vec::new());
    }

    /// Snapshot format version being loaded.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Name of the section being read.
    pub fn section_name(&self) -> &str {
        &self.section_name
    }

    /// Unread bytes left in the current section.
    pub fn remaining(&self) -> usize {
        let len = self.payload.get_ref().len() as u64;
        len.saturating_sub(self.payload.position()) as usize
    }

    fn read_err(&self, err: io::Error) -> AutomatonError {
        AutomatonError::SnapshotFormat {
            cause: format!("section '{}': {}", self.section_name, err),
        }
    }

    /// Read a byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.payload.read_u8().map_err(|e| self.read_err(e))
    }

    /// Read a bool.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.payload
            .read_u32::<LittleEndian>()
            .map_err(|e| self.read_err(e))
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.payload
            .read_u64::<LittleEndian>()
            .map_err(|e| self.read_err(e))
    }

    /// Read a little-endian i64.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.payload
            .read_i64::<LittleEndian>()
            .map_err(|e| self.read_err(e))
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(AutomatonError::SnapshotFormat {
                cause: format!(
                    "section '{}': byte string of {} bytes exceeds remaining {}",
                    self.section_name,
                    len,
                    self.remaining()
                ),
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.payload
            .read_exact(&mut buf)
            .map_err(|e| self.read_err(e))?;
        Ok(buf)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_bytes()?).map_err(|e| AutomatonError::SnapshotFormat {
            cause: format!("section '{}': {}", self.section_name, e),
        })
    }

    /// Read an entity key.
    pub fn read_key(&mut self) -> Result<EntitySerializationKey> {
        self.payload
            .read_i32::<LittleEndian>()
            .map(EntitySerializationKey)
            .map_err(|e| self.read_err(e))
    }

    /// Read a length-prefixed JSON value.
    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let data = self.read_bytes()?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Make `entity` resolvable under `key` for the rest of the load pass.
    pub fn register_entity<T: Any + Send + Sync>(
        &mut self,
        key: EntitySerializationKey,
        entity: Arc<T>,
    ) -> Result<()> {
        if !key.is_assigned() {
            return Err(AutomatonError::UnresolvedEntity {
                key: key.0,
                detail: " (cannot register the unassigned key)".to_string(),
            });
        }
        if self.entities.insert(key, entity).is_some() {
            return Err(AutomatonError::SnapshotFormat {
                cause: format!("entity key {} registered twice", key),
            });
        }
        Ok(())
    }

    /// Resolve a key registered earlier in this load pass.
    pub fn get_entity<T: Any + Send + Sync>(&self, key: EntitySerializationKey) -> Result<Arc<T>> {
        let entity = self
            .entities
            .get(&key)
            .cloned()
            .ok_or_else(|| AutomatonError::UnresolvedEntity {
                key: key.0,
                detail: String::new(),
            })?;

        entity
            .downcast::<T>()
            .map_err(|_| AutomatonError::UnresolvedEntity {
                key: key.0,
                detail: format!(" as {}", std::any::type_name::<T>()),
            })
    }

    /// Number of registered entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}

impl Read for LoadContext {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.payload.read(buf)
    }
}
