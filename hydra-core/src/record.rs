//! Changelog record types and serialization.
//!
//! Every record is framed as `[u32 total_len][u32 crc32(body)][body]`, little
//! endian, where the body carries the mutation header followed by the opaque
//! payload. Readers can therefore walk a changelog without understanding any
//! mutation type.

use crate::error::{HydraError, Result};
use crate::types::MutationId;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{self, Read, Write};

/// Size of the frame prefix (length + checksum).
pub const FRAME_HEADER_SIZE: usize = 4 + 4;

/// Minimum body size: timestamp, seed, id flag, type length, data length.
pub const MIN_BODY_SIZE: usize = 8 + 8 + 1 + 4 + 4;

/// Metadata captured when a mutation is logged.
///
/// Timestamp and random seed are fixed at log time so that every replica
/// applying the record sees identical values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationHeader {
    /// Handler key of the mutation.
    pub mutation_type: String,
    /// Client-supplied id, if any.
    pub mutation_id: Option<MutationId>,
    /// Wall clock at log time (Unix epoch milliseconds).
    pub timestamp_ms: u64,
    /// Seed for deterministic randomness during apply.
    pub random_seed: u64,
}

impl MutationHeader {
    /// Create a new header.
    pub fn new(
        mutation_type: impl Into<String>,
        mutation_id: Option<MutationId>,
        timestamp_ms: u64,
        random_seed: u64,
    ) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            mutation_id,
            timestamp_ms,
            random_seed,
        }
    }
}

/// A single changelog record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    /// Record header.
    pub header: MutationHeader,
    /// Opaque mutation payload.
    pub data: Bytes,
}

impl MutationRecord {
    /// Create a new record.
    pub fn new(header: MutationHeader, data: Bytes) -> Self {
        Self { header, data }
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.encode().map_err(|e| HydraError::RecordEncode {
            cause: e.to_string(),
        })
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.body_size());

        body.write_u64::<LittleEndian>(self.header.timestamp_ms)?;
        body.write_u64::<LittleEndian>(self.header.random_seed)?;

        match self.header.mutation_id {
            Some(id) => {
                body.write_u8(1)?;
                body.write_all(id.as_bytes())?;
            }
            None => body.write_u8(0)?,
        }

        let type_bytes = self.header.mutation_type.as_bytes();
        body.write_u32::<LittleEndian>(len_u32(type_bytes.len())?)?;
        body.write_all(type_bytes)?;

        body.write_u32::<LittleEndian>(len_u32(self.data.len())?)?;
        body.write_all(&self.data)?;

        let crc = crc32fast::hash(&body);
        let total_len = FRAME_HEADER_SIZE + body.len();

        let mut record = Vec::with_capacity(total_len);
        record.write_u32::<LittleEndian>(len_u32(total_len)?)?;
        record.write_u32::<LittleEndian>(crc)?;
        record.write_all(&body)?;

        Ok(record)
    }

    /// Deserialize a record from bytes.
    ///
    /// `bytes` must start at a frame boundary; trailing bytes past the frame
    /// are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE + MIN_BODY_SIZE {
            return Err(corruption(format!(
                "record too small: {} bytes",
                bytes.len()
            )));
        }

        let mut cursor = io::Cursor::new(bytes);
        let total_len = cursor.read_u32::<LittleEndian>().map_err(io_corruption)? as usize;
        let stored_crc = cursor.read_u32::<LittleEndian>().map_err(io_corruption)?;

        if total_len < FRAME_HEADER_SIZE + MIN_BODY_SIZE {
            return Err(corruption(format!("invalid record length {}", total_len)));
        }
        if bytes.len() < total_len {
            return Err(corruption(format!(
                "record truncated: expected {} bytes, got {}",
                total_len,
                bytes.len()
            )));
        }

        let body = &bytes[FRAME_HEADER_SIZE..total_len];
        let computed_crc = crc32fast::hash(body);
        if computed_crc != stored_crc {
            return Err(corruption(format!(
                "CRC mismatch: expected {}, got {}",
                stored_crc, computed_crc
            )));
        }

        Self::decode_body(body).map_err(io_corruption)
    }

    fn decode_body(body: &[u8]) -> io::Result<Self> {
        let mut cursor = io::Cursor::new(body);

        let timestamp_ms = cursor.read_u64::<LittleEndian>()?;
        let random_seed = cursor.read_u64::<LittleEndian>()?;

        let mutation_id = match cursor.read_u8()? {
            0 => None,
            1 => {
                let mut id = [0u8; 16];
                cursor.read_exact(&mut id)?;
                Some(MutationId::from_bytes(id))
            }
            flag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid mutation id flag {}", flag),
                ));
            }
        };

        let type_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut type_buf = vec![0u8; type_len];
        cursor.read_exact(&mut type_buf)?;
        let mutation_type = String::from_utf8(type_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let data_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut data = vec![0u8; data_len];
        cursor.read_exact(&mut data)?;

        Ok(Self {
            header: MutationHeader {
                mutation_type,
                mutation_id,
                timestamp_ms,
                random_seed,
            },
            data: Bytes::from(data),
        })
    }

    /// Get the total serialized size of this record.
    pub fn serialized_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_size()
    }

    fn body_size(&self) -> usize {
        let mut size = MIN_BODY_SIZE;
        if self.header.mutation_id.is_some() {
            size += 16;
        }
        size + self.header.mutation_type.len() + self.data.len()
    }
}

/// Read the length prefix of the frame starting at `bytes`, if complete.
pub fn peek_frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 4 {
        return None;
    }
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&bytes[..4]);
    Some(u32::from_le_bytes(prefix) as usize)
}

fn len_u32(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("length {} exceeds u32", len),
        )
    })
}

fn corruption(cause: String) -> HydraError {
    HydraError::RecordCorruption { cause }
}

fn io_corruption(err: io::Error) -> HydraError {
    corruption(err.to_string())
}
