//! Checkpointable snapshot stream.
//!
//! Layout:
//!
//! ```text
//! [magic "HSNP"][u32 format version]
//! section* : [u32 name_len][name][u8 kind][u64 payload_len][u32 crc32(payload)][payload]
//! [u32 0]    terminator
//! ```
//!
//! Every section is self-delimiting, so a reader can skip sections it has no
//! loader for.

use super::SectionKind;
use crate::error::{AutomatonError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Magic bytes for snapshot streams.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"HSNP";

/// Snapshot format version written by this build.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Maximum section name length.
const MAX_NAME_LEN: u32 = 4096;

fn format_err(cause: impl Into<String>) -> AutomatonError {
    AutomatonError::SnapshotFormat {
        cause: cause.into(),
    }
}

fn io_err(context: &str, err: io::Error) -> AutomatonError {
    format_err(format!("{}: {}", context, err))
}

/// A section read back from a snapshot.
#[derive(Debug)]
pub(crate) struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub payload: Vec<u8>,
}

/// Write the stream header.
pub(crate) fn write_header(out: &mut dyn Write, version: u32) -> Result<()> {
    out.write_all(SNAPSHOT_MAGIC)
        .and_then(|_| out.write_u32::<LittleEndian>(version))
        .map_err(|e| io_err("failed to write snapshot header", e))
}

/// Write one complete section.
pub(crate) fn write_section(
    out: &mut dyn Write,
    name: &str,
    kind: SectionKind,
    payload: &[u8],
) -> Result<()> {
    let name_len = u32::try_from(name.len())
        .ok()
        .filter(|len| *len > 0 && *len <= MAX_NAME_LEN)
        .ok_or_else(|| format_err(format!("invalid section name '{}'", name)))?;

    let write = |out: &mut dyn Write| -> io::Result<()> {
        out.write_u32::<LittleEndian>(name_len)?;
        out.write_all(name.as_bytes())?;
        out.write_u8(kind as u8)?;
        out.write_u64::<LittleEndian>(payload.len() as u64)?;
        out.write_u32::<LittleEndian>(crc32fast::hash(payload))?;
        out.write_all(payload)
    };
    write(out).map_err(|e| io_err(&format!("failed to write section '{}'", name), e))
}

/// Write the end-of-stream terminator and flush.
pub(crate) fn write_terminator(out: &mut dyn Write) -> Result<()> {
    out.write_u32::<LittleEndian>(0)
        .and_then(|_| out.flush())
        .map_err(|e| io_err("failed to finish snapshot", e))
}

/// Read and validate the stream header, returning the format version.
pub(crate) fn read_header(input: &mut dyn Read) -> Result<u32> {
    let mut magic = [0u8; 4];
    input
        .read_exact(&mut magic)
        .map_err(|e| io_err("failed to read magic", e))?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(format_err("invalid snapshot magic"));
    }

    input
        .read_u32::<LittleEndian>()
        .map_err(|e| io_err("failed to read format version", e))
}

/// Read the next section, or `None` at the terminator.
pub(crate) fn read_section(input: &mut dyn Read) -> Result<Option<Section>> {
    let name_len = input
        .read_u32::<LittleEndian>()
        .map_err(|e| io_err("snapshot truncated before terminator", e))?;
    if name_len == 0 {
        return Ok(None);
    }
    if name_len > MAX_NAME_LEN {
        return Err(format_err(format!("section name length {} too large", name_len)));
    }

    let mut name = vec![0u8; name_len as usize];
    input
        .read_exact(&mut name)
        .map_err(|e| io_err("failed to read section name", e))?;
    let name = String::from_utf8(name).map_err(|e| format_err(e.to_string()))?;

    let kind = input
        .read_u8()
        .map_err(|e| io_err("failed to read section kind", e))
        .and_then(|byte| {
            SectionKind::try_from(byte).map_err(|_| {
                format_err(format!("unknown kind {} for section '{}'", byte, name))
            })
        })?;

    let payload_len = input
        .read_u64::<LittleEndian>()
        .map_err(|e| io_err("failed to read section length", e))?;
    let stored_crc = input
        .read_u32::<LittleEndian>()
        .map_err(|e| io_err("failed to read section checksum", e))?;

    let mut payload = Vec::new();
    Read::take(&mut *input, payload_len)
        .read_to_end(&mut payload)
        .map_err(|e| io_err(&format!("failed to read section '{}'", name), e))?;
    if payload.len() as u64 != payload_len {
        return Err(format_err(format!(
            "section '{}' truncated: expected {} bytes, got {}",
            name,
            payload_len,
            payload.len()
        )));
    }

    let computed_crc = crc32fast::hash(&payload);
    if computed_crc != stored_crc {
        return Err(format_err(format!(
            "CRC mismatch in section '{}': expected {}, got {}",
            name, stored_crc, computed_crc
        )));
    }

    Ok(Some(Section {
        name,
        kind,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(sections: &[(&str, SectionKind, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, SNAPSHOT_FORMAT_VERSION).unwrap();
        for (name, kind, payload) in sections {
            write_section(&mut out, name, *kind, payload).unwrap();
        }
        write_terminator(&mut out).unwrap();
        out
    }

    #[test]
    fn sections_in_physical_order() {
        let data = stream(&[
            ("kv.keys", SectionKind::Keys, b"k"),
            ("kv.values", SectionKind::Values, b"vv"),
            ("kv.log", SectionKind::Async, b""),
        ]);
        let mut input = Cursor::new(data);

        assert_eq!(read_header(&mut input).unwrap(), SNAPSHOT_FORMAT_VERSION);
        let names: Vec<_> = std::iter::from_fn(|| read_section(&mut input).unwrap())
            .map(|s| (s.name, s.kind, s.payload.len()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("kv.keys".to_string(), SectionKind::Keys, 1),
                ("kv.values".to_string(), SectionKind::Values, 2),
                ("kv.log".to_string(), SectionKind::Async, 0),
            ]
        );
    }

    #[test]
    fn bad_magic() {
        let mut input = Cursor::new(b"XSNP\x01\x00\x00\x00".to_vec());
        assert!(read_header(&mut input).is_err());
    }

    #[test]
    fn corrupted_payload() {
        let mut data = stream(&[("kv.keys", SectionKind::Keys, b"payload")]);
        let pos = data.len() - 6;
        data[pos] ^= 0xFF;

        let mut input = Cursor::new(data);
        read_header(&mut input).unwrap();
        let err = read_section(&mut input).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn missing_terminator() {
        let mut data = stream(&[("kv.keys", SectionKind::Keys, b"payload")]);
        data.truncate(data.len() - 4);

        let mut input = Cursor::new(data);
        read_header(&mut input).unwrap();
        assert!(read_section(&mut input).unwrap().is_some());
        assert!(read_section(&mut input).is_err());
    }

    #[test]
    fn empty_name_rejected() {
        let mut out = Vec::new();
        assert!(write_section(&mut out, "", SectionKind::Keys, b"").is_err());
    }
}
