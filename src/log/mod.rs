//! Durable on-disk logging of the registry stream.
//!
//! One directory per recording session:
//!
//! - `manifest.yaml`: which variant this log is and which files hold it
//! - `handshake.dat`: the handshake blob, verbatim, fixing slot order
//! - `robot.dat`: uncompressed variant, fixed-width frame records
//! - `robot.lz4` + `robot.idx`: compressed variant, LZ4 blocks plus a
//!   16-byte-record index of (frame timestamp, byte offset)
//!
//! A frame record is `timestamp i64 | uid u64 | slot u64 × slot_count`, all
//! little-endian, so the uncompressed record width is fixed by the schema and
//! the timestamp is always the record's first eight bytes; the offline
//! compression pass and the index rely on both.

mod convert;
mod reader;
mod writer;

pub use convert::compress_log;
pub use reader::LogReader;
pub use writer::LogWriter;

use serde::{Deserialize, Serialize};

use crate::types::Frame;
use crate::{Result, StreamError};

pub(crate) const MANIFEST_FILE: &str = "manifest.yaml";
pub(crate) const HANDSHAKE_FILE: &str = "handshake.dat";
pub(crate) const RAW_DATA_FILE: &str = "robot.dat";
pub(crate) const COMPRESSED_DATA_FILE: &str = "robot.lz4";
pub(crate) const INDEX_FILE: &str = "robot.idx";

/// Session manifest, stored as YAML at the log directory root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogManifest {
    /// Human-readable session name.
    pub name: String,
    /// Whether the data file holds LZ4 blocks (with an index) or raw records.
    pub compressed: bool,
    /// Whether an index of per-record timestamps exists.
    pub timestamped: bool,
    pub handshake_file: String,
    pub data_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_file: Option<String>,
}

/// One fixed-width index record: the frame timestamp and the byte offset of
/// its (compressed) record in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogIndexEntry {
    pub timestamp: i64,
    pub offset: i64,
}

impl LogIndexEntry {
    pub(crate) const LEN: usize = 16;

    pub(crate) fn to_bytes(self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..8].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[8..].copy_from_slice(&self.offset.to_le_bytes());
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let mut timestamp = [0u8; 8];
        let mut offset = [0u8; 8];
        timestamp.copy_from_slice(&bytes[..8]);
        offset.copy_from_slice(&bytes[8..]);
        Self { timestamp: i64::from_le_bytes(timestamp), offset: i64::from_le_bytes(offset) }
    }
}

/// Uncompressed record width for a schema with `slot_count` slots.
pub(crate) fn record_len(slot_count: usize) -> usize {
    8 * (2 + slot_count)
}

pub(crate) fn encode_record(frame: &Frame, out: &mut Vec<u8>) {
    out.clear();
    out.extend_from_slice(&frame.timestamp.to_le_bytes());
    out.extend_from_slice(&frame.uid.to_le_bytes());
    for slot in &frame.slots {
        out.extend_from_slice(&slot.to_le_bytes());
    }
}

pub(crate) fn decode_record(record: &[u8], slot_count: usize) -> Result<Frame> {
    if record.len() != record_len(slot_count) {
        return Err(StreamError::decode(format!(
            "log record is {} bytes, expected {}",
            record.len(),
            record_len(slot_count)
        )));
    }
    let mut field = [0u8; 8];
    field.copy_from_slice(&record[..8]);
    let timestamp = i64::from_le_bytes(field);
    field.copy_from_slice(&record[8..16]);
    let uid = u64::from_le_bytes(field);

    let mut slots = Vec::with_capacity(slot_count);
    for chunk in record[16..].chunks_exact(8) {
        field.copy_from_slice(chunk);
        slots.push(u64::from_le_bytes(field));
    }
    Ok(Frame { uid, timestamp, slots })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_entry_round_trips() {
        let entry = LogIndexEntry { timestamp: -5, offset: 1 << 40 };
        assert_eq!(LogIndexEntry::from_bytes(&entry.to_bytes()), entry);
    }

    #[test]
    fn record_round_trips() {
        let frame = Frame { uid: 77, timestamp: -123456789, slots: vec![1, 2, u64::MAX] };
        let mut buf = Vec::new();
        encode_record(&frame, &mut buf);
        assert_eq!(buf.len(), record_len(3));
        // The timestamp leads the record; the index and the offline
        // compressor both read it from there.
        assert_eq!(&buf[..8], &(-123456789i64).to_le_bytes());
        assert_eq!(decode_record(&buf, 3).unwrap(), frame);
    }

    #[test]
    fn short_record_is_decode_error() {
        let err = decode_record(&[0u8; 20], 3).unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));
    }
}
