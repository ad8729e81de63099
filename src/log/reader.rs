//! Session log reader.
//!
//! The data and index files are loaded into memory at construction time for
//! fast random access; a multi-hour variable log is small next to the video it
//! accompanies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use super::{LogIndexEntry, LogManifest, MANIFEST_FILE, decode_record, record_len};
use crate::codec::{CompressionCodec, Lz4Codec};
use crate::schema::{HandshakeBlob, Schema};
use crate::types::Frame;
use crate::{Result, StreamError};

/// Reads a recorded session back, frame by frame or by random access.
#[derive(Debug)]
pub struct LogReader {
    dir: PathBuf,
    manifest: LogManifest,
    schema: Arc<Schema>,
    data: Vec<u8>,
    index: Option<Vec<LogIndexEntry>>,
    record_len: usize,
}

impl LogReader {
    /// Open a session directory: manifest, handshake, data and index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_text = std::fs::read_to_string(&manifest_path)
            .map_err(|e| StreamError::file(manifest_path.clone(), e))?;
        let manifest: LogManifest = serde_yaml_ng::from_str(&manifest_text)
            .map_err(|e| StreamError::configuration(format!("manifest: {e}")))?;

        let handshake_path = dir.join(&manifest.handshake_file);
        let blob = std::fs::read(&handshake_path)
            .map_err(|e| StreamError::file(handshake_path, e))?;
        let schema = HandshakeBlob::from_bytes(Bytes::from(blob)).parse()?;
        let record_len = record_len(schema.slot_count());

        let data_path = dir.join(&manifest.data_file);
        let data = std::fs::read(&data_path).map_err(|e| StreamError::file(data_path, e))?;

        let index = match &manifest.index_file {
            Some(name) => {
                let index_path = dir.join(name);
                let raw =
                    std::fs::read(&index_path).map_err(|e| StreamError::file(index_path, e))?;
                if raw.len() % LogIndexEntry::LEN != 0 {
                    return Err(StreamError::decode(format!(
                        "index file is {} bytes, not a multiple of {}",
                        raw.len(),
                        LogIndexEntry::LEN
                    )));
                }
                let mut entries = Vec::with_capacity(raw.len() / LogIndexEntry::LEN);
                for chunk in raw.chunks_exact(LogIndexEntry::LEN) {
                    let mut bytes = [0u8; LogIndexEntry::LEN];
                    bytes.copy_from_slice(chunk);
                    entries.push(LogIndexEntry::from_bytes(&bytes));
                }
                Some(entries)
            }
            None => {
                if data.len() % record_len != 0 {
                    return Err(StreamError::decode(format!(
                        "data file is {} bytes, not a multiple of the {record_len} byte record",
                        data.len()
                    )));
                }
                None
            }
        };

        if manifest.compressed && index.is_none() {
            return Err(StreamError::configuration(
                "compressed log without an index file".to_string(),
            ));
        }

        Ok(Self { dir, manifest, schema, data, index, record_len })
    }

    pub fn manifest(&self) -> &LogManifest {
        &self.manifest
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of recorded frames.
    pub fn frame_count(&self) -> usize {
        match &self.index {
            Some(index) => index.len(),
            None => self.data.len() / self.record_len,
        }
    }

    /// Index entries, when the log is timestamped.
    pub fn index(&self) -> Option<&[LogIndexEntry]> {
        self.index.as_deref()
    }

    /// Read one frame by position.
    pub fn read_frame(&self, position: usize) -> Result<Frame> {
        if position >= self.frame_count() {
            return Err(StreamError::decode(format!(
                "frame {position} out of range, log holds {}",
                self.frame_count()
            )));
        }

        if self.manifest.compressed {
            let index = self.index.as_ref().ok_or_else(|| {
                StreamError::configuration("compressed log without an index".to_string())
            })?;
            let start = index[position].offset as usize;
            let end = index
                .get(position + 1)
                .map(|e| e.offset as usize)
                .unwrap_or(self.data.len());
            if start > end || end > self.data.len() {
                return Err(StreamError::decode(format!(
                    "index entry {position} points outside the data file"
                )));
            }
            let record = Lz4Codec.decompress(&self.data[start..end], self.record_len)?;
            decode_record(&record, self.schema.slot_count())
        } else {
            let start = position * self.record_len;
            decode_record(&self.data[start..start + self.record_len], self.schema.slot_count())
        }
    }

    /// Iterate all frames in recording order.
    pub fn frames(&self) -> impl Iterator<Item = Result<Frame>> + '_ {
        (0..self.frame_count()).map(|i| self.read_frame(i))
    }
}

#[cfg(test)]
mod tests {
    use super::super::LogWriter;
    use super::*;
    use crate::registry::{NodeId, RegistryTree};
    use crate::types::{VariableDescriptor, VariableKind};

    fn sample_schema(variables: usize) -> Arc<Schema> {
        let mut tree = RegistryTree::new("root");
        for i in 0..variables {
            tree.add_variable(
                NodeId::ROOT,
                VariableDescriptor::new(format!("v{i}"), VariableKind::Double),
            )
            .unwrap();
        }
        Schema::from_tree(&tree, &[], 0.001).unwrap()
    }

    fn sample_frame(schema: &Schema, uid: u64) -> Frame {
        let mut frame = Frame::zeroed(schema.slot_count());
        frame.uid = uid;
        frame.timestamp = uid as i64 * 1_000_000;
        for (i, slot) in frame.slots.iter_mut().enumerate() {
            *slot = ((uid as f64) * 0.25 + i as f64).to_bits();
        }
        frame
    }

    fn write_session(dir: &Path, schema: &Arc<Schema>, compressed: bool, frames: u64) {
        let mut writer =
            LogWriter::create(dir, "walking_test", schema.clone(), compressed).unwrap();
        for uid in 0..frames {
            writer.write_frame(&sample_frame(schema, uid)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), frames);
    }

    #[test]
    fn uncompressed_log_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema(12);
        write_session(dir.path(), &schema, false, 50);

        let reader = LogReader::open(dir.path()).unwrap();
        assert!(!reader.manifest().compressed);
        assert_eq!(reader.frame_count(), 50);
        assert_eq!(*reader.schema(), schema);
        for uid in 0..50u64 {
            assert_eq!(reader.read_frame(uid as usize).unwrap(), sample_frame(&schema, uid));
        }
    }

    #[test]
    fn compressed_log_round_trips_with_index() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema(12);
        write_session(dir.path(), &schema, true, 50);

        let reader = LogReader::open(dir.path()).unwrap();
        assert!(reader.manifest().compressed);
        assert_eq!(reader.frame_count(), 50);

        let index = reader.index().unwrap();
        assert_eq!(index.len(), 50);
        assert_eq!(index[0].offset, 0);
        for (uid, entry) in index.iter().enumerate() {
            assert_eq!(entry.timestamp, uid as i64 * 1_000_000);
        }

        // Random access through the index, out of order.
        for uid in [49u64, 0, 25, 7] {
            assert_eq!(reader.read_frame(uid as usize).unwrap(), sample_frame(&schema, uid));
        }
    }

    #[test]
    fn double_create_in_same_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema(4);
        write_session(dir.path(), &schema, false, 1);
        let err = LogWriter::create(dir.path(), "again", schema, false).unwrap_err();
        assert!(matches!(err, StreamError::Configuration { .. }));
    }

    #[test]
    fn truncated_raw_data_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let schema = sample_schema(4);
        write_session(dir.path(), &schema, false, 3);

        let data_path = dir.path().join(super::super::RAW_DATA_FILE);
        let mut data = std::fs::read(&data_path).unwrap();
        data.truncate(data.len() - 5);
        std::fs::write(&data_path, data).unwrap();

        let err = LogReader::open(dir.path()).unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));
    }
}
