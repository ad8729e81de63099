//! Live session log writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::{
    COMPRESSED_DATA_FILE, HANDSHAKE_FILE, INDEX_FILE, LogIndexEntry, LogManifest, MANIFEST_FILE,
    RAW_DATA_FILE, encode_record,
};
use crate::codec::{CompressionCodec, Lz4Codec};
use crate::schema::{HandshakeBlob, Schema};
use crate::types::Frame;
use crate::{Result, StreamError};

/// Appends frames to a session log directory.
///
/// The writer lives on the consumer/logger side of the stream, never on the
/// producer's sampling thread. Uncompressed logs write fixed-width records and
/// can be compressed offline later ([`compress_log`](super::compress_log));
/// compressed logs LZ4-encode every record as it arrives and derive the index
/// on the fly.
#[derive(Debug)]
pub struct LogWriter {
    dir: PathBuf,
    schema: Arc<Schema>,
    data: BufWriter<File>,
    index: Option<BufWriter<File>>,
    codec: Option<Lz4Codec>,
    offset: u64,
    frames: u64,
    staging: Vec<u8>,
}

impl LogWriter {
    /// Create a session directory and its manifest, handshake and data files.
    ///
    /// Fails if the directory already contains a manifest; sessions are never
    /// appended across runs.
    pub fn create(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        schema: Arc<Schema>,
        compressed: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StreamError::file(dir.clone(), e))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            return Err(StreamError::configuration(format!(
                "{} already holds a recording session",
                dir.display()
            )));
        }

        let manifest = LogManifest {
            name: name.into(),
            compressed,
            timestamped: compressed,
            handshake_file: HANDSHAKE_FILE.to_string(),
            data_file: if compressed { COMPRESSED_DATA_FILE } else { RAW_DATA_FILE }.to_string(),
            index_file: compressed.then(|| INDEX_FILE.to_string()),
        };
        let manifest_text = serde_yaml_ng::to_string(&manifest)
            .map_err(|e| StreamError::configuration(format!("manifest serialization: {e}")))?;
        std::fs::write(&manifest_path, manifest_text)
            .map_err(|e| StreamError::file(manifest_path, e))?;

        let handshake_path = dir.join(HANDSHAKE_FILE);
        std::fs::write(&handshake_path, HandshakeBlob::from_schema(&schema).as_bytes())
            .map_err(|e| StreamError::file(handshake_path, e))?;

        let data_path = dir.join(&manifest.data_file);
        let data = BufWriter::new(
            File::create(&data_path).map_err(|e| StreamError::file(data_path, e))?,
        );
        let index = if compressed {
            let index_path = dir.join(INDEX_FILE);
            Some(BufWriter::new(
                File::create(&index_path).map_err(|e| StreamError::file(index_path, e))?,
            ))
        } else {
            None
        };

        info!(dir = %dir.display(), compressed, "recording session started");
        Ok(Self {
            dir,
            schema,
            data,
            index,
            codec: compressed.then_some(Lz4Codec),
            offset: 0,
            frames: 0,
            staging: Vec::new(),
        })
    }

    /// Append one frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.slots.len() != self.schema.slot_count() {
            return Err(StreamError::decode(format!(
                "frame has {} slots, log schema expects {}",
                frame.slots.len(),
                self.schema.slot_count()
            )));
        }

        let mut staging = std::mem::take(&mut self.staging);
        encode_record(frame, &mut staging);

        let write_result = match (&self.codec, &mut self.index) {
            (Some(codec), Some(index)) => {
                let block = codec.compress(&staging);
                let entry = LogIndexEntry { timestamp: frame.timestamp, offset: self.offset as i64 };
                index
                    .write_all(&entry.to_bytes())
                    .and_then(|()| self.data.write_all(&block))
                    .map(|()| block.len() as u64)
            }
            _ => self.data.write_all(&staging).map(|()| staging.len() as u64),
        };
        self.staging = staging;

        let written = write_result.map_err(|e| StreamError::file(self.dir.clone(), e))?;
        self.offset += written;
        self.frames += 1;
        Ok(())
    }

    /// Number of frames written so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Flush and close the session, returning the frame count.
    pub fn finish(mut self) -> Result<u64> {
        self.data.flush().map_err(|e| StreamError::file(self.dir.clone(), e))?;
        if let Some(index) = &mut self.index {
            index.flush().map_err(|e| StreamError::file(self.dir.clone(), e))?;
        }
        info!(dir = %self.dir.display(), frames = self.frames, "recording session finished");
        Ok(self.frames)
    }
}
