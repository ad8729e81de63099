//! Offline log compression.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytes::Bytes;
use tracing::info;

use super::{
    COMPRESSED_DATA_FILE, INDEX_FILE, LogIndexEntry, LogManifest, MANIFEST_FILE, record_len,
};
use crate::codec::{CompressionCodec, Lz4Codec};
use crate::schema::HandshakeBlob;
use crate::{Result, StreamError};

/// Compress an uncompressed session log in place.
///
/// Processes every fixed-width record of the raw data file in order,
/// LZ4-compressing each and deriving the timestamp index as a side effect.
/// The input is rejected, and the session left untouched, if any record is
/// not exactly the expected length (a short tail means a torn write; silently
/// compressing it would corrupt the log). On success the manifest points at
/// the compressed data and index files and the raw data file is removed.
pub fn compress_log(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();

    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest_text = std::fs::read_to_string(&manifest_path)
        .map_err(|e| StreamError::file(manifest_path.clone(), e))?;
    let mut manifest: LogManifest = serde_yaml_ng::from_str(&manifest_text)
        .map_err(|e| StreamError::configuration(format!("manifest: {e}")))?;

    if manifest.compressed {
        return Err(StreamError::configuration(format!(
            "{} is already compressed",
            dir.display()
        )));
    }

    let handshake_path = dir.join(&manifest.handshake_file);
    let blob =
        std::fs::read(&handshake_path).map_err(|e| StreamError::file(handshake_path, e))?;
    let schema = HandshakeBlob::from_bytes(Bytes::from(blob)).parse()?;
    let record_len = record_len(schema.slot_count());

    let raw_path = dir.join(&manifest.data_file);
    let raw_size = std::fs::metadata(&raw_path)
        .map_err(|e| StreamError::file(raw_path.clone(), e))?
        .len();
    if raw_size % record_len as u64 != 0 {
        return Err(StreamError::decode(format!(
            "{} is {raw_size} bytes, not a multiple of the {record_len} byte record",
            raw_path.display()
        )));
    }

    let mut raw =
        BufReader::new(File::open(&raw_path).map_err(|e| StreamError::file(raw_path.clone(), e))?);

    let data_path = dir.join(COMPRESSED_DATA_FILE);
    let index_path = dir.join(INDEX_FILE);
    let mut data = BufWriter::new(
        File::create(&data_path).map_err(|e| StreamError::file(data_path.clone(), e))?,
    );
    let mut index = BufWriter::new(
        File::create(&index_path).map_err(|e| StreamError::file(index_path.clone(), e))?,
    );

    let codec = Lz4Codec;
    let mut record = vec![0u8; record_len];
    let mut offset = 0u64;
    let mut count = 0u64;
    loop {
        match read_record(&mut raw, &mut record)? {
            ReadOutcome::Eof => break,
            ReadOutcome::Short(got) => {
                return Err(StreamError::decode(format!(
                    "record {count} is {got} bytes, expected {record_len}; refusing to compress"
                )));
            }
            ReadOutcome::Full => {}
        }

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&record[..8]);
        let entry =
            LogIndexEntry { timestamp: i64::from_le_bytes(timestamp), offset: offset as i64 };
        index
            .write_all(&entry.to_bytes())
            .map_err(|e| StreamError::file(index_path.clone(), e))?;

        let block = codec.compress(&record);
        data.write_all(&block).map_err(|e| StreamError::file(data_path.clone(), e))?;
        offset += block.len() as u64;
        count += 1;
    }
    data.flush().map_err(|e| StreamError::file(data_path.clone(), e))?;
    index.flush().map_err(|e| StreamError::file(index_path.clone(), e))?;

    manifest.compressed = true;
    manifest.timestamped = true;
    manifest.data_file = COMPRESSED_DATA_FILE.to_string();
    manifest.index_file = Some(INDEX_FILE.to_string());
    let manifest_text = serde_yaml_ng::to_string(&manifest)
        .map_err(|e| StreamError::configuration(format!("manifest serialization: {e}")))?;
    std::fs::write(&manifest_path, manifest_text)
        .map_err(|e| StreamError::file(manifest_path, e))?;

    std::fs::remove_file(&raw_path).map_err(|e| StreamError::file(raw_path, e))?;

    info!(dir = %dir.display(), records = count, "log compressed");
    Ok(())
}

enum ReadOutcome {
    Full,
    Short(usize),
    Eof,
}

/// Fill `record` completely, tolerating short `read` returns; a partial fill
/// at end of file is reported as `Short`.
fn read_record(reader: &mut impl Read, record: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < record.len() {
        let n = reader
            .read(&mut record[filled..])
            .map_err(|e| StreamError::decode(format!("log read failed: {e}")))?;
        if n == 0 {
            return Ok(if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Short(filled) });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
