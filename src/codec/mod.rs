//! Pluggable byte-block compression.
//!
//! The codec is injected explicitly into the segment planner, frame encoder
//! and frame decoder; there is no process-wide default. Besides the
//! compress/decompress pair, a codec exposes the two sizing functions the
//! planner inverts to decide how many variables fit one transport segment:
//!
//! - `max_compressed_len(n)` is an upper bound on the compressed size of any
//!   n-byte input, and
//! - `min_decompressed_len(n)` is a safe lower bound on how many uncompressed
//!   bytes could have produced an n-byte compressed block. For any length `L`,
//!   `min_decompressed_len(max_compressed_len(L))` is within one rounding unit
//!   of `L` (integer rounding slack, not exact equality).

use crate::{Result, StreamError};

/// Deterministic, lossless block compressor contract.
pub trait CompressionCodec: Send + Sync + 'static {
    /// Upper bound on compressed size for any input of `uncompressed_len`
    /// bytes.
    fn max_compressed_len(&self, uncompressed_len: usize) -> usize;

    /// Safe lower bound on the uncompressed size that can be packed into
    /// `compressed_len` bytes.
    fn min_decompressed_len(&self, compressed_len: usize) -> usize;

    /// Compress `src` into a fresh buffer.
    fn compress(&self, src: &[u8]) -> Vec<u8>;

    /// Decompress a block whose original length is known to be
    /// `expected_len`. Fails with [`StreamError::Decode`] on corrupt input.
    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// No-op codec: bytes pass through unchanged.
///
/// Used for uncompressed log variants and as the reference point for the
/// sizing contract (`max == min == identity`).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl CompressionCodec for IdentityCodec {
    fn max_compressed_len(&self, uncompressed_len: usize) -> usize {
        uncompressed_len
    }

    fn min_decompressed_len(&self, compressed_len: usize) -> usize {
        compressed_len
    }

    fn compress(&self, src: &[u8]) -> Vec<u8> {
        src.to_vec()
    }

    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        if compressed.len() != expected_len {
            return Err(StreamError::decode(format!(
                "identity block is {} bytes, expected {}",
                compressed.len(),
                expected_len
            )));
        }
        Ok(compressed.to_vec())
    }
}

/// LZ4 block codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl CompressionCodec for Lz4Codec {
    fn max_compressed_len(&self, uncompressed_len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(uncompressed_len)
    }

    fn min_decompressed_len(&self, compressed_len: usize) -> usize {
        // Inverse of the worst-case expansion `16 + n + n/255`, rounded down.
        compressed_len.saturating_sub(16) / 256 * 255
            + compressed_len.saturating_sub(16) % 256 * 255 / 256
    }

    fn compress(&self, src: &[u8]) -> Vec<u8> {
        lz4_flex::block::compress(src)
    }

    fn decompress(&self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(compressed, expected_len)
            .map_err(|e| StreamError::decode(format!("lz4: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn identity_bounds_are_exact() {
        let codec = IdentityCodec;
        for n in [0usize, 1, 8, 8000, 264_000] {
            assert_eq!(codec.max_compressed_len(n), n);
            assert_eq!(codec.min_decompressed_len(n), n);
        }
    }

    #[test]
    fn identity_rejects_wrong_length() {
        let codec = IdentityCodec;
        assert!(codec.decompress(&[1, 2, 3], 4).is_err());
    }

    #[test]
    fn lz4_sizing_inversion_within_one_unit() {
        let codec = Lz4Codec;
        for len in (0usize..100_000).step_by(977) {
            let inverted = codec.min_decompressed_len(codec.max_compressed_len(len));
            assert!(
                inverted <= len && len - inverted <= 1,
                "len {len} inverted to {inverted}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_identity_round_trip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let codec = IdentityCodec;
            let compressed = codec.compress(&data);
            prop_assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
        }

        #[test]
        fn prop_lz4_round_trip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let codec = Lz4Codec;
            let compressed = codec.compress(&data);
            prop_assert!(compressed.len() <= codec.max_compressed_len(data.len()));
            prop_assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
        }

        #[test]
        fn prop_lz4_round_trip_compressible(byte in any::<u8>(), len in 0usize..16384) {
            // Highly repetitive input exercises the match-copy path.
            let data = vec![byte; len];
            let codec = Lz4Codec;
            let compressed = codec.compress(&data);
            prop_assert!(compressed.len() <= codec.max_compressed_len(data.len()));
            prop_assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
        }

        #[test]
        fn prop_lz4_corrupt_block_is_decode_error(data in prop::collection::vec(any::<u8>(), 64..512)) {
            let codec = Lz4Codec;
            let mut compressed = codec.compress(&data);
            // Truncating the block must never panic, only error (or, for a
            // pathological prefix, still fail the length check upstream).
            compressed.truncate(compressed.len() / 2);
            let result = codec.decompress(&compressed, data.len());
            prop_assert!(result.is_err());
        }
    }
}
