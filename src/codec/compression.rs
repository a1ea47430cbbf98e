//! LZ4 block compression for frame payloads.
//!
//! The compressed form carries lz4_flex's little-endian size prefix so the
//! decoder can allocate the exact output buffer. The claimed size is checked
//! against the frame limit before any allocation happens.

use super::error::CodecError;

/// Compress `data`, prepending the uncompressed size.
#[must_use]
pub fn compress(data: &[u8]) -> Vec<u8> { lz4_flex::compress_prepend_size(data) }

/// Expand a size-prefixed compressed payload.
///
/// # Errors
///
/// Returns [`CodecError::DecompressTooLarge`] when the claimed uncompressed
/// size exceeds `limit`, and [`CodecError::Decompress`] when the block is
/// corrupt or truncated.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    if data.len() >= 4 {
        let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if claimed > limit {
            return Err(CodecError::DecompressTooLarge { claimed, limit });
        }
    }
    lz4_flex::decompress_size_prepended(data).map_err(CodecError::Decompress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_compressible_data() {
        let payload = vec![7u8; 10_000];
        let packed = compress(&payload);
        assert!(packed.len() < payload.len());
        assert_eq!(decompress(&packed, 1 << 20).expect("decompress"), payload);
    }

    #[test]
    fn round_trips_empty_payload() {
        let packed = compress(&[]);
        assert_eq!(decompress(&packed, 1 << 20).expect("decompress"), Vec::<u8>::new());
    }

    #[test]
    fn oversized_claim_is_rejected_before_allocation() {
        let mut packed = compress(&[1, 2, 3]);
        packed[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decompress(&packed, 1 << 20),
            Err(CodecError::DecompressTooLarge { .. })
        ));
    }

    #[test]
    fn corrupt_block_is_an_error() {
        let payload = vec![42u8; 4096];
        let mut packed = compress(&payload);
        let end = packed.len() - 1;
        packed.truncate(end);
        assert!(decompress(&packed, 1 << 20).is_err());
    }
}
