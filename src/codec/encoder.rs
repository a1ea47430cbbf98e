//! Frame encoder: the inverse of the framer's decode step.

use std::{borrow::Cow, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use super::{BIG_SIZE_THRESHOLD, CodecConfig, CodecError, PacketHeader, compression};

/// A ready-to-send wire frame plus the metadata recorded at encode time.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    /// The complete frame: header byte, length field, transformed payload.
    pub frame: Bytes,
    /// Header flags baked into the frame.
    pub header: PacketHeader,
    /// Payload length before any transform, kept for traffic statistics.
    pub original_size: usize,
}

/// Turns application payloads into wire frames.
///
/// Transforms run in the fixed order encrypt-then-compress; the framer
/// inverts them as decompress-then-decrypt. Compression only sticks when it
/// actually shrinks the payload, otherwise the flag stays clear and the
/// untouched bytes ship.
pub struct FrameEncoder {
    config: Arc<CodecConfig>,
}

impl FrameEncoder {
    /// Create an encoder over shared codec settings.
    #[must_use]
    pub fn new(config: Arc<CodecConfig>) -> Self { Self { config } }

    /// Encode `payload` into a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::CipherUnavailable`] when `encrypt` is requested
    /// without a configured cipher, [`CodecError::Encrypt`] when the cipher
    /// fails, and [`CodecError::FrameTooLarge`] or
    /// [`CodecError::LengthOverflow`] when the transformed payload cannot be
    /// carried by a single frame.
    pub fn encode(&self, payload: &[u8], encrypt: bool) -> Result<EncodedFrame, CodecError> {
        let original_size = payload.len();

        let mut bytes: Cow<'_, [u8]> = Cow::Borrowed(payload);
        let mut encrypted = false;
        if encrypt {
            let cipher = self
                .config
                .cipher
                .as_deref()
                .ok_or(CodecError::CipherUnavailable)?;
            bytes = Cow::Owned(cipher.encrypt(&bytes)?);
            encrypted = true;
        }

        let mut compressed = false;
        if self.config.compression_enabled && bytes.len() > self.config.compression_threshold {
            let packed = compression::compress(&bytes);
            if packed.len() < bytes.len() {
                bytes = Cow::Owned(packed);
                compressed = true;
            }
        }

        if bytes.len() > self.config.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                declared: bytes.len(),
                limit: self.config.max_frame_bytes,
            });
        }
        if u32::try_from(bytes.len()).is_err() {
            return Err(CodecError::LengthOverflow(bytes.len()));
        }

        let big_sized = bytes.len() > self.config.big_size_threshold.min(BIG_SIZE_THRESHOLD);
        let header = PacketHeader::new(compressed, big_sized, encrypted);

        let mut frame = BytesMut::with_capacity(1 + header.length_field_bytes() + bytes.len());
        frame.put_u8(header.encode());
        if big_sized {
            #[expect(clippy::cast_possible_truncation, reason = "length checked above")]
            frame.put_u32(bytes.len() as u32);
        } else {
            #[expect(clippy::cast_possible_truncation, reason = "branch implies len <= u16::MAX")]
            frame.put_u16(bytes.len() as u16);
        }
        frame.extend_from_slice(&bytes);

        Ok(EncodedFrame {
            frame: frame.freeze(),
            header,
            original_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::codec::{ChaChaPacketCipher, Framer};

    fn config_with_cipher(compression_threshold: usize) -> Arc<CodecConfig> {
        Arc::new(CodecConfig {
            compression_threshold,
            cipher: Some(Arc::new(ChaChaPacketCipher::new(&[7u8; 32]))),
            ..CodecConfig::default()
        })
    }

    fn round_trip(config: &Arc<CodecConfig>, payload: &[u8], encrypt: bool) {
        let encoded = FrameEncoder::new(Arc::clone(config))
            .encode(payload, encrypt)
            .expect("encode");
        assert_eq!(encoded.original_size, payload.len());

        let mut framer = Framer::new(Arc::clone(config));
        let mut out = Vec::new();
        framer.feed(&encoded.frame, &mut out).expect("decode");
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], payload);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(65_535)]
    #[case(65_536)]
    #[case(1_000_000)]
    fn round_trips_boundary_sizes_with_all_flag_combinations(#[case] size: usize) {
        let payload: Vec<u8> = (0..size).map(|i| (i % 241) as u8).collect();
        // Plain, compressed (tiny threshold), encrypted, and both.
        for threshold in [usize::MAX, 0] {
            for encrypt in [false, true] {
                let config = Arc::new(CodecConfig {
                    compression_enabled: threshold == 0,
                    compression_threshold: threshold.min(1),
                    cipher: Some(Arc::new(ChaChaPacketCipher::new(&[7u8; 32]))),
                    ..CodecConfig::default()
                });
                round_trip(&config, &payload, encrypt);
            }
        }
    }

    #[test]
    fn incompressible_payload_keeps_flag_clear() {
        let config = config_with_cipher(1);
        // High-entropy bytes: lz4 cannot shrink them.
        let payload: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let encoded = FrameEncoder::new(config).encode(&payload, false).expect("encode");
        assert!(!encoded.header.is_compressed());
    }

    #[test]
    fn compression_is_applied_above_threshold() {
        let config = config_with_cipher(64);
        let payload = vec![0u8; 10_000];
        let encoded = FrameEncoder::new(config).encode(&payload, false).expect("encode");
        assert!(encoded.header.is_compressed());
        assert!(encoded.frame.len() < payload.len());
    }

    #[test]
    fn encryption_without_cipher_is_refused() {
        let config = Arc::new(CodecConfig::default());
        assert!(matches!(
            FrameEncoder::new(config).encode(b"secret", true),
            Err(CodecError::CipherUnavailable)
        ));
    }

    #[test]
    fn big_size_boundary_is_exclusive() {
        let config = Arc::new(CodecConfig {
            compression_enabled: false,
            ..CodecConfig::default()
        });
        let encoder = FrameEncoder::new(Arc::clone(&config));
        let at_limit = encoder.encode(&vec![0u8; 65_535], false).expect("encode");
        assert!(!at_limit.header.is_big_sized());
        let over_limit = encoder.encode(&vec![0u8; 65_536], false).expect("encode");
        assert!(over_limit.header.is_big_sized());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let config = Arc::new(CodecConfig {
            compression_enabled: false,
            max_frame_bytes: 1024,
            ..CodecConfig::default()
        });
        assert!(matches!(
            FrameEncoder::new(config).encode(&vec![0u8; 2048], false),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
