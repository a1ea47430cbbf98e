//! Binary wire codec: header flags, streaming framer, and frame encoder.
//!
//! One frame on the wire is `[header byte][length field][payload]`. The
//! header byte carries the flags decoded by [`PacketHeader`]; the length
//! field is 2 bytes, or 4 when the big-sized flag is set, big-endian either
//! way. Payload transforms are fixed as encrypt-then-compress on encode and
//! the exact inverse, decompress-then-decrypt, on decode.

use std::sync::Arc;

pub mod compression;
pub mod crypto;
pub mod encoder;
pub mod error;
pub mod framer;
mod header;

pub use crypto::{ChaChaPacketCipher, PacketCipher};
pub use encoder::{EncodedFrame, FrameEncoder};
pub use error::CodecError;
pub use framer::{Framer, PendingPacket, ReadState};
pub use header::PacketHeader;

/// Largest payload representable by the 2-byte length field; anything longer
/// switches the frame to the 4-byte field and sets the big-sized flag.
pub const BIG_SIZE_THRESHOLD: usize = u16::MAX as usize;

/// Default cap on a single frame's transformed payload (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default payload length above which the encoder attempts compression.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 3000;

/// Shared codec settings consulted by the framer and the encoder.
///
/// One instance is built from the engine configuration and shared by every
/// session, so both directions of the pipeline agree on limits, thresholds,
/// and the cipher.
pub struct CodecConfig {
    /// Upper bound on a frame's declared payload length.
    pub max_frame_bytes: usize,
    /// Whether the encoder may compress payloads at all.
    pub compression_enabled: bool,
    /// Payload length above which compression is attempted.
    pub compression_threshold: usize,
    /// Payload length above which the 4-byte length field is used. Clamped
    /// to [`BIG_SIZE_THRESHOLD`], the most the 2-byte field can express.
    pub big_size_threshold: usize,
    /// Cipher applied to frames flagged encrypted, if configured.
    pub cipher: Option<Arc<dyn PacketCipher>>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            compression_enabled: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            big_size_threshold: BIG_SIZE_THRESHOLD,
            cipher: None,
        }
    }
}

impl std::fmt::Debug for CodecConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecConfig")
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("compression_enabled", &self.compression_enabled)
            .field("compression_threshold", &self.compression_threshold)
            .field("big_size_threshold", &self.big_size_threshold)
            .field("cipher", &self.cipher.as_ref().map(|_| "<cipher>"))
            .finish()
    }
}
