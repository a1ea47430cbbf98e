//! Error types for wire-frame encoding and decoding.

use thiserror::Error;

/// Errors raised while encoding or decoding wire frames.
///
/// Decode-side variants abort only the in-flight frame: the framer resets to
/// its initial state and the connection stays open. Encode-side variants are
/// returned to the caller before anything is queued.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CodecError {
    /// The header byte used bit positions outside the defined flag set.
    #[error("malformed header byte {byte:#04x}")]
    MalformedHeader {
        /// The offending header byte.
        byte: u8,
    },
    /// The header byte did not declare a length prefix, which the framer
    /// requires to delimit the frame.
    #[error("header byte {byte:#04x} does not declare a length prefix")]
    MissingLengthPrefix {
        /// The offending header byte.
        byte: u8,
    },
    /// The declared payload length exceeds the configured maximum.
    #[error("declared frame length {declared} exceeds the limit of {limit} bytes")]
    FrameTooLarge {
        /// Length announced by the frame's length field.
        declared: usize,
        /// Configured `max_frame_bytes`.
        limit: usize,
    },
    /// A completed accumulation buffer did not match the expected length.
    #[error("collected {collected} bytes for a frame expecting {expected}")]
    CapacityMismatch {
        /// Length announced by the frame's length field.
        expected: usize,
        /// Bytes actually collected.
        collected: usize,
    },
    /// The payload is too long to represent in the 4-byte length field.
    #[error("payload of {0} bytes cannot be represented in the length field")]
    LengthOverflow(usize),
    /// The compressed payload could not be expanded.
    #[error("payload decompression failed")]
    Decompress(#[source] lz4_flex::block::DecompressError),
    /// The decompressed size claimed by a compressed payload is implausible.
    #[error("compressed payload claims {claimed} bytes, limit is {limit}")]
    DecompressTooLarge {
        /// Size claimed by the compressed block's size prefix.
        claimed: usize,
        /// Configured `max_frame_bytes`.
        limit: usize,
    },
    /// The payload failed authenticated decryption.
    #[error("payload decryption failed")]
    Decrypt,
    /// The payload could not be encrypted.
    #[error("payload encryption failed")]
    Encrypt,
    /// A frame required a cipher but none is configured.
    #[error("frame is flagged encrypted but no cipher is configured")]
    CipherUnavailable,
    /// The framer's read state and its pending packet disagreed.
    #[error("framer state desynchronised from the pending packet")]
    StateDesync,
}
