//! Streaming framer: turns arbitrary byte chunks into complete payloads.
//!
//! Each session owns one [`Framer`]. The framer is a cyclic state machine
//! driven by whatever chunk sizes the transport delivers: a read may carry a
//! fraction of a frame or several frames back to back, and
//! [`Framer::feed`] drains everything decodable from each chunk. A framing
//! error discards only the in-flight frame; the machine resets to
//! [`ReadState::WaitNewPacket`] and the connection stays open.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::{CodecConfig, CodecError, PacketHeader, compression};

/// Position of the framer inside the current frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadState {
    /// Expecting the header byte of a new frame.
    WaitNewPacket,
    /// Expecting the full length field in the current chunk.
    WaitDataSize,
    /// The length field itself was split across chunks; collecting the rest.
    WaitDataSizeFragment,
    /// Collecting payload bytes until the expected length is reached.
    WaitData,
}

/// Parse state for the frame currently being collected.
///
/// Exactly one lives per session; it is reset at the start of every frame.
/// While the framer is in [`ReadState::WaitData`] the buffer accumulates
/// payload bytes up to `expected`; in
/// [`ReadState::WaitDataSizeFragment`] it temporarily holds the partial
/// length field instead.
#[derive(Debug, Default)]
pub struct PendingPacket {
    header: Option<PacketHeader>,
    buffer: BytesMut,
    expected: usize,
}

impl PendingPacket {
    fn reset(&mut self) {
        self.header = None;
        self.buffer = BytesMut::new();
        self.expected = 0;
    }

    /// Header decoded for the in-flight frame, if one is being collected.
    #[must_use]
    pub fn header(&self) -> Option<PacketHeader> { self.header }

    /// Payload length announced by the in-flight frame.
    #[must_use]
    pub fn expected_length(&self) -> usize { self.expected }
}

/// Per-session pull-based framing state machine.
pub struct Framer {
    config: Arc<CodecConfig>,
    state: ReadState,
    pending: PendingPacket,
}

impl Framer {
    /// Create a framer in its initial state.
    #[must_use]
    pub fn new(config: Arc<CodecConfig>) -> Self {
        Self {
            config,
            state: ReadState::WaitNewPacket,
            pending: PendingPacket::default(),
        }
    }

    /// Current position inside the frame cycle.
    #[must_use]
    pub fn read_state(&self) -> ReadState { self.state }

    /// Parse state of the frame currently being collected.
    #[must_use]
    pub fn pending(&self) -> &PendingPacket { &self.pending }

    /// Discard the in-flight frame and return to the initial state.
    pub fn reset(&mut self) {
        self.state = ReadState::WaitNewPacket;
        self.pending.reset();
    }

    /// Consume one chunk of bytes, appending every completed payload to
    /// `out`.
    ///
    /// The chunk is processed to exhaustion, so several queued frames
    /// arriving in a single read are all emitted in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`CodecError`] hit while framing or decoding. The
    /// in-flight frame and the unprocessed remainder of the chunk are
    /// discarded and the framer is reset; payloads completed before the error
    /// remain in `out`. The session may keep feeding subsequent chunks.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> Result<(), CodecError> {
        match self.feed_inner(chunk, out) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.reset();
                Err(error)
            }
        }
    }

    fn feed_inner(&mut self, chunk: &[u8], out: &mut Vec<Bytes>) -> Result<(), CodecError> {
        let mut data = chunk;
        while !data.is_empty() {
            // The steps run in sequence, not exclusively: a chunk that
            // completes the length field must fall through to the payload
            // step in the same pass, or a zero-length frame whose length
            // field ends the chunk would never complete.
            if self.state == ReadState::WaitNewPacket {
                data = self.on_new_packet(data)?;
            }
            if self.state == ReadState::WaitDataSize {
                data = self.on_data_size(data)?;
            }
            if self.state == ReadState::WaitDataSizeFragment {
                data = self.on_data_size_fragment(data)?;
            }
            if self.state == ReadState::WaitData {
                data = self.on_data(data, out)?;
            }
        }
        Ok(())
    }

    /// Decode the header byte and move on to the length field.
    fn on_new_packet<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], CodecError> {
        let header = PacketHeader::decode(data[0])?;
        self.pending.header = Some(header);
        self.state = ReadState::WaitDataSize;
        Ok(&data[1..])
    }

    /// Read the length field when the chunk holds it whole; otherwise stash
    /// the partial field and wait for more bytes.
    fn on_data_size<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], CodecError> {
        let Some(header) = self.pending.header else {
            return Err(CodecError::StateDesync);
        };
        let field = header.length_field_bytes();
        if data.len() >= field {
            self.begin_payload(read_length(&data[..field]))?;
            Ok(&data[field..])
        } else {
            self.pending.buffer = BytesMut::with_capacity(field);
            self.pending.buffer.extend_from_slice(data);
            self.state = ReadState::WaitDataSizeFragment;
            Ok(&[])
        }
    }

    /// Accumulate length-field bytes split across chunks.
    fn on_data_size_fragment<'a>(&mut self, data: &'a [u8]) -> Result<&'a [u8], CodecError> {
        let Some(header) = self.pending.header else {
            return Err(CodecError::StateDesync);
        };
        let field = header.length_field_bytes();
        let missing = field - self.pending.buffer.len();
        if data.len() >= missing {
            self.pending.buffer.extend_from_slice(&data[..missing]);
            let length = read_length(&self.pending.buffer);
            self.begin_payload(length)?;
            Ok(&data[missing..])
        } else {
            self.pending.buffer.extend_from_slice(data);
            Ok(&[])
        }
    }

    /// Record the expected payload length and allocate the collection
    /// buffer. The length is validated first so a hostile length field never
    /// drives an allocation.
    fn begin_payload(&mut self, expected: usize) -> Result<(), CodecError> {
        if expected > self.config.max_frame_bytes {
            return Err(CodecError::FrameTooLarge {
                declared: expected,
                limit: self.config.max_frame_bytes,
            });
        }
        self.pending.expected = expected;
        self.pending.buffer = BytesMut::with_capacity(expected);
        self.state = ReadState::WaitData;
        Ok(())
    }

    /// Collect payload bytes; on completion decode and emit the frame,
    /// carrying leftover bytes into the next cycle.
    fn on_data<'a>(
        &mut self,
        data: &'a [u8],
        out: &mut Vec<Bytes>,
    ) -> Result<&'a [u8], CodecError> {
        let missing = self.pending.expected - self.pending.buffer.len();
        let take = missing.min(data.len());
        self.pending.buffer.extend_from_slice(&data[..take]);
        if self.pending.buffer.len() == self.pending.expected {
            let payload = self.finish_frame()?;
            out.push(payload);
            self.state = ReadState::WaitNewPacket;
        }
        Ok(&data[take..])
    }

    /// Apply the decode transforms to a fully collected payload.
    fn finish_frame(&mut self) -> Result<Bytes, CodecError> {
        let Some(header) = self.pending.header else {
            return Err(CodecError::StateDesync);
        };
        let expected = self.pending.expected;
        let collected = std::mem::take(&mut self.pending.buffer);
        if collected.len() != expected {
            return Err(CodecError::CapacityMismatch {
                expected,
                collected: collected.len(),
            });
        }
        self.pending.reset();

        // Inverse of the encoder: decompress first, decrypt second.
        let mut payload = collected.freeze();
        if header.is_compressed() {
            payload = compression::decompress(&payload, self.config.max_frame_bytes)?.into();
        }
        if header.is_encrypted() {
            let cipher = self
                .config
                .cipher
                .as_deref()
                .ok_or(CodecError::CipherUnavailable)?;
            payload = cipher.decrypt(&payload)?.into();
        }
        Ok(payload)
    }
}

/// Read a 2- or 4-byte big-endian length field.
fn read_length(field: &[u8]) -> usize {
    match *field {
        [a, b] => u16::from_be_bytes([a, b]) as usize,
        [a, b, c, d] => u32::from_be_bytes([a, b, c, d]) as usize,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::codec::FrameEncoder;

    fn config() -> Arc<CodecConfig> { Arc::new(CodecConfig::default()) }

    fn encode(payload: &[u8]) -> Bytes {
        FrameEncoder::new(config())
            .encode(payload, false)
            .expect("encode")
            .frame
    }

    #[test]
    fn example_scenario_ten_byte_frame() {
        let payload = b"0123456789";
        let frame = encode(payload);
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..3], &10u16.to_be_bytes());
        assert_eq!(&frame[3..], payload);

        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        framer.feed(&frame, &mut out).expect("feed");
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], payload);
    }

    #[test]
    fn zero_length_frame_completes_without_further_bytes() {
        let frame = encode(b"");
        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        framer.feed(&frame, &mut out).expect("feed");
        assert_eq!(out.len(), 1);
        assert!(out[0].is_empty());
        assert_eq!(framer.read_state(), ReadState::WaitNewPacket);
    }

    #[test]
    fn zero_length_frame_completes_when_length_field_ends_the_chunk() {
        let frame = encode(b"");
        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        // Header alone, then the two length bytes as their own chunk.
        framer.feed(&frame[..1], &mut out).expect("feed");
        assert!(out.is_empty());
        framer.feed(&frame[1..], &mut out).expect("feed");
        assert_eq!(out.len(), 1);
    }

    #[rstest]
    #[case::byte_at_a_time(1)]
    #[case::pairs(2)]
    #[case::odd_stride(7)]
    fn chunked_delivery_matches_whole_delivery(#[case] stride: usize) {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let frame = encode(&payload);

        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        for chunk in frame.chunks(stride) {
            framer.feed(chunk, &mut out).expect("feed");
        }
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &payload[..]);
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 64 * (usize::from(i) + 1)]).collect();
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(&encode(p));
        }

        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        framer.feed(&stream, &mut out).expect("feed");
        assert_eq!(out.len(), payloads.len());
        for (decoded, expected) in out.iter().zip(&payloads) {
            assert_eq!(&decoded[..], &expected[..]);
        }
    }

    #[test]
    fn big_sized_frame_uses_four_byte_length_field() {
        let payload = vec![0xabu8; BIG_SIZE + 1];
        let frame = FrameEncoder::new(uncompressed_config())
            .encode(&payload, false)
            .expect("encode")
            .frame;
        assert_eq!(frame[0], 0x05);
        assert_eq!(&frame[1..5], &((BIG_SIZE + 1) as u32).to_be_bytes());

        let mut framer = Framer::new(uncompressed_config());
        let mut out = Vec::new();
        framer.feed(&frame, &mut out).expect("feed");
        assert_eq!(&out[0][..], &payload[..]);
    }

    #[test]
    fn split_length_field_is_reassembled() {
        let payload = vec![0x11u8; 300];
        let frame = encode(&payload);
        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        // Split inside the 2-byte length field.
        framer.feed(&frame[..2], &mut out).expect("feed");
        assert_eq!(framer.read_state(), ReadState::WaitDataSizeFragment);
        framer.feed(&frame[2..], &mut out).expect("feed");
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &payload[..]);
    }

    #[test]
    fn malformed_header_aborts_frame_but_not_the_framer() {
        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        assert!(framer.feed(&[0xff, 1, 2, 3], &mut out).is_err());
        assert_eq!(framer.read_state(), ReadState::WaitNewPacket);

        // The next well-formed frame decodes normally.
        let frame = encode(b"recovered");
        framer.feed(&frame, &mut out).expect("feed");
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], b"recovered");
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let config = Arc::new(CodecConfig {
            max_frame_bytes: 128,
            ..CodecConfig::default()
        });
        let mut framer = Framer::new(config);
        let mut out = Vec::new();
        let mut frame = vec![0x01];
        frame.extend_from_slice(&1000u16.to_be_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            framer.feed(&frame, &mut out),
            Err(CodecError::FrameTooLarge { declared: 1000, .. })
        ));
        assert_eq!(framer.read_state(), ReadState::WaitNewPacket);
    }

    #[test]
    fn encrypted_flag_without_cipher_is_an_error() {
        let mut framer = Framer::new(config());
        let mut out = Vec::new();
        let mut frame = vec![0x09];
        frame.extend_from_slice(&3u16.to_be_bytes());
        frame.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            framer.feed(&frame, &mut out),
            Err(CodecError::CipherUnavailable)
        ));
    }

    const BIG_SIZE: usize = crate::codec::BIG_SIZE_THRESHOLD;

    fn uncompressed_config() -> Arc<CodecConfig> {
        Arc::new(CodecConfig {
            compression_enabled: false,
            ..CodecConfig::default()
        })
    }
}
