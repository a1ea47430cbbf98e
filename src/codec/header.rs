//! The one-byte bit-flag header prefixed to every wire frame.

use super::error::CodecError;

/// Flag marking the payload as binary; doubles as the "counted" marker
/// telling the decoder that a length field follows the header byte.
const FLAG_BINARY: u8 = 0x01;
/// Flag marking the payload as compressed.
const FLAG_COMPRESSED: u8 = 0x02;
/// Flag selecting the 4-byte length field instead of the 2-byte one.
const FLAG_BIG_SIZED: u8 = 0x04;
/// Flag marking the payload as encrypted.
const FLAG_ENCRYPTED: u8 = 0x08;
/// Reserved bit: accepted on decode, never produced on encode.
const FLAG_RESERVED: u8 = 0x10;

/// Bits that a well-formed header byte may use.
const KNOWN_BITS: u8 =
    FLAG_BINARY | FLAG_COMPRESSED | FLAG_BIG_SIZED | FLAG_ENCRYPTED | FLAG_RESERVED;

/// Decoded form of the header byte prefixed to every frame.
///
/// The header is an immutable value type; the binary/counted flag is implied
/// because [`PacketHeader::decode`] rejects headers without it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    compressed: bool,
    big_sized: bool,
    encrypted: bool,
}

impl PacketHeader {
    /// Create a header with the given payload flags.
    #[must_use]
    pub fn new(compressed: bool, big_sized: bool, encrypted: bool) -> Self {
        Self {
            compressed,
            big_sized,
            encrypted,
        }
    }

    /// Whether the payload was compressed before transmission.
    #[must_use]
    pub fn is_compressed(self) -> bool { self.compressed }

    /// Whether the frame uses the 4-byte length field.
    #[must_use]
    pub fn is_big_sized(self) -> bool { self.big_sized }

    /// Whether the payload was encrypted before transmission.
    #[must_use]
    pub fn is_encrypted(self) -> bool { self.encrypted }

    /// Width in bytes of the length field that follows the header byte.
    #[must_use]
    pub fn length_field_bytes(self) -> usize { if self.big_sized { 4 } else { 2 } }

    /// Pack the flags into the wire header byte.
    #[must_use]
    pub fn encode(self) -> u8 {
        let mut byte = FLAG_BINARY;
        if self.compressed {
            byte |= FLAG_COMPRESSED;
        }
        if self.big_sized {
            byte |= FLAG_BIG_SIZED;
        }
        if self.encrypted {
            byte |= FLAG_ENCRYPTED;
        }
        byte
    }

    /// Decode a wire header byte.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MalformedHeader`] if the byte uses bits outside
    /// the defined flag set, or [`CodecError::MissingLengthPrefix`] if the
    /// binary/counted bit is clear: the framer cannot delimit a frame whose
    /// header does not announce a length field.
    pub fn decode(byte: u8) -> Result<Self, CodecError> {
        if byte & !KNOWN_BITS != 0 {
            return Err(CodecError::MalformedHeader { byte });
        }
        if byte & FLAG_BINARY == 0 {
            return Err(CodecError::MissingLengthPrefix { byte });
        }
        Ok(Self {
            compressed: byte & FLAG_COMPRESSED != 0,
            big_sized: byte & FLAG_BIG_SIZED != 0,
            encrypted: byte & FLAG_ENCRYPTED != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(false, false, false, 0x01)]
    #[case(true, false, false, 0x03)]
    #[case(false, true, false, 0x05)]
    #[case(false, false, true, 0x09)]
    #[case(true, true, true, 0x0f)]
    fn encodes_expected_bit_patterns(
        #[case] compressed: bool,
        #[case] big_sized: bool,
        #[case] encrypted: bool,
        #[case] expected: u8,
    ) {
        let header = PacketHeader::new(compressed, big_sized, encrypted);
        assert_eq!(header.encode(), expected);
    }

    #[test]
    fn decode_round_trips_every_flag_combination() {
        for compressed in [false, true] {
            for big_sized in [false, true] {
                for encrypted in [false, true] {
                    let header = PacketHeader::new(compressed, big_sized, encrypted);
                    let decoded = PacketHeader::decode(header.encode()).expect("valid header");
                    assert_eq!(decoded, header);
                }
            }
        }
    }

    #[test]
    fn reserved_bit_is_accepted_but_never_produced() {
        let decoded = PacketHeader::decode(FLAG_BINARY | FLAG_RESERVED).expect("reserved bit");
        assert_eq!(decoded, PacketHeader::new(false, false, false));
        assert_eq!(decoded.encode() & FLAG_RESERVED, 0);
    }

    #[rstest]
    #[case(0x20)]
    #[case(0x41)]
    #[case(0xff)]
    fn unknown_bits_are_rejected(#[case] byte: u8) {
        assert!(matches!(
            PacketHeader::decode(byte),
            Err(CodecError::MalformedHeader { .. })
        ));
    }

    #[rstest]
    #[case(0x00)]
    #[case(0x02)]
    #[case(0x0e)]
    fn uncounted_headers_are_rejected(#[case] byte: u8) {
        assert!(matches!(
            PacketHeader::decode(byte),
            Err(CodecError::MissingLengthPrefix { .. })
        ));
    }

    #[test]
    fn length_field_width_follows_big_sized_flag() {
        assert_eq!(PacketHeader::new(false, false, false).length_field_bytes(), 2);
        assert_eq!(PacketHeader::new(false, true, false).length_field_bytes(), 4);
    }
}
