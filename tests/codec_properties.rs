//! Wire-format properties: round trips, chunking invariance, pipelining.

use std::sync::Arc;

use bytes::Bytes;
use gamewire::{ChaChaPacketCipher, CodecConfig, FrameEncoder, Framer};
use proptest::prelude::*;
use rstest::rstest;

fn plain_config() -> Arc<CodecConfig> {
    Arc::new(CodecConfig {
        compression_enabled: false,
        ..CodecConfig::default()
    })
}

fn full_config() -> Arc<CodecConfig> {
    Arc::new(CodecConfig {
        compression_threshold: 32,
        cipher: Some(Arc::new(ChaChaPacketCipher::new(&[0x5a; 32]))),
        ..CodecConfig::default()
    })
}

fn decode_all(config: &Arc<CodecConfig>, stream: &[u8]) -> Vec<Bytes> {
    let mut framer = Framer::new(Arc::clone(config));
    let mut out = Vec::new();
    framer.feed(stream, &mut out).expect("feed");
    out
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(65_535)]
#[case(65_536)]
#[case(1_000_000)]
fn round_trip_at_boundary_sizes(#[case] size: usize) {
    let payload: Vec<u8> = (0..size).map(|i| (i % 239) as u8).collect();
    for (config, encrypt) in [
        (plain_config(), false),
        (full_config(), false),
        (full_config(), true),
    ] {
        let frame = FrameEncoder::new(Arc::clone(&config))
            .encode(&payload, encrypt)
            .expect("encode")
            .frame;
        let decoded = decode_all(&config, &frame);
        assert_eq!(decoded.len(), 1);
        assert_eq!(&decoded[0][..], &payload[..]);
    }
}

#[test]
fn example_scenario_ten_bytes() {
    let payload = [7u8; 10];
    let frame = FrameEncoder::new(plain_config())
        .encode(&payload, false)
        .expect("encode")
        .frame;
    // [header][2-byte length = 10][10 payload bytes]
    assert_eq!(frame.len(), 13);
    assert_eq!(frame[0], 0x01);
    assert_eq!(&frame[1..3], &[0, 10]);
    assert_eq!(&frame[3..], &payload);

    let decoded = decode_all(&plain_config(), &frame);
    assert_eq!(&decoded[0][..], &payload);
}

#[test]
fn splitting_at_every_boundary_yields_the_same_message() {
    let config = plain_config();
    let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    let frame = FrameEncoder::new(Arc::clone(&config))
        .encode(&payload, false)
        .expect("encode")
        .frame;
    let whole = decode_all(&config, &frame);

    for split in 0..=frame.len() {
        let mut framer = Framer::new(Arc::clone(&config));
        let mut out = Vec::new();
        framer.feed(&frame[..split], &mut out).expect("first piece");
        framer.feed(&frame[split..], &mut out).expect("second piece");
        assert_eq!(out.len(), 1, "split at {split}");
        assert_eq!(out[0], whole[0], "split at {split}");
    }
}

#[test]
fn pipelined_frames_decode_in_order() {
    let config = plain_config();
    let encoder = FrameEncoder::new(Arc::clone(&config));
    let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; usize::from(i) * 31 + 1]).collect();
    let mut stream = Vec::new();
    for payload in &payloads {
        stream.extend_from_slice(&encoder.encode(payload, false).expect("encode").frame);
    }
    let decoded = decode_all(&config, &stream);
    assert_eq!(decoded.len(), payloads.len());
    for (got, want) in decoded.iter().zip(&payloads) {
        assert_eq!(&got[..], &want[..]);
    }
}

proptest! {
    /// Any chunking of any frame sequence decodes to the same messages as
    /// one contiguous feed.
    #[test]
    fn arbitrary_chunking_is_invariant(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..5),
        cuts in prop::collection::vec(1usize..64, 0..32),
    ) {
        let config = plain_config();
        let encoder = FrameEncoder::new(Arc::clone(&config));
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend_from_slice(&encoder.encode(payload, false).expect("encode").frame);
        }
        let whole = decode_all(&config, &stream);

        let mut framer = Framer::new(Arc::clone(&config));
        let mut chunked = Vec::new();
        let mut rest: &[u8] = &stream;
        for cut in &cuts {
            if rest.is_empty() {
                break;
            }
            let take = (*cut).min(rest.len());
            framer.feed(&rest[..take], &mut chunked).expect("chunk");
            rest = &rest[take..];
        }
        framer.feed(rest, &mut chunked).expect("tail");

        prop_assert_eq!(chunked.len(), whole.len());
        for (got, want) in chunked.iter().zip(&whole) {
            prop_assert_eq!(got, want);
        }
    }
}
