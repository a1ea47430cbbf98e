//! Reliable-UDP overlay: ordered, retransmitted delivery over datagrams.
//!
//! Each participating session owns a [`Conveyor`] identified by a convey id.
//! Outbound frames are split into sequenced segments; the peer acknowledges
//! cumulatively and unacknowledged segments are retransmitted on a fixed
//! timer. Inbound segments are reordered and the contiguous byte run is fed
//! through the conveyor's own framer, so the overlay presents the same
//! byte-chunk interface as a stream channel.
//!
//! Segment wire format, big-endian:
//! `[u32 convey id][u8 kind][u32 sequence][payload]` where kind 0 is DATA
//! and kind 1 is ACK (sequence = next expected, payload empty).

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, warn};

use crate::{
    codec::{CodecConfig, Framer},
    session::SessionId,
};

/// Header bytes in front of every segment.
pub const SEGMENT_HEADER_BYTES: usize = 4 + 1 + 4;

/// Largest payload carried by one segment, keeping segments under a typical
/// path MTU.
pub const MAX_SEGMENT_PAYLOAD: usize = 1152;

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;

/// Retransmission timeout for unacknowledged segments.
pub const RETRANSMIT_AFTER: tokio::time::Duration = tokio::time::Duration::from_millis(200);

/// A parsed overlay segment.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    /// Payload-carrying segment.
    Data {
        /// Conveyor the segment belongs to.
        convey_id: u32,
        /// Sequence number of this segment.
        seq: u32,
        /// Segment payload.
        payload: &'a [u8],
    },
    /// Cumulative acknowledgement.
    Ack {
        /// Conveyor the segment belongs to.
        convey_id: u32,
        /// Next sequence number the peer expects.
        next_expected: u32,
    },
}

pub(crate) fn decode_segment(buf: &[u8]) -> Option<Segment<'_>> {
    if buf.len() < SEGMENT_HEADER_BYTES {
        return None;
    }
    let convey_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let kind = buf[4];
    let seq = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    match kind {
        KIND_DATA => Some(Segment::Data {
            convey_id,
            seq,
            payload: &buf[SEGMENT_HEADER_BYTES..],
        }),
        KIND_ACK => Some(Segment::Ack {
            convey_id,
            next_expected: seq,
        }),
        _ => None,
    }
}

fn encode_segment(convey_id: u32, kind: u8, seq: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_BYTES + payload.len());
    buf.put_u32(convey_id);
    buf.put_u8(kind);
    buf.put_u32(seq);
    buf.extend_from_slice(payload);
    buf.freeze()
}

struct Unacked {
    seq: u32,
    payload: Bytes,
    last_sent: Instant,
}

struct SendWindow {
    next_seq: u32,
    unacked: VecDeque<Unacked>,
}

struct RecvBuffer {
    next_expected: u32,
    pending: BTreeMap<u32, Bytes>,
}

/// Per-session reliable-UDP state: send window, reorder buffer, and the
/// framer that turns the ordered byte run back into frames.
pub struct Conveyor {
    convey_id: u32,
    session: SessionId,
    remote: Mutex<Option<SocketAddr>>,
    send: Mutex<SendWindow>,
    recv: Mutex<RecvBuffer>,
    framer: Mutex<Framer>,
}

impl Conveyor {
    fn new(convey_id: u32, session: SessionId, codec: Arc<CodecConfig>) -> Self {
        Self {
            convey_id,
            session,
            remote: Mutex::new(None),
            send: Mutex::new(SendWindow {
                next_seq: 0,
                unacked: VecDeque::new(),
            }),
            recv: Mutex::new(RecvBuffer {
                next_expected: 0,
                pending: BTreeMap::new(),
            }),
            framer: Mutex::new(Framer::new(codec)),
        }
    }

    /// Conveyor identifier carried by every segment.
    #[must_use]
    pub fn convey_id(&self) -> u32 { self.convey_id }

    /// Session this conveyor delivers to.
    #[must_use]
    pub fn session(&self) -> SessionId { self.session }

    /// Latest remote address segments arrived from.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> { *lock(&self.remote) }

    pub(crate) fn set_remote(&self, addr: SocketAddr) { *lock(&self.remote) = Some(addr); }

    /// Split `frame` into sequenced segments and queue them for delivery.
    ///
    /// Returns the encoded segments; the caller transmits them and the send
    /// window retains copies until they are acknowledged.
    pub(crate) fn segment_frame(&self, frame: &Bytes) -> Vec<Bytes> {
        let mut window = lock(&self.send);
        let mut wire = Vec::new();
        let mut offset = 0;
        loop {
            let end = (offset + MAX_SEGMENT_PAYLOAD).min(frame.len());
            let chunk = frame.slice(offset..end);
            let seq = window.next_seq;
            window.next_seq = window.next_seq.wrapping_add(1);
            wire.push(encode_segment(self.convey_id, KIND_DATA, seq, &chunk));
            window.unacked.push_back(Unacked {
                seq,
                payload: chunk,
                last_sent: Instant::now(),
            });
            offset = end;
            if offset >= frame.len() {
                break;
            }
        }
        wire
    }

    /// Accept a DATA segment, returning the contiguous payload run now
    /// deliverable in order.
    pub(crate) fn accept_data(&self, seq: u32, payload: &[u8]) -> Vec<Bytes> {
        let mut recv = lock(&self.recv);
        // Duplicates of already-delivered segments are dropped silently.
        if seq.wrapping_sub(recv.next_expected) < u32::MAX / 2 {
            recv.pending
                .entry(seq)
                .or_insert_with(|| Bytes::copy_from_slice(payload));
        }
        let mut ready = Vec::new();
        loop {
            let key = recv.next_expected;
            let Some(chunk) = recv.pending.remove(&key) else {
                break;
            };
            ready.push(chunk);
            recv.next_expected = recv.next_expected.wrapping_add(1);
        }
        ready
    }

    /// Cumulative-acknowledgement value to report to the peer.
    pub(crate) fn ack_value(&self) -> u32 { lock(&self.recv).next_expected }

    /// Drop every unacknowledged segment older than `next_expected`.
    pub(crate) fn accept_ack(&self, next_expected: u32) {
        let mut window = lock(&self.send);
        window
            .unacked
            .retain(|segment| segment.seq.wrapping_sub(next_expected) < u32::MAX / 2);
    }

    /// Segments due for retransmission, with their timers restarted.
    pub(crate) fn retransmit_due(&self, now: Instant) -> Vec<Bytes> {
        let mut window = lock(&self.send);
        let mut due = Vec::new();
        for segment in &mut window.unacked {
            if now.duration_since(segment.last_sent) >= RETRANSMIT_AFTER {
                segment.last_sent = now;
                due.push(encode_segment(
                    self.convey_id,
                    KIND_DATA,
                    segment.seq,
                    &segment.payload,
                ));
            }
        }
        due
    }

    /// Segments the peer has not yet acknowledged.
    #[must_use]
    pub fn unacked_len(&self) -> usize { lock(&self.send).unacked.len() }

    /// Feed an ordered payload run through the conveyor's framer.
    pub(crate) fn feed_ordered(
        &self,
        chunks: &[Bytes],
        out: &mut Vec<Bytes>,
    ) -> Result<(), crate::codec::CodecError> {
        let mut framer = lock(&self.framer);
        for chunk in chunks {
            framer.feed(chunk, out)?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The engine-wide reliable-UDP socket plus its conveyor registry.
pub struct RudpEndpoint {
    socket: Arc<UdpSocket>,
    conveyors: DashMap<u32, Arc<Conveyor>>,
    counter: AtomicU32,
    codec: Arc<CodecConfig>,
}

impl RudpEndpoint {
    pub(crate) fn new(socket: Arc<UdpSocket>, codec: Arc<CodecConfig>) -> Self {
        Self {
            socket,
            conveyors: DashMap::new(),
            counter: AtomicU32::new(1),
            codec,
        }
    }

    pub(crate) fn socket(&self) -> &Arc<UdpSocket> { &self.socket }

    /// Register a conveyor for `session`, returning it for attachment.
    #[must_use]
    pub fn register(&self, session: SessionId) -> Arc<Conveyor> {
        let convey_id = self.counter.fetch_add(1, Ordering::Relaxed);
        let conveyor = Arc::new(Conveyor::new(convey_id, session, Arc::clone(&self.codec)));
        self.conveyors.insert(convey_id, Arc::clone(&conveyor));
        conveyor
    }

    /// Drop the conveyor with the given id.
    pub fn deregister(&self, convey_id: u32) { self.conveyors.remove(&convey_id); }

    /// Look up a conveyor by id.
    #[must_use]
    pub fn conveyor(&self, convey_id: u32) -> Option<Arc<Conveyor>> {
        self.conveyors.get(&convey_id).map(|c| Arc::clone(c.value()))
    }

    /// Transmit a frame over `conveyor`, segmenting as needed.
    pub(crate) async fn send_frame(
        &self,
        conveyor: &Conveyor,
        frame: &Bytes,
    ) -> io::Result<()> {
        let Some(remote) = conveyor.remote() else {
            debug!(
                "dropping reliable-udp frame, no remote yet: convey_id={}",
                conveyor.convey_id()
            );
            return Ok(());
        };
        for segment in conveyor.segment_frame(frame) {
            self.socket.send_to(&segment, remote).await?;
        }
        Ok(())
    }

    /// Process one datagram from the overlay socket.
    ///
    /// For DATA segments this returns the conveyor plus the frames completed
    /// by the newly contiguous bytes; an ACK is sent back immediately. ACK
    /// segments prune the send window and return nothing.
    pub(crate) async fn on_datagram(
        &self,
        buf: &[u8],
        from: SocketAddr,
    ) -> Option<(Arc<Conveyor>, Vec<Bytes>)> {
        match decode_segment(buf)? {
            Segment::Data {
                convey_id,
                seq,
                payload,
            } => {
                let conveyor = self.conveyor(convey_id)?;
                conveyor.set_remote(from);
                let ordered = conveyor.accept_data(seq, payload);
                let ack = encode_segment(convey_id, KIND_ACK, conveyor.ack_value(), &[]);
                if let Err(error) = self.socket.send_to(&ack, from).await {
                    warn!("failed to send reliable-udp ack: convey_id={convey_id}, error={error}");
                }
                let mut frames = Vec::new();
                if let Err(error) = conveyor.feed_ordered(&ordered, &mut frames) {
                    warn!(
                        "reliable-udp framing error: convey_id={convey_id}, error={error}"
                    );
                }
                Some((conveyor, frames))
            }
            Segment::Ack {
                convey_id,
                next_expected,
            } => {
                if let Some(conveyor) = self.conveyor(convey_id) {
                    conveyor.accept_ack(next_expected);
                }
                None
            }
        }
    }

    /// Retransmit every due segment across all conveyors.
    pub(crate) async fn tick(&self) {
        let now = Instant::now();
        // Snapshot first: sending awaits, and map shards must not stay
        // locked across suspension points.
        let conveyors: Vec<Arc<Conveyor>> = self
            .conveyors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conveyor in conveyors {
            let Some(remote) = conveyor.remote() else {
                continue;
            };
            for segment in conveyor.retransmit_due(now) {
                if let Err(error) = self.socket.send_to(&segment, remote).await {
                    warn!(
                        "reliable-udp retransmit failed: convey_id={}, error={error}",
                        conveyor.convey_id()
                    );
                    break;
                }
            }
        }
    }
}
