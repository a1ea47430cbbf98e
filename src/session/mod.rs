//! Per-connection server-side state.
//!
//! A [`Session`] binds one client connection to its transport channel(s),
//! its framing state, its outbound [`PacketQueue`], and the association
//! state machine that ties the connection to a player identity. Sessions are
//! created when a connection is accepted and recycled on disconnect.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        OnceLock,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CodecConfig, Framer},
    packet::{PacketQueue, TransportKind},
    transport::{rudp::Conveyor, writer::WriterCommand},
};

pub mod manager;

pub use manager::SessionManager;

/// How long a session may stay unassociated before the orphan scan may
/// reap it.
const ORPHAN_GRACE_MS: u64 = 3000;

/// Identifier assigned to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }

    pub(crate) const fn from_raw(id: u64) -> Self { Self(id) }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Progress of binding a session to a player identity.
///
/// Transitions are monotonic — `None → Doing → Done` — except for the
/// explicit reset back to `None` on login failure or disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AssociationState {
    /// Fresh connection, no login attempt in flight.
    None = 0,
    /// Exactly one login or reconnect flow owns the session.
    Doing = 1,
    /// The session routes traffic for a bound player.
    Done = 2,
}

/// Milliseconds since the Unix epoch, the clock used by activity counters.
#[must_use]
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Hand-off information binding a session to its writer worker.
pub(crate) struct WriterBinding {
    pub(crate) tx: mpsc::UnboundedSender<WriterCommand>,
}

/// Server-side state for one client connection.
pub struct Session {
    id: SessionId,
    transport: TransportKind,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,

    association: AtomicU8,
    activated: AtomicU8,

    queue: PacketQueue,
    framer: Mutex<Framer>,

    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    read_packets: AtomicU64,
    written_packets: AtomicU64,
    dropped_packets: AtomicU64,

    created_at_ms: u64,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    max_idle_read_secs: AtomicU64,
    max_idle_write_secs: AtomicU64,

    datagram_addr: Mutex<Option<SocketAddr>>,
    convey_id: AtomicU32,
    conveyor: Mutex<Option<Arc<Conveyor>>>,

    writer: OnceLock<WriterBinding>,
    close_token: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        transport: TransportKind,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        queue: PacketQueue,
        codec: Arc<CodecConfig>,
    ) -> Arc<Self> {
        let now = now_millis();
        Arc::new(Self {
            id: SessionId(id),
            transport,
            peer_addr,
            local_addr,
            association: AtomicU8::new(AssociationState::None as u8),
            activated: AtomicU8::new(1),
            queue,
            framer: Mutex::new(Framer::new(codec)),
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            read_packets: AtomicU64::new(0),
            written_packets: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            created_at_ms: now,
            last_read_ms: AtomicU64::new(now),
            last_write_ms: AtomicU64::new(now),
            last_activity_ms: AtomicU64::new(now),
            max_idle_read_secs: AtomicU64::new(0),
            max_idle_write_secs: AtomicU64::new(0),
            datagram_addr: Mutex::new(None),
            convey_id: AtomicU32::new(0),
            conveyor: Mutex::new(None),
            writer: OnceLock::new(),
            close_token: CancellationToken::new(),
        })
    }

    /// Token cancelled when the session enters its close path; reader workers
    /// use it to release read halves of connections closed server-side.
    pub(crate) fn close_token(&self) -> CancellationToken { self.close_token.clone() }

    /// Identifier of this session.
    #[must_use]
    pub fn id(&self) -> SessionId { self.id }

    /// Primary transport this session was accepted on.
    #[must_use]
    pub fn transport(&self) -> TransportKind { self.transport }

    /// Whether the primary channel is a stream socket.
    #[must_use]
    pub fn is_stream(&self) -> bool { self.transport == TransportKind::Stream }

    /// Whether the session lives on a WebSocket connection.
    #[must_use]
    pub fn is_web_socket(&self) -> bool { self.transport == TransportKind::WebSocket }

    /// Remote address of the connection.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr { self.peer_addr }

    /// Local address the connection was accepted on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// The session's outbound packet queue.
    #[must_use]
    pub fn queue(&self) -> &PacketQueue { &self.queue }

    /// The session's framer; locked only by the owning reader worker.
    pub(crate) fn framer(&self) -> std::sync::MutexGuard<'_, Framer> {
        match self.framer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- association state machine -------------------------------------

    /// Current association state.
    #[must_use]
    pub fn association(&self) -> AssociationState {
        match self.association.load(Ordering::Acquire) {
            1 => AssociationState::Doing,
            2 => AssociationState::Done,
            _ => AssociationState::None,
        }
    }

    /// Attempt the `None → Doing` transition.
    ///
    /// Compare-and-set semantics: under concurrent login or reconnect flows
    /// exactly one caller observes `true` and owns the association attempt.
    #[must_use]
    pub fn try_begin_association(&self) -> bool {
        self.association
            .compare_exchange(
                AssociationState::None as u8,
                AssociationState::Doing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Complete the `Doing → Done` transition, binding the player identity.
    ///
    /// Returns `false` when the session was not in `Doing`, e.g. because a
    /// disconnect reset it mid-flow.
    #[must_use]
    pub fn complete_association(&self) -> bool {
        self.association
            .compare_exchange(
                AssociationState::Doing as u8,
                AssociationState::Done as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Reset the association to `None` on login failure or disconnect.
    pub fn reset_association(&self) {
        self.association
            .store(AssociationState::None as u8, Ordering::Release);
    }

    /// Whether the session is fully bound to a player and may route
    /// application traffic.
    #[must_use]
    pub fn is_associated(&self) -> bool { self.association() == AssociationState::Done }

    /// A session that never finished associating and has outlived the grace
    /// period; the periodic cleanup scan reaps these.
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        !self.is_associated() && now_millis().saturating_sub(self.created_at_ms) >= ORPHAN_GRACE_MS
    }

    // --- activation and idleness ---------------------------------------

    /// Whether the session is still live.
    #[must_use]
    pub fn is_activated(&self) -> bool { self.activated.load(Ordering::Acquire) == 1 }

    /// Deactivate the session; returns `true` for the caller that actually
    /// performed the transition, making the close path idempotent.
    pub(crate) fn deactivate(&self) -> bool {
        let first = self.activated.swap(0, Ordering::AcqRel) == 1;
        if first {
            self.close_token.cancel();
        }
        first
    }

    /// Configure the read and write inactivity thresholds; zero disables
    /// either direction.
    pub fn set_idle_thresholds(&self, read_secs: u64, write_secs: u64) {
        self.max_idle_read_secs.store(read_secs, Ordering::Relaxed);
        self.max_idle_write_secs.store(write_secs, Ordering::Relaxed);
    }

    /// Whether the session has exceeded either inactivity threshold.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let now = now_millis();
        let exceeded = |threshold: u64, last: u64| {
            threshold > 0 && now.saturating_sub(last) / 1000 > threshold
        };
        exceeded(
            self.max_idle_read_secs.load(Ordering::Relaxed),
            self.last_read_ms.load(Ordering::Relaxed),
        ) || exceeded(
            self.max_idle_write_secs.load(Ordering::Relaxed),
            self.last_write_ms.load(Ordering::Relaxed),
        )
    }

    // --- traffic counters ----------------------------------------------

    /// Record bytes read from the channel.
    pub(crate) fn record_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        let now = now_millis();
        self.last_read_ms.store(now, Ordering::Relaxed);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Record completed inbound frames.
    pub(crate) fn record_read_frames(&self, frames: u64) {
        self.read_packets.fetch_add(frames, Ordering::Relaxed);
    }

    /// Record bytes written to the channel.
    pub(crate) fn record_write(&self, bytes: u64) {
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
        let now = now_millis();
        self.last_write_ms.store(now, Ordering::Relaxed);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Record a fully written outbound packet.
    pub(crate) fn record_written_packet(&self) {
        self.written_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record packets dropped by queue admission.
    pub(crate) fn record_dropped(&self, packets: u64) {
        self.dropped_packets.fetch_add(packets, Ordering::Relaxed);
    }

    /// Total bytes read from this session's channels.
    #[must_use]
    pub fn read_bytes(&self) -> u64 { self.read_bytes.load(Ordering::Relaxed) }

    /// Total bytes written to this session's channels.
    #[must_use]
    pub fn written_bytes(&self) -> u64 { self.written_bytes.load(Ordering::Relaxed) }

    /// Total inbound frames completed.
    #[must_use]
    pub fn read_packets(&self) -> u64 { self.read_packets.load(Ordering::Relaxed) }

    /// Total outbound packets fully written.
    #[must_use]
    pub fn written_packets(&self) -> u64 { self.written_packets.load(Ordering::Relaxed) }

    /// Total outbound packets dropped by admission.
    #[must_use]
    pub fn dropped_packets(&self) -> u64 { self.dropped_packets.load(Ordering::Relaxed) }

    /// Millisecond timestamp of the last read.
    #[must_use]
    pub fn last_read_ms(&self) -> u64 { self.last_read_ms.load(Ordering::Relaxed) }

    /// Millisecond timestamp of the last write.
    #[must_use]
    pub fn last_write_ms(&self) -> u64 { self.last_write_ms.load(Ordering::Relaxed) }

    // --- side channels --------------------------------------------------

    /// Whether a datagram return address is bound to this session.
    #[must_use]
    pub fn has_datagram(&self) -> bool { self.convey_id.load(Ordering::Acquire) != 0 }

    /// The session's datagram convey id, if the side-channel is enabled.
    #[must_use]
    pub fn convey_id(&self) -> Option<u32> {
        match self.convey_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Bind the datagram side-channel. Only meaningful for stream sessions;
    /// the return address is learned from the first datagram that arrives.
    pub(crate) fn enable_datagram(&self, convey_id: u32) {
        self.convey_id.store(convey_id, Ordering::Release);
    }

    /// Latest datagram return address observed for this session.
    #[must_use]
    pub fn datagram_addr(&self) -> Option<SocketAddr> { *self.lock_datagram_addr() }

    pub(crate) fn set_datagram_addr(&self, remote: SocketAddr) {
        *self.lock_datagram_addr() = Some(remote);
    }

    /// Whether a reliable-UDP conveyor is active on this session.
    #[must_use]
    pub fn has_reliable_udp(&self) -> bool { self.lock_conveyor().is_some() }

    pub(crate) fn conveyor(&self) -> Option<Arc<Conveyor>> { self.lock_conveyor().clone() }

    pub(crate) fn set_conveyor(&self, conveyor: Option<Arc<Conveyor>>) {
        *self.lock_conveyor() = conveyor;
    }

    fn lock_datagram_addr(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        match self.datagram_addr.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_conveyor(&self) -> std::sync::MutexGuard<'_, Option<Arc<Conveyor>>> {
        match self.conveyor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // --- writer hand-off -------------------------------------------------

    pub(crate) fn bind_writer(&self, tx: mpsc::UnboundedSender<WriterCommand>) {
        let _ = self.writer.set(WriterBinding { tx });
    }

    /// Signal the owning writer worker that this session's queue may hold
    /// packets.
    pub(crate) fn ticket(&self) {
        if let Some(binding) = self.writer.get() {
            let _ = binding.tx.send(WriterCommand::Ticket { session: self.id });
        }
    }

    pub(crate) fn writer_tx(&self) -> Option<&mpsc::UnboundedSender<WriterCommand>> {
        self.writer.get().map(|b| &b.tx)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("peer_addr", &self.peer_addr)
            .field("association", &self.association())
            .field("activated", &self.is_activated())
            .field("read_bytes", &self.read_bytes())
            .field("written_bytes", &self.written_bytes())
            .finish_non_exhaustive()
    }
}
