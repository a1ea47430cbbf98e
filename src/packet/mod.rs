//! Outbound packet entity and its factory.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;

use crate::session::SessionId;

pub mod policy;
pub mod queue;

pub use policy::{Admission, DefaultQueuePolicy, EvictLowestPolicy, QueuePolicy, RejectWhenFull};
pub use queue::{PacketQueue, QueueError, QueueSnapshot};

/// Identifier assigned to an outbound packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketId(u64);

impl PacketId {
    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(self) -> u64 { self.0 }
}

impl std::fmt::Display for PacketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketId({})", self.0)
    }
}

/// Transport a packet travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// The session's primary stream channel.
    Stream,
    /// The raw datagram side-channel.
    Datagram,
    /// The reliable-UDP overlay side-channel.
    ReliableUdp,
    /// A WebSocket connection's single channel.
    WebSocket,
}

/// Delivery tier attached to an outbound packet.
///
/// The ordering is meaningful: queues drain higher tiers first and admission
/// policies shed lower tiers under pressure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Guarantee {
    /// May be dropped under any pressure.
    NonGuaranteed,
    /// Default tier.
    #[default]
    Normal,
    /// Kept until capacity is truly exhausted.
    Guaranteed,
    /// Admitted even when the queue is nearly saturated.
    GuaranteedQuickest,
}

/// One outbound wire frame queued towards a session.
///
/// Created by the response path, owned by a [`PacketQueue`] until a writer
/// worker drains it, and dropped after the frame is fully written (or the
/// session closes).
#[derive(Clone, Debug)]
pub struct Packet {
    id: PacketId,
    data: Bytes,
    transport: TransportKind,
    guarantee: Guarantee,
    encrypted: bool,
    recipients: Vec<SessionId>,
    created_at: Instant,
    original_size: usize,
    fragment: Option<Bytes>,
    last: bool,
}

impl Packet {
    /// Identifier of this packet.
    #[must_use]
    pub fn id(&self) -> PacketId { self.id }

    /// The ready-to-send frame bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes { &self.data }

    /// Transport this packet is routed on.
    #[must_use]
    pub fn transport(&self) -> TransportKind { self.transport }

    /// Delivery tier used for queue ordering and admission.
    #[must_use]
    pub fn guarantee(&self) -> Guarantee { self.guarantee }

    /// Whether the payload was encrypted at encode time.
    #[must_use]
    pub fn is_encrypted(&self) -> bool { self.encrypted }

    /// Sessions this packet is addressed to.
    #[must_use]
    pub fn recipients(&self) -> &[SessionId] { &self.recipients }

    /// Instant the packet was created, for latency accounting.
    #[must_use]
    pub fn created_at(&self) -> Instant { self.created_at }

    /// Payload length before compression or encryption.
    #[must_use]
    pub fn original_size(&self) -> usize { self.original_size }

    /// Unsent tail left over from a partial write, if any.
    #[must_use]
    pub fn fragment(&self) -> Option<&Bytes> { self.fragment.as_ref() }

    /// Store the unsent tail of a partial write for the next writable pass.
    pub fn set_fragment(&mut self, fragment: Option<Bytes>) { self.fragment = fragment; }

    /// Whether a previous write left this packet partially sent.
    #[must_use]
    pub fn is_fragmented(&self) -> bool { self.fragment.is_some() }

    /// Whether the session closes once this packet is fully written.
    #[must_use]
    pub fn is_marked_last(&self) -> bool { self.last }

    /// Mark this packet as the session's final frame.
    pub fn mark_last(&mut self) { self.last = true; }

    /// The bytes the next write attempt should send.
    #[must_use]
    pub fn sendable(&self) -> &Bytes { self.fragment.as_ref().unwrap_or(&self.data) }
}

/// Creates packets with ids drawn from an explicitly owned counter.
///
/// The counter is injected so tests and embedders control id scopes; there is
/// no process-wide static.
#[derive(Clone)]
pub struct PacketFactory {
    counter: Arc<AtomicU64>,
}

impl Default for PacketFactory {
    fn default() -> Self { Self::new(Arc::new(AtomicU64::new(1))) }
}

impl PacketFactory {
    /// Build a factory around the given id counter.
    #[must_use]
    pub fn new(counter: Arc<AtomicU64>) -> Self { Self { counter } }

    /// Create a packet carrying `data` on `transport`.
    #[must_use]
    pub fn create(
        &self,
        data: Bytes,
        transport: TransportKind,
        guarantee: Guarantee,
        encrypted: bool,
        original_size: usize,
        recipients: Vec<SessionId>,
    ) -> Packet {
        Packet {
            id: PacketId(self.counter.fetch_add(1, Ordering::Relaxed)),
            data,
            transport,
            guarantee,
            encrypted,
            recipients,
            created_at: Instant::now(),
            original_size,
            fragment: None,
            last: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_ids_are_monotonic() {
        let factory = PacketFactory::default();
        let a = factory.create(Bytes::new(), TransportKind::Stream, Guarantee::Normal, false, 0, vec![]);
        let b = factory.create(Bytes::new(), TransportKind::Stream, Guarantee::Normal, false, 0, vec![]);
        assert!(b.id().as_u64() > a.id().as_u64());
    }

    #[test]
    fn guarantee_tiers_are_ordered() {
        assert!(Guarantee::NonGuaranteed < Guarantee::Normal);
        assert!(Guarantee::Normal < Guarantee::Guaranteed);
        assert!(Guarantee::Guaranteed < Guarantee::GuaranteedQuickest);
    }

    #[test]
    fn sendable_prefers_the_fragment() {
        let factory = PacketFactory::default();
        let mut packet = factory.create(
            Bytes::from_static(b"whole frame"),
            TransportKind::Stream,
            Guarantee::Normal,
            false,
            11,
            vec![],
        );
        assert_eq!(&packet.sendable()[..], b"whole frame");
        packet.set_fragment(Some(Bytes::from_static(b"frame")));
        assert_eq!(&packet.sendable()[..], b"frame");
    }
}
