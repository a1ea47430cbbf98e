//! Bounded, priority-ordered outbound queue, one per session.
//!
//! Packets drain highest guarantee first, FIFO inside a tier: entries are
//! keyed by `(guarantee, insertion sequence)` so two packets of equal
//! priority can never collide or reorder. Multiple producers may `put`
//! concurrently while a single writer worker drains; one internal mutex
//! covers both.

use std::{cmp::Reverse, collections::BTreeMap, sync::Mutex};

use thiserror::Error;

use super::{Admission, Guarantee, Packet, QueuePolicy};

/// Errors returned by [`PacketQueue::put`].
///
/// The two conditions are deliberately distinct: `Full` means capacity is
/// exhausted under the active policy, `PolicyViolation` means the policy
/// refused this specific packet.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// No capacity remains for this packet.
    #[error("packet queue full")]
    Full,
    /// The admission policy rejected the packet.
    #[error("packet rejected by the queue policy")]
    PolicyViolation,
}

/// Occupancy view handed to admission policies.
#[derive(Clone, Copy, Debug)]
pub struct QueueSnapshot {
    /// Packets currently queued.
    pub len: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Occupancy in percent, `0.0..=100.0`.
    pub percentage_used: f32,
    /// Tier of the lowest-priority queued packet, if any.
    pub lowest_guarantee: Option<Guarantee>,
}

/// Ordering key: higher guarantees first, FIFO within a tier.
type QueueKey = (Reverse<Guarantee>, u64);

struct QueueInner {
    packets: BTreeMap<QueueKey, Packet>,
    sequence: u64,
}

/// Bounded multiset of [`Packet`]s ordered by guarantee tier.
pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    policy: Box<dyn QueuePolicy>,
    max_size: usize,
}

impl PacketQueue {
    /// Create a queue with the given capacity and admission policy.
    #[must_use]
    pub fn new(max_size: usize, policy: Box<dyn QueuePolicy>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                packets: BTreeMap::new(),
                sequence: 0,
            }),
            policy,
            max_size,
        }
    }

    /// Clone of the highest-priority packet without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<Packet> {
        let inner = self.lock();
        inner.packets.first_key_value().map(|(_, p)| p.clone())
    }

    /// Remove and return the highest-priority packet.
    #[must_use]
    pub fn take(&self) -> Option<Packet> {
        let mut inner = self.lock();
        inner.packets.pop_first().map(|(_, p)| p)
    }

    /// Replace the frame at the head of the queue.
    ///
    /// Used by writer workers to store a partial-write fragment back onto the
    /// packet they peeked.
    pub fn replace_front(&self, packet: Packet) {
        let mut inner = self.lock();
        let front = inner.packets.first_key_value().map(|(key, _)| *key);
        if let Some(key) = front {
            inner.packets.insert(key, packet);
        }
    }

    /// Insert a packet, consulting the admission policy.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PolicyViolation`] when the policy refuses the
    /// packet and [`QueueError::Full`] when capacity is exhausted (including
    /// when an eviction verdict finds no lower-priority victim).
    pub fn put(&self, packet: Packet) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let snapshot = Self::snapshot_of(&inner, self.max_size);
        match self.policy.admit(&snapshot, &packet) {
            Admission::Reject => return Err(QueueError::PolicyViolation),
            Admission::Allow => {
                if inner.packets.len() >= self.max_size {
                    return Err(QueueError::Full);
                }
            }
            Admission::EvictLowest => {
                if inner.packets.len() >= self.max_size {
                    let victim = inner
                        .packets
                        .last_key_value()
                        .filter(|(_, lowest)| lowest.guarantee() < packet.guarantee())
                        .map(|(key, _)| *key);
                    match victim {
                        Some(key) => {
                            inner.packets.remove(&key);
                        }
                        None => return Err(QueueError::Full),
                    }
                }
            }
        }
        let key = (Reverse(packet.guarantee()), inner.sequence);
        inner.sequence += 1;
        inner.packets.insert(key, packet);
        Ok(())
    }

    /// Drop every queued packet.
    pub fn clear(&self) { self.lock().packets.clear(); }

    /// Packets currently queued.
    #[must_use]
    pub fn len(&self) -> usize { self.lock().packets.len() }

    /// Whether the queue holds no packets.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.lock().packets.is_empty() }

    /// Whether the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool { self.len() >= self.max_size }

    /// Occupancy in percent, for monitoring and backpressure signalling.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "queue sizes are far below 2^23")]
    pub fn percentage_used(&self) -> f32 {
        if self.max_size == 0 {
            return 100.0;
        }
        self.lock().packets.len() as f32 / self.max_size as f32 * 100.0
    }

    fn snapshot_of(inner: &QueueInner, max_size: usize) -> QueueSnapshot {
        #[expect(clippy::cast_precision_loss, reason = "queue sizes are far below 2^23")]
        let percentage_used = if max_size == 0 {
            100.0
        } else {
            inner.packets.len() as f32 / max_size as f32 * 100.0
        };
        QueueSnapshot {
            len: inner.packets.len(),
            max_size,
            percentage_used,
            lowest_guarantee: inner.packets.last_key_value().map(|(_, p)| p.guarantee()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // Poisoning only happens if a holder panicked; the queue contents are
        // plain data, safe to keep serving.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::packet::{DefaultQueuePolicy, EvictLowestPolicy, PacketFactory, RejectWhenFull, TransportKind};

    fn packet(factory: &PacketFactory, guarantee: Guarantee, tag: u8) -> Packet {
        factory.create(
            Bytes::copy_from_slice(&[tag]),
            TransportKind::Stream,
            guarantee,
            false,
            1,
            vec![],
        )
    }

    #[test]
    fn fourth_put_reports_full_and_size_stays_three() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(3, Box::new(RejectWhenFull));
        for i in 0..3 {
            queue
                .put(packet(&factory, Guarantee::Normal, i))
                .expect("put");
        }
        assert_eq!(
            queue.put(packet(&factory, Guarantee::Normal, 9)),
            Err(QueueError::Full)
        );
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn drains_by_tier_then_fifo_within_a_tier() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(8, Box::new(RejectWhenFull));
        queue.put(packet(&factory, Guarantee::Normal, 1)).expect("put");
        queue.put(packet(&factory, Guarantee::Guaranteed, 2)).expect("put");
        queue.put(packet(&factory, Guarantee::Normal, 3)).expect("put");
        queue.put(packet(&factory, Guarantee::GuaranteedQuickest, 4)).expect("put");
        queue.put(packet(&factory, Guarantee::Guaranteed, 5)).expect("put");

        let order: Vec<u8> = std::iter::from_fn(|| queue.take())
            .map(|p| p.data()[0])
            .collect();
        assert_eq!(order, vec![4, 2, 5, 1, 3]);
    }

    #[test]
    fn equal_priority_packets_never_collide() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(16, Box::new(RejectWhenFull));
        for i in 0..10 {
            queue.put(packet(&factory, Guarantee::Normal, i)).expect("put");
        }
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn default_policy_sheds_low_tiers_under_pressure() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(10, Box::new(DefaultQueuePolicy));
        for i in 0..8 {
            queue.put(packet(&factory, Guarantee::Normal, i)).expect("put");
        }
        // 80 % used: non-guaranteed refused, normal still admitted.
        assert_eq!(
            queue.put(packet(&factory, Guarantee::NonGuaranteed, 50)),
            Err(QueueError::PolicyViolation)
        );
        queue.put(packet(&factory, Guarantee::Normal, 51)).expect("put");
        // 90 % used: only guaranteed-quickest passes.
        assert_eq!(
            queue.put(packet(&factory, Guarantee::Guaranteed, 52)),
            Err(QueueError::PolicyViolation)
        );
        queue
            .put(packet(&factory, Guarantee::GuaranteedQuickest, 53))
            .expect("put");
    }

    #[test]
    fn evict_policy_drops_a_lower_tier_victim() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(2, Box::new(EvictLowestPolicy));
        queue.put(packet(&factory, Guarantee::NonGuaranteed, 1)).expect("put");
        queue.put(packet(&factory, Guarantee::Normal, 2)).expect("put");
        queue.put(packet(&factory, Guarantee::Guaranteed, 3)).expect("put");
        assert_eq!(queue.len(), 2);
        let drained: Vec<u8> = std::iter::from_fn(|| queue.take())
            .map(|p| p.data()[0])
            .collect();
        assert_eq!(drained, vec![3, 2]);
    }

    #[test]
    fn evict_policy_refuses_when_no_victim_ranks_below() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(1, Box::new(EvictLowestPolicy));
        queue.put(packet(&factory, Guarantee::Guaranteed, 1)).expect("put");
        assert_eq!(
            queue.put(packet(&factory, Guarantee::Guaranteed, 2)),
            Err(QueueError::Full)
        );
    }

    #[test]
    fn percentage_tracks_occupancy() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(4, Box::new(RejectWhenFull));
        assert!((queue.percentage_used() - 0.0).abs() < f32::EPSILON);
        queue.put(packet(&factory, Guarantee::Normal, 1)).expect("put");
        assert!((queue.percentage_used() - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn clear_empties_the_queue() {
        let factory = PacketFactory::default();
        let queue = PacketQueue::new(4, Box::new(RejectWhenFull));
        queue.put(packet(&factory, Guarantee::Normal, 1)).expect("put");
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }
}
