//! Concurrent registry of live sessions.
//!
//! Sessions are keyed by [`SessionId`]; a secondary index maps datagram
//! convey ids to sessions so connectionless packets can be attributed to the
//! stream session that enabled the side-channel.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use dashmap::DashMap;

use crate::{
    codec::CodecConfig,
    packet::{PacketQueue, TransportKind},
    session::{Session, SessionId},
};

/// Builds sessions and tracks every live one.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    convey_index: DashMap<u32, SessionId>,
    id_counter: Arc<AtomicU64>,
    convey_counter: AtomicU32,
    codec: Arc<CodecConfig>,
    queue_capacity: usize,
    queue_policy: crate::config::QueuePolicyKind,
    idle_read_secs: u64,
    idle_write_secs: u64,
}

impl SessionManager {
    /// Create a manager issuing ids from the injected counter.
    #[must_use]
    pub fn new(
        id_counter: Arc<AtomicU64>,
        codec: Arc<CodecConfig>,
        queue_capacity: usize,
        queue_policy: crate::config::QueuePolicyKind,
        idle_read_secs: u64,
        idle_write_secs: u64,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            convey_index: DashMap::new(),
            id_counter,
            convey_counter: AtomicU32::new(1),
            codec,
            queue_capacity,
            queue_policy,
            idle_read_secs,
            idle_write_secs,
        }
    }

    /// Create and register a session for a newly accepted connection.
    #[must_use]
    pub fn create_session(
        &self,
        transport: TransportKind,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Arc<Session> {
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let queue = PacketQueue::new(self.queue_capacity, self.queue_policy.instantiate());
        let session = Session::new(
            id,
            transport,
            peer_addr,
            local_addr,
            queue,
            Arc::clone(&self.codec),
        );
        session.set_idle_thresholds(self.idle_read_secs, self.idle_write_secs);
        self.sessions.insert(session.id(), Arc::clone(&session));
        session
    }

    /// Look up a live session.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve a datagram convey id to its owning session.
    #[must_use]
    pub fn by_convey(&self, convey_id: u32) -> Option<Arc<Session>> {
        let id = *self.convey_index.get(&convey_id)?;
        self.get(id)
    }

    /// Enable the datagram side-channel on a stream session, allocating the
    /// convey id clients must prefix their datagrams with.
    #[must_use]
    pub fn enable_datagram(&self, session: &Arc<Session>) -> u32 {
        let convey_id = self.convey_counter.fetch_add(1, Ordering::Relaxed);
        session.enable_datagram(convey_id);
        self.convey_index.insert(convey_id, session.id());
        convey_id
    }

    /// Remove a session and its convey index entry.
    pub fn remove(&self, session: &Arc<Session>) {
        if let Some(convey_id) = session.convey_id() {
            self.convey_index.remove(&convey_id);
        }
        self.sessions.remove(&session.id());
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize { self.sessions.len() }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.sessions.is_empty() }

    /// Snapshot of every live session, for broadcast and shutdown walks.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sessions exceeding their idle threshold or orphaned past the grace
    /// period; the external cleanup scan feeds these to the disconnect path.
    #[must_use]
    pub fn reapable(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().is_idle() || entry.value().is_orphan())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
