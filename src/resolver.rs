//! Response resolution: from recipient players to per-transport buckets.
//!
//! An outbound [`Response`] names players, not channels. Resolution looks
//! each player up through the [`PlayerSessionIndex`] seam, keeps only live
//! fully-associated sessions, and buckets them by the transport the response
//! should travel on. Players without a live session come back as
//! non-routable rather than vanishing silently.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    packet::Guarantee,
    session::{Session, SessionId, SessionManager},
};

/// Identity of a player as known to the external player registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wrap a player name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }

    /// The player name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(name: &str) -> Self { Self::new(name) }
}

/// Seam to the external player registry: which session does a player own?
pub trait PlayerSessionIndex: Send + Sync + 'static {
    /// Session currently bound to `player`, if any.
    fn session_of(&self, player: &PlayerId) -> Option<SessionId>;
}

/// One outbound message plus its recipients and delivery hints.
#[derive(Clone, Debug)]
pub struct Response {
    payload: Bytes,
    recipients: Vec<PlayerId>,
    guarantee: Guarantee,
    prefer_reliable_udp: bool,
    prefer_datagram: bool,
    encrypted: bool,
}

impl Response {
    /// Start a response carrying `payload`.
    #[must_use]
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            recipients: Vec::new(),
            guarantee: Guarantee::default(),
            prefer_reliable_udp: false,
            prefer_datagram: false,
            encrypted: false,
        }
    }

    /// Add one recipient player.
    #[must_use]
    pub fn recipient(mut self, player: impl Into<PlayerId>) -> Self {
        self.recipients.push(player.into());
        self
    }

    /// Add many recipient players.
    #[must_use]
    pub fn recipients(mut self, players: impl IntoIterator<Item = PlayerId>) -> Self {
        self.recipients.extend(players);
        self
    }

    /// Set the delivery guarantee tier.
    #[must_use]
    pub fn guarantee(mut self, guarantee: Guarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    /// Prefer the reliable-UDP side-channel where a session has one.
    #[must_use]
    pub fn prefer_reliable_udp(mut self) -> Self {
        self.prefer_reliable_udp = true;
        self
    }

    /// Prefer the raw datagram side-channel where a session has one.
    #[must_use]
    pub fn prefer_datagram(mut self) -> Self {
        self.prefer_datagram = true;
        self
    }

    /// Request payload encryption.
    #[must_use]
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// The message payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// The recipient players.
    #[must_use]
    pub fn recipient_players(&self) -> &[PlayerId] { &self.recipients }

    /// The delivery guarantee tier.
    #[must_use]
    pub fn guarantee_level(&self) -> Guarantee { self.guarantee }

    /// Whether encryption was requested.
    #[must_use]
    pub fn is_encrypted(&self) -> bool { self.encrypted }
}

/// Sessions bucketed by the transport their copy of a response travels on.
#[derive(Default)]
pub struct ResolvedRecipients {
    /// Sessions routed over the raw datagram side-channel.
    pub datagram: Vec<Arc<Session>>,
    /// Sessions routed over the reliable-UDP overlay.
    pub reliable_udp: Vec<Arc<Session>>,
    /// Sessions routed over their primary stream channel.
    pub stream: Vec<Arc<Session>>,
    /// Sessions routed over their WebSocket channel.
    pub web_socket: Vec<Arc<Session>>,
    /// Players with no live, fully-associated session.
    pub non_routable: Vec<PlayerId>,
}

impl ResolvedRecipients {
    /// Total sessions across all four buckets.
    #[must_use]
    pub fn routable_len(&self) -> usize {
        self.datagram.len() + self.reliable_udp.len() + self.stream.len() + self.web_socket.len()
    }
}

/// Bucket every recipient of `response` by transport.
///
/// Precedence for stream-capable sessions: an active reliable-UDP conveyor
/// wins over a datagram side-channel, which wins over the primary stream —
/// each only when the matching preference flag is set. WebSocket sessions
/// always use their single channel.
#[must_use]
pub fn resolve(
    response: &Response,
    index: &dyn PlayerSessionIndex,
    manager: &SessionManager,
) -> ResolvedRecipients {
    let mut resolved = ResolvedRecipients::default();
    for player in &response.recipients {
        let session = index
            .session_of(player)
            .and_then(|id| manager.get(id))
            .filter(|session| session.is_activated() && session.is_associated());
        let Some(session) = session else {
            resolved.non_routable.push(player.clone());
            continue;
        };
        if session.is_web_socket() {
            resolved.web_socket.push(session);
        } else if response.prefer_reliable_udp && session.has_reliable_udp() {
            resolved.reliable_udp.push(session);
        } else if response.prefer_datagram && session.has_datagram() {
            resolved.datagram.push(session);
        } else {
            resolved.stream.push(session);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::atomic::AtomicU64,
    };

    use super::*;
    use crate::{
        codec::CodecConfig,
        config::QueuePolicyKind,
        packet::TransportKind,
        transport::rudp::RudpEndpoint,
    };

    struct MapIndex(HashMap<PlayerId, SessionId>);

    impl PlayerSessionIndex for MapIndex {
        fn session_of(&self, player: &PlayerId) -> Option<SessionId> {
            self.0.get(player).copied()
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(
            Arc::new(AtomicU64::new(1)),
            Arc::new(CodecConfig::default()),
            8,
            QueuePolicyKind::RejectWhenFull,
            0,
            0,
        )
    }

    fn addr() -> SocketAddr { "127.0.0.1:5000".parse().expect("addr") }

    fn associated_session(manager: &SessionManager, transport: TransportKind) -> Arc<Session> {
        let session = manager.create_session(transport, addr(), addr());
        assert!(session.try_begin_association());
        assert!(session.complete_association());
        session
    }

    async fn rudp_endpoint() -> RudpEndpoint {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        RudpEndpoint::new(Arc::new(socket), Arc::new(CodecConfig::default()))
    }

    #[tokio::test]
    async fn reliable_udp_preference_wins_over_datagram_and_stream() {
        let manager = manager();
        let session = associated_session(&manager, TransportKind::Stream);
        let _ = manager.enable_datagram(&session);
        let endpoint = rudp_endpoint().await;
        session.set_conveyor(Some(endpoint.register(session.id())));

        let index = MapIndex(HashMap::from([(PlayerId::from("kai"), session.id())]));
        let response = Response::new(Bytes::from_static(b"move"))
            .recipient("kai")
            .prefer_reliable_udp()
            .prefer_datagram();
        let resolved = resolve(&response, &index, &manager);
        assert_eq!(resolved.reliable_udp.len(), 1);
        assert!(resolved.datagram.is_empty());
        assert!(resolved.stream.is_empty());
    }

    #[test]
    fn datagram_preference_wins_over_stream() {
        let manager = manager();
        let session = associated_session(&manager, TransportKind::Stream);
        let _ = manager.enable_datagram(&session);

        let index = MapIndex(HashMap::from([(PlayerId::from("kai"), session.id())]));
        let response = Response::new(Bytes::from_static(b"move"))
            .recipient("kai")
            .prefer_datagram();
        let resolved = resolve(&response, &index, &manager);
        assert_eq!(resolved.datagram.len(), 1);
        assert!(resolved.stream.is_empty());
    }

    #[test]
    fn preferences_without_side_channels_fall_back_to_stream() {
        let manager = manager();
        let session = associated_session(&manager, TransportKind::Stream);

        let index = MapIndex(HashMap::from([(PlayerId::from("kai"), session.id())]));
        let response = Response::new(Bytes::from_static(b"move"))
            .recipient("kai")
            .prefer_reliable_udp()
            .prefer_datagram();
        let resolved = resolve(&response, &index, &manager);
        assert_eq!(resolved.stream.len(), 1);
    }

    #[tokio::test]
    async fn websocket_sessions_ignore_priority_flags() {
        let manager = manager();
        let session = associated_session(&manager, TransportKind::WebSocket);
        let endpoint = rudp_endpoint().await;
        session.set_conveyor(Some(endpoint.register(session.id())));

        let index = MapIndex(HashMap::from([(PlayerId::from("kai"), session.id())]));
        let response = Response::new(Bytes::from_static(b"move"))
            .recipient("kai")
            .prefer_reliable_udp();
        let resolved = resolve(&response, &index, &manager);
        assert_eq!(resolved.web_socket.len(), 1);
        assert!(resolved.reliable_udp.is_empty());
    }

    #[test]
    fn unresolvable_players_are_reported_not_dropped() {
        let manager = manager();
        let session = associated_session(&manager, TransportKind::Stream);
        let index = MapIndex(HashMap::from([
            (PlayerId::from("bound"), session.id()),
            (PlayerId::from("ghost"), SessionId::from_raw(9999)),
        ]));
        let response = Response::new(Bytes::from_static(b"hello"))
            .recipients([PlayerId::from("bound"), PlayerId::from("ghost"), PlayerId::from("nobody")]);
        let resolved = resolve(&response, &index, &manager);
        assert_eq!(resolved.stream.len(), 1);
        assert_eq!(
            resolved.non_routable,
            vec![PlayerId::from("ghost"), PlayerId::from("nobody")]
        );
    }

    #[test]
    fn unassociated_sessions_are_non_routable() {
        let manager = manager();
        let session = manager.create_session(TransportKind::Stream, addr(), addr());
        let index = MapIndex(HashMap::from([(PlayerId::from("early"), session.id())]));
        let response = Response::new(Bytes::from_static(b"hi")).recipient("early");
        let resolved = resolve(&response, &index, &manager);
        assert_eq!(resolved.routable_len(), 0);
        assert_eq!(resolved.non_routable, vec![PlayerId::from("early")]);
    }
}
