//! The multi-transport network engine.
//!
//! Thread shape: one acceptor task, R reader workers, and W writer workers,
//! independent of how many sessions are live. Bind failures are fatal at
//! startup; everything after that degrades per-session. Shutdown closes
//! client channels first so application-level cleanup events fire, then the
//! listeners stop, then after a short grace delay the workers wind down.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use log::{info, warn};
use thiserror::Error;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::mpsc,
    time::Duration,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    codec::{CodecConfig, CodecError, FrameEncoder},
    config::{ConfigError, EngineConfig},
    events::{DisconnectReason, EngineHooks},
    metrics,
    packet::{Guarantee, Packet, PacketFactory, QueueError, TransportKind},
    resolver::{PlayerSessionIndex, Response, resolve},
    session::{Session, SessionId, SessionManager},
    transport::{
        acceptor::Acceptor,
        backoff::BackoffConfig,
        filter::ConnectionFilter,
        reader::{self, ReaderSource, ReaderWorker},
        rudp::RudpEndpoint,
        writer::{WriterCommand, WriterWorker},
    },
};

/// Delay between stopping the listeners and cancelling the workers, giving
/// final writes a chance to flush.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Cadence of the reliable-UDP retransmission sweep.
const RUDP_TICK: Duration = Duration::from_millis(50);

/// Fatal engine errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A listening or datagram socket could not be bound.
    #[error("failed to bind {addr}")]
    Bind {
        /// The address that could not be bound.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Errors from the direct-session send path.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SendError {
    /// The payload could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The session's queue refused the packet.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of resolving and enqueuing one response.
#[derive(Debug, Default)]
pub struct SendReport {
    /// Packets accepted onto session queues.
    pub routed: usize,
    /// Packets refused because a queue was full.
    pub dropped_full: usize,
    /// Packets refused by an admission policy.
    pub dropped_policy: usize,
    /// Recipients with no live session.
    pub non_routable: Vec<crate::resolver::PlayerId>,
}

/// State shared by the acceptor and every worker.
pub(crate) struct EngineShared {
    pub(crate) codec: Arc<CodecConfig>,
    pub(crate) manager: SessionManager,
    pub(crate) filter: ConnectionFilter,
    pub(crate) hooks: Arc<dyn EngineHooks>,
    pub(crate) packet_factory: PacketFactory,
    pub(crate) encoder: FrameEncoder,
    pub(crate) readers: Vec<mpsc::UnboundedSender<ReaderSource>>,
    pub(crate) writers: Vec<mpsc::UnboundedSender<WriterCommand>>,
    pub(crate) reader_indexer: AtomicUsize,
    pub(crate) datagram_socket: Option<Arc<UdpSocket>>,
    pub(crate) rudp: Option<Arc<RudpEndpoint>>,
    pub(crate) read_buffer_bytes: usize,
    pub(crate) shutdown: CancellationToken,
}

impl EngineShared {
    /// Hand a channel to the next reader worker, round robin.
    pub(crate) fn assign_reader(&self, source: ReaderSource) {
        let index = self.reader_indexer.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let _ = self.readers[index].send(source);
    }

    /// The writer worker owning `session`; stable for the session's life.
    pub(crate) fn writer_for(&self, session: SessionId) -> &mpsc::UnboundedSender<WriterCommand> {
        let index = usize::try_from(session.as_u64()).unwrap_or(usize::MAX) % self.writers.len();
        &self.writers[index]
    }

    /// Deliver decoded frames to the inbound handler.
    pub(crate) fn dispatch_frames(&self, session: &Arc<Session>, frames: Vec<Bytes>) {
        reader::dispatch_frames(self, session, frames);
    }

    /// Queue `packet` towards `session` and wake its writer.
    pub(crate) fn enqueue(&self, session: &Arc<Session>, packet: Packet) -> Result<(), QueueError> {
        session.queue().put(packet)?;
        session.ticket();
        Ok(())
    }

    /// The single close path: idempotent, always unbinds the association
    /// before the session object is released.
    pub(crate) fn disconnect(&self, session: &Arc<Session>, reason: DisconnectReason) {
        if !session.deactivate() {
            return;
        }
        info!("session closing: id={}, reason={reason}", session.id());
        session.queue().clear();
        if let Some(conveyor) = session.conveyor() {
            if let Some(rudp) = &self.rudp {
                rudp.deregister(conveyor.convey_id());
            }
            session.set_conveyor(None);
        }
        session.reset_association();
        self.filter.release(session.peer_addr().ip());
        self.manager.remove(session);
        self.hooks.on_session_close(session, reason);
        if let Some(writer_tx) = session.writer_tx() {
            let _ = writer_tx.send(WriterCommand::Close {
                session: session.id(),
            });
        }
        metrics::dec_sessions();
    }
}

/// Handle to a bound, running engine.
pub struct NetworkEngine {
    shared: Arc<EngineShared>,
    tracker: TaskTracker,
    accept_token: CancellationToken,
    shutdown: CancellationToken,
    player_index: Arc<dyn PlayerSessionIndex>,
    stream_addrs: Vec<SocketAddr>,
    websocket_addrs: Vec<SocketAddr>,
    datagram_addrs: Vec<SocketAddr>,
    rudp_addr: Option<SocketAddr>,
}

impl NetworkEngine {
    /// Bind every configured listener and start the worker tasks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for invalid configuration and
    /// [`EngineError::Bind`] when a listening or datagram socket cannot be
    /// bound. Bind failures are fatal: nothing is retried and no tasks are
    /// left running.
    pub async fn bind(
        config: EngineConfig,
        hooks: Arc<dyn EngineHooks>,
        player_index: Arc<dyn PlayerSessionIndex>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let codec = Arc::new(config.codec_config());

        let mut stream_listeners = Vec::new();
        let mut stream_addrs = Vec::new();
        for addr in &config.stream_listeners {
            let listener = bind_tcp(*addr).await?;
            stream_addrs.push(listener.local_addr().map_err(|source| EngineError::Bind {
                addr: *addr,
                source,
            })?);
            stream_listeners.push(Arc::new(listener));
        }
        let mut websocket_listeners = Vec::new();
        let mut websocket_addrs = Vec::new();
        for addr in &config.websocket_listeners {
            let listener = bind_tcp(*addr).await?;
            websocket_addrs.push(listener.local_addr().map_err(|source| {
                EngineError::Bind {
                    addr: *addr,
                    source,
                }
            })?);
            websocket_listeners.push(Arc::new(listener));
        }
        let mut datagram_sockets = Vec::new();
        let mut datagram_addrs = Vec::new();
        for addr in &config.datagram_binds {
            let socket = bind_udp(*addr).await?;
            datagram_addrs.push(socket.local_addr().map_err(|source| EngineError::Bind {
                addr: *addr,
                source,
            })?);
            datagram_sockets.push(Arc::new(socket));
        }
        let mut rudp_addr = None;
        let rudp = match config.rudp_bind {
            Some(addr) => {
                let socket = bind_udp(addr).await?;
                rudp_addr = Some(socket.local_addr().map_err(|source| EngineError::Bind {
                    addr,
                    source,
                })?);
                Some(Arc::new(RudpEndpoint::new(
                    Arc::new(socket),
                    Arc::clone(&codec),
                )))
            }
            None => None,
        };

        let mut reader_txs = Vec::new();
        let mut reader_rxs = Vec::new();
        for _ in 0..config.reader_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            reader_txs.push(tx);
            reader_rxs.push(rx);
        }
        let mut writer_txs = Vec::new();
        let mut writer_rxs = Vec::new();
        for _ in 0..config.writer_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            writer_txs.push(tx);
            writer_rxs.push(rx);
        }

        let shutdown = CancellationToken::new();
        let accept_token = shutdown.child_token();
        let manager = SessionManager::new(
            Arc::new(AtomicU64::new(1)),
            Arc::clone(&codec),
            config.queue_capacity,
            config.queue_policy,
            config.idle_read_secs,
            config.idle_write_secs,
        );
        let shared = Arc::new(EngineShared {
            codec: Arc::clone(&codec),
            manager,
            filter: ConnectionFilter::new(config.filter),
            hooks,
            packet_factory: PacketFactory::new(Arc::new(AtomicU64::new(1))),
            encoder: FrameEncoder::new(codec),
            readers: reader_txs,
            writers: writer_txs,
            reader_indexer: AtomicUsize::new(0),
            datagram_socket: datagram_sockets.first().cloned(),
            rudp: rudp.clone(),
            read_buffer_bytes: config.read_buffer_bytes,
            shutdown: shutdown.clone(),
        });

        let tracker = TaskTracker::new();
        for rx in reader_rxs {
            tracker.spawn(ReaderWorker::new(rx, Arc::clone(&shared)).run());
        }
        for rx in writer_rxs {
            tracker.spawn(WriterWorker::new(rx, Arc::clone(&shared)).run());
        }

        // Datagram sockets are connectionless: they register with reader
        // workers directly, never with the acceptor.
        for socket in &datagram_sockets {
            shared.assign_reader(ReaderSource::Datagram {
                socket: Arc::clone(socket),
            });
        }
        if let Some(endpoint) = &rudp {
            shared.assign_reader(ReaderSource::Rudp {
                socket: Arc::clone(endpoint.socket()),
            });
            let endpoint = Arc::clone(endpoint);
            let token = shutdown.clone();
            tracker.spawn(async move {
                let mut interval = tokio::time::interval(RUDP_TICK);
                loop {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => break,
                        _ = interval.tick() => endpoint.tick().await,
                    }
                }
            });
        }

        let acceptor = Acceptor::new(
            stream_listeners,
            websocket_listeners,
            Arc::clone(&shared),
            accept_token.clone(),
            tracker.clone(),
            BackoffConfig::default(),
        );
        tracker.spawn(acceptor.run());

        info!(
            "engine bound: stream={stream_addrs:?}, websocket={websocket_addrs:?}, \
             datagram={datagram_addrs:?}, rudp={rudp_addr:?}"
        );

        Ok(Self {
            shared,
            tracker,
            accept_token,
            shutdown,
            player_index,
            stream_addrs,
            websocket_addrs,
            datagram_addrs,
            rudp_addr,
        })
    }

    /// Addresses the stream listeners actually bound to.
    #[must_use]
    pub fn stream_addrs(&self) -> &[SocketAddr] { &self.stream_addrs }

    /// Addresses the WebSocket listeners actually bound to.
    #[must_use]
    pub fn websocket_addrs(&self) -> &[SocketAddr] { &self.websocket_addrs }

    /// Addresses the datagram sockets actually bound to.
    #[must_use]
    pub fn datagram_addrs(&self) -> &[SocketAddr] { &self.datagram_addrs }

    /// Address of the reliable-UDP overlay socket, if configured.
    #[must_use]
    pub fn rudp_addr(&self) -> Option<SocketAddr> { self.rudp_addr }

    /// The live session registry.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager { &self.shared.manager }

    /// The connection filter, for ban-list administration.
    #[must_use]
    pub fn filter(&self) -> &ConnectionFilter { &self.shared.filter }

    /// Enable the datagram side-channel for a stream session, returning the
    /// convey id its datagrams must carry. `None` when no datagram socket is
    /// bound or the session is not stream-based.
    #[must_use]
    pub fn enable_datagram(&self, session: &Arc<Session>) -> Option<u32> {
        if self.shared.datagram_socket.is_none() || !session.is_stream() {
            return None;
        }
        Some(self.shared.manager.enable_datagram(session))
    }

    /// Attach a reliable-UDP conveyor to a stream session, returning its
    /// convey id. `None` when the overlay is not configured or the session is
    /// not stream-based.
    #[must_use]
    pub fn enable_reliable_udp(&self, session: &Arc<Session>) -> Option<u32> {
        let endpoint = self.shared.rudp.as_ref()?;
        if !session.is_stream() {
            return None;
        }
        let conveyor = endpoint.register(session.id());
        let convey_id = conveyor.convey_id();
        session.set_conveyor(Some(conveyor));
        Some(convey_id)
    }

    /// Resolve and enqueue one response towards its recipients.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the payload cannot be encoded; queue
    /// refusals are per-recipient and reported in the [`SendReport`].
    pub fn send(&self, response: &Response) -> Result<SendReport, CodecError> {
        let mut report = SendReport::default();
        if response.recipient_players().is_empty() {
            return Ok(report);
        }
        let resolved = resolve(response, self.player_index.as_ref(), &self.shared.manager);
        let no_routable = resolved.routable_len() == 0;
        report.non_routable = resolved.non_routable;
        if no_routable {
            return Ok(report);
        }

        let encoded = self
            .shared
            .encoder
            .encode(response.payload(), response.is_encrypted())?;

        let buckets = [
            (resolved.datagram, TransportKind::Datagram),
            (resolved.reliable_udp, TransportKind::ReliableUdp),
            (resolved.stream, TransportKind::Stream),
            (resolved.web_socket, TransportKind::WebSocket),
        ];
        for (sessions, transport) in buckets {
            if sessions.is_empty() {
                continue;
            }
            let recipients: Vec<SessionId> = sessions.iter().map(|s| s.id()).collect();
            let packet = self.shared.packet_factory.create(
                encoded.frame.clone(),
                transport,
                response.guarantee_level(),
                response.is_encrypted(),
                encoded.original_size,
                recipients,
            );
            for session in &sessions {
                match self.shared.enqueue(session, packet.clone()) {
                    Ok(()) => report.routed += 1,
                    Err(error) => {
                        session.record_dropped(1);
                        metrics::inc_dropped(1);
                        match error {
                            QueueError::Full => report.dropped_full += 1,
                            _ => report.dropped_policy += 1,
                        }
                        warn!(
                            "outbound packet refused: session={}, error={error}",
                            session.id()
                        );
                    }
                }
            }
        }
        Ok(report)
    }

    /// Encode `payload` and queue it straight onto one session.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] when encoding fails or the queue refuses the
    /// packet.
    pub fn send_to_session(
        &self,
        session: &Arc<Session>,
        payload: &[u8],
        guarantee: Guarantee,
    ) -> Result<(), SendError> {
        self.send_internal(session, payload, guarantee, false)
    }

    /// Like [`send_to_session`](Self::send_to_session), but the session
    /// closes once the frame is fully written — the kick path.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] when encoding fails or the queue refuses the
    /// packet.
    pub fn send_final_to_session(
        &self,
        session: &Arc<Session>,
        payload: &[u8],
        guarantee: Guarantee,
    ) -> Result<(), SendError> {
        self.send_internal(session, payload, guarantee, true)
    }

    fn send_internal(
        &self,
        session: &Arc<Session>,
        payload: &[u8],
        guarantee: Guarantee,
        last: bool,
    ) -> Result<(), SendError> {
        let encoded = self.shared.encoder.encode(payload, false)?;
        let transport = if session.is_web_socket() {
            TransportKind::WebSocket
        } else {
            TransportKind::Stream
        };
        let mut packet = self.shared.packet_factory.create(
            encoded.frame,
            transport,
            guarantee,
            false,
            encoded.original_size,
            vec![session.id()],
        );
        if last {
            packet.mark_last();
        }
        self.shared.enqueue(session, packet)?;
        Ok(())
    }

    /// Close one session through the standard disconnect path.
    pub fn disconnect(&self, session: &Arc<Session>, reason: DisconnectReason) {
        self.shared.disconnect(session, reason);
    }

    /// Stop the engine in order: client channels first so cleanup events
    /// fire, then the listeners, then — after a grace delay for final
    /// writes — the workers.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        for session in self.shared.manager.snapshot() {
            self.shared
                .disconnect(&session, DisconnectReason::ServerShutdown);
        }
        self.accept_token.cancel();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("engine stopped");
    }
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener, EngineError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| EngineError::Bind { addr, source })
}

async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, EngineError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| EngineError::Bind { addr, source })
}
