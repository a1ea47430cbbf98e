//! The accept loop: one task watching every listening socket.
//!
//! Stream and WebSocket listeners are multiplexed through a single
//! `FuturesUnordered`, so the engine runs exactly one acceptor regardless of
//! how many ports are configured. Accepted connections are validated against
//! the connection filter, then handed round-robin to reader workers while
//! their write halves go to the writer selected by session id. Accept
//! failures back off exponentially.

use std::{io, net::SocketAddr, pin::Pin, sync::Arc};

use async_trait::async_trait;
use futures::{Future, StreamExt, stream::FuturesUnordered};
use log::{info, warn};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    metrics,
    packet::TransportKind,
    session::Session,
    transport::{
        backoff::BackoffConfig,
        engine::EngineShared,
        reader::ReaderSource,
        writer::WriterCommand,
    },
};

/// Source of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
pub(crate) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

/// Which pipeline an accepted connection enters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AcceptKind {
    Stream,
    WebSocket,
}

type AcceptFuture = Pin<
    Box<
        dyn Future<
                Output = (
                    Arc<dyn AcceptListener>,
                    AcceptKind,
                    io::Result<(TcpStream, SocketAddr)>,
                ),
            > + Send,
    >,
>;

fn arm(listener: Arc<dyn AcceptListener>, kind: AcceptKind) -> AcceptFuture {
    Box::pin(async move {
        let result = listener.accept().await;
        (listener, kind, result)
    })
}

/// The engine's single accept task.
pub(crate) struct Acceptor {
    stream_listeners: Vec<Arc<dyn AcceptListener>>,
    websocket_listeners: Vec<Arc<dyn AcceptListener>>,
    shared: Arc<EngineShared>,
    accept_token: CancellationToken,
    tracker: TaskTracker,
    backoff: BackoffConfig,
}

impl Acceptor {
    pub(crate) fn new(
        stream_listeners: Vec<Arc<TcpListener>>,
        websocket_listeners: Vec<Arc<TcpListener>>,
        shared: Arc<EngineShared>,
        accept_token: CancellationToken,
        tracker: TaskTracker,
        backoff: BackoffConfig,
    ) -> Self {
        let as_dyn = |listeners: Vec<Arc<TcpListener>>| -> Vec<Arc<dyn AcceptListener>> {
            listeners
                .into_iter()
                .map(|l| l as Arc<dyn AcceptListener>)
                .collect()
        };
        Self {
            stream_listeners: as_dyn(stream_listeners),
            websocket_listeners: as_dyn(websocket_listeners),
            shared,
            accept_token,
            tracker,
            backoff: backoff.normalized(),
        }
    }

    pub(crate) async fn run(self) {
        let mut accepts: FuturesUnordered<AcceptFuture> = FuturesUnordered::new();
        for listener in &self.stream_listeners {
            accepts.push(arm(Arc::clone(listener), AcceptKind::Stream));
        }
        for listener in &self.websocket_listeners {
            accepts.push(arm(Arc::clone(listener), AcceptKind::WebSocket));
        }
        if accepts.is_empty() {
            self.accept_token.cancelled().await;
            return;
        }

        let mut delay = self.backoff.initial_delay;
        loop {
            tokio::select! {
                biased;

                () = self.accept_token.cancelled() => break,
                Some((listener, kind, result)) = accepts.next() => {
                    match result {
                        Ok((stream, peer)) => {
                            delay = self.backoff.initial_delay;
                            self.admit(stream, peer, kind).await;
                        }
                        Err(error) => {
                            let local_addr = listener.local_addr().ok();
                            warn!("accept error: error={error:?}, local_addr={local_addr:?}");
                            sleep(delay).await;
                            delay = self.backoff.next_delay(delay);
                        }
                    }
                    accepts.push(arm(listener, kind));
                }
            }
        }
        // Dropping the acceptor closes every listening socket.
    }

    /// Filter, register, and hand off one accepted connection.
    async fn admit(&self, mut stream: TcpStream, peer: SocketAddr, kind: AcceptKind) {
        if let Err(error) = self.shared.filter.check_and_register(peer.ip()) {
            warn!("connection refused: peer={peer}, reason={error}");
            self.shared.hooks.on_connection_refused(peer, &error);
            // Orderly shutdown of the refused channel; engine state untouched.
            let _ = stream.shutdown().await;
            return;
        }
        let local = stream.local_addr().unwrap_or(peer);
        let _ = stream.set_nodelay(true);

        match kind {
            AcceptKind::Stream => {
                let session =
                    self.shared
                        .manager
                        .create_session(TransportKind::Stream, peer, local);
                let (read_half, write_half) = stream.into_split();
                let writer_tx = self.shared.writer_for(session.id()).clone();
                session.bind_writer(writer_tx.clone());
                let _ = writer_tx.send(WriterCommand::RegisterStream {
                    session: Arc::clone(&session),
                    half: write_half,
                });
                self.shared.assign_reader(ReaderSource::Stream {
                    session: Arc::clone(&session),
                    half: read_half,
                });
                finish_admission(&self.shared, &session);
            }
            AcceptKind::WebSocket => {
                // The handshake happens off the accept loop so a slow client
                // cannot stall other listeners.
                let shared = Arc::clone(&self.shared);
                self.tracker.spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(web_socket) => {
                            let session = shared.manager.create_session(
                                TransportKind::WebSocket,
                                peer,
                                local,
                            );
                            let (sink, ws_stream) = web_socket.split();
                            let writer_tx = shared.writer_for(session.id()).clone();
                            session.bind_writer(writer_tx.clone());
                            let _ = writer_tx.send(WriterCommand::RegisterWebSocket {
                                session: Arc::clone(&session),
                                sink: Box::new(sink),
                            });
                            shared.assign_reader(ReaderSource::WebSocket {
                                session: Arc::clone(&session),
                                stream: ws_stream,
                            });
                            finish_admission(&shared, &session);
                        }
                        Err(error) => {
                            warn!("websocket handshake failed: peer={peer}, error={error}");
                            shared.filter.release(peer.ip());
                        }
                    }
                });
            }
        }
    }
}

/// Common tail of a successful admission.
fn finish_admission(shared: &Arc<EngineShared>, session: &Arc<Session>) {
    metrics::inc_sessions();
    info!(
        "connection opened: session={}, transport={:?}, peer={}",
        session.id(),
        session.transport(),
        session.peer_addr()
    );
    shared.hooks.on_connection_established(session);
}
