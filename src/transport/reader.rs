//! Reader workers: multiplex many channels, feed bytes into framers.
//!
//! Each worker owns the read halves of its assigned sessions plus any bound
//! datagram and overlay sockets, multiplexed through one `FuturesUnordered`
//! so a single task serves them all. A session is only ever owned by one
//! worker, so its framer state advances strictly in arrival order without
//! locking against other readers.

use std::{net::SocketAddr, pin::Pin, sync::Arc};

use bytes::Bytes;
use futures::{
    Future,
    StreamExt,
    stream::{FuturesUnordered, SplitStream},
};
use log::{debug, warn};
use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, UdpSocket, tcp::OwnedReadHalf},
    sync::mpsc,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

use crate::{
    codec::Framer,
    events::DisconnectReason,
    metrics,
    session::Session,
    transport::engine::EngineShared,
};

/// Stream half of an accepted WebSocket connection.
pub(crate) type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// A channel handed to a reader worker for multiplexing.
pub(crate) enum ReaderSource {
    /// Read half of an accepted stream connection.
    Stream {
        session: Arc<Session>,
        half: OwnedReadHalf,
    },
    /// Stream half of an accepted WebSocket connection.
    WebSocket {
        session: Arc<Session>,
        stream: WsStream,
    },
    /// A bound, connectionless datagram socket.
    Datagram { socket: Arc<UdpSocket> },
    /// The reliable-UDP overlay socket.
    Rudp { socket: Arc<UdpSocket> },
}

/// Completion of one read on some source.
enum ReadEvent {
    Stream {
        session: Arc<Session>,
        half: OwnedReadHalf,
        buf: Vec<u8>,
        read: std::io::Result<usize>,
        cancelled: bool,
    },
    WebSocket {
        session: Arc<Session>,
        stream: WsStream,
        item: Option<Result<Message, WsError>>,
        cancelled: bool,
    },
    Datagram {
        socket: Arc<UdpSocket>,
        buf: Vec<u8>,
        received: std::io::Result<(usize, SocketAddr)>,
    },
    Rudp {
        socket: Arc<UdpSocket>,
        buf: Vec<u8>,
        received: std::io::Result<(usize, SocketAddr)>,
    },
}

type ReadFuture = Pin<Box<dyn Future<Output = ReadEvent> + Send>>;

/// One reader worker multiplexing many sessions.
pub(crate) struct ReaderWorker {
    rx: mpsc::UnboundedReceiver<ReaderSource>,
    shared: Arc<EngineShared>,
}

impl ReaderWorker {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<ReaderSource>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self { rx, shared }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();
        let mut reads: FuturesUnordered<ReadFuture> = FuturesUnordered::new();
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                source = self.rx.recv() => match source {
                    Some(source) => reads.push(self.arm(source)),
                    None => break,
                },
                Some(event) = reads.next(), if !reads.is_empty() => {
                    if let Some(rearmed) = self.handle(event).await {
                        reads.push(rearmed);
                    }
                }
            }
        }
    }

    /// Build the next read future for a source.
    fn arm(&self, source: ReaderSource) -> ReadFuture {
        let buffer_bytes = self.shared.read_buffer_bytes;
        match source {
            ReaderSource::Stream { session, mut half } => {
                let token = session.close_token();
                Box::pin(async move {
                    let mut buf = vec![0u8; buffer_bytes];
                    let (read, cancelled) = tokio::select! {
                        () = token.cancelled() => (Ok(0), true),
                        read = half.read(&mut buf) => (read, false),
                    };
                    ReadEvent::Stream {
                        session,
                        half,
                        buf,
                        read,
                        cancelled,
                    }
                })
            }
            ReaderSource::WebSocket {
                session,
                mut stream,
            } => {
                let token = session.close_token();
                Box::pin(async move {
                    let (item, cancelled) = tokio::select! {
                        () = token.cancelled() => (None, true),
                        item = stream.next() => (item, false),
                    };
                    ReadEvent::WebSocket {
                        session,
                        stream,
                        item,
                        cancelled,
                    }
                })
            }
            ReaderSource::Datagram { socket } => Box::pin(async move {
                let mut buf = vec![0u8; buffer_bytes];
                let received = socket.recv_from(&mut buf).await;
                ReadEvent::Datagram {
                    socket,
                    buf,
                    received,
                }
            }),
            ReaderSource::Rudp { socket } => Box::pin(async move {
                let mut buf = vec![0u8; buffer_bytes];
                let received = socket.recv_from(&mut buf).await;
                ReadEvent::Rudp {
                    socket,
                    buf,
                    received,
                }
            }),
        }
    }

    /// React to one completed read; returns the re-armed future when the
    /// source stays registered.
    async fn handle(&mut self, event: ReadEvent) -> Option<ReadFuture> {
        match event {
            ReadEvent::Stream {
                session,
                half,
                buf,
                read,
                cancelled,
            } => {
                if cancelled {
                    // Server-side close released this read half.
                    return None;
                }
                match read {
                    Ok(0) => {
                        self.shared
                            .disconnect(&session, DisconnectReason::ClientClosed);
                        None
                    }
                    Ok(read_bytes) => {
                        self.ingest_session_bytes(&session, &buf[..read_bytes]);
                        session.is_activated().then(|| {
                            self.arm(ReaderSource::Stream { session, half })
                        })
                    }
                    Err(error) => {
                        warn!("read failed: session={}, error={error}", session.id());
                        self.shared
                            .disconnect(&session, DisconnectReason::ReadError);
                        None
                    }
                }
            }
            ReadEvent::WebSocket {
                session,
                stream,
                item,
                cancelled,
            } => {
                if cancelled {
                    return None;
                }
                match item {
                    Some(Ok(Message::Binary(data))) => {
                        self.ingest_session_bytes(&session, &data);
                        session.is_activated().then(|| {
                            self.arm(ReaderSource::WebSocket { session, stream })
                        })
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.shared
                            .disconnect(&session, DisconnectReason::ClientClosed);
                        None
                    }
                    Some(Ok(_)) => {
                        // Pings and pongs are handled by the protocol layer;
                        // text frames carry nothing for the binary pipeline.
                        Some(self.arm(ReaderSource::WebSocket { session, stream }))
                    }
                    Some(Err(error)) => {
                        warn!(
                            "websocket read failed: session={}, error={error}",
                            session.id()
                        );
                        self.shared
                            .disconnect(&session, DisconnectReason::ReadError);
                        None
                    }
                }
            }
            ReadEvent::Datagram {
                socket,
                buf,
                received,
            } => {
                match received {
                    Ok((received_bytes, from)) => {
                        self.ingest_datagram(&buf[..received_bytes], from);
                    }
                    Err(error) => {
                        warn!("datagram receive failed: error={error}");
                        metrics::inc_errors();
                    }
                }
                Some(self.arm(ReaderSource::Datagram { socket }))
            }
            ReadEvent::Rudp {
                socket,
                buf,
                received,
            } => {
                match received {
                    Ok((received_bytes, from)) => {
                        self.ingest_rudp(&buf[..received_bytes], from).await;
                    }
                    Err(error) => {
                        warn!("reliable-udp receive failed: error={error}");
                        metrics::inc_errors();
                    }
                }
                Some(self.arm(ReaderSource::Rudp { socket }))
            }
        }
    }

    /// Feed stream-ordered bytes through the session's framer and dispatch
    /// every completed frame.
    fn ingest_session_bytes(&self, session: &Arc<Session>, bytes: &[u8]) {
        session.record_read(bytes.len() as u64);
        let mut frames = Vec::new();
        let result = session.framer().feed(bytes, &mut frames);
        if let Err(error) = result {
            // The in-flight frame is lost; the framer reset itself and the
            // connection keeps serving subsequent frames.
            warn!(
                "framing error: session={}, error={error}",
                session.id()
            );
            metrics::inc_errors();
        }
        self.shared.dispatch_frames(session, frames);
    }

    /// Attribute a raw datagram to its session via the convey id prefix and
    /// decode its self-contained frame.
    fn ingest_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if datagram.len() < 4 {
            debug!("runt datagram from {from}");
            return;
        }
        let convey_id = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        let Some(session) = self.shared.manager.by_convey(convey_id) else {
            debug!("datagram with unknown convey id {convey_id} from {from}");
            metrics::inc_errors();
            return;
        };
        session.set_datagram_addr(from);
        session.record_read(datagram.len() as u64);

        // Datagrams are self-contained: a fresh framer decodes each one so
        // interleaving never perturbs the stream channel's parse state.
        let mut framer = Framer::new(Arc::clone(&self.shared.codec));
        let mut frames = Vec::new();
        if let Err(error) = framer.feed(&datagram[4..], &mut frames) {
            warn!(
                "datagram framing error: session={}, error={error}",
                session.id()
            );
            metrics::inc_errors();
        }
        self.shared.dispatch_frames(&session, frames);
    }

    /// Hand an overlay segment to the endpoint and dispatch whatever frames
    /// the newly ordered bytes completed.
    async fn ingest_rudp(&self, datagram: &[u8], from: SocketAddr) {
        let Some(endpoint) = self.shared.rudp.as_ref() else {
            return;
        };
        let Some((conveyor, frames)) = endpoint.on_datagram(datagram, from).await else {
            return;
        };
        let Some(session) = self.shared.manager.get(conveyor.session()) else {
            debug!(
                "reliable-udp frames for a vanished session: convey_id={}",
                conveyor.convey_id()
            );
            return;
        };
        session.record_read(datagram.len() as u64);
        self.shared.dispatch_frames(&session, frames);
    }
}

/// Deliver decoded frames to the inbound handler, counting them as they go.
pub(crate) fn dispatch_frames(shared: &EngineShared, session: &Arc<Session>, frames: Vec<Bytes>) {
    if frames.is_empty() {
        return;
    }
    session.record_read_frames(frames.len() as u64);
    for frame in frames {
        metrics::inc_frames(metrics::Direction::Inbound);
        shared.hooks.on_message(session, frame);
    }
}
