//! Writer workers: drain session packet queues onto real channels.
//!
//! Each worker owns the write halves of the sessions assigned to it and a
//! command channel. A `Ticket` means "this session's queue may hold
//! packets"; the worker sends one packet (or one partial) per ticket and
//! re-tickets while more remain, so many sessions progress fairly. Partial
//! stream writes park the unsent tail as a fragment on the packet and resume
//! on the next pass.

use std::{collections::HashMap, sync::Arc};

use futures::{SinkExt, stream::SplitSink};
use log::{debug, warn};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::mpsc,
};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};

use crate::{
    events::DisconnectReason,
    metrics,
    packet::{Packet, TransportKind},
    session::{Session, SessionId},
    transport::engine::EngineShared,
};

/// Sink half of an accepted WebSocket connection.
pub(crate) type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Commands accepted by a writer worker.
pub(crate) enum WriterCommand {
    /// Adopt the write half of a newly accepted stream connection.
    RegisterStream {
        session: Arc<Session>,
        half: OwnedWriteHalf,
    },
    /// Adopt the sink of a newly accepted WebSocket connection.
    RegisterWebSocket {
        session: Arc<Session>,
        sink: Box<WsSink>,
    },
    /// The session's queue may hold packets to drain.
    Ticket { session: SessionId },
    /// Drop the session's channel.
    Close { session: SessionId },
}

enum WriteSink {
    Stream(OwnedWriteHalf),
    WebSocket(Box<WsSink>),
}

/// One writer worker multiplexing many sessions.
pub(crate) struct WriterWorker {
    rx: mpsc::UnboundedReceiver<WriterCommand>,
    shared: Arc<EngineShared>,
    sinks: HashMap<SessionId, WriteSink>,
}

impl WriterWorker {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<WriterCommand>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            rx,
            shared,
            sinks: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&mut self, command: WriterCommand) {
        match command {
            WriterCommand::RegisterStream { session, half } => {
                self.sinks.insert(session.id(), WriteSink::Stream(half));
            }
            WriterCommand::RegisterWebSocket { session, sink } => {
                self.sinks.insert(session.id(), WriteSink::WebSocket(sink));
            }
            WriterCommand::Ticket { session } => self.drain_one(session).await,
            WriterCommand::Close { session } => {
                if let Some(WriteSink::WebSocket(mut sink)) = self.sinks.remove(&session) {
                    // Best effort: the peer may already be gone.
                    let _ = sink.close().await;
                }
            }
        }
    }

    /// Send one packet (or partial) for the ticketed session.
    async fn drain_one(&mut self, id: SessionId) {
        let Some(session) = self.shared.manager.get(id) else {
            return;
        };
        if !session.is_activated() {
            return;
        }
        let Some(packet) = session.queue().peek() else {
            return;
        };
        match packet.transport() {
            TransportKind::Stream => self.write_stream(&session, packet).await,
            TransportKind::WebSocket => self.write_web_socket(&session, packet).await,
            TransportKind::Datagram => self.write_datagram(&session, &packet).await,
            TransportKind::ReliableUdp => self.write_reliable_udp(&session, &packet).await,
        }
    }

    async fn write_stream(&mut self, session: &Arc<Session>, mut packet: Packet) {
        let bytes = packet.sendable().clone();
        let Some(WriteSink::Stream(half)) = self.sinks.get_mut(&session.id()) else {
            debug!("no stream sink for ticketed session: id={}", session.id());
            return;
        };
        match half.write(&bytes).await {
            Ok(written) => {
                session.record_write(written as u64);
                if written < bytes.len() {
                    // Park the unsent tail and retry on the next pass.
                    packet.set_fragment(Some(bytes.slice(written..)));
                    session.queue().replace_front(packet);
                    session.ticket();
                } else {
                    self.finish_packet(session, &packet).await;
                }
            }
            Err(error) => {
                warn!(
                    "write failed: session={}, error={error}",
                    session.id()
                );
                self.shared.disconnect(session, DisconnectReason::WriteError);
            }
        }
    }

    async fn write_web_socket(&mut self, session: &Arc<Session>, packet: Packet) {
        let bytes = packet.data().clone();
        let Some(WriteSink::WebSocket(sink)) = self.sinks.get_mut(&session.id()) else {
            debug!("no websocket sink for ticketed session: id={}", session.id());
            return;
        };
        match sink.send(Message::Binary(bytes.to_vec())).await {
            Ok(()) => {
                session.record_write(bytes.len() as u64);
                self.finish_packet(session, &packet).await;
            }
            Err(error) => {
                warn!(
                    "websocket write failed: session={}, error={error}",
                    session.id()
                );
                self.shared.disconnect(session, DisconnectReason::WriteError);
            }
        }
    }

    async fn write_datagram(&mut self, session: &Arc<Session>, packet: &Packet) {
        let result = match (self.shared.datagram_socket.as_ref(), session.datagram_addr()) {
            (Some(socket), Some(remote)) => socket.send_to(packet.data(), remote).await,
            (socket, remote) => {
                debug!(
                    "dropping datagram packet: session={}, socket={}, remote={remote:?}",
                    session.id(),
                    socket.is_some(),
                );
                // Datagram delivery is best effort; the packet is consumed.
                let _ = session.queue().take();
                session.record_dropped(1);
                metrics::inc_dropped(1);
                return;
            }
        };
        match result {
            Ok(written) => {
                session.record_write(written as u64);
                self.finish_packet(session, packet).await;
            }
            Err(error) => {
                // A failed datagram never tears the session down.
                warn!(
                    "datagram send failed: session={}, error={error}",
                    session.id()
                );
                let _ = session.queue().take();
                session.record_dropped(1);
                metrics::inc_dropped(1);
            }
        }
    }

    async fn write_reliable_udp(&mut self, session: &Arc<Session>, packet: &Packet) {
        let (Some(endpoint), Some(conveyor)) = (self.shared.rudp.as_ref(), session.conveyor())
        else {
            debug!(
                "dropping reliable-udp packet, overlay not active: session={}",
                session.id()
            );
            let _ = session.queue().take();
            session.record_dropped(1);
            metrics::inc_dropped(1);
            return;
        };
        match endpoint.send_frame(&conveyor, packet.data()).await {
            Ok(()) => {
                session.record_write(packet.data().len() as u64);
                self.finish_packet(session, packet).await;
            }
            Err(error) => {
                warn!(
                    "reliable-udp send failed: session={}, error={error}",
                    session.id()
                );
                self.shared.disconnect(session, DisconnectReason::WriteError);
            }
        }
    }

    /// Consume a fully written packet and honour its last-frame marker.
    async fn finish_packet(&mut self, session: &Arc<Session>, packet: &Packet) {
        let _ = session.queue().take();
        session.record_written_packet();
        metrics::inc_frames(metrics::Direction::Outbound);
        if packet.is_marked_last() {
            session.queue().clear();
            self.shared
                .disconnect(session, DisconnectReason::ClientRequest);
            return;
        }
        if !session.queue().is_empty() {
            session.ticket();
        }
    }
}
