//! Callback seams between the transport core and external game logic.
//!
//! The engine calls into an [`EngineHooks`] implementation for every decoded
//! inbound frame and for connection lifecycle changes. Callbacks run
//! synchronously inside the worker that owns the event, so implementations
//! must hand heavy work to their own executors rather than block.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;

use crate::{session::Session, transport::filter::FilterError};

/// Why a session is being closed.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection.
    ClientClosed,
    /// A frame marked as last finished writing.
    ClientRequest,
    /// Reading from the channel failed.
    ReadError,
    /// Writing to the channel failed.
    WriteError,
    /// The session exceeded its inactivity threshold.
    IdleTimeout,
    /// The session never associated with a player in time.
    Orphaned,
    /// The engine is shutting down.
    ServerShutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::ClientClosed => "client closed",
            DisconnectReason::ClientRequest => "client request",
            DisconnectReason::ReadError => "read error",
            DisconnectReason::WriteError => "write error",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::Orphaned => "orphaned",
            DisconnectReason::ServerShutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Callbacks the engine invokes on protocol and lifecycle events.
///
/// All methods default to no-ops so implementations override only what they
/// consume, mirroring how player and room managers subscribe to a subset of
/// server events.
pub trait EngineHooks: Send + Sync + 'static {
    /// One decoded application message arrived on `session`.
    fn on_message(&self, _session: &Arc<Session>, _payload: Bytes) {}

    /// A connection passed the filter and its session is registered.
    fn on_connection_established(&self, _session: &Arc<Session>) {}

    /// A connection was refused before a session existed.
    fn on_connection_refused(&self, _peer: SocketAddr, _error: &FilterError) {}

    /// `session` is about to close; external registries should unbind the
    /// player identity here.
    fn on_session_close(&self, _session: &Arc<Session>, _reason: DisconnectReason) {}
}

/// Hooks implementation that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl EngineHooks for NoopHooks {}
