//! Transport and wire-protocol core for a multiplayer game server.
//!
//! This crate provides the binary packet protocol (header flags, streaming
//! framer, frame encoder), a readiness-driven multi-transport engine with a
//! bounded worker count, per-session outbound queues with pluggable
//! admission policies, and the session-association state machine binding
//! connections to player identities.

pub mod codec;
pub mod config;
pub mod events;
pub mod metrics;
pub mod packet;
pub mod resolver;
pub mod session;
pub mod transport;

pub use codec::{
    ChaChaPacketCipher,
    CodecConfig,
    CodecError,
    EncodedFrame,
    FrameEncoder,
    Framer,
    PacketCipher,
    PacketHeader,
    ReadState,
};
pub use config::{ConfigError, EngineConfig, FilterConfig, QueuePolicyKind};
pub use events::{DisconnectReason, EngineHooks, NoopHooks};
pub use packet::{
    Guarantee,
    Packet,
    PacketFactory,
    PacketId,
    PacketQueue,
    QueueError,
    TransportKind,
};
pub use resolver::{PlayerId, PlayerSessionIndex, ResolvedRecipients, Response, resolve};
pub use session::{AssociationState, Session, SessionId, SessionManager};
pub use transport::{
    ConnectionFilter,
    EngineError,
    FilterError,
    NetworkEngine,
    SendError,
    SendReport,
};
