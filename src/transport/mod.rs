//! Non-blocking multi-transport I/O engine.
//!
//! One acceptor, a pool of reader workers, and a pool of writer workers
//! serve every session; datagram and reliable-UDP sockets register with the
//! reader pool directly. See [`engine::NetworkEngine`] for the entry point.

pub(crate) mod acceptor;
pub mod backoff;
pub mod engine;
pub mod filter;
pub(crate) mod reader;
pub mod rudp;
pub(crate) mod writer;

pub use backoff::BackoffConfig;
pub use engine::{EngineError, NetworkEngine, SendError, SendReport};
pub use filter::{ConnectionFilter, FilterError};
pub use rudp::{Conveyor, RudpEndpoint};
