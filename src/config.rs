//! Engine configuration surface.

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;

use crate::{
    codec::{self, CodecConfig, PacketCipher},
    packet::{DefaultQueuePolicy, EvictLowestPolicy, QueuePolicy, RejectWhenFull},
};

/// Errors detected while validating an [`EngineConfig`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No listener of any transport kind was configured.
    #[error("no listeners configured")]
    NoListeners,
    /// A worker pool was sized to zero.
    #[error("{pool} worker pool must hold at least one worker")]
    EmptyWorkerPool {
        /// Which pool was empty.
        pool: &'static str,
    },
    /// The per-session queue capacity was zero.
    #[error("session queue capacity must be at least 1")]
    ZeroQueueCapacity,
    /// The frame length cap was zero.
    #[error("max_frame_bytes must be at least 1")]
    ZeroMaxFrame,
}

/// Which admission policy new session queues are built with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicyKind {
    /// Tiered shedding of low-guarantee packets under pressure.
    Default,
    /// Admit until capacity, then report the queue as full.
    RejectWhenFull,
    /// Evict the lowest-priority packet for a higher-priority arrival.
    EvictLowest,
}

impl QueuePolicyKind {
    pub(crate) fn instantiate(self) -> Box<dyn QueuePolicy> {
        match self {
            QueuePolicyKind::Default => Box::new(DefaultQueuePolicy),
            QueuePolicyKind::RejectWhenFull => Box::new(RejectWhenFull),
            QueuePolicyKind::EvictLowest => Box::new(EvictLowestPolicy),
        }
    }
}

/// Limits applied by the connection filter at accept time.
#[derive(Clone, Copy, Debug)]
pub struct FilterConfig {
    /// Maximum simultaneous connections per remote IP.
    pub max_connections_per_ip: usize,
    /// Accepted connections per second across the engine; `None` disables
    /// rate limiting.
    pub accept_rate: Option<usize>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 10,
            accept_rate: None,
        }
    }
}

/// Everything the engine needs to bind, size its worker pools, and build
/// per-session state.
pub struct EngineConfig {
    /// Stream (TCP) listener addresses.
    pub stream_listeners: Vec<SocketAddr>,
    /// WebSocket listener addresses.
    pub websocket_listeners: Vec<SocketAddr>,
    /// Bound datagram socket addresses.
    pub datagram_binds: Vec<SocketAddr>,
    /// Reliable-UDP overlay bind address.
    pub rudp_bind: Option<SocketAddr>,
    /// Number of reader worker tasks.
    pub reader_workers: usize,
    /// Number of writer worker tasks.
    pub writer_workers: usize,
    /// Per-session outbound queue capacity.
    pub queue_capacity: usize,
    /// Admission policy for per-session queues.
    pub queue_policy: QueuePolicyKind,
    /// Seconds without a read before the idle scan may close a session;
    /// zero disables.
    pub idle_read_secs: u64,
    /// Seconds without a write before the idle scan may close a session;
    /// zero disables.
    pub idle_write_secs: u64,
    /// Whether the encoder may compress payloads.
    pub compression_enabled: bool,
    /// Payload length above which compression is attempted.
    pub compression_threshold: usize,
    /// Payload length above which frames switch to the 4-byte length field.
    pub big_size_threshold: usize,
    /// Cap on a single frame's transformed payload.
    pub max_frame_bytes: usize,
    /// Cipher for frames flagged encrypted; `None` refuses encrypted
    /// traffic.
    pub cipher: Option<Arc<dyn PacketCipher>>,
    /// Read buffer size handed to each channel read.
    pub read_buffer_bytes: usize,
    /// Connection filter limits.
    pub filter: FilterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_listeners: Vec::new(),
            websocket_listeners: Vec::new(),
            datagram_binds: Vec::new(),
            rudp_bind: None,
            reader_workers: 2,
            writer_workers: 2,
            queue_capacity: 128,
            queue_policy: QueuePolicyKind::Default,
            idle_read_secs: 0,
            idle_write_secs: 0,
            compression_enabled: true,
            compression_threshold: codec::DEFAULT_COMPRESSION_THRESHOLD,
            big_size_threshold: codec::BIG_SIZE_THRESHOLD,
            max_frame_bytes: codec::DEFAULT_MAX_FRAME_BYTES,
            cipher: None,
            read_buffer_bytes: 64 * 1024,
            filter: FilterConfig::default(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("stream_listeners", &self.stream_listeners)
            .field("websocket_listeners", &self.websocket_listeners)
            .field("datagram_binds", &self.datagram_binds)
            .field("rudp_bind", &self.rudp_bind)
            .field("reader_workers", &self.reader_workers)
            .field("writer_workers", &self.writer_workers)
            .field("queue_capacity", &self.queue_capacity)
            .field("queue_policy", &self.queue_policy)
            .field("idle_read_secs", &self.idle_read_secs)
            .field("idle_write_secs", &self.idle_write_secs)
            .field("compression_enabled", &self.compression_enabled)
            .field("compression_threshold", &self.compression_threshold)
            .field("big_size_threshold", &self.big_size_threshold)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("cipher", &self.cipher.as_ref().map(|_| "<cipher>"))
            .field("read_buffer_bytes", &self.read_buffer_bytes)
            .field("filter", &self.filter)
            .finish()
    }
}

impl EngineConfig {
    /// Check the configuration for combinations the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_listeners.is_empty()
            && self.websocket_listeners.is_empty()
            && self.datagram_binds.is_empty()
            && self.rudp_bind.is_none()
        {
            return Err(ConfigError::NoListeners);
        }
        if self.reader_workers == 0 {
            return Err(ConfigError::EmptyWorkerPool { pool: "reader" });
        }
        if self.writer_workers == 0 {
            return Err(ConfigError::EmptyWorkerPool { pool: "writer" });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ZeroMaxFrame);
        }
        Ok(())
    }

    /// Codec settings shared by every session's framer and the encoder.
    #[must_use]
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            max_frame_bytes: self.max_frame_bytes,
            compression_enabled: self.compression_enabled,
            compression_threshold: self.compression_threshold,
            big_size_threshold: self.big_size_threshold.min(codec::BIG_SIZE_THRESHOLD),
            cipher: self.cipher.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listening_config() -> EngineConfig {
        EngineConfig {
            stream_listeners: vec!["127.0.0.1:0".parse().expect("addr")],
            ..EngineConfig::default()
        }
    }

    #[test]
    fn default_with_a_listener_validates() {
        assert!(listening_config().validate().is_ok());
    }

    #[test]
    fn listenerless_config_is_rejected() {
        assert!(matches!(
            EngineConfig::default().validate(),
            Err(ConfigError::NoListeners)
        ));
    }

    #[test]
    fn zero_worker_pools_are_rejected() {
        let config = EngineConfig {
            reader_workers: 0,
            ..listening_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyWorkerPool { pool: "reader" })
        ));

        let config = EngineConfig {
            writer_workers: 0,
            ..listening_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyWorkerPool { pool: "writer" })
        ));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let config = EngineConfig {
            queue_capacity: 0,
            ..listening_config()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroQueueCapacity)));
    }
}
