//! Metric helpers for `gamewire`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled every helper compiles to a no-op.

/// Name of the gauge tracking live sessions.
pub const SESSIONS_ACTIVE: &str = "gamewire_sessions_active";
/// Name of the counter tracking completed frames.
pub const FRAMES_PROCESSED: &str = "gamewire_frames_processed_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "gamewire_errors_total";
/// Name of the counter tracking packets dropped by queue admission.
pub const PACKETS_DROPPED: &str = "gamewire_packets_dropped_total";

/// Direction of frame processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Inbound frames received from a client.
    Inbound,
    /// Outbound frames sent to a client.
    Outbound,
}

impl Direction {
    #[cfg(feature = "metrics")]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[cfg(feature = "metrics")]
mod imp {
    use metrics::{counter, gauge};

    use super::{Direction, ERRORS_TOTAL, FRAMES_PROCESSED, PACKETS_DROPPED, SESSIONS_ACTIVE};

    /// Increment the live-sessions gauge.
    pub fn inc_sessions() { gauge!(SESSIONS_ACTIVE).increment(1.0); }

    /// Decrement the live-sessions gauge.
    pub fn dec_sessions() { gauge!(SESSIONS_ACTIVE).decrement(1.0); }

    /// Record a processed frame for the given direction.
    pub fn inc_frames(direction: Direction) {
        counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    }

    /// Record an error occurrence.
    pub fn inc_errors() { counter!(ERRORS_TOTAL).increment(1); }

    /// Record packets dropped by queue admission.
    pub fn inc_dropped(count: u64) { counter!(PACKETS_DROPPED).increment(count); }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    use super::Direction;

    /// Increment the live-sessions gauge.
    pub fn inc_sessions() {}

    /// Decrement the live-sessions gauge.
    pub fn dec_sessions() {}

    /// Record a processed frame for the given direction.
    pub fn inc_frames(_direction: Direction) {}

    /// Record an error occurrence.
    pub fn inc_errors() {}

    /// Record packets dropped by queue admission.
    pub fn inc_dropped(_count: u64) {}
}

pub use imp::{dec_sessions, inc_dropped, inc_errors, inc_frames, inc_sessions};
