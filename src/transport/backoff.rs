//! Exponential backoff for accept-loop errors.

use tokio::time::Duration;

/// Controls how quickly the acceptor retries after `accept()` failures.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling the delay doubles towards.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp the configuration into a usable range.
    #[must_use]
    pub fn normalized(self) -> Self {
        let initial_delay = self.initial_delay.max(Duration::from_millis(1));
        Self {
            initial_delay,
            max_delay: self.max_delay.max(initial_delay),
        }
    }

    /// The delay to use after another consecutive failure.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}
