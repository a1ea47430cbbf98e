//! Connection filter applied at accept time.
//!
//! Tracks a ban list and per-IP connection counts, and optionally caps the
//! engine-wide accept rate. Rejection happens before a session exists, so a
//! refused connection never touches engine state.

use std::net::IpAddr;

use dashmap::{DashMap, DashSet};
use leaky_bucket::RateLimiter;
use thiserror::Error;

use crate::config::FilterConfig;

/// Why the filter refused a connection.
#[non_exhaustive]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    /// The remote address is on the ban list.
    #[error("address is banned")]
    Banned,
    /// The remote address holds too many simultaneous connections.
    #[error("address reached the maximum of {limit} connections")]
    TooManyConnections {
        /// Configured per-IP limit.
        limit: usize,
    },
    /// The engine-wide accept rate was exceeded.
    #[error("accept rate exceeded")]
    RateExceeded,
}

/// Validates remote addresses before the engine admits their connections.
pub struct ConnectionFilter {
    banned: DashSet<IpAddr>,
    per_ip: DashMap<IpAddr, usize>,
    max_per_ip: usize,
    limiter: Option<RateLimiter>,
}

impl ConnectionFilter {
    /// Build a filter from the configured limits.
    #[must_use]
    pub fn new(config: FilterConfig) -> Self {
        let limiter = config.accept_rate.map(|rate| {
            RateLimiter::builder()
                .initial(rate)
                .refill(rate)
                .interval(std::time::Duration::from_secs(1))
                .max(rate)
                .build()
        });
        Self {
            banned: DashSet::new(),
            per_ip: DashMap::new(),
            max_per_ip: config.max_connections_per_ip,
            limiter,
        }
    }

    /// Add an address to the ban list.
    pub fn ban(&self, address: IpAddr) { self.banned.insert(address); }

    /// Remove an address from the ban list.
    pub fn unban(&self, address: IpAddr) { self.banned.remove(&address); }

    /// Snapshot of the ban list.
    #[must_use]
    pub fn banned_addresses(&self) -> Vec<IpAddr> {
        self.banned.iter().map(|entry| *entry).collect()
    }

    /// Validate `address` and count its new connection.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] when the address is banned, holds too many
    /// connections, or the accept rate is exceeded; nothing is registered in
    /// that case.
    pub fn check_and_register(&self, address: IpAddr) -> Result<(), FilterError> {
        if self.banned.contains(&address) {
            return Err(FilterError::Banned);
        }
        if let Some(limiter) = &self.limiter
            && !limiter.try_acquire(1)
        {
            return Err(FilterError::RateExceeded);
        }
        let mut count = self.per_ip.entry(address).or_insert(0);
        if *count >= self.max_per_ip {
            return Err(FilterError::TooManyConnections {
                limit: self.max_per_ip,
            });
        }
        *count += 1;
        Ok(())
    }

    /// Release one connection held by `address`.
    pub fn release(&self, address: IpAddr) {
        let remove = match self.per_ip.get_mut(&address) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            self.per_ip.remove_if(&address, |_, count| *count == 0);
        }
    }

    /// Connections currently counted for `address`.
    #[must_use]
    pub fn connections_from(&self, address: IpAddr) -> usize {
        self.per_ip.get(&address).map_or(0, |count| *count)
    }
}
