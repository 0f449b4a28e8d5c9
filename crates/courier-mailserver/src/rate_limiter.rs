//! Per-peer request rate limiting.
//!
//! A peer may issue one history request per `interval`. Entries older than
//! the interval carry no information and are pruned periodically.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use courier_core::PeerId;
use tokio::time::Instant;
use tracing::debug;

/// Tracks the last admitted request per peer.
pub struct PeerRateLimiter {
    interval: Duration,
    last_request: Mutex<HashMap<PeerId, Instant>>,
}

impl PeerRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Admit a request from `peer` if its previous one is at least
    /// `interval` old, recording the new request time. Returns whether the
    /// request was admitted.
    pub fn check(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match last.get(peer) {
            Some(prev) if now.saturating_duration_since(*prev) < self.interval => false,
            _ => {
                last.insert(*peer, now);
                true
            }
        }
    }

    /// Forget peers whose last request is older than the interval.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = last.len();
        last.retain(|_, at| now.saturating_duration_since(*at) < self.interval);
        let removed = before - last.len();
        if removed > 0 {
            debug!(removed, "pruned idle peers from rate limiter");
        }
        removed
    }

    pub fn tracked_peers(&self) -> usize {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
