//! Per-relay minimum-interval gate
//!
//! One session owns one relay per cycle, so the limiter is plain owned state
//! with no locking: a monotonic clock read and write per query.

use std::time::Duration;

use tokio::time::Instant;

use crate::types::RelayId;

/// Enforces a minimum gap between consecutive queries to one relay
#[derive(Debug, Clone)]
pub struct RateLimiter {
    relay: RelayId,
    min_interval: Duration,
    last_request_at: Option<Instant>,
}

impl RateLimiter {
    pub fn new(relay: RelayId, min_interval: Duration) -> Self {
        Self {
            relay,
            min_interval,
            last_request_at: None,
        }
    }

    /// Wait until `min_interval` has passed since the previous query, then
    /// stamp the new one
    pub async fn wait(&mut self) {
        if let Some(ready_at) = self.ready_at() {
            if ready_at > Instant::now() {
                tracing::trace!(relay = %self.relay, "Rate limit wait");
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_request_at = Some(Instant::now());
    }

    /// Earliest instant the next query may go out
    pub fn ready_at(&self) -> Option<Instant> {
        self.last_request_at.map(|t| t + self.min_interval)
    }

    pub fn relay(&self) -> &RelayId {
        &self.relay
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }
}
