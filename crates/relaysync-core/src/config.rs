//! Cycle configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! none at all) is valid. Durations are in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::types::{Relay, TransportClass};

/// Timeouts for one transport class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportTimeouts {
    pub connect_ms: u64,
    pub query_ms: u64,
}

impl TransportTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn query(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            query_ms: 15_000,
        }
    }
}

/// Everything a cycle needs to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between cycle starts
    pub cycle_interval_ms: u64,
    /// Hard stop for a single cycle
    pub cycle_deadline_ms: u64,
    /// Number of worker shards (N)
    pub workers: usize,
    /// Concurrent sessions per worker (M)
    pub sessions_per_worker: usize,
    /// Random delay range applied before each session starts
    pub stagger_min_ms: u64,
    pub stagger_max_ms: u64,
    /// Where relays without a watermark start
    pub default_lookback_secs: u64,
    /// Result cap assumed when a relay has no hint
    pub result_cap: usize,
    /// Narrowing floor for the window splitter, in seconds
    pub min_window_secs: u64,
    /// Events per sink write
    pub batch_size: usize,
    /// Default gap between two queries to the same relay
    pub min_request_interval_ms: u64,
    /// Default time a session may spend on one relay per cycle
    pub peer_budget_ms: u64,
    pub direct: TransportTimeouts,
    pub proxied: TransportTimeouts,
    /// SOCKS5 proxy used for proxied relays
    pub proxy_addr: Option<String>,
    /// How long in-flight sessions get to stop on their own at shutdown
    pub shutdown_grace_ms: u64,
    pub query_retry: RetryPolicy,
    pub sink_retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 10 * 60 * 1000,
            cycle_deadline_ms: 9 * 60 * 1000,
            workers: 4,
            sessions_per_worker: 32,
            stagger_min_ms: 0,
            stagger_max_ms: 2_000,
            default_lookback_secs: 7 * 24 * 3600,
            result_cap: 500,
            min_window_secs: 1,
            batch_size: 200,
            min_request_interval_ms: 250,
            peer_budget_ms: 3 * 60 * 1000,
            direct: TransportTimeouts::default(),
            proxied: TransportTimeouts {
                connect_ms: 30_000,
                query_ms: 45_000,
            },
            proxy_addr: None,
            shutdown_grace_ms: 10_000,
            query_retry: RetryPolicy::default(),
            sink_retry: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 200,
                max_delay_ms: 5_000,
                multiplier: 2.0,
            },
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file and validate
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> SyncResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> SyncResult<()> {
        let fail = |msg: &str| Err(SyncError::Config(msg.to_string()));
        if self.workers == 0 {
            return fail("workers must be at least 1");
        }
        if self.sessions_per_worker == 0 {
            return fail("sessions_per_worker must be at least 1");
        }
        if self.result_cap == 0 {
            return fail("result_cap must be at least 1");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1");
        }
        if self.min_window_secs == 0 {
            return fail("min_window_secs must be at least 1");
        }
        if self.stagger_min_ms > self.stagger_max_ms {
            return fail("stagger_min_ms exceeds stagger_max_ms");
        }
        if self.cycle_deadline_ms == 0 {
            return fail("cycle_deadline_ms must be positive");
        }
        if self.query_retry.max_attempts == 0 || self.sink_retry.max_attempts == 0 {
            return fail("retry max_attempts must be at least 1");
        }
        if let Some(addr) = &self.proxy_addr {
            if addr.parse::<std::net::SocketAddr>().is_err() && !addr.contains(':') {
                return fail("proxy_addr must be host:port");
            }
        }
        Ok(())
    }

    /// Check that every relay in a snapshot can be reached with this config
    pub fn validate_relays(&self, relays: &[Relay]) -> SyncResult<()> {
        if self.proxy_addr.is_none() {
            if let Some(r) = relays
                .iter()
                .find(|r| r.transport == TransportClass::Proxied)
            {
                return Err(SyncError::Config(format!(
                    "relay {} is proxied but no proxy_addr is configured",
                    r.id
                )));
            }
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn default_lookback(&self) -> Duration {
        Duration::from_secs(self.default_lookback_secs)
    }

    pub fn stagger_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.stagger_min_ms),
            Duration::from_millis(self.stagger_max_ms),
        )
    }

    pub fn timeouts_for(&self, class: TransportClass) -> TransportTimeouts {
        match class {
            TransportClass::Direct => self.direct,
            TransportClass::Proxied => self.proxied,
        }
    }

    /// Hard ceiling on simultaneously open relay connections
    pub fn connection_ceiling(&self) -> usize {
        self.workers * self.sessions_per_worker
    }

    /// Resolve the effective per-relay settings
    pub fn relay_settings(&self, relay: &Relay) -> RelaySettings {
        let class = self.timeouts_for(relay.transport);
        let o = &relay.overrides;
        RelaySettings {
            connect_timeout: class.connect(),
            query_timeout: o
                .request_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(class.query()),
            budget: Duration::from_millis(o.budget_ms.unwrap_or(self.peer_budget_ms)),
            result_cap: o.result_cap.unwrap_or(self.result_cap).max(1),
            min_interval: Duration::from_millis(
                o.min_interval_ms.unwrap_or(self.min_request_interval_ms),
            ),
            min_window_secs: self.min_window_secs.max(1),
            batch_size: self.batch_size.max(1),
            query_retry: self.query_retry,
            sink_retry: self.sink_retry,
        }
    }
}

/// Settings for one relay after applying its overrides
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub budget: Duration,
    pub result_cap: usize,
    pub min_interval: Duration,
    pub min_window_secs: u64,
    pub batch_size: usize,
    pub query_retry: RetryPolicy,
    pub sink_retry: RetryPolicy,
}
