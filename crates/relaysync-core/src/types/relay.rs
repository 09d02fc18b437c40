//! Relay descriptors
//!
//! A relay record is owned by whatever discovers relays; the engine only
//! reads it. Overrides let an operator tune a single misbehaving relay
//! without touching the global configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Relay identity: the network address the engine dials
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelayId(pub String);

impl RelayId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RelayId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How a relay is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TransportClass {
    /// Plain TCP to the relay address
    #[default]
    Direct,
    /// Tunnelled through the configured SOCKS5 proxy
    Proxied,
}

impl std::fmt::Display for TransportClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportClass::Direct => write!(f, "direct"),
            TransportClass::Proxied => write!(f, "proxied"),
        }
    }
}

/// Per-relay knobs that win over the global configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayOverrides {
    /// Per-query timeout in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// Total time a session may spend on this relay per cycle, in milliseconds
    pub budget_ms: Option<u64>,
    /// Largest result set the relay returns for one query
    pub result_cap: Option<usize>,
    /// Minimum gap between two queries to this relay, in milliseconds
    pub min_interval_ms: Option<u64>,
    /// Disabled relays are skipped by the directory
    pub enabled: bool,
}

impl Default for RelayOverrides {
    fn default() -> Self {
        Self {
            request_timeout_ms: None,
            budget_ms: None,
            result_cap: None,
            min_interval_ms: None,
            enabled: true,
        }
    }
}

/// A relay the engine harvests from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub id: RelayId,
    pub transport: TransportClass,
    pub overrides: RelayOverrides,
}

impl Relay {
    /// Create a direct relay with no overrides
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            id: RelayId::new(addr),
            transport: TransportClass::Direct,
            overrides: RelayOverrides::default(),
        }
    }

    pub fn with_transport(mut self, transport: TransportClass) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_result_cap(mut self, cap: usize) -> Self {
        self.overrides.result_cap = Some(cap);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.overrides.budget_ms = Some(budget.as_millis() as u64);
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.overrides.min_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.overrides.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.overrides.enabled
    }
}
