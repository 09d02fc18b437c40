//! Core types for the relay synchronization engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

pub mod event;
pub mod relay;
pub mod window;

pub use event::{Event, EventBatch, StoredEvent};
pub use relay::{Relay, RelayId, RelayOverrides, TransportClass};
pub use window::Window;

/// Point in time at one-second resolution (unix seconds)
///
/// Relays timestamp items in whole seconds, so every window boundary and
/// watermark lives on this grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp().max(0) as u64)
    }

    /// Raw unix seconds
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Step back by a duration, clamping at the epoch
    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_secs()))
    }

    /// Step back by whole seconds, clamping at the epoch
    pub fn saturating_sub_secs(self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Self(secs)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match chrono::DateTime::from_timestamp(self.0 as i64, 0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}s", self.0),
        }
    }
}

/// Identifier for one synchronization cycle
///
/// ULIDs sort by creation time, so cycle ids in logs read chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleId(pub Ulid);

impl CycleId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CycleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cycle_{}", self.0)
    }
}
