//! Time windows submitted as single bounded queries

use serde::{Deserialize, Serialize};

use super::Timestamp;

/// A time range queried in one request
///
/// Both bounds are inclusive, matching how relays interpret `since` and
/// `until` filters. A window with `since == until` covers exactly one second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub since: Timestamp,
    pub until: Timestamp,
}

impl Window {
    pub fn new(since: impl Into<Timestamp>, until: impl Into<Timestamp>) -> Self {
        Self {
            since: since.into(),
            until: until.into(),
        }
    }

    /// Seconds between the bounds (zero for a single-second window)
    pub fn width(&self) -> u64 {
        self.until.0.saturating_sub(self.since.0)
    }

    /// An inverted window covers nothing
    pub fn is_empty(&self) -> bool {
        self.since > self.until
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.since <= ts && ts <= self.until
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.since.0, self.until.0)
    }
}
