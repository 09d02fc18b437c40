//! Cycle state and the events broadcast while cycles run
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  CycleState                                                    │
//! │  IDLE ──▶ RUNNING ──▶ COMPLETED ──▶ IDLE                       │
//! │              │    └─▶ PARTIAL   ──▶ IDLE                       │
//! │              └──▶ STOPPING ──▶ STOPPED                         │
//! │                                                                │
//! │  SyncEvent                                                     │
//! │  ├── StateChanged / CycleStarted / CycleFinished / CycleFailed │
//! │  ├── SessionFinished: one relay done for this cycle            │
//! │  └── WatermarkCommitted: coverage advanced for a relay         │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::types::{CycleId, RelayId, Timestamp};

use super::session::SessionOutcome;

/// Coordinator state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    #[default]
    Idle,
    Running,
    /// Every session finished before the cycle deadline
    Completed,
    /// The deadline cut some sessions short
    Partial,
    /// Shutdown requested; waiting for sessions to stop
    Stopping,
    Stopped,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::Idle => "IDLE",
            CycleState::Running => "RUNNING",
            CycleState::Completed => "COMPLETED",
            CycleState::Partial => "PARTIAL",
            CycleState::Stopping => "STOPPING",
            CycleState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Events emitted by the coordinator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged {
        state: CycleState,
    },
    CycleStarted {
        cycle: CycleId,
        relays: usize,
    },
    SessionFinished {
        cycle: CycleId,
        relay: RelayId,
        outcome: SessionOutcome,
    },
    WatermarkCommitted {
        relay: RelayId,
        until: Timestamp,
    },
    CycleFinished {
        cycle: CycleId,
        state: CycleState,
    },
    /// A cycle could not start (unreadable directory, bad configuration)
    CycleFailed {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(CycleState::Idle.to_string(), "IDLE");
        assert_eq!(CycleState::Partial.to_string(), "PARTIAL");
        assert_eq!(CycleState::default(), CycleState::Idle);
    }
}
