//! Harvesting cycles
//!
//! ## Overview
//!
//! A cycle snapshots the relay directory, gives every relay a range that
//! starts at its watermark and ends at the cycle start, and drains those
//! ranges concurrently. Sessions are sharded over a fixed number of workers;
//! inside a worker a semaphore bounds how many relays are talked to at once.
//!
//! ```text
//! SyncCoordinator ──plan──▶ SessionJob × relays
//!        │
//!        ├── Distributor ──▶ worker 0 ── SessionPool ── PeerSession …
//!        │                 ▶ worker 1 ── SessionPool ── PeerSession …
//!        │
//!        ◀── SessionReport (mpsc) ── drained? ──▶ WatermarkStore::set
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let coordinator = SyncCoordinator::new(config, directory, watermarks, sinks, connector)?;
//! let report = coordinator.run_cycle().await?;
//! println!("{} of {} relays drained", report.drained(), report.sessions.len());
//! ```

pub mod coordinator;
pub mod distributor;
pub mod events;
pub mod pool;
pub mod session;

pub use coordinator::{CycleReport, SyncCoordinator};
pub use distributor::Distributor;
pub use events::{CycleState, SyncEvent};
pub use pool::{PoolSummary, SessionPool};
pub use session::{
    AbandonReason, PeerSession, SessionControl, SessionJob, SessionOutcome, SessionReport,
    SessionStats,
};
