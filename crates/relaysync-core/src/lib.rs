//! Relay Synchronization Engine Core Library
//!
//! Complete, crash-safe harvesting of time-ordered events from many relays
//! that cap every reply.
//!
//! ## Overview
//!
//! A relay answers a query for a time range with at most `cap` events,
//! newest first. A reply that hits the cap says nothing about what lies
//! below the oldest event it carried. The engine walks each relay's range
//! with a stack of windows, narrowing any window whose reply was full, until
//! every window has been answered with fewer than `cap` events. Only then
//! does the relay's watermark move forward.
//!
//! ## Core Principles
//!
//! - **Complete**: an event inside a drained range was delivered to the sink
//! - **Crash-safe**: watermarks move only after the sink accepted everything
//! - **Polite**: every relay sees at most one query per minimum interval
//! - **Bounded**: open connections never exceed workers × sessions per worker
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relaysync_core::{Storage, SyncConfig, SyncCoordinator, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new("~/.relaysync/relaysync.redb")?;
//!     let config = SyncConfig::default();
//!     let connector = TcpConnector::new(config.proxy_addr.clone());
//!
//!     let store = Arc::new(storage);
//!     let coordinator = SyncCoordinator::new(
//!         config,
//!         store.clone(),
//!         store.clone(),
//!         store,
//!         Arc::new(connector),
//!     )?;
//!
//!     let report = coordinator.run_cycle().await?;
//!     println!("{}: {} relays drained", report.state, report.drained());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod rate_limit;
pub mod retry;
pub mod sink;
pub mod splitter;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{RelaySettings, SyncConfig, TransportTimeouts};
pub use error::{ItemError, SinkError, SyncError, SyncResult, TransportError};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use sink::{EventSink, RelayDirectory, SharedSink, SinkFactory, WatermarkStore};
pub use splitter::{Resolution, WindowSplitter, WindowStack};
pub use storage::Storage;
pub use sync::{
    AbandonReason, CycleReport, CycleState, PeerSession, SessionOutcome, SessionReport,
    SessionStats, SyncCoordinator, SyncEvent,
};
pub use transport::tcp::TcpConnector;
pub use transport::{QueryResponse, RelayConnection, RelayConnector, WindowQuery};
pub use types::*;
