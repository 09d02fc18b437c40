//! Structured logging setup and JSONL log files.
//!
//! Console output goes through `tracing-subscriber`'s fmt layer. With a log
//! directory configured, every event is also appended to a per-instance,
//! per-day JSONL file that carries the enclosing span fields (`cycle`,
//! `worker`, `relay`).
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-19_relaysync.jsonl
//!     └── 2026-10-20_relaysync.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use relaysync_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("relaysync")
//!     .with_filter("relaysync_core=debug")
//!     .with_logs_dir(Some("./logs".into()))
//!     .init()?;
//! ```
//!
//! ### Querying logs with jq
//!
//! ```bash
//! # Every session that gave up on a relay
//! jq 'select(.msg == "Session finished" and .fields.outcome != "drained")' logs/raw/*.jsonl
//!
//! # Saturated windows for one relay
//! jq 'select(.fields.relay == "relay.example:7447" and .level == "warn")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_all_entries, InstanceLogWriter};
