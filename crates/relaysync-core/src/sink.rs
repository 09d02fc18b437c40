//! Capabilities the engine needs from its surroundings
//!
//! The engine never picks a concrete store. It is handed a directory of
//! relays, a watermark store and a factory that gives each worker its own
//! event sink handle.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{SinkError, SyncResult};
use crate::types::{EventBatch, Relay, RelayId, Timestamp};

/// Destination for harvested events
///
/// Implementations must be idempotent: delivering an event that is already
/// stored is a no-op, not an error. The engine relies on this to re-query
/// window boundaries and to retry whole cycles.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Store a batch, returning how many events were new
    async fn insert_batch(&self, batch: &EventBatch) -> Result<usize, SinkError>;

    /// Release resources once every session using this handle has stopped
    async fn close(&self) {}
}

/// Per-relay confirmed-coverage timestamps
pub trait WatermarkStore: Send + Sync {
    fn get(&self, relay: &RelayId) -> SyncResult<Option<Timestamp>>;

    /// Record coverage up to `until`; a lower value than the stored one is
    /// ignored
    fn set(&self, relay: &RelayId, until: Timestamp) -> SyncResult<()>;

    fn list(&self) -> SyncResult<Vec<(RelayId, Timestamp)>>;
}

/// Read-only snapshot source of relays to harvest
pub trait RelayDirectory: Send + Sync {
    fn list_eligible(&self) -> SyncResult<Vec<Relay>>;
}

/// Hands each worker its own sink handle
pub trait SinkFactory: Send + Sync {
    fn open(&self, worker: usize) -> SyncResult<Arc<dyn EventSink>>;
}

/// Factory that shares one sink between all workers
pub struct SharedSink(pub Arc<dyn EventSink>);

impl SinkFactory for SharedSink {
    fn open(&self, _worker: usize) -> SyncResult<Arc<dyn EventSink>> {
        Ok(self.0.clone())
    }
}
