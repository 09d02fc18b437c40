//! Event storage
//!
//! Events are keyed by their id, so inserting an event twice leaves the
//! first copy in place. A second table remembers every relay an event was
//! seen on, which is how duplicate deliveries from overlapping windows and
//! from different relays stay harmless.

use std::sync::Arc;

use async_trait::async_trait;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use super::Storage;
use crate::error::{SinkError, SyncError};
use crate::sink::{EventSink, SinkFactory};
use crate::types::{EventBatch, StoredEvent};

/// Table for events (key: event id hex, value: postcard StoredEvent)
pub(crate) const EVENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Table of (event id, relay) sightings (value: observed_at seconds)
pub(crate) const EVENT_SOURCES_TABLE: TableDefinition<(&str, &str), u64> =
    TableDefinition::new("event_sources");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Event Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a batch in one transaction, returning how many events were new
    pub fn insert_events(&self, batch: &EventBatch) -> Result<usize, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut inserted = 0;
        {
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let mut sources = write_txn.open_table(EVENT_SOURCES_TABLE)?;
            let relay = batch.relay.as_str();
            let observed_at = batch.observed_at.as_secs();

            for event in &batch.events {
                let id = event.id.as_str();
                if events.get(id)?.is_none() {
                    let stored = StoredEvent {
                        event: event.clone(),
                        first_relay: relay.to_string(),
                        observed_at,
                    };
                    let bytes = postcard::to_allocvec(&stored)
                        .map_err(|e| SyncError::Serialization(e.to_string()))?;
                    events.insert(id, bytes.as_slice())?;
                    inserted += 1;
                }
                if sources.get((id, relay))?.is_none() {
                    sources.insert((id, relay), observed_at)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Load a stored event by id
    pub fn load_event(&self, id: &str) -> Result<Option<StoredEvent>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(EVENTS_TABLE)?;

        match table.get(id)? {
            Some(v) => {
                let stored: StoredEvent = postcard::from_bytes(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(stored))
            }
            None => Ok(None),
        }
    }

    /// Relays an event has been seen on
    pub fn event_sources(&self, id: &str) -> Result<Vec<String>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(EVENT_SOURCES_TABLE)?;

        let mut relays = Vec::new();
        for entry in table.range((id, "")..)? {
            let (key, _) = entry?;
            let (event_id, relay) = key.value();
            if event_id != id {
                break;
            }
            relays.push(relay.to_string());
        }
        Ok(relays)
    }

    pub fn count_events(&self) -> Result<u64, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(EVENTS_TABLE)?;
        Ok(table.len()?)
    }
}

#[async_trait]
impl EventSink for Storage {
    async fn insert_batch(&self, batch: &EventBatch) -> Result<usize, SinkError> {
        let storage = self.clone();
        let batch = batch.clone();
        tokio::task::spawn_blocking(move || storage.insert_events(&batch))
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?
            .map_err(SinkError::from)
    }
}

impl SinkFactory for Storage {
    fn open(&self, _worker: usize) -> Result<Arc<dyn EventSink>, SyncError> {
        Ok(Arc::new(self.clone()))
    }
}
