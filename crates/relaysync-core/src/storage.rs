//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Harvested events (idempotent on event id)
//! - Which relays each event was seen on
//! - Per-relay watermarks (monotonic)
//! - The relay directory

use crate::error::SyncError;
use parking_lot::RwLock;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

// Submodules
mod events;
mod relays;
mod watermarks;

use events::{EVENTS_TABLE, EVENT_SOURCES_TABLE};
use relays::RELAYS_TABLE;
use watermarks::WATERMARKS_TABLE;

/// Storage layer using redb for ACID-compliant persistence
///
/// Cloning is cheap; clones share the same database handle.
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EVENTS_TABLE)?;
            let _ = write_txn.open_table(EVENT_SOURCES_TABLE)?;
            let _ = write_txn.open_table(WATERMARKS_TABLE)?;
            let _ = write_txn.open_table(RELAYS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Get a reference to the shared database handle
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}
