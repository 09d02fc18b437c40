//! Relay directory storage

use redb::{ReadableTable, TableDefinition};

use super::Storage;
use crate::error::SyncError;
use crate::sink::RelayDirectory;
use crate::types::{Relay, RelayId};

/// Table for relays (key: relay address, value: postcard Relay)
pub(crate) const RELAYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("relays");

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Relay Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save a relay, overwriting any existing record for the same address
    pub fn save_relay(&self, relay: &Relay) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(RELAYS_TABLE)?;
            let data = postcard::to_allocvec(relay)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(relay.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_relay(&self, id: &RelayId) -> Result<Option<Relay>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RELAYS_TABLE)?;

        match table.get(id.as_str())? {
            Some(v) => {
                let relay: Relay = postcard::from_bytes(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(relay))
            }
            None => Ok(None),
        }
    }

    /// All relays, enabled or not
    pub fn list_relays(&self) -> Result<Vec<Relay>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(RELAYS_TABLE)?;

        let mut relays = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let relay: Relay = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            relays.push(relay);
        }
        Ok(relays)
    }

    /// Flip a relay's enabled flag
    pub fn set_relay_enabled(&self, id: &RelayId, enabled: bool) -> Result<(), SyncError> {
        let mut relay = self
            .load_relay(id)?
            .ok_or_else(|| SyncError::RelayNotFound(id.to_string()))?;
        relay.overrides.enabled = enabled;
        self.save_relay(&relay)
    }
}

impl RelayDirectory for Storage {
    fn list_eligible(&self) -> Result<Vec<Relay>, SyncError> {
        let relays = self
            .list_relays()
            .map_err(|e| SyncError::Directory(e.to_string()))?;
        Ok(relays.into_iter().filter(Relay::is_enabled).collect())
    }
}
