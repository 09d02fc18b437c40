//! Watermark storage
//!
//! A watermark only ever moves forward. `set` with an older timestamp is
//! accepted and ignored, so a late or replayed commit can never undo
//! confirmed coverage.

use redb::{ReadableTable, TableDefinition};

use super::Storage;
use crate::error::SyncError;
use crate::sink::WatermarkStore;
use crate::types::{RelayId, Timestamp};

/// Table for watermarks (key: relay address, value: confirmed_until seconds)
pub(crate) const WATERMARKS_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("watermarks");

impl WatermarkStore for Storage {
    fn get(&self, relay: &RelayId) -> Result<Option<Timestamp>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(WATERMARKS_TABLE)?;
        Ok(table.get(relay.as_str())?.map(|v| Timestamp(v.value())))
    }

    fn set(&self, relay: &RelayId, until: Timestamp) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(WATERMARKS_TABLE)?;
            let current = table.get(relay.as_str())?.map(|v| v.value());
            if current.map_or(true, |c| until.0 > c) {
                table.insert(relay.as_str(), until.0)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<(RelayId, Timestamp)>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(WATERMARKS_TABLE)?;

        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            out.push((RelayId::new(key.value()), Timestamp(value.value())));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("test.redb")).unwrap();
        (storage, temp)
    }

    #[test]
    fn test_unknown_relay_has_no_watermark() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.get(&RelayId::new("r:1")).unwrap(), None);
    }

    #[test]
    fn test_watermark_never_moves_backward() {
        let (storage, _temp) = create_test_storage();
        let relay = RelayId::new("r:1");

        storage.set(&relay, Timestamp(500)).unwrap();
        storage.set(&relay, Timestamp(300)).unwrap();
        assert_eq!(storage.get(&relay).unwrap(), Some(Timestamp(500)));

        storage.set(&relay, Timestamp(900)).unwrap();
        assert_eq!(storage.get(&relay).unwrap(), Some(Timestamp(900)));
    }

    #[test]
    fn test_watermarks_persist_across_instances() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("test.redb");
        {
            let storage = Storage::new(&path).unwrap();
            storage.set(&RelayId::new("r:1"), Timestamp(42)).unwrap();
        }
        let storage = Storage::new(&path).unwrap();
        assert_eq!(
            storage.list().unwrap(),
            vec![(RelayId::new("r:1"), Timestamp(42))]
        );
    }
}
