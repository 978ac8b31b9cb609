//! In-memory record store
//!
//! Cloning shares the underlying map, so a test can keep a handle to a store
//! it has handed to a node and inspect it afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::MeshError;
use crate::types::Record;

use super::RecordStore;

#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<String, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with existing records
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl RecordStore for MemoryStore {
    fn list(&self) -> Result<Vec<Record>, MeshError> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Record, MeshError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(id.to_string()))
    }

    fn contains(&self, id: &str) -> Result<bool, MeshError> {
        Ok(self.records.read().contains_key(id))
    }

    fn put(&self, record: &Record) -> Result<(), MeshError> {
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn put_many(&self, records: &[Record]) -> Result<(), MeshError> {
        let mut map = self.records.write();
        for record in records {
            map.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), MeshError> {
        self.records.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockToken;
    use crate::types::PeerId;

    #[test]
    fn test_clones_share_state() {
        let store = MemoryStore::new();
        let view = store.clone();
        let rec = Record::new_task("x", &PeerId::new("p"), ClockToken::new(1, "p"));
        store.put(&rec).unwrap();
        assert_eq!(view.get(&rec.id).unwrap(), rec);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.get("x"), Err(MeshError::NotFound(_))));
    }
}
