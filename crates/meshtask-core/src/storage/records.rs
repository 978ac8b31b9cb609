//! Record Storage - CRUD operations for task records
//!
//! Stores records in redb as JSON with the record id as the key.

use crate::error::MeshError;
use crate::types::Record;
use redb::{ReadableTable, TableDefinition};
use tracing::warn;

use super::{RecordStore, Storage};

/// Table for storing records (key: record id, value: JSON-encoded Record)
pub(crate) const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

fn encode(record: &Record) -> Result<Vec<u8>, MeshError> {
    serde_json::to_vec(record).map_err(|e| MeshError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Record, MeshError> {
    serde_json::from_slice(bytes).map_err(|e| MeshError::Serialization(e.to_string()))
}

impl RecordStore for Storage {
    fn list(&self) -> Result<Vec<Record>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match decode(value.value()) {
                Ok(record) => records.push(record),
                Err(e) => warn!(id = key.value(), error = %e, "Skipping undecodable record"),
            }
        }
        Ok(records)
    }

    fn get(&self, id: &str) -> Result<Record, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        match table.get(id)? {
            Some(v) => decode(v.value()),
            None => Err(MeshError::NotFound(id.to_string())),
        }
    }

    fn contains(&self, id: &str) -> Result<bool, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        Ok(table.get(id)?.is_some())
    }

    fn put(&self, record: &Record) -> Result<(), MeshError> {
        self.put_many(std::slice::from_ref(record))
    }

    fn put_many(&self, records: &[Record]) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            for record in records {
                let data = encode(record)?;
                table.insert(record.id.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS_TABLE)?;
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                keys.push(key.value().to_string());
            }
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
