//! Persistent record storage using redb.
//!
//! The sync core only relies on the [`RecordStore`] contract: a key-value
//! namespace keyed by record id whose values are full [`Record`]s. The store
//! never merges; it overwrites. Tombstones are ordinary records with
//! `deleted = true` and stay in place until [`RecordStore::clear`] runs.
//!
//! This module provides:
//! - [`Storage`]: redb-backed store used by the CLI peer
//! - [`MemoryStore`]: in-process store for tests and ephemeral peers

use crate::error::MeshError;
use crate::types::Record;
use parking_lot::RwLock;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

// Submodules
mod memory;
mod meta;
mod records;

use meta::META_TABLE;
use records::RECORDS_TABLE;

pub use memory::MemoryStore;

/// CRUD contract the sync core needs from a persistent store
pub trait RecordStore: Send + 'static {
    /// All stored records, tombstones included. Order is unspecified.
    fn list(&self) -> Result<Vec<Record>, MeshError>;

    /// Fetch one record, failing with [`MeshError::NotFound`] when absent
    fn get(&self, id: &str) -> Result<Record, MeshError>;

    /// Whether a record with this id exists
    fn contains(&self, id: &str) -> Result<bool, MeshError>;

    /// Upsert, replacing any record with the same id
    fn put(&self, record: &Record) -> Result<(), MeshError>;

    /// Same as repeated [`RecordStore::put`], committed together
    fn put_many(&self, records: &[Record]) -> Result<(), MeshError>;

    /// Physically remove every record
    fn clear(&self) -> Result<(), MeshError>;
}

/// Storage layer using redb for ACID-compliant persistence
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
    pub fn new(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
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
