//! Node metadata - the persisted local peer identifier

use crate::error::MeshError;
use crate::types::PeerId;
use redb::{ReadableTable, TableDefinition};

use super::Storage;

/// Table for small node-level values (key: name, value: UTF-8 bytes)
pub(crate) const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

impl Storage {
    /// Peer id storage key (there's only one identity per node)
    const PEER_ID_KEY: &'static str = "peer_id";

    /// Save the node's peer identifier.
    pub fn save_peer_id(&self, peer_id: &PeerId) -> Result<(), MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(META_TABLE)?;
            table.insert(Self::PEER_ID_KEY, peer_id.as_str().as_bytes())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the node's peer identifier.
    ///
    /// Returns `None` if none has been saved yet.
    pub fn load_peer_id(&self) -> Result<Option<PeerId>, MeshError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(META_TABLE)?;

        match table.get(Self::PEER_ID_KEY)? {
            Some(v) => {
                let id = String::from_utf8(v.value().to_vec())
                    .map_err(|e| MeshError::Serialization(e.to_string()))?;
                Ok(Some(PeerId::new(id)))
            }
            None => Ok(None),
        }
    }

    /// Load the saved peer id, or generate and save a new one.
    pub fn load_or_create_peer_id(&self) -> Result<PeerId, MeshError> {
        if let Some(id) = self.load_peer_id()? {
            return Ok(id);
        }
        let id = PeerId::generate();
        self.save_peer_id(&id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_peer_id_is_stable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta.redb");

        let first = {
            let storage = Storage::new(&path).unwrap();
            assert!(storage.load_peer_id().unwrap().is_none());
            storage.load_or_create_peer_id().unwrap()
        };

        let storage = Storage::new(&path).unwrap();
        assert_eq!(storage.load_or_create_peer_id().unwrap(), first);
    }
}
