//! Redb-backed durable storage.
//!
//! One table of CBOR-encoded [`VersionedObject`]s keyed by string. Every call
//! runs in its own ACID transaction.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError, VersionedObject, decode_cbor, encode_cbor};

/// Table: objects
/// Key: storage key
/// Value: CBOR-encoded VersionedObject
const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(OBJECTS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(OBJECTS).map_err(io)?;

        let mut keys = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

impl Storage for RedbStorage {
    fn get(&self, key: &str) -> Result<Option<VersionedObject>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(OBJECTS).map_err(io)?;

        match table.get(key).map_err(io)? {
            Some(value) => Ok(Some(decode_cbor(value.value())?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), StorageError> {
        let bytes = encode_cbor(object)?;

        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(OBJECTS).map_err(io)?;
            table.insert(key, bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(OBJECTS).map_err(io)?;
            table.remove(key).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }
}
