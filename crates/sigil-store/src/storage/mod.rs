//! Key-value persistence contract.
//!
//! Everything Sigil persists goes through [`Storage`]: a flat string keyspace
//! of [`VersionedObject`]s. The trait is synchronous and every call is atomic
//! for its key. Multi-key consistency is the caller's job (see the auth
//! store's write ordering).

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub use self::redb::RedbStorage;

/// Unit of persistence: a record body tagged with its schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedObject {
    /// Schema version of `data`.
    pub version: u64,
    /// Encoded record.
    pub data: Vec<u8>,
}

impl VersionedObject {
    /// Wrap an encoded record.
    pub fn new(version: u64, data: Vec<u8>) -> Self {
        Self { version, data }
    }
}

/// Versioned key-value store.
///
/// Must be Clone (shared between the auth store and every channel), Send +
/// Sync, and synchronous. Implementations share state through `Arc`, so
/// clones see the same data.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Object stored under `key`, or `None`.
    fn get(&self, key: &str) -> Result<Option<VersionedObject>, StorageError>;

    /// Store `object` under `key`, replacing any previous value.
    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Record body under `key`, checked against `version`.
    ///
    /// # Errors
    ///
    /// - `StorageError::VersionMismatch` if the stored version differs
    fn get_versioned(&self, key: &str, version: u64) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(object) = self.get(key)? else {
            return Ok(None);
        };
        if object.version != version {
            return Err(StorageError::VersionMismatch {
                key: key.to_string(),
                expected: version,
                found: object.version,
            });
        }
        Ok(Some(object.data))
    }

    /// CBOR-encode `record` and store it under `key` at `version`.
    fn set_record<T: Serialize>(
        &self,
        key: &str,
        version: u64,
        record: &T,
    ) -> Result<(), StorageError> {
        self.set(key, &VersionedObject::new(version, encode_cbor(record)?))
    }

    /// Load and CBOR-decode the record under `key`.
    fn get_record<T: DeserializeOwned>(
        &self,
        key: &str,
        version: u64,
    ) -> Result<Option<T>, StorageError> {
        self.get_versioned(key, version)?.map(|data| decode_cbor(&data)).transpose()
    }
}

/// CBOR-encode a record.
pub fn encode_cbor<T: Serialize>(record: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decode a CBOR record.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
