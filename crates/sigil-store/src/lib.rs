//! Sigil Persistence
//!
//! - [`storage`]: the versioned key-value contract ([`Storage`]) with an
//!   in-memory backend, a fault-injecting wrapper for chaos tests and a
//!   durable `redb` backend
//! - [`auth`]: the [`AuthStore`], which makes channel negotiation replay-safe
//!   and crash-recoverable

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth;
pub mod storage;

pub use auth::{
    AuthStore, AuthStoreError, Confirmation, NegotiationFingerprint, ReceivedRequest, RequestKind,
    SentRequest, negotiation_fingerprint,
};
pub use storage::{
    ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError, VersionedObject,
    decode_cbor, encode_cbor,
};
