//! Routing table from receive-key fingerprints to partners.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use sigil_core::CypherHandler;
use sigil_crypto::Fingerprint;
use sigil_proto::PartnerId;

/// Every unused receive fingerprint of every channel, and who owns it.
///
/// Channels keep it current through [`CypherHandler`]. The manager looks up
/// inbound channel messages here before touching any channel.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<Fingerprint, PartnerId>>,
}

impl KeyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Partner whose channel can decrypt under `fingerprint`.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<PartnerId> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).get(fingerprint).copied()
    }

    /// Number of registered fingerprints.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no fingerprint is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fingerprints registered for `partner`.
    pub fn count_for(&self, partner: &PartnerId) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|owner| *owner == partner)
            .count()
    }
}

impl CypherHandler for KeyRegistry {
    fn add_key(&self, fingerprint: Fingerprint, partner: PartnerId) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).insert(fingerprint, partner);
    }

    fn delete_key(&self, fingerprint: Fingerprint) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).remove(&fingerprint);
    }
}
