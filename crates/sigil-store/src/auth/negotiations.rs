//! Per-partner history of negotiation fingerprints.
//!
//! A request is retried by the transport until delivered, so the same
//! negotiation can arrive several times. Each partner's fingerprints are kept
//! oldest first; positions are reported newest first, so the latest
//! negotiation is always at position 0.

use std::collections::BTreeSet;

use sigil_crypto::blake2b_256;
use sigil_proto::PartnerId;

use super::{AuthStore, AuthStoreError, NegotiationFingerprint, Result, StoreState, partner_key};
use crate::storage::Storage;

const PARTNERS_KEY: &str = "NegotiationPartners";
const PARTNERS_VERSION: u64 = 1;
const FINGERPRINTS_PREFIX: &str = "NegotiationFingerprints/";
const FINGERPRINTS_VERSION: u64 = 0;

/// Fingerprint of a negotiation offered with these public keys.
pub fn negotiation_fingerprint(dh_public: &[u8], pq_public: &[u8]) -> NegotiationFingerprint {
    blake2b_256(&[dh_public, pq_public])
}

pub(super) fn load_partners<S: Storage>(storage: &S) -> Result<BTreeSet<PartnerId>> {
    let partners: Option<Vec<PartnerId>> = storage.get_record(PARTNERS_KEY, PARTNERS_VERSION)?;
    Ok(partners.unwrap_or_default().into_iter().collect())
}

impl<S: Storage> AuthStore<S> {
    pub(super) fn save_partners(&self, state: &StoreState) -> Result<()> {
        let partners: Vec<PartnerId> = state.negotiated.iter().copied().collect();
        self.storage.set_record(PARTNERS_KEY, PARTNERS_VERSION, &partners)?;
        Ok(())
    }

    /// Record `fingerprint` as seen from `partner`.
    ///
    /// Returns `(is_new, position)`:
    /// - unseen partner: the fingerprint starts its history, `(true, 0)`
    /// - seen partner, unseen fingerprint: appended as latest, `(true, 0)`
    /// - seen fingerprint: nothing changes, `(false, age)` where the latest
    ///   fingerprint has age 0
    pub fn check_if_negotiation_is_new(
        &self,
        partner: &PartnerId,
        fingerprint: &NegotiationFingerprint,
    ) -> Result<(bool, usize)> {
        let mut state = self.state();
        let key = partner_key(FINGERPRINTS_PREFIX, partner);

        if !state.negotiated.contains(partner) {
            self.storage.set_record(&key, FINGERPRINTS_VERSION, &[*fingerprint])?;

            state.negotiated.insert(*partner);
            if let Err(err) = self.save_partners(&state) {
                state.negotiated.remove(partner);
                return Err(err);
            }
            return Ok((true, 0));
        }

        let mut history: Vec<NegotiationFingerprint> = self
            .storage
            .get_record(&key, FINGERPRINTS_VERSION)?
            .ok_or_else(|| AuthStoreError::Corrupt {
                key: key.clone(),
                reason: "negotiation partner without fingerprint history".to_string(),
            })?;

        if let Some(index) = history.iter().position(|known| known == fingerprint) {
            return Ok((false, history.len() - 1 - index));
        }

        history.push(*fingerprint);
        self.storage.set_record(&key, FINGERPRINTS_VERSION, &history)?;
        Ok((true, 0))
    }

    /// Fingerprints seen from `partner`, newest first.
    pub fn negotiation_history(&self, partner: &PartnerId) -> Result<Vec<NegotiationFingerprint>> {
        let _state = self.state();
        let key = partner_key(FINGERPRINTS_PREFIX, partner);
        let history: Option<Vec<NegotiationFingerprint>> =
            self.storage.get_record(&key, FINGERPRINTS_VERSION)?;
        Ok(history.unwrap_or_default().into_iter().rev().collect())
    }

    pub(super) fn delete_negotiation_history(&self, partner: &PartnerId) -> Result<()> {
        let mut state = self.state();
        if state.negotiated.remove(partner) {
            if let Err(err) = self.save_partners(&state) {
                state.negotiated.insert(*partner);
                return Err(err);
            }
        }
        self.storage.delete(&partner_key(FINGERPRINTS_PREFIX, partner))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::tests::partner, storage::MemoryStorage};

    fn store() -> AuthStore<MemoryStorage> {
        AuthStore::new(MemoryStorage::new()).unwrap()
    }

    #[test]
    fn duplicate_detection_sequence() {
        let store = store();
        let alice = partner(1);

        assert_eq!(store.check_if_negotiation_is_new(&alice, &[1; 32]).unwrap(), (true, 0));
        assert_eq!(store.check_if_negotiation_is_new(&alice, &[1; 32]).unwrap(), (false, 0));
        assert_eq!(store.check_if_negotiation_is_new(&alice, &[2; 32]).unwrap(), (true, 0));
        assert_eq!(store.check_if_negotiation_is_new(&alice, &[1; 32]).unwrap(), (false, 1));
        assert_eq!(store.check_if_negotiation_is_new(&alice, &[2; 32]).unwrap(), (false, 0));
    }

    #[test]
    fn partners_are_independent() {
        let store = store();
        store.check_if_negotiation_is_new(&partner(1), &[1; 32]).unwrap();
        assert_eq!(store.check_if_negotiation_is_new(&partner(2), &[1; 32]).unwrap(), (true, 0));
    }

    #[test]
    fn history_is_newest_first_and_survives_reload() {
        let storage = MemoryStorage::new();
        {
            let store = AuthStore::new(storage.clone()).unwrap();
            for byte in 1..=3 {
                store.check_if_negotiation_is_new(&partner(1), &[byte; 32]).unwrap();
            }
        }

        let store = AuthStore::open(storage).unwrap();
        assert_eq!(store.negotiation_history(&partner(1)).unwrap(), vec![[3; 32], [2; 32], [1; 32]]);
        assert_eq!(store.check_if_negotiation_is_new(&partner(1), &[3; 32]).unwrap(), (false, 0));
    }

    #[test]
    fn negotiation_fingerprint_binds_both_keys() {
        let fp = negotiation_fingerprint(b"dh", b"pq");
        assert_ne!(fp, negotiation_fingerprint(b"dh", b"pq2"));
        assert_ne!(fp, negotiation_fingerprint(b"dh2", b"pq"));
    }
}
