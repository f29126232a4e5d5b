//! Long-lived identities and what peers know about them.

use std::fmt;

use rand::{CryptoRng, RngCore};
use sigil_crypto::{
    CryptoError, FfDh, Fingerprint, Nike, NikePublicKey, OwnershipProof,
    nike::{FfDhPrivateKey, FfDhPublicKey},
    request_fingerprint,
};
use sigil_proto::PartnerId;

/// Our identity: a partner id and the historical classical key pair that
/// requests are addressed to.
#[derive(Clone)]
pub struct Identity {
    id: PartnerId,
    private: FfDhPrivateKey,
    public: FfDhPublicKey,
}

impl Identity {
    /// Fresh identity with a random historical key pair.
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(id: PartnerId, rng: &mut R) -> Self {
        let (private, public) = FfDh::new_keypair(rng);
        Self { id, private, public }
    }

    /// Restore an identity from its encoded historical private key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::InvalidKey` if `private` does not decode
    pub fn from_private_bytes(id: PartnerId, private: &[u8]) -> Result<Self, CryptoError> {
        let private = FfDh::private_key_from_bytes(private)?;
        let public = FfDh::derive_public_key(&private);
        Ok(Self { id, private, public })
    }

    /// Partner id.
    pub fn id(&self) -> PartnerId {
        self.id
    }

    /// Historical public key.
    pub fn public_key(&self) -> &FfDhPublicKey {
        &self.public
    }

    pub(crate) fn private_key(&self) -> &FfDhPrivateKey {
        &self.private
    }

    /// Fingerprint requests for this identity arrive under.
    pub fn request_fingerprint(&self) -> Fingerprint {
        request_fingerprint(&self.public.to_bytes())
    }

    /// What a peer needs to send us a request.
    pub fn contact(&self) -> Contact {
        Contact::new(self.id, self.public.clone())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A partner as seen by us.
///
/// For outbound requests `dh_public` is the partner's historical key. In
/// request callbacks it is the ephemeral key the partner's request was sent
/// with, and `ownership_proof` carries the proof from that request.
#[derive(Debug, Clone)]
pub struct Contact {
    /// Partner id
    pub id: PartnerId,
    /// Partner's classical public key
    pub dh_public: FfDhPublicKey,
    /// Proof the partner attached to its last request or confirm
    pub ownership_proof: Option<OwnershipProof>,
    /// Facts the partner disclosed
    pub facts: Vec<String>,
}

impl Contact {
    /// Contact with no proof and no facts.
    pub fn new(id: PartnerId, dh_public: FfDhPublicKey) -> Self {
        Self { id, dh_public, ownership_proof: None, facts: Vec::new() }
    }

    /// Same contact with `facts` attached.
    #[must_use]
    pub fn with_facts(mut self, facts: Vec<String>) -> Self {
        self.facts = facts;
        self
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use sigil_crypto::NikePrivateKey;

    use super::*;

    #[test]
    fn identity_restores_from_private_bytes() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let id = PartnerId::new([1; PartnerId::LEN]);
        let identity = Identity::generate(id, &mut rng);

        let restored =
            Identity::from_private_bytes(id, &identity.private_key().to_bytes()).unwrap();
        assert!(restored.public_key().ct_eq(identity.public_key()));
        assert_eq!(restored.request_fingerprint(), identity.request_fingerprint());
    }

    #[test]
    fn contact_carries_historical_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let identity = Identity::generate(PartnerId::new([2; PartnerId::LEN]), &mut rng);
        let contact = identity.contact().with_facts(vec!["email:a@b".to_string()]);

        assert_eq!(contact.id, identity.id());
        assert!(contact.dh_public.ct_eq(identity.public_key()));
        assert!(contact.ownership_proof.is_none());
        assert_eq!(contact.facts, ["email:a@b"]);
    }

    #[test]
    fn debug_hides_private_key() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let identity = Identity::generate(PartnerId::new([3; PartnerId::LEN]), &mut rng);
        let rendered = format!("{identity:?}");
        assert!(rendered.starts_with("Identity"));
        assert!(!rendered.contains("private"));
    }
}
