//! Relationship fingerprints and ownership proofs.
//!
//! The relationship fingerprint salts every ratchet between two identities.
//! Ownership proofs tie a request to long-lived ("historical") key material
//! so a confirm can only be produced by the holder of the matching private
//! key, independently of the per-exchange ephemeral keys.

use subtle::ConstantTimeEq;

use crate::{
    hash::{HASH_LEN, blake2b_256},
    nike::Nike,
    scheduler::Fingerprint,
};

const OWNERSHIP_PROOF_SALT: &[u8] = b"authStoreOwnershipProofSalt";
const OWNERSHIP_FINGERPRINT_SALT: &[u8] = b"authStoreOwnershipProofFingerprintSalt";
const REQUEST_FINGERPRINT_SALT: &[u8] = b"authRequestFingerprintSalt";

/// Ownership proof width in bytes.
pub const OWNERSHIP_PROOF_LEN: usize = HASH_LEN;

/// Salt binding a ratchet to the ordered (sender, receiver) pair.
///
/// Public keys are hashed larger first, so both parties agree regardless of
/// who computes it. Identities are hashed in sender, receiver order, so the
/// two directions of one relationship get different salts.
pub fn make_relationship_fingerprint(
    sender_public: &[u8],
    receiver_public: &[u8],
    sender_id: &[u8],
    receiver_id: &[u8],
) -> [u8; HASH_LEN] {
    if sender_public == receiver_public {
        tracing::warn!("relationship fingerprint over identical public keys");
    }
    let (larger, smaller) = if sender_public >= receiver_public {
        (sender_public, receiver_public)
    } else {
        (receiver_public, sender_public)
    };
    blake2b_256(&[larger, smaller, sender_id, receiver_id])
}

/// MAC over the historical DH secret.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OwnershipProof([u8; OWNERSHIP_PROOF_LEN]);

impl OwnershipProof {
    /// Wrap raw proof bytes.
    pub const fn new(bytes: [u8; OWNERSHIP_PROOF_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; OWNERSHIP_PROOF_LEN] {
        &self.0
    }

    /// Fingerprint under which the confirm for this proof is routed.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_digest(blake2b_256(&[&self.0, OWNERSHIP_FINGERPRINT_SALT]))
    }
}

impl std::fmt::Debug for OwnershipProof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnershipProof({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Proof that we hold `my_private` and know `partner_public`.
pub fn make_ownership_proof<N: Nike>(
    my_private: &N::PrivateKey,
    partner_public: &N::PublicKey,
) -> OwnershipProof {
    let secret = N::derive_secret(my_private, partner_public);
    OwnershipProof(blake2b_256(&[&secret[..], OWNERSHIP_PROOF_SALT]))
}

/// Fingerprint routing the confirm for `proof`.
pub fn make_ownership_proof_fp(proof: &OwnershipProof) -> Fingerprint {
    proof.fingerprint()
}

/// Check a received proof against the one we would compute, in constant time.
pub fn verify_ownership_proof<N: Nike>(
    my_private: &N::PrivateKey,
    partner_public: &N::PublicKey,
    received: &OwnershipProof,
) -> bool {
    let expected = make_ownership_proof::<N>(my_private, partner_public);
    expected.0.ct_eq(&received.0).into()
}

/// Fingerprint under which requests addressed to `historical_public` arrive.
pub fn request_fingerprint(historical_public: &[u8]) -> Fingerprint {
    Fingerprint::from_digest(blake2b_256(&[historical_public, REQUEST_FINGERPRINT_SALT]))
}
