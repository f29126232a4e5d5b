//! Sigil Cryptographic Primitives
//!
//! Key material for pairwise end-to-end channels. A channel between two
//! identities is a set of ratchets, each of which is a fixed budget of
//! single-use symmetric keys derived from one NIKE shared secret.
//!
//! # Key Lifecycle
//!
//! ```text
//! NIKE(my private, partner public)
//!        │
//!        ▼
//! Shared Secret ──► RatchetId = H(secret)
//!        │
//!        ▼
//! KeyScheduler(secret, relationship salt, size)
//!        │
//!        ├──► key(i)          (first half of secret)
//!        └──► fingerprint(i)  (second half of secret)
//!        │
//!        ▼
//! XChaCha20 + HMAC-SHA256 → MAC || ciphertext
//! ```
//!
//! Each key index is consumed at most once, tracked by a [`StateVector`].
//! When a ratchet runs low, the sender draws a fresh ephemeral key pair
//! ([`SendRatchet::next`]) and the receiver rederives against it
//! ([`ReceiveRatchet::next`]).
//!
//! # Security
//!
//! Hybrid key exchange:
//! - [`DefaultNike`] concatenates classical finite-field DH with CSIDH-512
//! - The combined secret is unpredictable unless both schemes are broken
//!
//! Key separation:
//! - Keys and fingerprints hash disjoint halves of the secret
//! - The relationship fingerprint salts each direction differently
//!
//! Authenticity:
//! - MAC verified before any plaintext is produced
//! - Failed verification consumes no key

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod auth_crypto;
pub mod error;
pub mod hash;
pub mod nike;
pub mod ratchet;
pub mod relationship;
pub mod scheduler;
pub mod state_vector;

pub use auth_crypto::{auth_decrypt, auth_encrypt};
pub use error::CryptoError;
pub use hash::{HASH_LEN, blake2b_256};
pub use nike::{
    Csidh512, DefaultNike, FfDh, Hybrid, HybridPrivateKey, HybridPublicKey, Nike, NikePrivateKey,
    NikePublicKey,
};
pub use ratchet::{RatchetId, ReceiveRatchet, SendRatchet};
pub use relationship::{
    OWNERSHIP_PROOF_LEN, OwnershipProof, make_ownership_proof, make_ownership_proof_fp,
    make_relationship_fingerprint, request_fingerprint, verify_ownership_proof,
};
pub use scheduler::{
    EncryptedMessage, FINGERPRINT_LEN, Fingerprint, KeyResidue, KeyScheduler, MAC_LEN,
};
pub use state_vector::StateVector;
