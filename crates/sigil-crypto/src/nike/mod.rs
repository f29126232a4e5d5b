//! Non-interactive key exchange.
//!
//! A [`Nike`] scheme derives the same shared secret from `(a_priv, b_pub)` and
//! `(b_priv, a_pub)` without any message exchange beyond the public keys. Two
//! concrete schemes are provided:
//!
//! - [`FfDh`]: classical Diffie-Hellman over the RFC 3526 2048-bit MODP group
//! - [`Csidh512`]: post-quantum commutative isogeny key exchange
//!
//! [`Hybrid`] composes any two schemes so the secret stays unpredictable
//! unless both are broken. [`DefaultNike`] is the composition used on the
//! wire.
//!
//! Schemes are types, not values: every operation is an associated function,
//! so a ratchet is generic over its scheme with no runtime dispatch.

mod csidh;
mod ffdh;
mod hybrid;

use std::fmt;

pub use csidh::{Csidh512, CsidhPrivateKey, CsidhPublicKey};
pub use ffdh::{FfDh, FfDhPrivateKey, FfDhPublicKey};
pub use hybrid::{Hybrid, HybridPrivateKey, HybridPublicKey};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Scheme used for all negotiated sessions.
pub type DefaultNike = Hybrid<FfDh, Csidh512>;

/// Public half of a NIKE key pair.
pub trait NikePublicKey: Clone + fmt::Debug + Send + Sync + 'static {
    /// Fixed-width encoding.
    fn to_bytes(&self) -> Vec<u8>;

    /// Constant-time equality.
    fn ct_eq(&self, other: &Self) -> bool;
}

/// Private half of a NIKE key pair. Wiped on drop.
pub trait NikePrivateKey: Clone + Send + Sync + 'static {
    /// Fixed-width encoding.
    fn to_bytes(&self) -> Zeroizing<Vec<u8>>;

    /// Constant-time equality.
    fn ct_eq(&self, other: &Self) -> bool;
}

/// Non-interactive key exchange scheme.
pub trait Nike: Send + Sync + 'static {
    /// Public key type
    type PublicKey: NikePublicKey;
    /// Private key type
    type PrivateKey: NikePrivateKey;

    /// Human-readable scheme name for errors and logs.
    const NAME: &'static str;
    /// Encoded public key width in bytes.
    const PUBLIC_KEY_SIZE: usize;
    /// Encoded private key width in bytes.
    const PRIVATE_KEY_SIZE: usize;
    /// Shared secret width in bytes.
    const SECRET_SIZE: usize;

    /// Generate a fresh key pair.
    fn new_keypair<R: RngCore + CryptoRng + ?Sized>(
        rng: &mut R,
    ) -> (Self::PrivateKey, Self::PublicKey);

    /// Public key belonging to `private`.
    fn derive_public_key(private: &Self::PrivateKey) -> Self::PublicKey;

    /// Shared secret between `private` and the peer's `public`.
    fn derive_secret(private: &Self::PrivateKey, public: &Self::PublicKey) -> Zeroizing<Vec<u8>>;

    /// Decode and validate a public key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::InvalidKey` if the width is wrong or the key is not a
    ///   valid group element
    fn public_key_from_bytes(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError>;

    /// Decode a private key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::InvalidKey` if the width or contents are invalid
    fn private_key_from_bytes(bytes: &[u8]) -> Result<Self::PrivateKey, CryptoError>;
}

pub(crate) fn check_len(
    scheme: &'static str,
    kind: &'static str,
    bytes: &[u8],
    expected: usize,
) -> Result<(), CryptoError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(CryptoError::InvalidKey {
            scheme,
            kind,
            reason: format!("expected {expected} bytes, got {}", bytes.len()),
        })
    }
}
