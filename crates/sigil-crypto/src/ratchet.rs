//! Send and receive ratchets.
//!
//! A ratchet binds a [`KeyScheduler`] to the NIKE key material it was derived
//! from, so it can produce its own successor:
//!
//! - [`SendRatchet`] owns an ephemeral key pair. [`SendRatchet::next`] draws a
//!   fresh pair and rederives against the partner's unchanged public key.
//! - [`ReceiveRatchet`] owns a static private key. [`ReceiveRatchet::next`]
//!   rederives against a public key the partner offered during rekey.
//!
//! Both ends of one exchange compute the same shared secret, so the ratchet id
//! `H(secret)` names the pair and lets the peers refer to a ratchet without
//! transmitting it.
//!
//! Successors inherit salt and size; the session layer decides budgets.

use std::fmt;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    error::CryptoError,
    hash::{HASH_LEN, blake2b_256},
    nike::{Nike, NikePrivateKey, NikePublicKey},
    scheduler::{EncryptedMessage, Fingerprint, KeyScheduler},
};

/// Name shared by the two ends of one ratchet: `H(shared secret)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RatchetId([u8; HASH_LEN]);

impl RatchetId {
    /// Id for a ratchet over `secret`.
    pub fn from_secret(secret: &[u8]) -> Self {
        Self(blake2b_256(&[secret]))
    }

    /// Wrap raw id bytes.
    pub const fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for RatchetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RatchetId({:02x}{:02x}{:02x}{:02x})", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for RatchetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SendDisk {
    id: RatchetId,
    my_private: Vec<u8>,
    my_public: Vec<u8>,
    partner_public: Vec<u8>,
    scheduler: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ReceiveDisk {
    id: RatchetId,
    my_private: Vec<u8>,
    partner_public: Vec<u8>,
    scheduler: Vec<u8>,
}

/// Outbound half of a key exchange.
pub struct SendRatchet<N: Nike> {
    id: RatchetId,
    my_private: N::PrivateKey,
    my_public: N::PublicKey,
    partner_public: N::PublicKey,
    scheduler: KeyScheduler,
}

impl<N: Nike> SendRatchet<N> {
    /// Derive the shared secret and build a ratchet of `size` keys.
    pub fn new(
        my_private: N::PrivateKey,
        my_public: N::PublicKey,
        partner_public: N::PublicKey,
        salt: &[u8],
        size: u32,
    ) -> Self {
        let secret = N::derive_secret(&my_private, &partner_public);
        Self::from_secret(&secret, my_private, my_public, partner_public, salt, size)
    }

    /// Build from an already derived `secret`.
    ///
    /// The caller guarantees `secret` is the NIKE output for the given keys.
    pub fn from_secret(
        secret: &[u8],
        my_private: N::PrivateKey,
        my_public: N::PublicKey,
        partner_public: N::PublicKey,
        salt: &[u8],
        size: u32,
    ) -> Self {
        Self {
            id: RatchetId::from_secret(secret),
            my_private,
            my_public,
            partner_public,
            scheduler: KeyScheduler::new(secret, salt, size),
        }
    }

    /// Build a ratchet whose size is chosen from the shared secret.
    ///
    /// Both ends hold the same secret, so a deterministic `size_of` gives
    /// both ends the same budget without negotiating it.
    pub fn new_sized(
        my_private: N::PrivateKey,
        my_public: N::PublicKey,
        partner_public: N::PublicKey,
        salt: &[u8],
        size_of: impl FnOnce(&[u8]) -> u32,
    ) -> Self {
        let secret = N::derive_secret(&my_private, &partner_public);
        let size = size_of(&secret);
        Self::from_secret(&secret, my_private, my_public, partner_public, salt, size)
    }

    /// Successor over a fresh ephemeral key pair, sized from its secret.
    pub fn next_sized<R: RngCore + CryptoRng + ?Sized>(
        &self,
        rng: &mut R,
        size_of: impl FnOnce(&[u8]) -> u32,
    ) -> Self {
        let (private, public) = N::new_keypair(rng);
        Self::new_sized(private, public, self.partner_public.clone(), self.scheduler.salt(), size_of)
    }

    /// Successor over a fresh ephemeral key pair, same salt and size.
    pub fn next<R: RngCore + CryptoRng + ?Sized>(&self, rng: &mut R) -> Self {
        let (private, public) = N::new_keypair(rng);
        Self::new(private, public, self.partner_public.clone(), self.scheduler.salt(), self.size())
    }

    /// Encrypt under the next unused key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyExhaustion` once every key is used
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        self.scheduler.encrypt(plaintext)
    }

    /// Ratchet id.
    pub fn id(&self) -> RatchetId {
        self.id
    }

    /// Our ephemeral public key, offered to the partner on rekey.
    pub fn my_public_key(&self) -> &N::PublicKey {
        &self.my_public
    }

    /// Partner's static public key.
    pub fn partner_public_key(&self) -> &N::PublicKey {
        &self.partner_public
    }

    /// Total keys in the schedule.
    pub fn size(&self) -> u32 {
        self.scheduler.size()
    }

    /// Keys not yet used.
    pub fn num_available(&self) -> u32 {
        self.scheduler.num_available()
    }

    /// Keys already used.
    pub fn num_used(&self) -> u32 {
        self.scheduler.state().num_used()
    }

    /// Underlying scheduler.
    pub fn scheduler(&self) -> &KeyScheduler {
        &self.scheduler
    }

    /// Serialize to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let disk = SendDisk {
            id: self.id,
            my_private: self.my_private.to_bytes().to_vec(),
            my_public: self.my_public.to_bytes(),
            partner_public: self.partner_public.to_bytes(),
            scheduler: self.scheduler.to_bytes()?,
        };
        encode(&disk)
    }

    /// Restore a ratchet saved with [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// - `CryptoError::Corrupt` if the blob does not decode
    /// - `CryptoError::InvalidKey` if stored key material no longer parses
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let disk: SendDisk = decode(bytes, "send ratchet")?;
        Ok(Self {
            id: disk.id,
            my_private: N::private_key_from_bytes(&disk.my_private)?,
            my_public: N::public_key_from_bytes(&disk.my_public)?,
            partner_public: N::public_key_from_bytes(&disk.partner_public)?,
            scheduler: KeyScheduler::from_bytes(&disk.scheduler)?,
        })
    }
}

impl<N: Nike> Clone for SendRatchet<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            my_private: self.my_private.clone(),
            my_public: self.my_public.clone(),
            partner_public: self.partner_public.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<N: Nike> fmt::Debug for SendRatchet<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRatchet")
            .field("id", &self.id)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Inbound half of a key exchange.
pub struct ReceiveRatchet<N: Nike> {
    id: RatchetId,
    my_private: N::PrivateKey,
    partner_public: N::PublicKey,
    scheduler: KeyScheduler,
}

impl<N: Nike> ReceiveRatchet<N> {
    /// Derive the shared secret and build a ratchet of `size` keys.
    pub fn new(my_private: N::PrivateKey, partner_public: N::PublicKey, salt: &[u8], size: u32) -> Self {
        let secret = N::derive_secret(&my_private, &partner_public);
        Self::from_secret(&secret, my_private, partner_public, salt, size)
    }

    /// Build from an already derived `secret`.
    pub fn from_secret(
        secret: &[u8],
        my_private: N::PrivateKey,
        partner_public: N::PublicKey,
        salt: &[u8],
        size: u32,
    ) -> Self {
        Self {
            id: RatchetId::from_secret(secret),
            my_private,
            partner_public,
            scheduler: KeyScheduler::new(secret, salt, size),
        }
    }

    /// Build a ratchet whose size is chosen from the shared secret.
    pub fn new_sized(
        my_private: N::PrivateKey,
        partner_public: N::PublicKey,
        salt: &[u8],
        size_of: impl FnOnce(&[u8]) -> u32,
    ) -> Self {
        let secret = N::derive_secret(&my_private, &partner_public);
        let size = size_of(&secret);
        Self::from_secret(&secret, my_private, partner_public, salt, size)
    }

    /// Successor against a newly offered partner key, sized from its secret.
    pub fn next_sized(
        &self,
        partner_public: N::PublicKey,
        size_of: impl FnOnce(&[u8]) -> u32,
    ) -> Self {
        Self::new_sized(self.my_private.clone(), partner_public, self.scheduler.salt(), size_of)
    }

    /// Successor against the partner's newly offered public key.
    pub fn next(&self, partner_public: N::PublicKey) -> Self {
        Self::new(self.my_private.clone(), partner_public, self.scheduler.salt(), self.size())
    }

    /// Decrypt and consume the key behind the message fingerprint.
    ///
    /// # Errors
    ///
    /// See [`KeyScheduler::decrypt`].
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        self.scheduler.decrypt(message)
    }

    /// Whether `fingerprint` belongs to this ratchet.
    pub fn owns(&self, fingerprint: &Fingerprint) -> bool {
        self.scheduler.index_of(fingerprint).is_some()
    }

    /// All fingerprints this ratchet accepts, in index order.
    pub fn fingerprints(&self) -> &[Fingerprint] {
        self.scheduler.fingerprints()
    }

    /// Fingerprints not yet consumed.
    pub fn unused_fingerprints(&self) -> Vec<Fingerprint> {
        self.scheduler.unused_fingerprints()
    }

    /// Ratchet id.
    pub fn id(&self) -> RatchetId {
        self.id
    }

    /// Public key the partner encrypts against.
    pub fn partner_public_key(&self) -> &N::PublicKey {
        &self.partner_public
    }

    /// Total keys in the schedule.
    pub fn size(&self) -> u32 {
        self.scheduler.size()
    }

    /// Keys not yet consumed.
    pub fn num_available(&self) -> u32 {
        self.scheduler.num_available()
    }

    /// Serialize to CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let disk = ReceiveDisk {
            id: self.id,
            my_private: self.my_private.to_bytes().to_vec(),
            partner_public: self.partner_public.to_bytes(),
            scheduler: self.scheduler.to_bytes()?,
        };
        encode(&disk)
    }

    /// Restore a ratchet saved with [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// - `CryptoError::Corrupt` if the blob does not decode
    /// - `CryptoError::InvalidKey` if stored key material no longer parses
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let disk: ReceiveDisk = decode(bytes, "receive ratchet")?;
        Ok(Self {
            id: disk.id,
            my_private: N::private_key_from_bytes(&disk.my_private)?,
            partner_public: N::public_key_from_bytes(&disk.partner_public)?,
            scheduler: KeyScheduler::from_bytes(&disk.scheduler)?,
        })
    }
}

impl<N: Nike> Clone for ReceiveRatchet<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            my_private: self.my_private.clone(),
            partner_public: self.partner_public.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<N: Nike> fmt::Debug for ReceiveRatchet<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveRatchet")
            .field("id", &self.id)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], what: &'static str) -> Result<T, CryptoError> {
    ciborium::from_reader(bytes).map_err(|e| CryptoError::Corrupt { what, reason: e.to_string() })
}
