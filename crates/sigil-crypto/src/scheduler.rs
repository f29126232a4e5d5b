//! Fingerprint-indexed symmetric key scheduler.
//!
//! A [`KeyScheduler`] turns one shared secret into `size` single-use keys. Each
//! key index `i` has two derived values:
//!
//! ```text
//! key(i)         = H(secret[..len/2] || uvarint(i) || salt)
//! fingerprint(i) = H(secret[len/2..] || uvarint(i) || salt), top bit cleared
//! ```
//!
//! The fingerprint travels with the ciphertext so the receiver finds the key
//! index with one map lookup instead of trial decryption. Halving the secret
//! keeps fingerprints (public) and keys (secret) derived from disjoint input.
//!
//! # Wire layout
//!
//! ```text
//! [ HMAC-SHA256(key, body) : 32 ][ XChaCha20(key, fp[..24]) ^ plaintext ]
//! ```
//!
//! The stream cipher nonce is the fingerprint itself. That is only sound
//! because the [`StateVector`] hands out each index at most once.

use std::{collections::HashMap, fmt};

use chacha20::{
    Key, XChaCha20, XNonce,
    cipher::{KeyIvInit, StreamCipher},
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    hash::{HASH_LEN, blake2b_256, put_uvarint},
    state_vector::StateVector,
};

type HmacSha256 = Hmac<Sha256>;

/// Fingerprint size in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// MAC prefix size in bytes.
pub const MAC_LEN: usize = 32;

/// Key residue size in bytes.
pub const KEY_RESIDUE_LEN: usize = 32;

/// Domain string mixed into key residues.
const RESIDUE_SALT: &[u8] = b"e2eKeyResidueSalt";

/// XChaCha20 nonce size.
const NONCE_LEN: usize = 24;

/// Message key lookup tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes.
    pub const fn new(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Fingerprint from a hash digest, top bit cleared.
    pub(crate) fn from_digest(mut digest: [u8; FINGERPRINT_LEN]) -> Self {
        digest[0] &= 0x7f;
        Self(digest)
    }

    /// Parse from a slice of exactly [`FINGERPRINT_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; FINGERPRINT_LEN] =
            bytes.try_into().map_err(|_| CryptoError::FormatTooSmall {
                what: "fingerprint",
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Hash of a message key, used by callers for key-commitment bookkeeping.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyResidue([u8; KEY_RESIDUE_LEN]);

impl KeyResidue {
    fn from_key(key: &[u8]) -> Self {
        Self(blake2b_256(&[key, RESIDUE_SALT]))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_RESIDUE_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyResidue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyResidue({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Output of [`KeyScheduler::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// `MAC || ciphertext`
    pub ciphertext: Vec<u8>,
    /// Lookup tag for the key that produced `ciphertext`
    pub fingerprint: Fingerprint,
    /// Residue of the message key
    pub residue: KeyResidue,
}

impl EncryptedMessage {
    /// Rebuild a received message from its wire parts.
    ///
    /// The residue never travels, so it is left zeroed; decryption reads only
    /// the fingerprint and ciphertext.
    pub fn from_wire(fingerprint: Fingerprint, ciphertext: Vec<u8>) -> Self {
        Self { ciphertext, fingerprint, residue: KeyResidue([0; KEY_RESIDUE_LEN]) }
    }
}

#[derive(Serialize, Deserialize)]
struct SchedulerDisk {
    size: u32,
    shared_secret: Vec<u8>,
    salt: Vec<u8>,
    used_keys: Vec<u8>,
}

/// Single-use key schedule over a shared secret.
///
/// # Invariants
///
/// - `fingerprints.len() == size` and `fingerprint_map` is its inverse
/// - The state vector has exactly `size` slots
/// - Each index is encrypted with at most once
#[derive(Clone)]
pub struct KeyScheduler {
    size: u32,
    shared_secret: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
    used_keys: StateVector,
    fingerprints: Vec<Fingerprint>,
    fingerprint_map: HashMap<Fingerprint, u32>,
}

impl KeyScheduler {
    /// Create a scheduler and eagerly derive all `size` fingerprints.
    pub fn new(shared_secret: &[u8], salt: &[u8], size: u32) -> Self {
        Self::with_state(
            Zeroizing::new(shared_secret.to_vec()),
            salt.to_vec(),
            StateVector::new(size),
        )
    }

    fn with_state(shared_secret: Zeroizing<Vec<u8>>, salt: Vec<u8>, used_keys: StateVector) -> Self {
        let size = used_keys.num_keys();
        let fingerprints: Vec<Fingerprint> =
            (0..size).map(|i| derive_fingerprint(&shared_secret, i, &salt)).collect();
        let fingerprint_map = fingerprints.iter().enumerate().map(|(i, fp)| (*fp, i as u32)).collect();

        Self { size, shared_secret, salt, used_keys, fingerprints, fingerprint_map }
    }

    /// Encrypt `plaintext` under the next unused key.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyExhaustion` if every key is used. The caller should
    ///   rekey rather than treat this as a failure.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let index = self.used_keys.next()?;
        let fingerprint = derive_fingerprint(&self.shared_secret, index, &self.salt);
        let key = derive_key(&self.shared_secret, index, &self.salt);

        let mut body = plaintext.to_vec();
        apply_keystream(&key, &fingerprint, &mut body);
        let mac = compute_mac(&key, &body);

        let mut ciphertext = Vec::with_capacity(MAC_LEN + body.len());
        ciphertext.extend_from_slice(&mac);
        ciphertext.extend_from_slice(&body);

        Ok(EncryptedMessage { ciphertext, fingerprint, residue: KeyResidue::from_key(&key[..]) })
    }

    /// Decrypt a message produced by the peer scheduler and consume its key.
    ///
    /// Nothing is mutated unless the MAC verifies.
    ///
    /// # Errors
    ///
    /// - `CryptoError::UnknownFingerprint` if the fingerprint is not ours
    /// - `CryptoError::KeyReused` if the key was already consumed
    /// - `CryptoError::FormatTooSmall` if the ciphertext lacks a MAC
    /// - `CryptoError::AuthenticationFailure` if the MAC does not verify
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        let index = self.index_of(&message.fingerprint).ok_or(CryptoError::UnknownFingerprint)?;
        if self.used_keys.used(index) {
            return Err(CryptoError::KeyReused { index });
        }
        if message.ciphertext.len() < MAC_LEN {
            return Err(CryptoError::FormatTooSmall {
                what: "ciphertext",
                expected: MAC_LEN,
                actual: message.ciphertext.len(),
            });
        }

        let key = derive_key(&self.shared_secret, index, &self.salt);
        let (mac, body) = message.ciphertext.split_at(MAC_LEN);
        if !verify_mac(&key, body, mac) {
            return Err(CryptoError::AuthenticationFailure);
        }

        let mut plaintext = body.to_vec();
        apply_keystream(&key, &message.fingerprint, &mut plaintext);
        self.used_keys.use_key(index);
        Ok(plaintext)
    }

    /// Consume the key behind `fingerprint` without decrypting.
    ///
    /// # Errors
    ///
    /// - `CryptoError::UnknownFingerprint` if the fingerprint is not ours
    /// - `CryptoError::KeyReused` if the key was already consumed
    pub fn mark_used(&mut self, fingerprint: &Fingerprint) -> Result<u32, CryptoError> {
        let index = self.index_of(fingerprint).ok_or(CryptoError::UnknownFingerprint)?;
        if self.used_keys.used(index) {
            return Err(CryptoError::KeyReused { index });
        }
        self.used_keys.use_key(index);
        Ok(index)
    }

    /// Key index registered for `fingerprint`.
    pub fn index_of(&self, fingerprint: &Fingerprint) -> Option<u32> {
        self.fingerprint_map.get(fingerprint).copied()
    }

    /// All fingerprints in index order.
    pub fn fingerprints(&self) -> &[Fingerprint] {
        &self.fingerprints
    }

    /// Fingerprints of keys not yet consumed.
    pub fn unused_fingerprints(&self) -> Vec<Fingerprint> {
        self.used_keys.unused_key_nums().into_iter().map(|i| self.fingerprints[i as usize]).collect()
    }

    /// Salt mixed into every derivation.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Number of keys in the schedule.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Key usage state.
    pub fn state(&self) -> &StateVector {
        &self.used_keys
    }

    /// Number of keys not yet consumed.
    pub fn num_available(&self) -> u32 {
        self.used_keys.num_available()
    }

    /// Serialize `{size, secret, salt, used keys}` to CBOR.
    ///
    /// Fingerprints are not stored; [`Self::from_bytes`] rederives them.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let disk = SchedulerDisk {
            size: self.size,
            shared_secret: self.shared_secret.to_vec(),
            salt: self.salt.clone(),
            used_keys: self.used_keys.marshal()?,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&disk, &mut bytes)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Restore a scheduler saved with [`Self::to_bytes`].
    ///
    /// # Errors
    ///
    /// - `CryptoError::Corrupt` if the blob is malformed or its state vector
    ///   does not match the recorded size
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let disk: SchedulerDisk = ciborium::from_reader(bytes)
            .map_err(|e| CryptoError::Corrupt { what: "key scheduler", reason: e.to_string() })?;
        let used_keys = StateVector::unmarshal(&disk.used_keys)?;
        if used_keys.num_keys() != disk.size {
            return Err(CryptoError::Corrupt {
                what: "key scheduler",
                reason: format!("size {} but state vector tracks {}", disk.size, used_keys.num_keys()),
            });
        }
        Ok(Self::with_state(Zeroizing::new(disk.shared_secret), disk.salt, used_keys))
    }
}

impl fmt::Debug for KeyScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyScheduler")
            .field("size", &self.size)
            .field("available", &self.used_keys.num_available())
            .finish_non_exhaustive()
    }
}

fn derive(data: &[u8], index: u32, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut index_bytes = Vec::with_capacity(5);
    put_uvarint(&mut index_bytes, u64::from(index));
    blake2b_256(&[data, index_bytes.as_slice(), salt])
}

/// Message key for `index`: hash over the first half of the secret.
pub(crate) fn derive_key(secret: &[u8], index: u32, salt: &[u8]) -> Zeroizing<[u8; HASH_LEN]> {
    Zeroizing::new(derive(&secret[..secret.len() / 2], index, salt))
}

/// Fingerprint for `index`: hash over the second half of the secret.
pub(crate) fn derive_fingerprint(secret: &[u8], index: u32, salt: &[u8]) -> Fingerprint {
    Fingerprint::from_digest(derive(&secret[secret.len() / 2..], index, salt))
}

fn apply_keystream(key: &[u8; HASH_LEN], fingerprint: &Fingerprint, data: &mut [u8]) {
    let nonce = XNonce::from_slice(&fingerprint.0[..NONCE_LEN]);
    let mut cipher = XChaCha20::new(Key::from_slice(key), nonce);
    cipher.apply_keystream(data);
}

fn compute_mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn verify_mac(key: &[u8; HASH_LEN], data: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}
