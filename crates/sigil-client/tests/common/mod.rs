//! Helpers shared by the manager integration tests.

#![allow(dead_code)]

use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sigil_client::Identity;
use sigil_core::Params;
use sigil_crypto::{
    CryptoError, Csidh512, Nike,
    nike::{CsidhPrivateKey, CsidhPublicKey},
};
use sigil_proto::PartnerId;
use zeroize::Zeroizing;

/// Transport payload used by every test.
pub const PAYLOAD_SIZE: usize = 1024;

/// CSIDH-512 with at most six unit steps per key.
pub struct SparseCsidh;

impl Nike for SparseCsidh {
    type PublicKey = CsidhPublicKey;
    type PrivateKey = CsidhPrivateKey;

    const NAME: &'static str = "csidh-512-sparse";
    const PUBLIC_KEY_SIZE: usize = Csidh512::PUBLIC_KEY_SIZE;
    const PRIVATE_KEY_SIZE: usize = Csidh512::PRIVATE_KEY_SIZE;
    const SECRET_SIZE: usize = Csidh512::SECRET_SIZE;

    fn new_keypair<R: RngCore + CryptoRng + ?Sized>(
        rng: &mut R,
    ) -> (Self::PrivateKey, Self::PublicKey) {
        let mut draw = [0u8; 6];
        rng.fill_bytes(&mut draw);

        let mut raw = [0u8; Csidh512::PRIVATE_KEY_SIZE];
        raw[0] = if draw[0] & 1 == 0 { 1 } else { (-1i8) as u8 };
        for (slot, byte) in raw[1..6].iter_mut().zip(&draw[1..]) {
            *slot = ((byte % 3) as i8 - 1) as u8;
        }
        let private = Csidh512::private_key_from_bytes(&raw).unwrap();
        let public = Csidh512::derive_public_key(&private);
        (private, public)
    }

    fn derive_public_key(private: &Self::PrivateKey) -> Self::PublicKey {
        Csidh512::derive_public_key(private)
    }

    fn derive_secret(private: &Self::PrivateKey, public: &Self::PublicKey) -> Zeroizing<Vec<u8>> {
        Csidh512::derive_secret(private, public)
    }

    fn public_key_from_bytes(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError> {
        Csidh512::public_key_from_bytes(bytes)
    }

    fn private_key_from_bytes(bytes: &[u8]) -> Result<Self::PrivateKey, CryptoError> {
        Csidh512::private_key_from_bytes(bytes)
    }
}

/// Small ratchets so rekeys happen within a few messages.
pub fn params() -> Params {
    Params {
        min_keys: 12,
        max_keys: 16,
        rekey_threshold: 0.5,
        num_rekeys: 4,
        unconfirmed_retry_ratio: 1.0,
        replay_requests: false,
    }
}

/// Deterministic identity with every id byte set to `byte`.
pub fn identity(byte: u8) -> Identity {
    let mut rng = ChaCha20Rng::seed_from_u64(u64::from(byte));
    Identity::generate(PartnerId::new([byte; PartnerId::LEN]), &mut rng)
}
