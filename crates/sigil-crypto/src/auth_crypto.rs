//! Symmetric layer for negotiation messages.
//!
//! Requests and confirms are sealed under a fresh NIKE secret that is used for
//! exactly one message. HKDF expands that secret into a cipher key, a MAC key
//! and a nonce, so no nonce is transmitted.

use chacha20::{
    Key, XChaCha20, XNonce,
    cipher::{KeyIvInit, StreamCipher},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{error::CryptoError, scheduler::MAC_LEN};

type HmacSha256 = Hmac<Sha256>;

const AUTH_KEYS_LABEL: &[u8] = b"sigilAuthKeysV1";

/// Cipher key, MAC key and nonce, back to back.
const OKM_LEN: usize = 32 + 32 + 24;

struct AuthKeys {
    okm: Zeroizing<[u8; OKM_LEN]>,
}

impl AuthKeys {
    fn derive(secret: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, secret);
        let mut okm = Zeroizing::new([0u8; OKM_LEN]);
        let Ok(()) = hkdf.expand(AUTH_KEYS_LABEL, &mut okm[..]) else {
            unreachable!("88 bytes is a valid HKDF-SHA256 output length");
        };
        Self { okm }
    }

    fn cipher(&self) -> XChaCha20 {
        XChaCha20::new(Key::from_slice(&self.okm[..32]), XNonce::from_slice(&self.okm[64..]))
    }

    fn mac(&self) -> HmacSha256 {
        let Ok(mac) = HmacSha256::new_from_slice(&self.okm[32..64]) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac
    }
}

/// Encrypt `payload` under a single-use `secret`.
///
/// Returns `(ciphertext, mac)`; the MAC covers the ciphertext.
pub fn auth_encrypt(secret: &[u8], payload: &[u8]) -> (Vec<u8>, [u8; MAC_LEN]) {
    let keys = AuthKeys::derive(secret);

    let mut ciphertext = payload.to_vec();
    keys.cipher().apply_keystream(&mut ciphertext);

    let mut mac = keys.mac();
    mac.update(&ciphertext);
    let mut tag = [0u8; MAC_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());

    (ciphertext, tag)
}

/// Verify `mac` and decrypt `ciphertext`.
///
/// # Errors
///
/// - `CryptoError::AuthenticationFailure` if the MAC does not verify. No
///   plaintext is produced.
pub fn auth_decrypt(secret: &[u8], ciphertext: &[u8], mac: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let keys = AuthKeys::derive(secret);

    let mut verifier = keys.mac();
    verifier.update(ciphertext);
    verifier.verify_slice(mac).map_err(|_| CryptoError::AuthenticationFailure)?;

    let mut plaintext = ciphertext.to_vec();
    keys.cipher().apply_keystream(&mut plaintext);
    Ok(plaintext)
}
