//! Finite-field Diffie-Hellman over the RFC 3526 2048-bit MODP group.

use std::{fmt, sync::LazyLock};

use num_bigint::BigUint;
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{Nike, NikePrivateKey, NikePublicKey, check_len};
use crate::error::CryptoError;

const SCHEME: &str = "ffdh-2048";
const GROUP_BYTES: usize = 256;
const EXPONENT_BYTES: usize = 32;

/// RFC 3526 group 14 prime. A safe prime, so the only small subgroups are
/// `{1}` and `{1, p-1}`.
const MODP_2048_HEX: &[u8] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
83655D23DCA3AD961C62F356208552BB9ED529077096966D\
670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
15728E5A8AACAA68FFFFFFFFFFFFFFFF";

static PRIME: LazyLock<BigUint> = LazyLock::new(|| {
    let Some(p) = BigUint::parse_bytes(MODP_2048_HEX, 16) else {
        unreachable!("MODP prime constant is valid hex");
    };
    p
});

static GENERATOR: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(2u8));

/// Classical Diffie-Hellman scheme.
#[derive(Debug, Clone, Copy)]
pub struct FfDh;

/// Group element `g^x mod p`.
#[derive(Clone, PartialEq, Eq)]
pub struct FfDhPublicKey(BigUint);

/// 256-bit secret exponent.
#[derive(Clone)]
pub struct FfDhPrivateKey(Zeroizing<[u8; EXPONENT_BYTES]>);

impl FfDhPrivateKey {
    fn exponent(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0[..])
    }
}

impl fmt::Debug for FfDhPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "FfDhPublicKey({:02x}{:02x}{:02x}{:02x}..)", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl NikePublicKey for FfDhPublicKey {
    fn to_bytes(&self) -> Vec<u8> {
        left_pad(&self.0.to_bytes_be(), GROUP_BYTES)
    }

    fn ct_eq(&self, other: &Self) -> bool {
        self.to_bytes().ct_eq(&other.to_bytes()).into()
    }
}

impl NikePrivateKey for FfDhPrivateKey {
    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.to_vec())
    }

    fn ct_eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Nike for FfDh {
    type PublicKey = FfDhPublicKey;
    type PrivateKey = FfDhPrivateKey;

    const NAME: &'static str = SCHEME;
    const PUBLIC_KEY_SIZE: usize = GROUP_BYTES;
    const PRIVATE_KEY_SIZE: usize = EXPONENT_BYTES;
    const SECRET_SIZE: usize = GROUP_BYTES;

    fn new_keypair<R: RngCore + CryptoRng + ?Sized>(
        rng: &mut R,
    ) -> (Self::PrivateKey, Self::PublicKey) {
        let mut exponent = Zeroizing::new([0u8; EXPONENT_BYTES]);
        // Exponents 0 and 1 yield public keys outside the accepted range.
        while exponent[..EXPONENT_BYTES - 1].iter().all(|&b| b == 0) {
            rng.fill_bytes(&mut exponent[..]);
        }
        let private = FfDhPrivateKey(exponent);
        let public = Self::derive_public_key(&private);
        (private, public)
    }

    fn derive_public_key(private: &Self::PrivateKey) -> Self::PublicKey {
        FfDhPublicKey(GENERATOR.modpow(&private.exponent(), &PRIME))
    }

    fn derive_secret(private: &Self::PrivateKey, public: &Self::PublicKey) -> Zeroizing<Vec<u8>> {
        let shared = public.0.modpow(&private.exponent(), &PRIME);
        Zeroizing::new(left_pad(&shared.to_bytes_be(), GROUP_BYTES))
    }

    fn public_key_from_bytes(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError> {
        check_len(SCHEME, "public", bytes, GROUP_BYTES)?;
        let value = BigUint::from_bytes_be(bytes);

        let two = BigUint::from(2u8);
        if value < two || value > &*PRIME - &two {
            return Err(CryptoError::InvalidKey {
                scheme: SCHEME,
                kind: "public",
                reason: "element outside [2, p-2]".to_string(),
            });
        }
        Ok(FfDhPublicKey(value))
    }

    fn private_key_from_bytes(bytes: &[u8]) -> Result<Self::PrivateKey, CryptoError> {
        check_len(SCHEME, "private", bytes, EXPONENT_BYTES)?;
        let mut exponent = Zeroizing::new([0u8; EXPONENT_BYTES]);
        exponent.copy_from_slice(bytes);
        Ok(FfDhPrivateKey(exponent))
    }
}

fn left_pad(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    #[test]
    fn prime_has_expected_width() {
        assert_eq!(PRIME.bits(), 2048);
    }

    #[test]
    fn rejects_degenerate_public_keys() {
        let p_minus_one = &*PRIME - BigUint::from(1u8);
        for bad in [BigUint::from(0u8), BigUint::from(1u8), p_minus_one, PRIME.clone()] {
            let bytes = left_pad(&bad.to_bytes_be(), GROUP_BYTES);
            assert!(FfDh::public_key_from_bytes(&bytes).is_err());
        }
    }

    #[test]
    fn public_key_encoding_is_fixed_width() {
        let mut raw = [0u8; EXPONENT_BYTES];
        raw[EXPONENT_BYTES - 1] = 3;
        let private = FfDh::private_key_from_bytes(&raw).unwrap();
        let public = FfDh::derive_public_key(&private);
        let bytes = public.to_bytes();
        assert_eq!(bytes.len(), GROUP_BYTES);
        assert_eq!(bytes[GROUP_BYTES - 1], 8);
        assert!(bytes[..GROUP_BYTES - 1].iter().all(|&b| b == 0));
    }

    #[test]
    fn keypairs_are_distinct() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (_, a) = FfDh::new_keypair(&mut rng);
        let (_, b) = FfDh::new_keypair(&mut rng);
        assert_ne!(a, b);
    }
}
