//! Concatenating composition of two NIKE schemes.
//!
//! ```text
//! public  = public_A  || public_B
//! private = private_A || private_B
//! secret  = secret_A  || secret_B
//! ```
//!
//! Offsets are fixed by `A`'s sizes, so `Hybrid<A, B>` and `Hybrid<B, A>` are
//! different wire formats.

use std::{fmt, marker::PhantomData};

use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use super::{Nike, NikePrivateKey, NikePublicKey, check_len};
use crate::error::CryptoError;

/// Hybrid of schemes `A` and `B`.
pub struct Hybrid<A, B>(PhantomData<(A, B)>);

impl<A, B> fmt::Debug for Hybrid<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hybrid")
    }
}

/// Pair of public keys.
pub struct HybridPublicKey<A: Nike, B: Nike> {
    first: A::PublicKey,
    second: B::PublicKey,
}

impl<A: Nike, B: Nike> HybridPublicKey<A, B> {
    /// Pair up two independently generated public keys.
    pub fn new(first: A::PublicKey, second: B::PublicKey) -> Self {
        Self { first, second }
    }

    /// Key of the first scheme.
    pub fn first(&self) -> &A::PublicKey {
        &self.first
    }

    /// Key of the second scheme.
    pub fn second(&self) -> &B::PublicKey {
        &self.second
    }
}

impl<A: Nike, B: Nike> Clone for HybridPublicKey<A, B> {
    fn clone(&self) -> Self {
        Self { first: self.first.clone(), second: self.second.clone() }
    }
}

impl<A: Nike, B: Nike> fmt::Debug for HybridPublicKey<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HybridPublicKey").field(&self.first).field(&self.second).finish()
    }
}

/// Pair of private keys.
pub struct HybridPrivateKey<A: Nike, B: Nike> {
    first: A::PrivateKey,
    second: B::PrivateKey,
}

impl<A: Nike, B: Nike> HybridPrivateKey<A, B> {
    /// Pair up two independently generated private keys.
    pub fn new(first: A::PrivateKey, second: B::PrivateKey) -> Self {
        Self { first, second }
    }

    /// Key of the first scheme.
    pub fn first(&self) -> &A::PrivateKey {
        &self.first
    }

    /// Key of the second scheme.
    pub fn second(&self) -> &B::PrivateKey {
        &self.second
    }
}

impl<A: Nike, B: Nike> Clone for HybridPrivateKey<A, B> {
    fn clone(&self) -> Self {
        Self { first: self.first.clone(), second: self.second.clone() }
    }
}

impl<A: Nike, B: Nike> NikePublicKey for HybridPublicKey<A, B> {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.first.to_bytes();
        bytes.extend_from_slice(&self.second.to_bytes());
        bytes
    }

    fn ct_eq(&self, other: &Self) -> bool {
        // Both halves are always compared.
        let first = self.first.ct_eq(&other.first);
        let second = self.second.ct_eq(&other.second);
        first & second
    }
}

impl<A: Nike, B: Nike> NikePrivateKey for HybridPrivateKey<A, B> {
    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = self.first.to_bytes();
        bytes.extend_from_slice(&self.second.to_bytes());
        bytes
    }

    fn ct_eq(&self, other: &Self) -> bool {
        let first = self.first.ct_eq(&other.first);
        let second = self.second.ct_eq(&other.second);
        first & second
    }
}

impl<A: Nike, B: Nike> Nike for Hybrid<A, B> {
    type PublicKey = HybridPublicKey<A, B>;
    type PrivateKey = HybridPrivateKey<A, B>;

    const NAME: &'static str = "hybrid";
    const PUBLIC_KEY_SIZE: usize = A::PUBLIC_KEY_SIZE + B::PUBLIC_KEY_SIZE;
    const PRIVATE_KEY_SIZE: usize = A::PRIVATE_KEY_SIZE + B::PRIVATE_KEY_SIZE;
    const SECRET_SIZE: usize = A::SECRET_SIZE + B::SECRET_SIZE;

    fn new_keypair<R: RngCore + CryptoRng + ?Sized>(
        rng: &mut R,
    ) -> (Self::PrivateKey, Self::PublicKey) {
        let (first_priv, first_pub) = A::new_keypair(rng);
        let (second_priv, second_pub) = B::new_keypair(rng);
        (
            HybridPrivateKey { first: first_priv, second: second_priv },
            HybridPublicKey { first: first_pub, second: second_pub },
        )
    }

    fn derive_public_key(private: &Self::PrivateKey) -> Self::PublicKey {
        HybridPublicKey {
            first: A::derive_public_key(&private.first),
            second: B::derive_public_key(&private.second),
        }
    }

    fn derive_secret(private: &Self::PrivateKey, public: &Self::PublicKey) -> Zeroizing<Vec<u8>> {
        let mut secret = A::derive_secret(&private.first, &public.first);
        secret.extend_from_slice(&B::derive_secret(&private.second, &public.second));
        secret
    }

    fn public_key_from_bytes(bytes: &[u8]) -> Result<Self::PublicKey, CryptoError> {
        check_len(Self::NAME, "public", bytes, Self::PUBLIC_KEY_SIZE)?;
        let (first, second) = bytes.split_at(A::PUBLIC_KEY_SIZE);
        Ok(HybridPublicKey {
            first: A::public_key_from_bytes(first)?,
            second: B::public_key_from_bytes(second)?,
        })
    }

    fn private_key_from_bytes(bytes: &[u8]) -> Result<Self::PrivateKey, CryptoError> {
        check_len(Self::NAME, "private", bytes, Self::PRIVATE_KEY_SIZE)?;
        let (first, second) = bytes.split_at(A::PRIVATE_KEY_SIZE);
        Ok(HybridPrivateKey {
            first: A::private_key_from_bytes(first)?,
            second: B::private_key_from_bytes(second)?,
        })
    }
}
