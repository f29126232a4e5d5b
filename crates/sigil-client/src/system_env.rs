//! Production environment backed by the OS RNG.
//!
//! Key pairs, ratchet successors and retry draws all come from here in
//! production, so none of it is reproducible. Tests use
//! [`sigil_core::SeededEnv`] instead.

use sigil_core::Environment;

/// Production environment using OS cryptographic randomness.
///
/// # Security
///
/// The RNG uses getrandom, i.e. the platform CSPRNG (`getrandom(2)` on Linux,
/// `BCryptGenRandom` on Windows). Suitable for ephemeral key pairs and
/// nonces.
///
/// # Panics
///
/// Panics if the OS RNG fails. Negotiation without working randomness would
/// produce predictable keys, so there is nothing to fall back to.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys would be predictable");
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;

    #[test]
    fn random_bytes_differ() {
        let env = SystemEnv::new();

        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        env.random_bytes(&mut first);
        env.random_bytes(&mut second);

        assert_ne!(first, second);
    }

    #[test]
    fn random_bytes_fill_buffer() {
        let env = SystemEnv::new();

        let mut bytes = [0u8; 64];
        env.random_bytes(&mut bytes);

        let non_zero = bytes.iter().filter(|&&b| b != 0).count();
        assert!(non_zero > 32, "most bytes should be non-zero");
    }

    #[test]
    fn unit_draws_stay_in_range() {
        let env = SystemEnv::new();
        for _ in 0..100 {
            let draw = env.random_unit();
            assert!((0.0..1.0).contains(&draw));
        }
        assert_ne!(env.rng().next_u64(), env.rng().next_u64());
    }
}
