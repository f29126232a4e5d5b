//! Cryptographic error types.

use thiserror::Error;

/// Errors from key scheduling, key exchange and ratchet operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Every key index of the ratchet has been claimed.
    ///
    /// Not a hard failure: the caller must rekey and retry on the successor.
    #[error("no keys remaining: all {num_keys} keys used")]
    KeyExhaustion {
        /// Size of the exhausted key space
        num_keys: u32,
    },

    /// Fingerprint does not belong to this ratchet (unknown session or epoch).
    #[error("fingerprint not registered with this ratchet")]
    UnknownFingerprint,

    /// The key behind this fingerprint was already consumed.
    #[error("key {index} already used")]
    KeyReused {
        /// Index of the reused key
        index: u32,
    },

    /// MAC verification failed.
    ///
    /// Deliberately carries no detail: wrong key and corrupted data are
    /// indistinguishable to the caller.
    #[error("MAC failure")]
    AuthenticationFailure,

    /// Input shorter than the fixed framing requires.
    #[error("{what} too small: expected at least {expected} bytes, got {actual}")]
    FormatTooSmall {
        /// What was being parsed
        what: &'static str,
        /// Minimum size in bytes
        expected: usize,
        /// Actual size in bytes
        actual: usize,
    },

    /// Key bytes rejected by a NIKE scheme.
    #[error("invalid {scheme} {kind} key: {reason}")]
    InvalidKey {
        /// Scheme name
        scheme: &'static str,
        /// "public" or "private"
        kind: &'static str,
        /// Why the key was rejected
        reason: String,
    },

    /// Persisted state failed to decode or is internally inconsistent.
    #[error("corrupt {what}: {reason}")]
    Corrupt {
        /// Which structure
        what: &'static str,
        /// Description of the inconsistency
        reason: String,
    },

    /// CBOR encoding failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl CryptoError {
    /// Whether the caller should rekey instead of treating this as a failure.
    pub fn requires_rekey(&self) -> bool {
        matches!(self, Self::KeyExhaustion { .. })
    }

    /// Whether this error indicates corrupted local state.
    ///
    /// Fatal errors mean a persisted ratchet cannot be trusted and the
    /// relationship must be reset. Errors caused by remote input are not
    /// fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Serialization(_))
    }
}
