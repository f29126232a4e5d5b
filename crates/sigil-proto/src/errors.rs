//! Wire format errors.

use sigil_crypto::CryptoError;
use thiserror::Error;

/// Result alias for wire format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding or decoding wire objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than the fixed layout requires
    #[error("{what} too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Structure being decoded
        what: &'static str,
        /// Minimum size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Content does not fit the space the layout leaves for it
    #[error("{what} too large: {size} bytes, {max} available")]
    TooLarge {
        /// Structure being encoded
        what: &'static str,
        /// Size requested
        size: usize,
        /// Space available
        max: usize,
    },

    /// Field width does not match the layout
    #[error("{what} has wrong width: expected {expected} bytes, got {actual}")]
    WrongWidth {
        /// Field being set
        what: &'static str,
        /// Width required by the layout
        expected: usize,
        /// Width supplied
        actual: usize,
    },

    /// Trailing version byte is not a known format
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Envelope kind byte is not a known message kind
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    /// Fact text is not representable on the wire
    #[error("invalid fact {fact:?}: {reason}")]
    InvalidFact {
        /// Offending fact
        fact: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// CBOR payload failed to encode or decode
    #[error("payload serialization: {0}")]
    Serialization(String),

    /// Embedded cryptographic field failed to parse
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
}
