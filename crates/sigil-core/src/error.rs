//! Error types for the Sigil channel core.
//!
//! Negotiation errors separate three outcomes the caller handles differently:
//! a ratchet that needs a rekey, a peer message that must be dropped, and a
//! local persistence failure.

use sigil_crypto::{CryptoError, Fingerprint, RatchetId};
use sigil_proto::ProtocolError;
use sigil_store::StorageError;
use thiserror::Error;

use crate::negotiation::NegotiationState;

/// Errors from the negotiation state machine and authenticated channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// Transition absent from the legal-transition table
    #[error("invalid state transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Ratchet being moved
        id: RatchetId,
        /// Current state
        from: NegotiationState,
        /// Requested state
        to: NegotiationState,
    },

    /// Ratchet is not tracked
    #[error("ratchet {id} not found")]
    NotFound {
        /// Ratchet that was looked up
        id: RatchetId,
    },

    /// No send ratchet can carry traffic
    #[error("no usable send ratchet")]
    NoSendRatchet,

    /// Every usable key of the send ratchet has been spent
    #[error("send ratchet {id} is out of keys")]
    KeysExhausted {
        /// Exhausted ratchet
        id: RatchetId,
    },

    /// Inbound fingerprint is not registered with this channel
    #[error("unknown fingerprint {0:?}")]
    UnknownFingerprint(Fingerprint),

    /// Parameters out of bounds
    #[error("invalid params: {reason}")]
    InvalidParams {
        /// What is out of bounds
        reason: String,
    },

    /// Persisted channel state could not be decoded
    #[error("corrupt channel state: {reason}")]
    Corrupt {
        /// Decoder message
        reason: String,
    },

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Malformed payload
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl NegotiationError {
    /// Whether the caller should rekey instead of failing.
    pub fn requires_rekey(&self) -> bool {
        match self {
            Self::KeysExhausted { .. } => true,
            Self::Crypto(err) => err.requires_rekey(),
            _ => false,
        }
    }

    /// Whether local state may be inconsistent after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Corrupt { .. } | Self::Storage(_) => true,
            Self::Crypto(err) => err.is_fatal(),
            _ => false,
        }
    }
}
