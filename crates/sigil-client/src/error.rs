//! Client error types.
//!
//! Inbound traffic fails in two ways. Most failures mean the message is bad
//! (forged, stale, truncated) and it is dropped with a [`DropReason`]. The
//! rest are local failures (storage, transport) that the caller must see.

use sigil_core::NegotiationError;
use sigil_crypto::CryptoError;
use sigil_proto::{PartnerId, ProtocolError};
use sigil_store::{AuthStoreError, StorageError};
use thiserror::Error;

use crate::{event::DropReason, transport::TransportError};

/// Errors from [`crate::Manager`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// A channel with the partner already exists.
    #[error("channel with {partner} already exists")]
    ChannelExists {
        /// Partner with the channel
        partner: PartnerId,
    },

    /// No channel with the partner.
    #[error("no channel with {partner}")]
    NoChannel {
        /// Partner that was looked up
        partner: PartnerId,
    },

    /// The partner's ownership proof does not verify.
    #[error("ownership proof from {partner} does not verify")]
    OwnershipProof {
        /// Sender of the proof
        partner: PartnerId,
    },

    /// Requests crossed and the partner is the one that confirms.
    #[error("request from {partner} crossed ours; waiting for its confirm")]
    CrossedRequest {
        /// Partner whose request crossed ours
        partner: PartnerId,
    },

    /// Request fingerprint does not belong to this identity.
    #[error("request is not addressed to this identity")]
    Misaddressed,

    /// Manager configuration is unusable.
    #[error("invalid config: {reason}")]
    Config {
        /// What is wrong
        reason: String,
    },

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Channel state machine failure.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// Auth store failure.
    #[error(transparent)]
    AuthStore(#[from] AuthStoreError),

    /// Malformed wire data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Cryptographic failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ClientError {
    /// Reason to drop the inbound message that caused this error, or `None`
    /// if the error is local and must reach the caller.
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Self::Misaddressed => Some(DropReason::UnknownFingerprint),
            Self::OwnershipProof { .. } => Some(DropReason::OwnershipProof),
            Self::ChannelExists { .. } => Some(DropReason::ChannelExists),
            Self::Protocol(_) => Some(DropReason::Malformed),
            Self::Crypto(err) => crypto_drop_reason(err),
            Self::Negotiation(err) => match err {
                NegotiationError::UnknownFingerprint(_) => Some(DropReason::UnknownFingerprint),
                NegotiationError::NotFound { .. } | NegotiationError::InvalidTransition { .. } => {
                    Some(DropReason::Stale)
                },
                NegotiationError::Protocol(_) => Some(DropReason::Malformed),
                NegotiationError::Crypto(err) => crypto_drop_reason(err),
                _ => None,
            },
            Self::AuthStore(err) if err.is_not_found() => Some(DropReason::Stale),
            _ => None,
        }
    }

    /// Whether local state may be inconsistent after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Negotiation(err) => err.is_fatal(),
            Self::AuthStore(err) => err.is_fatal(),
            Self::Crypto(err) => err.is_fatal(),
            Self::Storage(_) => true,
            _ => false,
        }
    }
}

fn crypto_drop_reason(err: &CryptoError) -> Option<DropReason> {
    match err {
        CryptoError::AuthenticationFailure => Some(DropReason::AuthenticationFailed),
        CryptoError::KeyReused { .. } => Some(DropReason::Duplicate),
        CryptoError::UnknownFingerprint => Some(DropReason::UnknownFingerprint),
        CryptoError::InvalidKey { .. } | CryptoError::FormatTooSmall { .. } => {
            Some(DropReason::Malformed)
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use sigil_crypto::RatchetId;

    use super::*;

    #[test]
    fn peer_faults_are_dropped() {
        assert_eq!(
            ClientError::Crypto(CryptoError::AuthenticationFailure).drop_reason(),
            Some(DropReason::AuthenticationFailed)
        );
        assert_eq!(
            ClientError::Negotiation(NegotiationError::NotFound { id: RatchetId::new([1; 32]) })
                .drop_reason(),
            Some(DropReason::Stale)
        );
        assert_eq!(
            ClientError::Protocol(ProtocolError::UnknownKind(99)).drop_reason(),
            Some(DropReason::Malformed)
        );
    }

    #[test]
    fn local_faults_surface() {
        let storage = ClientError::Storage(StorageError::Io("disk".to_string()));
        assert_eq!(storage.drop_reason(), None);
        assert!(storage.is_fatal());

        let transport = ClientError::Transport(TransportError::TooLarge { size: 2, max: 1 });
        assert_eq!(transport.drop_reason(), None);
        assert!(!transport.is_fatal());
    }
}
