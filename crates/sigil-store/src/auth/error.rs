//! Auth store error types.

use sigil_proto::PartnerId;
use thiserror::Error;

use super::RequestKind;
use crate::storage::StorageError;

/// Errors from [`super::AuthStore`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthStoreError {
    /// No outstanding request of this kind for the partner.
    #[error("no {kind} request for partner {partner}")]
    NotFound {
        /// Partner that was looked up
        partner: PartnerId,
        /// Side that was looked up
        kind: RequestKind,
    },

    /// A request for the partner is already outstanding.
    #[error("a {kind} request for partner {partner} already exists")]
    RequestAlreadyExists {
        /// Partner with the outstanding request
        partner: PartnerId,
        /// Side of the outstanding request
        kind: RequestKind,
    },

    /// No confirm has been stored for the partner.
    #[error("no stored confirmation for partner {partner}")]
    NoConfirmation {
        /// Partner that was looked up
        partner: PartnerId,
    },

    /// The request map no longer lists the record but the record itself could
    /// not be removed.
    #[error("{kind} request for {partner} unlinked but not deleted: {reason}")]
    PartialDelete {
        /// Partner whose record was orphaned
        partner: PartnerId,
        /// Side of the orphaned record
        kind: RequestKind,
        /// Underlying storage failure
        reason: String,
    },

    /// A record the store depends on is missing or unreadable.
    #[error("corrupt auth store record {key}: {reason}")]
    Corrupt {
        /// Storage key
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// Persistence failed; in-memory state was left unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthStoreError {
    /// Whether the store's durable state may no longer match memory.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PartialDelete { .. } | Self::Corrupt { .. })
    }

    /// Whether this is a missing-request lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
