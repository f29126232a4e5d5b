//! Outcomes of processing one inbound frame.

use sigil_crypto::RatchetId;
use sigil_proto::PartnerId;

/// What an inbound frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// A request was stored; the request callback fired.
    RequestReceived {
        /// Requesting partner
        partner: PartnerId,
    },
    /// A channel was created, either from a confirm or by auto-confirming a
    /// crossed request.
    Confirmed {
        /// Partner of the new channel
        partner: PartnerId,
    },
    /// The partner reset the channel and a new one was confirmed.
    Reset {
        /// Partner that reset
        partner: PartnerId,
    },
    /// A request crossed ours; the partner will confirm ours instead.
    Deferred {
        /// Partner whose request crossed ours
        partner: PartnerId,
    },
    /// The partner acknowledged our confirm.
    Acknowledged {
        /// Acknowledging partner
        partner: PartnerId,
    },
    /// We built a receive ratchet for the partner's rekey.
    RekeyAccepted {
        /// Rekeying partner
        partner: PartnerId,
        /// New receive ratchet
        ratchet: RatchetId,
    },
    /// The partner confirmed our rekey.
    RekeyConfirmed {
        /// Confirming partner
        partner: PartnerId,
        /// Send ratchet now confirmed
        ratchet: RatchetId,
    },
    /// Application data.
    Message {
        /// Sender
        partner: PartnerId,
        /// Decrypted body
        body: Vec<u8>,
    },
    /// The frame was discarded.
    Dropped(DropReason),
}

/// Why an inbound frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No request, confirm or channel key matches the fingerprint
    UnknownFingerprint,
    /// Bytes do not parse
    Malformed,
    /// MAC check failed
    AuthenticationFailed,
    /// Ownership proof does not verify
    OwnershipProof,
    /// Already processed
    Duplicate,
    /// Refers to a negotiation or ratchet that has moved on
    Stale,
    /// A channel with the sender already exists
    ChannelExists,
}
