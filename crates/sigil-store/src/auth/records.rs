//! Persisted negotiation records.

use std::fmt;

use serde::{Deserialize, Serialize};
use sigil_crypto::{Fingerprint, HASH_LEN, MAC_LEN, OWNERSHIP_PROOF_LEN};
use sigil_proto::PartnerId;
use zeroize::Zeroize;

/// `H(partner ephemeral public ‖ partner PQ public)`, identifying one
/// negotiation attempt for duplicate detection.
pub type NegotiationFingerprint = [u8; HASH_LEN];

/// Which side of a negotiation a request record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// We asked the partner for a channel.
    Sent,
    /// The partner asked us.
    Received,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => f.write_str("sent"),
            Self::Received => f.write_str("received"),
        }
    }
}

/// Outstanding request we sent, kept until the partner's confirm arrives.
///
/// Holds the ephemeral private keys of the request, so the channel can be
/// built when the confirm is processed. Private keys are wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRequest {
    /// Partner the request was addressed to.
    pub partner: PartnerId,
    /// Partner's long-lived classical public key.
    pub partner_historical_public: Vec<u8>,
    /// Our ephemeral classical private key.
    pub my_dh_private: Vec<u8>,
    /// Our ephemeral classical public key.
    pub my_dh_public: Vec<u8>,
    /// Our post-quantum private key.
    pub my_pq_private: Vec<u8>,
    /// Our post-quantum public key.
    pub my_pq_public: Vec<u8>,
    /// Fingerprint the partner's confirm will arrive under.
    pub confirm_fingerprint: Fingerprint,
    /// Facts sent with the request.
    pub facts: Vec<String>,
    /// Whether this request replaces an existing channel.
    pub reset: bool,
}

impl Drop for SentRequest {
    fn drop(&mut self) {
        self.my_dh_private.zeroize();
        self.my_pq_private.zeroize();
    }
}

impl fmt::Debug for SentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentRequest")
            .field("partner", &self.partner)
            .field("confirm_fingerprint", &self.confirm_fingerprint)
            .field("facts", &self.facts)
            .field("reset", &self.reset)
            .finish_non_exhaustive()
    }
}

/// Request received from a partner and not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedRequest {
    /// Requesting partner.
    pub partner: PartnerId,
    /// Partner's ephemeral classical public key.
    pub partner_dh_public: Vec<u8>,
    /// Partner's post-quantum public key.
    pub partner_pq_public: Vec<u8>,
    /// Proof the partner holds its historical key.
    pub ownership_proof: [u8; OWNERSHIP_PROOF_LEN],
    /// Facts the partner disclosed.
    pub facts: Vec<String>,
    /// Whether the partner asked to replace an existing channel.
    pub reset: bool,
    /// Transport round the request arrived in.
    pub round: u64,
}

/// A confirm exactly as it was sent, for verbatim replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Encoded base-format payload.
    pub payload: Vec<u8>,
    /// Transport fingerprint.
    pub fingerprint: Fingerprint,
    /// Transport MAC.
    pub mac: [u8; MAC_LEN],
}

/// Partner and kind of one outstanding request, as listed in the request map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RequestEntry {
    pub kind: RequestKind,
    pub partner: PartnerId,
}
