//! Transport seam and an in-process loopback network.
//!
//! The manager never touches sockets. It hands finished [`Envelope`]s to a
//! [`Transport`] and is fed inbound frames by whoever drives it. The
//! [`LoopbackNetwork`] connects several managers in one process: every send
//! is encoded to bytes and queued for the recipient, so frames cross the same
//! codec a real network would use.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::BytesMut;
use sigil_proto::{Envelope, PartnerId, ProtocolError};
use thiserror::Error;

/// Transport round a message was sent in or received from.
pub type Round = u64;

/// Transport errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Recipient cannot be reached.
    #[error("partner {partner} is unreachable")]
    Unreachable {
        /// Intended recipient
        partner: PartnerId,
    },

    /// Envelope payload does not fit one transport payload.
    #[error("payload of {size} bytes exceeds transport payload of {max}")]
    TooLarge {
        /// Payload size
        size: usize,
        /// Transport payload size
        max: usize,
    },

    /// Envelope could not be framed.
    #[error("framing failed: {0}")]
    Framing(#[from] ProtocolError),
}

/// Outbound half of the network.
pub trait Transport: Send + Sync {
    /// Hand `envelope` to the network for `partner`.
    ///
    /// `critical` marks negotiation traffic that the network should keep
    /// retrying until it is delivered.
    fn send(
        &self,
        partner: &PartnerId,
        envelope: &Envelope,
        critical: bool,
    ) -> Result<Round, TransportError>;

    /// Size in bytes of one transport payload. Negotiation formats fill it
    /// exactly.
    fn payload_size(&self) -> usize;
}

/// Encoded envelope queued for a recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Round the sender was told
    pub round: Round,
    /// Encoded envelope
    pub frame: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    queues: HashMap<PartnerId, VecDeque<Delivery>>,
    offline: HashSet<PartnerId>,
    round: Round,
}

/// Shared in-memory network. Clones see the same queues.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `me` and return its sending half.
    pub fn join(&self, me: PartnerId, payload_size: usize) -> LoopbackTransport {
        self.state().queues.entry(me).or_default();
        LoopbackTransport { network: self.clone(), me, payload_size }
    }

    /// Mark `partner` unreachable (`false`) or reachable again (`true`).
    pub fn set_online(&self, partner: PartnerId, online: bool) {
        let mut state = self.state();
        if online {
            state.offline.remove(&partner);
        } else {
            state.offline.insert(partner);
        }
    }

    /// Take every frame queued for `partner`, oldest first.
    pub fn drain(&self, partner: &PartnerId) -> Vec<Delivery> {
        self.state()
            .queues
            .get_mut(partner)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Number of frames queued for `partner`.
    pub fn pending(&self, partner: &PartnerId) -> usize {
        self.state().queues.get(partner).map_or(0, VecDeque::len)
    }

    /// Queue raw bytes for `partner` as if a peer had sent them.
    pub fn inject(&self, partner: PartnerId, frame: Vec<u8>) -> Round {
        let mut state = self.state();
        state.round += 1;
        let round = state.round;
        state.queues.entry(partner).or_default().push_back(Delivery { round, frame });
        round
    }

    fn deliver(
        &self,
        from: PartnerId,
        to: &PartnerId,
        frame: Vec<u8>,
    ) -> Result<Round, TransportError> {
        let mut state = self.state();
        if state.offline.contains(to) || state.offline.contains(&from) {
            return Err(TransportError::Unreachable { partner: *to });
        }
        state.round += 1;
        let round = state.round;
        let Some(queue) = state.queues.get_mut(to) else {
            return Err(TransportError::Unreachable { partner: *to });
        };
        queue.push_back(Delivery { round, frame });
        Ok(round)
    }
}

/// One participant's sending half of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    me: PartnerId,
    payload_size: usize,
}

impl LoopbackTransport {
    /// Identity this transport sends as.
    pub fn me(&self) -> PartnerId {
        self.me
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &self,
        partner: &PartnerId,
        envelope: &Envelope,
        critical: bool,
    ) -> Result<Round, TransportError> {
        if envelope.payload.len() > self.payload_size {
            return Err(TransportError::TooLarge {
                size: envelope.payload.len(),
                max: self.payload_size,
            });
        }

        let mut frame = BytesMut::new();
        envelope.encode(&mut frame)?;
        let round = self.network.deliver(self.me, partner, frame.to_vec())?;

        tracing::trace!(
            from = %self.me,
            to = %partner,
            kind = ?envelope.kind,
            critical,
            round,
            "loopback delivery"
        );
        Ok(round)
    }

    fn payload_size(&self) -> usize {
        self.payload_size
    }
}
