//! Authenticated channel: every ratchet shared with one partner.
//!
//! Send ratchets are wrapped in [`SendSession`]s and tracked by negotiation
//! state. Receive ratchets are kept oldest first and indexed by fingerprint,
//! so an inbound message finds its key without trial decryption.
//!
//! # Lifecycle
//!
//! 1. The responder builds its channel from the request. Its send ratchet
//!    starts `NewSessionTriggered`; if the confirm cannot be sent it moves to
//!    `NewSessionCreated`.
//! 2. The requester builds its channel from the confirm. Its send ratchet
//!    starts `Confirmed`, and it acknowledges.
//! 3. The acknowledgement promotes the responder's ratchet to `Confirmed`.
//! 4. Any inbound message promotes the responder's only send ratchet if the
//!    acknowledgement was lost.
//! 5. A confirmed ratchet past its threshold spawns a successor in `Sending`
//!    and moves to `NewSessionCreated`. The successor moves to `Sent` once
//!    handed to the transport, or back to `Unconfirmed` if that fails.
//! 6. The partner builds a receive ratchet against the successor's key and
//!    confirms.
//! 7. The confirm moves the successor to `Confirmed` and retires its parent.
//!
//! # Persistence
//!
//! Every mutation runs on a copy of the ratchet state. The copy replaces the
//! live state, and the [`CypherHandler`] hears about changed fingerprints,
//! only once the copy has been written. A failed write leaves the channel
//! exactly as it was, consumed keys included.

use std::{collections::HashMap, fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use sigil_crypto::{
    DefaultNike, EncryptedMessage, Fingerprint, Nike, NikePublicKey, RatchetId, ReceiveRatchet,
    SendRatchet, make_relationship_fingerprint,
};
use sigil_proto::{PartnerId, RekeyTrigger};
use sigil_store::Storage;

use crate::{
    env::Environment,
    error::NegotiationError,
    negotiation::{NegotiationState, NegotiationTracker},
    params::Params,
    session::{Budget, SendSession, SessionStatus},
};

const CHANNEL_PREFIX: &str = "channel/";
const CHANNEL_VERSION: u64 = 0;

/// Send ratchet states tried by [`AuthenticatedChannel::encrypt`], in order.
const SEND_PRIORITY: [NegotiationState; 4] = [
    NegotiationState::Confirmed,
    NegotiationState::NewSessionCreated,
    NegotiationState::NewSessionTriggered,
    NegotiationState::Sent,
];

/// Receiver of receive-side key fingerprints.
///
/// The message layer uses these to route inbound ciphertext to a channel.
pub trait CypherHandler: Send + Sync {
    /// `fingerprint` now identifies a key shared with `partner`.
    fn add_key(&self, fingerprint: Fingerprint, partner: PartnerId);

    /// `fingerprint` will no longer decrypt.
    fn delete_key(&self, fingerprint: Fingerprint);
}

/// Which side of the initial negotiation built the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the request, built the channel from the confirm
    Requester,
    /// Received the request, built the channel to confirm it
    Responder,
}

/// Key material of the initial ratchets.
pub struct ChannelKeys<N: Nike> {
    /// Our private key for this channel
    pub my_private: N::PrivateKey,
    /// Our public key for this channel
    pub my_public: N::PublicKey,
    /// The partner's public key for this channel
    pub partner_public: N::PublicKey,
}

/// Work the caller must hand to the transport after a trigger pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAction {
    /// A successor was spawned; offer it to the partner
    Rekey {
        /// The new send ratchet
        ratchet: RatchetId,
        /// Body of the rekey message
        trigger: RekeyTrigger,
    },
    /// An unconfirmed successor is offered again
    Resend {
        /// The unconfirmed send ratchet
        ratchet: RatchetId,
        /// Body of the rekey message
        trigger: RekeyTrigger,
    },
}

/// Output of [`AuthenticatedChannel::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Send ratchet that produced the message
    pub ratchet: RatchetId,
    /// Ciphertext and fingerprint
    pub message: EncryptedMessage,
    /// Usage of that ratchet after this message
    pub status: SessionStatus,
}

/// Output of [`AuthenticatedChannel::decrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    /// Receive ratchet that held the key
    pub ratchet: RatchetId,
    /// Decrypted bytes
    pub plaintext: Vec<u8>,
    /// Whether the message promoted an unacknowledged send ratchet
    pub promoted: bool,
}

#[derive(Serialize, Deserialize)]
struct SessionDisk {
    state: NegotiationState,
    parent: Option<RatchetId>,
    ratchet: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ChannelDisk {
    me: PartnerId,
    partner: PartnerId,
    params: Params,
    sessions: Vec<SessionDisk>,
    receivers: Vec<Vec<u8>>,
}

fn channel_key(partner: &PartnerId) -> String {
    format!("{CHANNEL_PREFIX}{}", STANDARD.encode(partner.as_bytes()))
}

/// Fingerprint change owed to the [`CypherHandler`].
#[derive(Clone, Copy)]
enum KeyEvent {
    Added(Fingerprint),
    Removed(Fingerprint),
}

/// Mutable ratchet state of a channel.
struct Ratchets<N: Nike> {
    sessions: HashMap<RatchetId, SendSession<N>>,
    tracker: NegotiationTracker,
    /// Oldest first
    receivers: Vec<ReceiveRatchet<N>>,
    fingerprints: HashMap<Fingerprint, RatchetId>,
    /// Delivered to the handler on commit
    events: Vec<KeyEvent>,
}

impl<N: Nike> Clone for Ratchets<N> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            tracker: self.tracker.clone(),
            receivers: self.receivers.clone(),
            fingerprints: self.fingerprints.clone(),
            events: self.events.clone(),
        }
    }
}

impl<N: Nike> Ratchets<N> {
    fn empty() -> Self {
        Self {
            sessions: HashMap::new(),
            tracker: NegotiationTracker::new(),
            receivers: Vec::new(),
            fingerprints: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn insert_session(&mut self, session: SendSession<N>, state: NegotiationState) {
        self.tracker.insert(session.id(), state);
        self.sessions.insert(session.id(), session);
    }

    fn register(&mut self, receiver: ReceiveRatchet<N>) {
        let id = receiver.id();
        for fingerprint in receiver.fingerprints() {
            self.fingerprints.insert(*fingerprint, id);
        }
        self.events.extend(receiver.unused_fingerprints().into_iter().map(KeyEvent::Added));
        self.receivers.push(receiver);
    }

    fn receiver(&self, id: &RatchetId) -> Option<&ReceiveRatchet<N>> {
        self.receivers.iter().find(|receiver| receiver.id() == *id)
    }

    fn seal(
        &mut self,
        plaintext: &[u8],
        reserved: bool,
    ) -> Result<(RatchetId, EncryptedMessage, SessionStatus), NegotiationError> {
        let candidates: Vec<RatchetId> = SEND_PRIORITY
            .iter()
            .flat_map(|state| self.tracker.ids_in(*state).iter().rev().copied())
            .collect();

        let mut exhausted = None;
        for id in candidates {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            let result =
                if reserved { session.pop_rekey(plaintext) } else { session.pop_key(plaintext) };
            match result {
                Ok(message) => return Ok((id, message, session.status())),
                Err(err) if err.requires_rekey() => {
                    exhausted.get_or_insert(NegotiationError::KeysExhausted { id });
                },
                Err(err) => return Err(err),
            }
        }
        Err(exhausted.unwrap_or(NegotiationError::NoSendRatchet))
    }

    /// Decrypt and consume the key. Returns the plaintext and the receive
    /// ratchet pruned as spent, if any.
    fn open(
        &mut self,
        id: RatchetId,
        message: &EncryptedMessage,
    ) -> Result<(Vec<u8>, Option<RatchetId>), NegotiationError> {
        let index = self
            .receivers
            .iter()
            .position(|receiver| receiver.id() == id)
            .ok_or(NegotiationError::NotFound { id })?;

        let plaintext = self.receivers[index].decrypt(message)?;
        self.events.push(KeyEvent::Removed(message.fingerprint));

        let mut pruned = None;
        if self.receivers[index].num_available() == 0 && index + 1 < self.receivers.len() {
            let spent = self.receivers.remove(index).id();
            self.fingerprints.retain(|_, owner| *owner != spent);
            pruned = Some(spent);
        }
        Ok((plaintext, pruned))
    }

    /// The only send ratchet, if it still awaits its acknowledgement.
    fn unacknowledged(&self) -> Option<(RatchetId, NegotiationState)> {
        if self.sessions.len() != 1 {
            return None;
        }
        self.tracker.iter().next().filter(|(_, state)| {
            matches!(state, NegotiationState::NewSessionTriggered | NegotiationState::NewSessionCreated)
        })
    }

    fn confirm(&mut self, id: RatchetId, state: NegotiationState) -> Result<(), NegotiationError> {
        if state == NegotiationState::NewSessionCreated {
            self.tracker.set_state(id, NegotiationState::Sent)?;
        }
        self.tracker.set_state(id, NegotiationState::Confirmed).map(|_| ())
    }

    /// Spawn the successor of a `NewSessionTriggered` ratchet.
    ///
    /// The successor starts in `Sending`; the parent moves to
    /// `NewSessionCreated`.
    fn spawn_successor<E: Environment>(
        &mut self,
        parent: RatchetId,
        params: &Params,
        env: &E,
    ) -> Result<(RatchetId, RekeyTrigger), NegotiationError> {
        let successor = self
            .sessions
            .get(&parent)
            .ok_or(NegotiationError::NotFound { id: parent })?
            .next(&mut env.rng(), params);
        let id = successor.id();
        let trigger =
            RekeyTrigger { previous: parent, public_key: successor.ratchet().my_public_key().to_bytes() };

        self.insert_session(successor, NegotiationState::Sending);
        self.tracker.set_state(parent, NegotiationState::NewSessionCreated)?;
        Ok((id, trigger))
    }

    fn resend_trigger(&self, id: RatchetId) -> Result<RekeyTrigger, NegotiationError> {
        let session = self.sessions.get(&id).ok_or(NegotiationError::NotFound { id })?;
        Ok(RekeyTrigger {
            previous: session.parent().unwrap_or(id),
            public_key: session.ratchet().my_public_key().to_bytes(),
        })
    }

    /// Confirm a successor and retire its parent. Returns the retired id.
    fn confirm_successor(&mut self, id: RatchetId) -> Result<Option<RatchetId>, NegotiationError> {
        self.tracker.set_state(id, NegotiationState::Confirmed)?;

        let parent = self.sessions.get(&id).and_then(SendSession::parent);
        match parent {
            Some(parent) if self.tracker.state(&parent) == Some(NegotiationState::NewSessionCreated) => {
                self.tracker.remove(&parent);
                self.sessions.remove(&parent);
                Ok(Some(parent))
            },
            _ => Ok(None),
        }
    }
}

/// All ratchets shared with one partner.
pub struct AuthenticatedChannel<S: Storage, N: Nike = DefaultNike> {
    me: PartnerId,
    partner: PartnerId,
    params: Params,
    ratchets: Ratchets<N>,
    storage: S,
    handler: Arc<dyn CypherHandler>,
}

impl<S: Storage, N: Nike> AuthenticatedChannel<S, N> {
    /// Build and persist a fresh channel.
    ///
    /// Both ratchets derive from `(my_private, partner_public)`; each
    /// direction is salted with its own relationship fingerprint.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::InvalidParams` if `params` do not validate
    /// - `NegotiationError::Storage` if the channel cannot be persisted
    pub fn new(
        storage: S,
        me: PartnerId,
        partner: PartnerId,
        keys: ChannelKeys<N>,
        role: Role,
        params: Params,
        handler: Arc<dyn CypherHandler>,
    ) -> Result<Self, NegotiationError> {
        params.validate()?;

        let my_public = keys.my_public.to_bytes();
        let partner_public = keys.partner_public.to_bytes();
        let send_salt =
            make_relationship_fingerprint(&my_public, &partner_public, me.as_bytes(), partner.as_bytes());
        let receive_salt =
            make_relationship_fingerprint(&partner_public, &my_public, partner.as_bytes(), me.as_bytes());

        let receiver = ReceiveRatchet::new_sized(
            keys.my_private.clone(),
            keys.partner_public.clone(),
            &receive_salt,
            |secret| Budget::from_secret(&params, secret).size(),
        );
        let session = SendSession::new(
            keys.my_private,
            keys.my_public,
            keys.partner_public,
            &send_salt,
            &params,
        );

        let state = match role {
            Role::Requester => NegotiationState::Confirmed,
            Role::Responder => NegotiationState::NewSessionTriggered,
        };

        let mut channel =
            Self { me, partner, params, ratchets: Ratchets::empty(), storage, handler };
        channel.transact(|ratchets| {
            ratchets.insert_session(session, state);
            ratchets.register(receiver);
            Ok(())
        })?;

        tracing::info!(partner = %partner, ?role, "authenticated channel created");
        Ok(channel)
    }

    /// Restore the channel with `partner`, if one was saved.
    ///
    /// Unused receive fingerprints are re-announced to `handler`.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::Storage` if the record cannot be read
    /// - `NegotiationError::Corrupt` if a stored ratchet does not decode
    pub fn load(
        storage: S,
        partner: &PartnerId,
        handler: Arc<dyn CypherHandler>,
    ) -> Result<Option<Self>, NegotiationError> {
        let Some(disk) = storage.get_record::<ChannelDisk>(&channel_key(partner), CHANNEL_VERSION)?
        else {
            return Ok(None);
        };
        let corrupt = |err: sigil_crypto::CryptoError| NegotiationError::Corrupt {
            reason: format!("channel with {partner}: {err}"),
        };

        let mut ratchets = Ratchets::empty();
        for stored in disk.sessions {
            let ratchet = SendRatchet::<N>::from_bytes(&stored.ratchet).map_err(corrupt)?;
            ratchets.insert_session(
                SendSession::from_parts(ratchet, &disk.params, stored.parent),
                stored.state,
            );
        }
        for blob in disk.receivers {
            ratchets.register(ReceiveRatchet::<N>::from_bytes(&blob).map_err(corrupt)?);
        }

        let mut channel = Self {
            me: disk.me,
            partner: disk.partner,
            params: disk.params,
            ratchets: Ratchets::empty(),
            storage,
            handler,
        };
        channel.commit(ratchets);

        tracing::debug!(
            partner = %partner,
            send = channel.ratchets.sessions.len(),
            receive = channel.ratchets.receivers.len(),
            "authenticated channel loaded"
        );
        Ok(Some(channel))
    }

    /// Persist the whole channel.
    ///
    /// In-flight states are written as their settled counterparts.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::Storage` if the write fails
    pub fn save(&self) -> Result<(), NegotiationError> {
        self.persist(&self.ratchets)
    }

    fn persist(&self, ratchets: &Ratchets<N>) -> Result<(), NegotiationError> {
        let mut sessions = Vec::with_capacity(ratchets.sessions.len());
        for (id, state) in ratchets.tracker.iter() {
            let Some(session) = ratchets.sessions.get(&id) else {
                continue;
            };
            sessions.push(SessionDisk {
                state: state.persisted(),
                parent: session.parent(),
                ratchet: session.ratchet().to_bytes()?,
            });
        }
        let receivers =
            ratchets.receivers.iter().map(ReceiveRatchet::to_bytes).collect::<Result<Vec<_>, _>>()?;

        let disk = ChannelDisk {
            me: self.me,
            partner: self.partner,
            params: self.params,
            sessions,
            receivers,
        };
        self.storage.set_record(&channel_key(&self.partner), CHANNEL_VERSION, &disk)?;
        Ok(())
    }

    /// Run `op` on a copy of the ratchets, persist the copy and only then
    /// make it live.
    fn transact<T>(
        &mut self,
        op: impl FnOnce(&mut Ratchets<N>) -> Result<T, NegotiationError>,
    ) -> Result<T, NegotiationError> {
        let mut next = self.ratchets.clone();
        let value = op(&mut next)?;
        self.persist(&next)?;
        self.commit(next);
        Ok(value)
    }

    fn commit(&mut self, mut next: Ratchets<N>) {
        for event in next.events.drain(..) {
            match event {
                KeyEvent::Added(fingerprint) => self.handler.add_key(fingerprint, self.partner),
                KeyEvent::Removed(fingerprint) => self.handler.delete_key(fingerprint),
            }
        }
        self.ratchets = next;
    }

    /// Remove the channel from storage and withdraw its fingerprints.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::Storage` if the record cannot be deleted
    pub fn delete(&self) -> Result<(), NegotiationError> {
        self.storage.delete(&channel_key(&self.partner))?;
        for receiver in &self.ratchets.receivers {
            for fingerprint in receiver.unused_fingerprints() {
                self.handler.delete_key(fingerprint);
            }
        }
        tracing::info!(partner = %self.partner, "authenticated channel deleted");
        Ok(())
    }

    /// Move a send ratchet to `state` and persist.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::NotFound` if the ratchet is not tracked
    /// - `NegotiationError::InvalidTransition` if the move is not legal
    /// - `NegotiationError::Storage` if the new state cannot be persisted
    pub fn set_state(&mut self, id: RatchetId, state: NegotiationState) -> Result<(), NegotiationError> {
        self.transact(|ratchets| ratchets.tracker.set_state(id, state).map(|_| ()))
    }

    /// Current state of a send ratchet.
    pub fn state(&self, id: &RatchetId) -> Option<NegotiationState> {
        self.ratchets.tracker.state(id)
    }

    /// Ids of all send ratchets.
    pub fn send_ratchets(&self) -> Vec<RatchetId> {
        self.ratchets.tracker.iter().map(|(id, _)| id).collect()
    }

    /// Ids of send ratchets in `state`, oldest first.
    pub fn send_ratchets_by_state(&self, state: NegotiationState) -> Vec<RatchetId> {
        self.ratchets.tracker.ids_in(state).to_vec()
    }

    /// Ids of all receive ratchets, oldest first.
    pub fn receive_ratchets(&self) -> Vec<RatchetId> {
        self.ratchets.receivers.iter().map(ReceiveRatchet::id).collect()
    }

    /// Send session by id.
    pub fn session(&self, id: &RatchetId) -> Option<&SendSession<N>> {
        self.ratchets.sessions.get(id)
    }

    /// Receive ratchet by id.
    pub fn receive_ratchet(&self, id: &RatchetId) -> Option<&ReceiveRatchet<N>> {
        self.ratchets.receiver(id)
    }

    /// Encrypt application data.
    ///
    /// Uses the newest `Confirmed` send ratchet with normal budget left,
    /// falling back to `NewSessionCreated`, `NewSessionTriggered` and `Sent`
    /// ratchets in that order.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::NoSendRatchet` if no ratchet may carry traffic
    /// - `NegotiationError::KeysExhausted` if every candidate is out of
    ///   keys; the caller should rekey
    /// - `NegotiationError::Storage` if the used key cannot be persisted;
    ///   the key stays unused
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Sealed, NegotiationError> {
        self.seal(plaintext, false)
    }

    /// Encrypt a control message, drawing on reserved rekey keys if needed.
    ///
    /// # Errors
    ///
    /// See [`Self::encrypt`].
    pub fn encrypt_reserved(&mut self, plaintext: &[u8]) -> Result<Sealed, NegotiationError> {
        self.seal(plaintext, true)
    }

    fn seal(&mut self, plaintext: &[u8], reserved: bool) -> Result<Sealed, NegotiationError> {
        let (ratchet, message, status) =
            self.transact(|ratchets| ratchets.seal(plaintext, reserved))?;
        if status != SessionStatus::Active {
            tracing::debug!(partner = %self.partner, %ratchet, ?status, "send ratchet running low");
        }
        Ok(Sealed { ratchet, message, status })
    }

    /// Decrypt an inbound message.
    ///
    /// If the channel has a single send ratchet still awaiting its
    /// acknowledgement, the message proves the partner holds the keys and the
    /// ratchet is promoted to `Confirmed`.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::UnknownFingerprint` if no receive ratchet owns
    ///   the fingerprint
    /// - `NegotiationError::Crypto` on MAC failure or key reuse
    /// - `NegotiationError::Storage` if the used key cannot be persisted
    ///
    /// Nothing is consumed on error.
    pub fn decrypt(&mut self, message: &EncryptedMessage) -> Result<Opened, NegotiationError> {
        let fingerprint = message.fingerprint;
        let id = *self
            .ratchets
            .fingerprints
            .get(&fingerprint)
            .ok_or(NegotiationError::UnknownFingerprint(fingerprint))?;

        let (plaintext, promoted, pruned) = self.transact(|ratchets| {
            let (plaintext, pruned) = ratchets.open(id, message)?;
            let promoted = ratchets.unacknowledged();
            if let Some((send, state)) = promoted {
                ratchets.confirm(send, state)?;
            }
            Ok((plaintext, promoted, pruned))
        })?;

        if let Some((send, state)) = promoted {
            tracing::warn!(
                partner = %self.partner,
                ratchet = %send,
                ?state,
                "promoted unacknowledged send ratchet on inbound message"
            );
        }
        if let Some(spent) = pruned {
            tracing::debug!(partner = %self.partner, ratchet = %spent, "spent receive ratchet pruned");
        }
        Ok(Opened { ratchet: id, plaintext, promoted: promoted.is_some() })
    }

    /// Promote a send ratchet to `Confirmed` on the partner's
    /// acknowledgement. Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::NotFound` if the ratchet is not tracked
    /// - `NegotiationError::InvalidTransition` if it is `Unconfirmed`
    /// - `NegotiationError::Storage` if the new state cannot be persisted
    pub fn promote(&mut self, id: RatchetId) -> Result<bool, NegotiationError> {
        let state = self.state(&id).ok_or(NegotiationError::NotFound { id })?;
        if state == NegotiationState::Confirmed {
            return Ok(false);
        }
        self.transact(|ratchets| ratchets.confirm(id, state))?;
        tracing::info!(partner = %self.partner, ratchet = %id, "send ratchet acknowledged");
        Ok(true)
    }

    /// Run one trigger pass over the send ratchets.
    ///
    /// Confirmed ratchets past their threshold spawn a successor; unconfirmed
    /// successors are offered again at the configured retry ratio.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::Storage` if the new state cannot be persisted
    pub fn trigger_negotiations<E: Environment>(
        &mut self,
        env: &E,
    ) -> Result<Vec<ChannelAction>, NegotiationError> {
        let params = self.params;
        let decisions: Vec<(RatchetId, NegotiationState)> = self
            .ratchets
            .tracker
            .iter()
            .filter_map(|(id, state)| {
                self.ratchets
                    .sessions
                    .get(&id)
                    .and_then(|session| session.trigger_negotiation(state, &params, env))
                    .map(|to| (id, to))
            })
            .collect();
        if decisions.is_empty() {
            return Ok(Vec::new());
        }

        let actions = self.transact(|ratchets| {
            let mut actions = Vec::with_capacity(decisions.len());
            for (id, to) in decisions {
                ratchets.tracker.set_state(id, to)?;
                if to == NegotiationState::NewSessionTriggered {
                    let (ratchet, trigger) = ratchets.spawn_successor(id, &params, env)?;
                    actions.push(ChannelAction::Rekey { ratchet, trigger });
                } else {
                    let trigger = ratchets.resend_trigger(id)?;
                    actions.push(ChannelAction::Resend { ratchet: id, trigger });
                }
            }
            Ok(actions)
        })?;

        for action in &actions {
            match action {
                ChannelAction::Rekey { ratchet, trigger } => tracing::info!(
                    partner = %self.partner,
                    parent = %trigger.previous,
                    %ratchet,
                    "rekey triggered"
                ),
                ChannelAction::Resend { ratchet, .. } => {
                    tracing::debug!(partner = %self.partner, %ratchet, "resending unconfirmed rekey");
                },
            }
        }
        Ok(actions)
    }

    /// Record that a rekey or confirm for `id` reached the transport.
    ///
    /// # Errors
    ///
    /// See [`Self::set_state`].
    pub fn mark_sent(&mut self, id: RatchetId) -> Result<(), NegotiationError> {
        self.set_state(id, NegotiationState::Sent)
    }

    /// Return a `Sending` ratchet to `Unconfirmed` so a later trigger pass
    /// resends it.
    ///
    /// # Errors
    ///
    /// See [`Self::set_state`].
    pub fn unconfirm(&mut self, id: RatchetId) -> Result<(), NegotiationError> {
        self.set_state(id, NegotiationState::Unconfirmed)
    }

    /// Record that the confirm for the responder's ratchet could not be
    /// sent.
    ///
    /// # Errors
    ///
    /// See [`Self::set_state`].
    pub fn mark_confirm_failed(&mut self, id: RatchetId) -> Result<(), NegotiationError> {
        self.set_state(id, NegotiationState::NewSessionCreated)
    }

    /// Build the receive ratchet for a partner's rekey offer.
    ///
    /// Idempotent: a repeated trigger returns the id of the ratchet built the
    /// first time.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::Crypto` if the offered key is invalid
    /// - `NegotiationError::NotFound` if the channel has no receive ratchet
    /// - `NegotiationError::Storage` if the ratchet cannot be persisted
    pub fn handle_rekey_trigger(&mut self, trigger: &RekeyTrigger) -> Result<RatchetId, NegotiationError> {
        let partner_public = N::public_key_from_bytes(&trigger.public_key)?;
        let base = self
            .ratchets
            .receiver(&trigger.previous)
            .or_else(|| self.ratchets.receivers.last())
            .ok_or(NegotiationError::NotFound { id: trigger.previous })?;

        let params = self.params;
        let receiver =
            base.next_sized(partner_public, |secret| Budget::from_secret(&params, secret).size());
        let id = receiver.id();

        if self.ratchets.receiver(&id).is_some() {
            tracing::debug!(partner = %self.partner, ratchet = %id, "duplicate rekey trigger");
            return Ok(id);
        }

        self.transact(|ratchets| {
            ratchets.register(receiver);
            Ok(())
        })?;
        tracing::info!(partner = %self.partner, previous = %trigger.previous, ratchet = %id, "rekey accepted");
        Ok(id)
    }

    /// Confirm a successor on the partner's receipt and retire its parent.
    /// Returns whether anything changed.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::NotFound` if the ratchet is not tracked
    /// - `NegotiationError::InvalidTransition` if it was never offered
    /// - `NegotiationError::Storage` if the new state cannot be persisted
    pub fn handle_rekey_confirm(&mut self, id: RatchetId) -> Result<bool, NegotiationError> {
        let state = self.state(&id).ok_or(NegotiationError::NotFound { id })?;
        if state == NegotiationState::Confirmed {
            return Ok(false);
        }

        let retired = self.transact(|ratchets| ratchets.confirm_successor(id))?;
        if let Some(parent) = retired {
            tracing::debug!(partner = %self.partner, ratchet = %parent, "send ratchet retired");
        }
        tracing::info!(partner = %self.partner, ratchet = %id, "rekey confirmed");
        Ok(true)
    }

    /// Partner identity.
    pub fn partner(&self) -> PartnerId {
        self.partner
    }

    /// Our identity.
    pub fn me(&self) -> PartnerId {
        self.me
    }

    /// Channel parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl<S: Storage, N: Nike> fmt::Debug for AuthenticatedChannel<S, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedChannel")
            .field("me", &self.me)
            .field("partner", &self.partner)
            .field("send", &self.ratchets.tracker)
            .field("receive", &self.receive_ratchets())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{Mutex, PoisonError},
    };

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use sigil_crypto::{CryptoError, FfDh, Hybrid};
    use sigil_store::{ChaoticStorage, MemoryStorage};

    use super::*;
    use crate::env::SeededEnv;

    type TestNike = Hybrid<FfDh, FfDh>;
    type TestChannel = AuthenticatedChannel<MemoryStorage, TestNike>;

    /// Fingerprints currently announced by a channel.
    #[derive(Default)]
    struct RecordingHandler {
        keys: Mutex<HashSet<Fingerprint>>,
    }

    impl RecordingHandler {
        fn len(&self) -> usize {
            self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        fn contains(&self, fingerprint: &Fingerprint) -> bool {
            self.keys.lock().unwrap_or_else(PoisonError::into_inner).contains(fingerprint)
        }
    }

    impl CypherHandler for RecordingHandler {
        fn add_key(&self, fingerprint: Fingerprint, _partner: PartnerId) {
            self.keys.lock().unwrap_or_else(PoisonError::into_inner).insert(fingerprint);
        }

        fn delete_key(&self, fingerprint: Fingerprint) {
            self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(&fingerprint);
        }
    }

    fn small_params() -> Params {
        Params {
            min_keys: 20,
            max_keys: 30,
            rekey_threshold: 0.25,
            num_rekeys: 3,
            unconfirmed_retry_ratio: 1.0,
            replay_requests: false,
        }
    }

    struct Pair<S: Storage = MemoryStorage> {
        alice: AuthenticatedChannel<S, TestNike>,
        bob: AuthenticatedChannel<S, TestNike>,
        alice_keys: Arc<RecordingHandler>,
        bob_keys: Arc<RecordingHandler>,
    }

    fn pair(seed: u64) -> Pair {
        pair_on(seed, MemoryStorage::new(), MemoryStorage::new())
    }

    fn pair_on<S: Storage>(seed: u64, alice_storage: S, bob_storage: S) -> Pair<S> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let (a_private, a_public) = TestNike::new_keypair(&mut rng);
        let (b_private, b_public) = TestNike::new_keypair(&mut rng);
        let alice_id = PartnerId::new([0xa1; PartnerId::LEN]);
        let bob_id = PartnerId::new([0xb0; PartnerId::LEN]);
        let alice_keys = Arc::new(RecordingHandler::default());
        let bob_keys = Arc::new(RecordingHandler::default());

        let alice = AuthenticatedChannel::new(
            alice_storage,
            alice_id,
            bob_id,
            ChannelKeys { my_private: a_private, my_public: a_public.clone(), partner_public: b_public.clone() },
            Role::Requester,
            small_params(),
            alice_keys.clone(),
        )
        .unwrap();
        let bob = AuthenticatedChannel::new(
            bob_storage,
            bob_id,
            alice_id,
            ChannelKeys { my_private: b_private, my_public: b_public, partner_public: a_public },
            Role::Responder,
            small_params(),
            bob_keys.clone(),
        )
        .unwrap();

        Pair { alice, bob, alice_keys, bob_keys }
    }

    /// Pair sharing one store that starts failing every operation once
    /// both channels exist.
    fn chaotic_pair(seed: u64) -> (Pair<ChaoticStorage<MemoryStorage>>, ChaoticStorage<MemoryStorage>) {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        let pair = pair_on(seed, storage.clone(), storage.clone());
        storage.set_failure_rate(1.0);
        (pair, storage)
    }

    fn only(ids: &[RatchetId]) -> RatchetId {
        assert_eq!(ids.len(), 1, "expected exactly one ratchet, got {ids:?}");
        ids[0]
    }

    #[test]
    fn both_directions_decrypt() {
        let Pair { mut alice, mut bob, .. } = pair(1);

        let sealed = alice.encrypt(b"hi bob").unwrap();
        assert_eq!(bob.decrypt(&sealed.message).unwrap().plaintext, b"hi bob");

        let sealed = bob.encrypt(b"hi alice").unwrap();
        assert_eq!(alice.decrypt(&sealed.message).unwrap().plaintext, b"hi alice");
    }

    #[test]
    fn peers_agree_on_ratchet_ids() {
        let Pair { alice, bob, .. } = pair(2);

        let alice_send = only(&alice.send_ratchets());
        assert_eq!(alice_send, only(&bob.receive_ratchets()));
        assert_eq!(only(&bob.send_ratchets()), only(&alice.receive_ratchets()));
        assert_eq!(
            alice.session(&alice_send).unwrap().ratchet().size(),
            bob.receive_ratchet(&alice_send).unwrap().size()
        );
    }

    #[test]
    fn roles_start_in_their_states() {
        let Pair { alice, bob, .. } = pair(3);

        assert_eq!(alice.send_ratchets_by_state(NegotiationState::Confirmed).len(), 1);
        assert_eq!(bob.send_ratchets_by_state(NegotiationState::NewSessionTriggered).len(), 1);
    }

    #[test]
    fn inbound_message_promotes_unacknowledged_responder() {
        let Pair { mut alice, mut bob, .. } = pair(4);
        let bob_send = only(&bob.send_ratchets());

        let sealed = alice.encrypt(b"first").unwrap();
        let opened = bob.decrypt(&sealed.message).unwrap();

        assert!(opened.promoted);
        assert_eq!(bob.state(&bob_send), Some(NegotiationState::Confirmed));

        let sealed = alice.encrypt(b"second").unwrap();
        assert!(!bob.decrypt(&sealed.message).unwrap().promoted);
    }

    #[test]
    fn failed_confirm_is_promoted_through_sent() {
        let Pair { mut alice, mut bob, .. } = pair(5);
        let bob_send = only(&bob.send_ratchets());

        bob.mark_confirm_failed(bob_send).unwrap();
        assert_eq!(bob.state(&bob_send), Some(NegotiationState::NewSessionCreated));

        let sealed = alice.encrypt(b"ack lost").unwrap();
        assert!(bob.decrypt(&sealed.message).unwrap().promoted);
        assert_eq!(bob.state(&bob_send), Some(NegotiationState::Confirmed));
    }

    #[test]
    fn acknowledgement_promotes_once() {
        let Pair { mut bob, .. } = pair(6);
        let bob_send = only(&bob.send_ratchets());

        assert!(bob.promote(bob_send).unwrap());
        assert!(!bob.promote(bob_send).unwrap());
    }

    #[test]
    fn replayed_message_is_rejected() {
        let Pair { mut alice, mut bob, .. } = pair(7);

        let sealed = alice.encrypt(b"once").unwrap();
        bob.decrypt(&sealed.message).unwrap();

        let err = bob.decrypt(&sealed.message).unwrap_err();
        assert!(matches!(err, NegotiationError::Crypto(CryptoError::KeyReused { .. })));
    }

    #[test]
    fn tampered_message_consumes_nothing() {
        let Pair { mut alice, mut bob, .. } = pair(8);

        let sealed = alice.encrypt(b"payload").unwrap();
        let mut tampered = sealed.message.clone();
        tampered.ciphertext[0] ^= 0x01;

        let err = bob.decrypt(&tampered).unwrap_err();
        assert!(matches!(err, NegotiationError::Crypto(CryptoError::AuthenticationFailure)));
        assert_eq!(bob.decrypt(&sealed.message).unwrap().plaintext, b"payload");
    }

    #[test]
    fn unknown_fingerprint_is_reported() {
        let Pair { mut alice, mut bob, .. } = pair(9);

        let mut sealed = alice.encrypt(b"lost").unwrap();
        sealed.message.fingerprint = Fingerprint::new([0x55; 32]);
        assert!(matches!(bob.decrypt(&sealed.message), Err(NegotiationError::UnknownFingerprint(_))));
    }

    #[test]
    fn handler_tracks_unused_fingerprints() {
        let Pair { mut alice, mut bob, bob_keys, .. } = pair(10);
        let receiver = only(&bob.receive_ratchets());
        let size = bob.receive_ratchet(&receiver).unwrap().size() as usize;
        assert_eq!(bob_keys.len(), size);

        let sealed = alice.encrypt(b"m").unwrap();
        assert!(bob_keys.contains(&sealed.message.fingerprint));
        bob.decrypt(&sealed.message).unwrap();
        assert!(!bob_keys.contains(&sealed.message.fingerprint));
        assert_eq!(bob_keys.len(), size - 1);
    }

    #[test]
    fn exhausted_channel_requires_rekey() {
        let Pair { mut alice, .. } = pair(11);
        let id = only(&alice.send_ratchets());
        let budget = alice.session(&id).unwrap().budget();

        for _ in 0..budget.num_keys {
            alice.encrypt(b"m").unwrap();
        }
        let err = alice.encrypt(b"m").unwrap_err();
        assert_eq!(err, NegotiationError::KeysExhausted { id });
        assert!(err.requires_rekey());

        for _ in 0..budget.num_rekeys {
            alice.encrypt_reserved(b"control").unwrap();
        }
        assert!(alice.encrypt_reserved(b"control").unwrap_err().requires_rekey());
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let Pair { mut alice, .. } = pair(12);
        let id = only(&alice.send_ratchets());

        let err = alice.set_state(id, NegotiationState::Sending).unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidTransition { .. }));
        assert_eq!(alice.state(&id), Some(NegotiationState::Confirmed));
    }

    fn drive_to_threshold<S: Storage>(
        channel: &mut AuthenticatedChannel<S, TestNike>,
        peer: &mut AuthenticatedChannel<S, TestNike>,
    ) {
        let id = channel.send_ratchets_by_state(NegotiationState::Confirmed)[0];
        let threshold = channel.session(&id).unwrap().budget().rekey_threshold;
        for _ in 0..threshold {
            let sealed = channel.encrypt(b"traffic").unwrap();
            peer.decrypt(&sealed.message).unwrap();
        }
    }

    #[test]
    fn rekey_round_trip() {
        let Pair { mut alice, mut bob, .. } = pair(13);
        let env = SeededEnv::new(13);
        let original = only(&alice.send_ratchets());

        assert!(alice.trigger_negotiations(&env).unwrap().is_empty());
        drive_to_threshold(&mut alice, &mut bob);

        let actions = alice.trigger_negotiations(&env).unwrap();
        let [ChannelAction::Rekey { ratchet, trigger }] = actions.as_slice() else {
            panic!("expected one rekey, got {actions:?}");
        };
        assert_eq!(trigger.previous, original);
        assert_eq!(alice.state(&original), Some(NegotiationState::NewSessionCreated));
        assert_eq!(alice.state(ratchet), Some(NegotiationState::Sending));

        // Still sending on the predecessor until the successor is confirmed.
        alice.mark_sent(*ratchet).unwrap();
        assert_eq!(alice.encrypt(b"in flight").unwrap().ratchet, original);

        let accepted = bob.handle_rekey_trigger(trigger).unwrap();
        assert_eq!(accepted, *ratchet);
        assert_eq!(bob.handle_rekey_trigger(trigger).unwrap(), accepted);
        assert_eq!(bob.receive_ratchets().len(), 2);

        assert!(alice.handle_rekey_confirm(accepted).unwrap());
        assert!(!alice.handle_rekey_confirm(accepted).unwrap());
        assert_eq!(alice.send_ratchets(), vec![accepted]);

        let sealed = alice.encrypt(b"after rekey").unwrap();
        assert_eq!(sealed.ratchet, accepted);
        let opened = bob.decrypt(&sealed.message).unwrap();
        assert_eq!(opened.ratchet, accepted);
        assert_eq!(opened.plaintext, b"after rekey");
    }

    #[test]
    fn failed_rekey_send_is_retried() {
        let Pair { mut alice, mut bob, .. } = pair(14);
        let env = SeededEnv::new(14);
        drive_to_threshold(&mut alice, &mut bob);

        let actions = alice.trigger_negotiations(&env).unwrap();
        let [ChannelAction::Rekey { ratchet, .. }] = actions.as_slice() else {
            panic!("expected one rekey, got {actions:?}");
        };
        let ratchet = *ratchet;

        alice.unconfirm(ratchet).unwrap();
        assert_eq!(alice.state(&ratchet), Some(NegotiationState::Unconfirmed));

        // Retry ratio is 1.0 in the test params.
        let actions = alice.trigger_negotiations(&env).unwrap();
        let [ChannelAction::Resend { ratchet: resent, trigger }] = actions.as_slice() else {
            panic!("expected one resend, got {actions:?}");
        };
        assert_eq!(*resent, ratchet);
        assert_eq!(alice.state(&ratchet), Some(NegotiationState::Sending));
        assert_eq!(bob.handle_rekey_trigger(trigger).unwrap(), ratchet);
    }

    #[test]
    fn sent_ratchet_cannot_be_unconfirmed() {
        let Pair { mut alice, mut bob, .. } = pair(15);
        let env = SeededEnv::new(15);
        drive_to_threshold(&mut alice, &mut bob);

        let actions = alice.trigger_negotiations(&env).unwrap();
        let [ChannelAction::Rekey { ratchet, .. }] = actions.as_slice() else {
            panic!("expected one rekey, got {actions:?}");
        };
        alice.mark_sent(*ratchet).unwrap();

        assert!(matches!(alice.unconfirm(*ratchet), Err(NegotiationError::InvalidTransition { .. })));
    }

    #[test]
    fn spent_receive_ratchet_is_pruned() {
        let Pair { mut alice, mut bob, .. } = pair(16);
        let env = SeededEnv::new(16);
        let original = only(&alice.send_ratchets());
        drive_to_threshold(&mut alice, &mut bob);

        let actions = alice.trigger_negotiations(&env).unwrap();
        let [ChannelAction::Rekey { ratchet, trigger }] = actions.as_slice() else {
            panic!("expected one rekey, got {actions:?}");
        };
        alice.mark_sent(*ratchet).unwrap();
        bob.handle_rekey_trigger(trigger).unwrap();

        // Drain the predecessor completely, reserve included.
        loop {
            let sealed = alice.encrypt_reserved(b"drain").unwrap();
            bob.decrypt(&sealed.message).unwrap();
            if sealed.ratchet != original {
                break;
            }
        }

        assert_eq!(bob.receive_ratchets(), vec![*ratchet]);
    }

    #[test]
    fn reload_restores_channel() {
        let Pair { mut alice, mut bob, .. } = pair(17);
        let sealed = alice.encrypt(b"before").unwrap();
        bob.decrypt(&sealed.message).unwrap();

        let storage = alice.storage.clone();
        let partner = alice.partner();
        let handler = Arc::new(RecordingHandler::default());
        let mut reloaded = TestChannel::load(storage, &partner, handler.clone()).unwrap().unwrap();

        assert_eq!(reloaded.send_ratchets(), alice.send_ratchets());
        assert_eq!(reloaded.receive_ratchets(), alice.receive_ratchets());
        assert_eq!(handler.len(), alice.receive_ratchet(&only(&alice.receive_ratchets())).unwrap().size() as usize);

        // Used keys stay used across reload.
        let after = reloaded.encrypt(b"after").unwrap();
        assert_ne!(after.message.fingerprint, sealed.message.fingerprint);
        assert_eq!(bob.decrypt(&after.message).unwrap().plaintext, b"after");
    }

    #[test]
    fn in_flight_states_reload_settled() {
        let Pair { bob, .. } = pair(18);
        let id = only(&bob.send_ratchets());

        let reloaded = TestChannel::load(
            bob.storage.clone(),
            &bob.partner(),
            Arc::new(RecordingHandler::default()),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reloaded.state(&id), Some(NegotiationState::Confirmed));
    }

    #[test]
    fn load_missing_channel_is_none() {
        let handler = Arc::new(RecordingHandler::default());
        let partner = PartnerId::new([7; PartnerId::LEN]);
        assert!(TestChannel::load(MemoryStorage::new(), &partner, handler).unwrap().is_none());
    }

    #[test]
    fn delete_withdraws_everything() {
        let Pair { alice, alice_keys, .. } = pair(19);
        let storage = alice.storage.clone();
        let partner = alice.partner();

        alice.delete().unwrap();
        assert_eq!(alice_keys.len(), 0);
        assert!(
            TestChannel::load(storage, &partner, Arc::new(RecordingHandler::default()))
                .unwrap()
                .is_none()
        );
    }

    fn is_storage_failure<T>(result: Result<T, NegotiationError>) -> bool {
        matches!(result, Err(NegotiationError::Storage(_)))
    }

    #[test]
    fn decrypt_failing_to_persist_consumes_nothing() {
        let (Pair { mut alice, mut bob, bob_keys, .. }, storage) = chaotic_pair(20);
        let bob_send = only(&bob.send_ratchets());
        let receiver = only(&bob.receive_ratchets());

        storage.set_failure_rate(0.0);
        let sealed = alice.encrypt(b"retry me").unwrap();
        storage.set_failure_rate(1.0);

        assert!(is_storage_failure(bob.decrypt(&sealed.message)));
        let untouched = bob.receive_ratchet(&receiver).unwrap();
        assert_eq!(untouched.num_available(), untouched.size());
        assert!(bob_keys.contains(&sealed.message.fingerprint));
        assert_eq!(bob.state(&bob_send), Some(NegotiationState::NewSessionTriggered));

        storage.set_failure_rate(0.0);
        let opened = bob.decrypt(&sealed.message).unwrap();
        assert_eq!(opened.plaintext, b"retry me");
        assert!(opened.promoted);
        assert!(!bob_keys.contains(&sealed.message.fingerprint));
    }

    #[test]
    fn encrypt_failing_to_persist_keeps_key() {
        let (Pair { mut alice, mut bob, .. }, storage) = chaotic_pair(21);
        let id = only(&alice.send_ratchets());

        assert!(is_storage_failure(alice.encrypt(b"lost")));
        assert!(is_storage_failure(alice.encrypt_reserved(b"lost")));
        assert_eq!(alice.session(&id).unwrap().ratchet().num_used(), 0);

        storage.set_failure_rate(0.0);
        let sealed = alice.encrypt(b"kept").unwrap();
        assert_eq!(alice.session(&id).unwrap().ratchet().num_used(), 1);
        assert_eq!(bob.decrypt(&sealed.message).unwrap().plaintext, b"kept");
    }

    #[test]
    fn set_state_failing_to_persist_keeps_state() {
        let (Pair { mut bob, .. }, storage) = chaotic_pair(22);
        let id = only(&bob.send_ratchets());

        assert!(is_storage_failure(bob.mark_confirm_failed(id)));
        assert!(is_storage_failure(bob.promote(id)));
        assert_eq!(bob.state(&id), Some(NegotiationState::NewSessionTriggered));

        storage.set_failure_rate(0.0);
        bob.mark_confirm_failed(id).unwrap();
        assert_eq!(bob.state(&id), Some(NegotiationState::NewSessionCreated));
    }

    #[test]
    fn trigger_pass_failing_to_persist_spawns_nothing() {
        let (Pair { mut alice, mut bob, .. }, storage) = chaotic_pair(23);
        let env = SeededEnv::new(23);
        let original = only(&alice.send_ratchets());

        storage.set_failure_rate(0.0);
        drive_to_threshold(&mut alice, &mut bob);
        storage.set_failure_rate(1.0);

        assert!(is_storage_failure(alice.trigger_negotiations(&env)));
        assert_eq!(alice.send_ratchets(), vec![original]);
        assert_eq!(alice.state(&original), Some(NegotiationState::Confirmed));

        storage.set_failure_rate(0.0);
        let actions = alice.trigger_negotiations(&env).unwrap();
        assert!(matches!(actions.as_slice(), [ChannelAction::Rekey { .. }]));
    }

    #[test]
    fn rekey_failing_to_persist_keeps_both_sides() {
        let (Pair { mut alice, mut bob, bob_keys, .. }, storage) = chaotic_pair(24);
        let env = SeededEnv::new(24);
        let original = only(&alice.send_ratchets());

        storage.set_failure_rate(0.0);
        drive_to_threshold(&mut alice, &mut bob);
        let actions = alice.trigger_negotiations(&env).unwrap();
        let [ChannelAction::Rekey { ratchet, trigger }] = actions.as_slice() else {
            panic!("expected one rekey, got {actions:?}");
        };
        let ratchet = *ratchet;
        alice.mark_sent(ratchet).unwrap();
        storage.set_failure_rate(1.0);

        let announced = bob_keys.len();
        assert!(is_storage_failure(bob.handle_rekey_trigger(trigger)));
        assert_eq!(bob.receive_ratchets().len(), 1);
        assert_eq!(bob_keys.len(), announced);

        assert!(is_storage_failure(alice.handle_rekey_confirm(ratchet)));
        assert_eq!(alice.state(&original), Some(NegotiationState::NewSessionCreated));
        assert_eq!(alice.state(&ratchet), Some(NegotiationState::Sent));

        storage.set_failure_rate(0.0);
        assert_eq!(bob.handle_rekey_trigger(trigger).unwrap(), ratchet);
        assert!(alice.handle_rekey_confirm(ratchet).unwrap());
        assert_eq!(alice.send_ratchets(), vec![ratchet]);
    }

    #[test]
    fn failed_write_leaves_stored_channel_intact() {
        let (Pair { mut alice, mut bob, .. }, storage) = chaotic_pair(25);

        storage.set_failure_rate(0.0);
        let sealed = alice.encrypt(b"durable").unwrap();
        storage.set_failure_rate(1.0);
        assert!(is_storage_failure(bob.decrypt(&sealed.message)));

        let mut reloaded = AuthenticatedChannel::<_, TestNike>::load(
            storage.inner().clone(),
            &bob.partner(),
            Arc::new(RecordingHandler::default()),
        )
        .unwrap()
        .unwrap();
        assert_eq!(reloaded.decrypt(&sealed.message).unwrap().plaintext, b"durable");
    }
}
