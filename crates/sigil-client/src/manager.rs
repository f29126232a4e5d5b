//! Channel manager: negotiation over a transport.
//!
//! The [`Manager`] owns one identity's auth store and every channel that
//! identity has. It turns API calls into envelopes for the [`Transport`] and
//! inbound frames into channel state and [`Callbacks`].
//!
//! # Negotiation
//!
//! ```text
//! requester                                   responder
//!    │  Request(ephemeral DH, ecr{proof, PQ, id, facts})
//!    │ ─────────────────────────────────────────────> │ stored, request callback
//!    │                                                │ confirm(): new DH + PQ,
//!    │  Confirm(new DH, ecr{proof, PQ})               │ channel (responder side)
//!    │ <───────────────────────────────────────────── │
//!    │ channel (requester side), confirm callback     │
//!    │  Ack(ratchet id)                               │
//!    │ ─────────────────────────────────────────────> │ send ratchet confirmed
//! ```
//!
//! Requests are encrypted to the partner's historical key and arrive under a
//! fingerprint derived from it. Confirms arrive under the fingerprint of the
//! requester's ownership proof. Everything after that is channel traffic,
//! routed by receive-key fingerprint through the [`KeyRegistry`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use sigil_core::{
    AuthenticatedChannel, ChannelAction, ChannelKeys, Environment, Params, Role, Sealed,
};
use sigil_crypto::{
    Csidh512, EncryptedMessage, FfDh, Fingerprint, Hybrid, HybridPrivateKey, HybridPublicKey, Nike,
    NikePrivateKey, NikePublicKey, OwnershipProof, RatchetId, auth_decrypt, auth_encrypt,
    make_ownership_proof, request_fingerprint, verify_ownership_proof,
};
use sigil_proto::{
    Ack, AppMessage, BaseFormat, ChannelPayload, EcrFormat, Envelope, MessageKind, PartnerId,
    RekeyConfirm, RequestFormat, WireVersion,
};
use sigil_store::{
    AuthStore, Confirmation, ReceivedRequest, SentRequest, Storage, negotiation_fingerprint,
};

use crate::{
    callbacks::{CallbackRegistry, Callbacks},
    contact::{Contact, Identity},
    error::ClientError,
    event::{DropReason, Processed},
    keys::KeyRegistry,
    transport::{Round, Transport},
};

const PARTNERS_KEY: &str = "manager/partners";
const PARTNERS_VERSION: u64 = 0;

/// Channel kept per partner.
pub type ManagedChannel<S, Q> = AuthenticatedChannel<S, Hybrid<FfDh, Q>>;

/// Shared handle to a [`ManagedChannel`].
pub type SharedChannel<S, Q> = Arc<Mutex<ManagedChannel<S, Q>>>;

type Result<T> = std::result::Result<T, ClientError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Negotiates and runs every channel of one identity.
///
/// Sessions use `Hybrid<FfDh, Q>`. `Q` must match the post-quantum key width
/// of the wire version, which [`Csidh512`] does.
pub struct Manager<S: Storage, T: Transport, E: Environment, Q: Nike = Csidh512> {
    identity: Identity,
    params: Params,
    version: WireVersion,
    store: AuthStore<S>,
    transport: T,
    env: E,
    callbacks: CallbackRegistry,
    keys: Arc<KeyRegistry>,
    channels: RwLock<HashMap<PartnerId, SharedChannel<S, Q>>>,
    /// Confirm fingerprint → partner, one per outstanding sent request
    confirm_routes: Mutex<HashMap<Fingerprint, PartnerId>>,
}

impl<S: Storage, T: Transport, E: Environment, Q: Nike> Manager<S, T, E, Q> {
    /// Open the manager for `identity`, restoring the auth store and every
    /// saved channel from `storage`.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` if `Q` or the transport payload do not fit the
    ///   wire layout
    /// - `ClientError::Negotiation` if `params` do not validate or a saved
    ///   channel is corrupt
    /// - `ClientError::AuthStore` if the auth store cannot be loaded
    pub fn new(
        identity: Identity,
        storage: S,
        transport: T,
        env: E,
        params: Params,
        callbacks: Arc<dyn Callbacks>,
    ) -> Result<Self> {
        params.validate()?;
        let version = WireVersion::CURRENT;
        let layout = version.layout();
        if Q::PUBLIC_KEY_SIZE != layout.pq_key_size {
            return Err(ClientError::Config {
                reason: format!(
                    "{} public keys are {} bytes, wire version {version:?} carries {}",
                    Q::NAME,
                    Q::PUBLIC_KEY_SIZE,
                    layout.pq_key_size
                ),
            });
        }
        let request_len = BaseFormat::ecr_len(version, transport.payload_size())
            .and_then(|ecr_len| EcrFormat::payload_len(version, ecr_len))
            .map_err(|err| ClientError::Config { reason: err.to_string() })?;
        if request_len < PartnerId::LEN {
            return Err(ClientError::Config {
                reason: format!(
                    "transport payload of {} bytes cannot carry a request",
                    transport.payload_size()
                ),
            });
        }

        let store = AuthStore::open(storage.clone())?;
        let keys = Arc::new(KeyRegistry::new());

        let partners: Vec<PartnerId> =
            storage.get_record(PARTNERS_KEY, PARTNERS_VERSION)?.unwrap_or_default();
        let mut channels: HashMap<PartnerId, SharedChannel<S, Q>> =
            HashMap::with_capacity(partners.len());
        for partner in partners {
            match AuthenticatedChannel::load(storage.clone(), &partner, keys.clone())? {
                Some(channel) => {
                    channels.insert(partner, Arc::new(Mutex::new(channel)));
                },
                None => tracing::warn!(%partner, "listed channel missing from storage"),
            }
        }
        let confirm_routes =
            store.get_all_sent().iter().map(|sent| (sent.confirm_fingerprint, sent.partner)).collect();

        tracing::info!(
            me = %identity.id(),
            channels = channels.len(),
            "manager opened"
        );

        Ok(Self {
            identity,
            params,
            version,
            store,
            transport,
            env,
            callbacks: CallbackRegistry::new(callbacks),
            keys,
            channels: RwLock::new(channels),
            confirm_routes: Mutex::new(confirm_routes),
        })
    }

    /// Our identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Channel parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Auth store backing this manager.
    pub fn auth_store(&self) -> &AuthStore<S> {
        &self.store
    }

    /// Receive-key routing table.
    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    /// Transport this manager sends through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    /// Ask `partner` for a channel, disclosing `facts`.
    ///
    /// If a request to the partner is already outstanding it is resent
    /// unchanged, keys and facts included.
    ///
    /// # Errors
    ///
    /// - `ClientError::ChannelExists` if a channel with the partner exists;
    ///   use [`Self::reset`] to replace it
    /// - `ClientError::AuthStore` if the partner's request is waiting for
    ///   our confirm
    /// - `ClientError::Protocol` if the facts do not fit or are invalid
    /// - `ClientError::Transport` if the request could not be handed off
    pub fn request(&self, partner: &Contact, facts: &[String]) -> Result<Round> {
        if self.has_channel(&partner.id) {
            return Err(ClientError::ChannelExists { partner: partner.id });
        }
        self.send_request(partner, facts, false)
    }

    /// Replace the channel with `partner` by a fresh negotiation.
    ///
    /// The current channel, stored confirm and outstanding requests are
    /// deleted first. The partner answers with a confirm and fires its reset
    /// callback.
    ///
    /// # Errors
    ///
    /// See [`Self::request`].
    pub fn reset(&self, partner: &Contact) -> Result<Round> {
        self.drop_channel(&partner.id)?;
        self.store.delete_confirmation(&partner.id)?;
        match self.store.delete_request(&partner.id) {
            Err(err) if !err.is_not_found() => return Err(err.into()),
            _ => {},
        }
        self.forget_route(&partner.id);
        tracing::info!(partner = %partner.id, "resetting channel");
        self.send_request(partner, &[], true)
    }

    fn send_request(&self, partner: &Contact, facts: &[String], reset: bool) -> Result<Round> {
        let sent = match self.store.get_sent_request(&partner.id) {
            Ok(existing) => {
                tracing::debug!(partner = %partner.id, "resending outstanding request");
                existing
            },
            Err(err) if err.is_not_found() => self.store_new_request(partner, facts, reset)?,
            Err(err) => return Err(err.into()),
        };
        lock(&self.confirm_routes).insert(sent.confirm_fingerprint, sent.partner);

        let envelope = self.request_envelope(&sent)?;
        let round = self.transport.send(&partner.id, &envelope, true)?;
        tracing::info!(partner = %partner.id, reset = sent.reset, round, "request sent");
        Ok(round)
    }

    fn store_new_request(
        &self,
        partner: &Contact,
        facts: &[String],
        reset: bool,
    ) -> Result<SentRequest> {
        let mut rng = self.env.rng();
        let (dh_private, dh_public) = FfDh::new_keypair(&mut rng);
        let (pq_private, pq_public) = Q::new_keypair(&mut rng);
        let proof = make_ownership_proof::<FfDh>(self.identity.private_key(), &partner.dh_public);

        let candidate = SentRequest {
            partner: partner.id,
            partner_historical_public: partner.dh_public.to_bytes(),
            my_dh_private: dh_private.to_bytes().to_vec(),
            my_dh_public: dh_public.to_bytes(),
            my_pq_private: pq_private.to_bytes().to_vec(),
            my_pq_public: pq_public.to_bytes(),
            confirm_fingerprint: proof.fingerprint(),
            facts: facts.to_vec(),
            reset,
        };
        let (sent, _) = self.store.add_sent(candidate)?;
        Ok(sent)
    }

    /// Base(ephemeral DH, enc(Ecr(proof, PQ, Request(id, facts)))).
    fn request_envelope(&self, sent: &SentRequest) -> Result<Envelope> {
        let dh_private = FfDh::private_key_from_bytes(&sent.my_dh_private)?;
        let partner_historical = FfDh::public_key_from_bytes(&sent.partner_historical_public)?;
        let proof = make_ownership_proof::<FfDh>(self.identity.private_key(), &partner_historical);

        let ecr_len = BaseFormat::ecr_len(self.version, self.transport.payload_size())?;
        let request_len = EcrFormat::payload_len(self.version, ecr_len)?;
        let request =
            RequestFormat { sender: self.identity.id(), facts: sent.facts.clone() }.encode(request_len)?;
        let ecr = EcrFormat { ownership: proof, pq_public_key: sent.my_pq_public.clone(), payload: request }
            .encode(self.version, ecr_len)?;

        let secret = FfDh::derive_secret(&dh_private, &partner_historical);
        let (ciphertext, mac) = auth_encrypt(&secret, &ecr);
        let base = BaseFormat::new(self.version, sent.my_dh_public.clone(), ciphertext)?;

        let kind = if sent.reset { MessageKind::Reset } else { MessageKind::Request };
        Ok(Envelope::new(
            kind,
            request_fingerprint(&sent.partner_historical_public),
            mac,
            base.encode(),
        ))
    }

    // ---------------------------------------------------------------------
    // Confirms
    // ---------------------------------------------------------------------

    /// Accept the partner's outstanding request and create the channel.
    ///
    /// The confirm is stored before it is sent so a duplicate request can be
    /// answered with the same bytes. If the send fails the channel is kept;
    /// deliver the confirm later with [`Self::replay_confirm`].
    ///
    /// # Errors
    ///
    /// - `ClientError::ChannelExists` if a channel with the partner exists
    /// - `ClientError::AuthStore` if no request from the partner is stored
    /// - `ClientError::Transport` if the confirm could not be handed off
    pub fn confirm(&self, partner: &PartnerId) -> Result<Round> {
        if self.has_channel(partner) {
            return Err(ClientError::ChannelExists { partner: *partner });
        }

        let (channel, confirmation) =
            self.store.handle_received_request(partner, |request| self.build_confirm(request))?;
        let initial = channel.send_ratchets().first().copied();
        let channel = Arc::new(Mutex::new(channel));
        self.insert_channel(*partner, Arc::clone(&channel))?;

        match self.send_confirmation(partner, &confirmation) {
            Ok(round) => {
                tracing::info!(partner = %partner, round, "confirm sent");
                Ok(round)
            },
            Err(err) => {
                if let Some(id) = initial {
                    lock(&channel).mark_confirm_failed(id)?;
                }
                tracing::warn!(partner = %partner, error = %err, "confirm not sent; replay later");
                Err(err)
            },
        }
    }

    /// Base(new DH, enc(Ecr(proof, PQ))), stored, plus the responder's
    /// channel.
    fn build_confirm(
        &self,
        request: &ReceivedRequest,
    ) -> Result<(ManagedChannel<S, Q>, Confirmation)> {
        let partner_dh = FfDh::public_key_from_bytes(&request.partner_dh_public)?;
        let partner_pq = Q::public_key_from_bytes(&request.partner_pq_public)?;

        let mut rng = self.env.rng();
        let (dh_private, dh_public) = FfDh::new_keypair(&mut rng);
        let (pq_private, pq_public) = Q::new_keypair(&mut rng);
        let proof = make_ownership_proof::<FfDh>(self.identity.private_key(), &partner_dh);

        let ecr_len = BaseFormat::ecr_len(self.version, self.transport.payload_size())?;
        let ecr = EcrFormat { ownership: proof, pq_public_key: pq_public.to_bytes(), payload: Vec::new() }
            .encode(self.version, ecr_len)?;
        let secret = FfDh::derive_secret(&dh_private, &partner_dh);
        let (ciphertext, mac) = auth_encrypt(&secret, &ecr);
        let base = BaseFormat::new(self.version, dh_public.to_bytes(), ciphertext)?;

        let confirmation = Confirmation {
            payload: base.encode(),
            fingerprint: OwnershipProof::new(request.ownership_proof).fingerprint(),
            mac,
        };
        self.store.store_confirmation(&request.partner, &confirmation)?;

        let keys = ChannelKeys {
            my_private: HybridPrivateKey::new(dh_private, pq_private),
            my_public: HybridPublicKey::new(dh_public, pq_public),
            partner_public: HybridPublicKey::new(partner_dh, partner_pq),
        };
        let channel = AuthenticatedChannel::new(
            self.store.storage().clone(),
            self.identity.id(),
            request.partner,
            keys,
            Role::Responder,
            self.params,
            self.keys.clone(),
        )?;
        Ok((channel, confirmation))
    }

    /// Resend the stored confirm for `partner`, byte for byte.
    ///
    /// # Errors
    ///
    /// - `ClientError::AuthStore` with `NoConfirmation` if none was stored
    /// - `ClientError::Transport` if the confirm could not be handed off
    pub fn replay_confirm(&self, partner: &PartnerId) -> Result<Round> {
        let confirmation = self.store.load_confirmation(partner)?;
        let round = self.send_confirmation(partner, &confirmation)?;
        tracing::info!(partner = %partner, round, "confirm replayed");
        Ok(round)
    }

    fn send_confirmation(&self, partner: &PartnerId, confirmation: &Confirmation) -> Result<Round> {
        let envelope = Envelope::new(
            MessageKind::Confirm,
            confirmation.fingerprint,
            confirmation.mac,
            confirmation.payload.clone(),
        );
        Ok(self.transport.send(partner, &envelope, true)?)
    }

    /// Fire the request (or reset) callback again for every stored request,
    /// with the round each arrived in. Returns how many fired.
    pub fn replay_requests(&self) -> usize {
        let mut fired = 0;
        for request in self.store.get_all_received() {
            match contact_from_received(&request) {
                Ok(contact) => {
                    let callbacks = self.callbacks.get(&request.partner);
                    if request.reset {
                        callbacks.reset(&contact, request.round);
                    } else {
                        callbacks.request(&contact, request.round);
                    }
                    fired += 1;
                },
                Err(err) => {
                    tracing::warn!(partner = %request.partner, error = %err, "unreadable stored request");
                },
            }
        }
        fired
    }

    /// The partner's outstanding request as a contact.
    ///
    /// # Errors
    ///
    /// - `ClientError::AuthStore` with `NotFound` if there is none
    pub fn get_received_request(&self, partner: &PartnerId) -> Result<Contact> {
        contact_from_received(&self.store.get_received_request(partner)?)
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Decode and process one inbound frame.
    ///
    /// # Errors
    ///
    /// Only local failures. Frames that are bad for any reason are reported
    /// as [`Processed::Dropped`].
    pub fn receive(&self, frame: &[u8], round: Round) -> Result<Processed> {
        match Envelope::decode(frame) {
            Ok(envelope) => self.process(&envelope, round),
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable frame");
                Ok(Processed::Dropped(DropReason::Malformed))
            },
        }
    }

    /// Process one inbound envelope.
    ///
    /// # Errors
    ///
    /// See [`Self::receive`].
    pub fn process(&self, envelope: &Envelope, round: Round) -> Result<Processed> {
        let result = match envelope.kind {
            MessageKind::Request | MessageKind::Reset => self.handle_request(envelope, round),
            MessageKind::Confirm => self.handle_confirm(envelope, round),
            MessageKind::Ack
            | MessageKind::RekeyTrigger
            | MessageKind::RekeyConfirm
            | MessageKind::Message => self.handle_channel_message(envelope),
        };

        match result {
            Err(err) => match err.drop_reason() {
                Some(reason) => {
                    tracing::warn!(kind = ?envelope.kind, ?reason, error = %err, "dropping inbound message");
                    Ok(Processed::Dropped(reason))
                },
                None => Err(err),
            },
            ok => ok,
        }
    }

    fn handle_request(&self, envelope: &Envelope, round: Round) -> Result<Processed> {
        if envelope.fingerprint != self.identity.request_fingerprint() {
            return Err(ClientError::Misaddressed);
        }

        let base = BaseFormat::decode(&envelope.payload)?;
        let partner_dh = FfDh::public_key_from_bytes(base.public_key())?;
        let secret = FfDh::derive_secret(self.identity.private_key(), &partner_dh);
        let ecr_bytes = auth_decrypt(&secret, base.ecr_payload(), &envelope.mac)?;
        let ecr = EcrFormat::decode(base.version(), &ecr_bytes)?;
        let request = RequestFormat::decode(&ecr.payload)?;
        Q::public_key_from_bytes(&ecr.pq_public_key)?;

        let partner = request.sender;
        let reset = envelope.kind == MessageKind::Reset;
        let contact = Contact {
            id: partner,
            dh_public: partner_dh,
            ownership_proof: Some(ecr.ownership),
            facts: request.facts,
        };

        let fingerprint = negotiation_fingerprint(base.public_key(), &ecr.pq_public_key);
        let (is_new, position) = self.store.check_if_negotiation_is_new(&partner, &fingerprint)?;
        if !is_new {
            return self.handle_duplicate_request(&contact, reset, position, round);
        }
        tracing::info!(partner = %partner, reset, round, "request received");

        let mut resetting = false;
        if self.has_channel(&partner) {
            if !reset {
                return Err(ClientError::ChannelExists { partner });
            }
            self.drop_channel(&partner)?;
            self.store.delete_confirmation(&partner)?;
            match self.store.delete_sent_request(&partner) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {},
            }
            self.forget_route(&partner);
            resetting = true;
        }

        match self.store.delete_received_request(&partner) {
            Err(err) if !err.is_not_found() => return Err(err.into()),
            Ok(()) => tracing::debug!(partner = %partner, "newer request replaces stored one"),
            Err(_) => {},
        }

        let auto_confirm =
            match self.store.handle_sent_request(&partner, |sent| self.resolve_crossed(sent, &contact)) {
                Ok(()) => {
                    self.forget_route(&partner);
                    tracing::info!(partner = %partner, "requests crossed; confirming theirs");
                    true
                },
                Err(ClientError::CrossedRequest { .. }) => {
                    tracing::info!(partner = %partner, "requests crossed; partner confirms ours");
                    return Ok(Processed::Deferred { partner });
                },
                Err(ClientError::AuthStore(err)) if err.is_not_found() => false,
                Err(err) => return Err(err),
            };

        self.store.add_received(ReceivedRequest {
            partner,
            partner_dh_public: base.public_key().to_vec(),
            partner_pq_public: ecr.pq_public_key,
            ownership_proof: *ecr.ownership.as_bytes(),
            facts: contact.facts.clone(),
            reset,
            round,
        })?;

        let callbacks = self.callbacks.get(&partner);
        if !(auto_confirm || resetting) {
            callbacks.request(&contact, round);
            return Ok(Processed::RequestReceived { partner });
        }

        match self.confirm(&partner) {
            Ok(_) | Err(ClientError::Transport(_)) => {},
            Err(err) => return Err(err),
        }
        if auto_confirm {
            callbacks.confirm(&contact, round);
            Ok(Processed::Confirmed { partner })
        } else {
            callbacks.reset(&contact, round);
            Ok(Processed::Reset { partner })
        }
    }

    /// Settle a request that crossed one of ours.
    ///
    /// Returning `Ok` lets the store delete our request and we confirm
    /// theirs. `CrossedRequest` keeps our request for the partner to
    /// confirm.
    fn resolve_crossed(&self, sent: &SentRequest, contact: &Contact) -> Result<()> {
        let historical = FfDh::public_key_from_bytes(&sent.partner_historical_public)?;
        let proven = contact.ownership_proof.as_ref().is_some_and(|proof| {
            verify_ownership_proof::<FfDh>(self.identity.private_key(), &historical, proof)
        });
        if !proven {
            return Err(ClientError::OwnershipProof { partner: contact.id });
        }
        if self.identity.id() > contact.id {
            return Err(ClientError::CrossedRequest { partner: contact.id });
        }
        Ok(())
    }

    /// A request we have seen before. Only the newest negotiation with a
    /// partner is answered: with the stored confirm if we already accepted,
    /// otherwise by replaying the callback when configured to.
    fn handle_duplicate_request(
        &self,
        contact: &Contact,
        reset: bool,
        position: usize,
        round: Round,
    ) -> Result<Processed> {
        if position != 0 {
            tracing::info!(partner = %contact.id, position, "dropping superseded request");
            return Ok(Processed::Dropped(DropReason::Stale));
        }

        if self.has_channel(&contact.id) {
            match self.replay_confirm(&contact.id) {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(partner = %contact.id, error = %err, "could not reconfirm duplicate request");
                },
                Ok(_) => {},
            }
        } else if self.params.replay_requests {
            let callbacks = self.callbacks.get(&contact.id);
            if reset {
                callbacks.reset(contact, round);
            } else {
                callbacks.request(contact, round);
            }
        }
        Ok(Processed::Dropped(DropReason::Duplicate))
    }

    fn handle_confirm(&self, envelope: &Envelope, round: Round) -> Result<Processed> {
        let Some(partner) = lock(&self.confirm_routes).get(&envelope.fingerprint).copied() else {
            return Ok(Processed::Dropped(DropReason::UnknownFingerprint));
        };

        if self.has_channel(&partner) {
            tracing::warn!(partner = %partner, "confirm for a partner we already have a channel with");
            match self.store.delete_sent_request(&partner) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {},
            }
            self.forget_route(&partner);
            return Ok(Processed::Dropped(DropReason::ChannelExists));
        }

        let (channel, contact) =
            self.store.handle_sent_request(&partner, |sent| self.accept_confirm(sent, envelope))?;
        self.forget_route(&partner);

        let ratchet = channel.send_ratchets().first().copied();
        let channel = Arc::new(Mutex::new(channel));
        self.insert_channel(partner, Arc::clone(&channel))?;
        tracing::info!(partner = %partner, round, "confirm received");

        if let Some(ratchet_id) = ratchet {
            let ack = ChannelPayload::Ack(Ack { ratchet_id });
            match self.send_payload(&partner, &channel, &ack, true) {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(partner = %partner, error = %err, "ack not sent; next message confirms");
                },
                Ok(_) => {},
            }
        }

        self.callbacks.get(&partner).confirm(&contact, round);
        Ok(Processed::Confirmed { partner })
    }

    /// Open the partner's confirm and build the requester's channel.
    fn accept_confirm(
        &self,
        sent: &SentRequest,
        envelope: &Envelope,
    ) -> Result<(ManagedChannel<S, Q>, Contact)> {
        let base = BaseFormat::decode(&envelope.payload)?;
        let partner_dh = FfDh::public_key_from_bytes(base.public_key())?;
        let my_dh_private = FfDh::private_key_from_bytes(&sent.my_dh_private)?;
        let secret = FfDh::derive_secret(&my_dh_private, &partner_dh);
        let ecr_bytes = auth_decrypt(&secret, base.ecr_payload(), &envelope.mac)?;
        let ecr = EcrFormat::decode(base.version(), &ecr_bytes)?;

        let partner_historical = FfDh::public_key_from_bytes(&sent.partner_historical_public)?;
        if !verify_ownership_proof::<FfDh>(&my_dh_private, &partner_historical, &ecr.ownership) {
            return Err(ClientError::OwnershipProof { partner: sent.partner });
        }
        let partner_pq = Q::public_key_from_bytes(&ecr.pq_public_key)?;

        let keys = ChannelKeys {
            my_private: HybridPrivateKey::new(
                my_dh_private,
                Q::private_key_from_bytes(&sent.my_pq_private)?,
            ),
            my_public: HybridPublicKey::new(
                FfDh::public_key_from_bytes(&sent.my_dh_public)?,
                Q::public_key_from_bytes(&sent.my_pq_public)?,
            ),
            partner_public: HybridPublicKey::new(partner_dh, partner_pq),
        };
        let channel = AuthenticatedChannel::new(
            self.store.storage().clone(),
            self.identity.id(),
            sent.partner,
            keys,
            Role::Requester,
            self.params,
            self.keys.clone(),
        )?;

        let contact = Contact {
            id: sent.partner,
            dh_public: partner_historical,
            ownership_proof: Some(ecr.ownership),
            facts: Vec::new(),
        };
        Ok((channel, contact))
    }

    fn handle_channel_message(&self, envelope: &Envelope) -> Result<Processed> {
        let Some(partner) = self.keys.lookup(&envelope.fingerprint) else {
            return Ok(Processed::Dropped(DropReason::UnknownFingerprint));
        };
        let channel = self.channel(&partner).ok_or(ClientError::NoChannel { partner })?;

        let message = EncryptedMessage::from_wire(envelope.fingerprint, envelope.to_ciphertext());
        let opened = lock(&channel).decrypt(&message)?;
        if opened.promoted {
            tracing::debug!(partner = %partner, "inbound traffic confirmed our send ratchet");
        }

        match ChannelPayload::decode(envelope.kind, &opened.plaintext)? {
            ChannelPayload::Ack(ack) => {
                lock(&channel).promote(ack.ratchet_id)?;
                Ok(Processed::Acknowledged { partner })
            },
            ChannelPayload::RekeyTrigger(trigger) => {
                let ratchet = lock(&channel).handle_rekey_trigger(&trigger)?;
                let reply = ChannelPayload::RekeyConfirm(RekeyConfirm { ratchet_id: ratchet });
                match self.send_payload(&partner, &channel, &reply, true) {
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        tracing::warn!(partner = %partner, ratchet = %ratchet, error = %err, "rekey confirm not sent");
                    },
                    Ok(_) => {},
                }
                Ok(Processed::RekeyAccepted { partner, ratchet })
            },
            ChannelPayload::RekeyConfirm(confirm) => {
                lock(&channel).handle_rekey_confirm(confirm.ratchet_id)?;
                Ok(Processed::RekeyConfirmed { partner, ratchet: confirm.ratchet_id })
            },
            ChannelPayload::Message(message) => Ok(Processed::Message { partner, body: message.body }),
        }
    }

    // ---------------------------------------------------------------------
    // Channel traffic
    // ---------------------------------------------------------------------

    /// Encrypt `body` to `partner` and send it, then run a trigger pass on
    /// the channel.
    ///
    /// # Errors
    ///
    /// - `ClientError::NoChannel` if there is no channel with the partner
    /// - `ClientError::Negotiation` with `KeysExhausted` if every send
    ///   ratchet is out of keys; a rekey has been started
    /// - `ClientError::Transport` if the message could not be handed off
    pub fn send_message(&self, partner: &PartnerId, body: &[u8]) -> Result<Round> {
        let channel = self.channel(partner).ok_or(ClientError::NoChannel { partner: *partner })?;
        let payload = ChannelPayload::Message(AppMessage { body: body.to_vec() });
        let sent = self.send_payload(partner, &channel, &payload, false);

        if let Err(err) = self.run_triggers(partner, &channel) {
            tracing::error!(partner = %partner, error = %err, "trigger pass failed");
        }
        sent.map(|(round, _)| round)
    }

    /// Run a trigger pass on the channel with `partner` and send the rekeys
    /// it produces. Returns how many rekeys were attempted.
    ///
    /// # Errors
    ///
    /// - `ClientError::NoChannel` if there is no channel with the partner
    /// - `ClientError::Negotiation` if channel state cannot be persisted
    pub fn trigger_negotiations(&self, partner: &PartnerId) -> Result<usize> {
        let channel = self.channel(partner).ok_or(ClientError::NoChannel { partner: *partner })?;
        self.run_triggers(partner, &channel)
    }

    fn run_triggers(&self, partner: &PartnerId, channel: &SharedChannel<S, Q>) -> Result<usize> {
        let actions = lock(channel).trigger_negotiations(&self.env)?;
        let attempted = actions.len();

        for action in actions {
            let (ChannelAction::Rekey { ratchet, trigger }
            | ChannelAction::Resend { ratchet, trigger }) = action;
            match self.send_payload(partner, channel, &ChannelPayload::RekeyTrigger(trigger), true) {
                Ok(_) => lock(channel).mark_sent(ratchet)?,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(partner = %partner, ratchet = %ratchet, error = %err, "rekey not sent");
                    lock(channel).unconfirm(ratchet)?;
                },
            }
        }
        Ok(attempted)
    }

    /// Seal `payload` on `channel` and hand it to the transport. Control
    /// payloads (`reserved`) may use the rekey reserve and are critical.
    fn send_payload(
        &self,
        partner: &PartnerId,
        channel: &SharedChannel<S, Q>,
        payload: &ChannelPayload,
        reserved: bool,
    ) -> Result<(Round, Sealed)> {
        let plaintext = payload.encode()?;
        let sealed = {
            let mut channel = lock(channel);
            if reserved { channel.encrypt_reserved(&plaintext)? } else { channel.encrypt(&plaintext)? }
        };
        let envelope = Envelope::from_ciphertext(
            payload.kind(),
            sealed.message.fingerprint,
            &sealed.message.ciphertext,
        )?;
        let round = self.transport.send(partner, &envelope, reserved)?;
        tracing::trace!(partner = %partner, kind = ?payload.kind(), ratchet = %sealed.ratchet, round, "channel message sent");
        Ok((round, sealed))
    }

    // ---------------------------------------------------------------------
    // Channels and deletion
    // ---------------------------------------------------------------------

    /// Shared handle to the channel with `partner`.
    pub fn channel(&self, partner: &PartnerId) -> Option<SharedChannel<S, Q>> {
        self.channels_read().get(partner).cloned()
    }

    /// Whether a channel with `partner` exists.
    pub fn has_channel(&self, partner: &PartnerId) -> bool {
        self.channels_read().contains_key(partner)
    }

    /// Partners we have a channel with, sorted.
    pub fn partners(&self) -> Vec<PartnerId> {
        let mut partners: Vec<PartnerId> = self.channels_read().keys().copied().collect();
        partners.sort();
        partners
    }

    /// Ids of the send ratchets of the channel with `partner`.
    pub fn send_ratchets(&self, partner: &PartnerId) -> Vec<RatchetId> {
        self.channel(partner).map(|channel| lock(&channel).send_ratchets()).unwrap_or_default()
    }

    /// Route callbacks for `partner` to `callbacks` instead of the default.
    pub fn add_partner_callback(&self, partner: PartnerId, callbacks: Arc<dyn Callbacks>) {
        self.callbacks.add(partner, callbacks);
    }

    /// Route callbacks for `partner` back to the default.
    pub fn delete_partner_callback(&self, partner: &PartnerId) {
        self.callbacks.delete(partner);
    }

    /// Forget everything about `partner`: channel, requests, negotiation
    /// history and stored confirm.
    ///
    /// # Errors
    ///
    /// - `ClientError::Negotiation` if the channel record cannot be deleted
    /// - `ClientError::AuthStore` if the auth store cannot be updated
    pub fn delete_partner(&self, partner: &PartnerId) -> Result<()> {
        self.drop_channel(partner)?;
        self.store.delete_partner(partner)?;
        self.forget_route(partner);
        tracing::info!(partner = %partner, "partner deleted");
        Ok(())
    }

    /// Delete both requests with `partner`.
    ///
    /// # Errors
    ///
    /// - `ClientError::AuthStore` with `NotFound` if neither exists
    pub fn delete_request(&self, partner: &PartnerId) -> Result<()> {
        self.store.delete_request(partner)?;
        self.forget_route(partner);
        Ok(())
    }

    /// Delete every outstanding request.
    pub fn delete_all_requests(&self) -> Result<()> {
        self.store.delete_all_requests()?;
        lock(&self.confirm_routes).clear();
        Ok(())
    }

    /// Delete every outstanding sent request.
    pub fn delete_sent_requests(&self) -> Result<()> {
        self.store.delete_sent_requests()?;
        lock(&self.confirm_routes).clear();
        Ok(())
    }

    /// Delete every outstanding received request.
    pub fn delete_receive_requests(&self) -> Result<()> {
        Ok(self.store.delete_receive_requests()?)
    }

    fn channels_read(&self) -> RwLockReadGuard<'_, HashMap<PartnerId, SharedChannel<S, Q>>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels_write(&self) -> RwLockWriteGuard<'_, HashMap<PartnerId, SharedChannel<S, Q>>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_channel(&self, partner: PartnerId, channel: SharedChannel<S, Q>) -> Result<()> {
        let mut channels = self.channels_write();
        channels.insert(partner, channel);
        if let Err(err) = self.save_partners(&channels) {
            channels.remove(&partner);
            return Err(err);
        }
        Ok(())
    }

    /// Remove and delete the channel with `partner`. Returns whether there
    /// was one.
    fn drop_channel(&self, partner: &PartnerId) -> Result<bool> {
        let removed = {
            let mut channels = self.channels_write();
            let Some(channel) = channels.remove(partner) else {
                return Ok(false);
            };
            self.save_partners(&channels)?;
            channel
        };
        lock(&removed).delete()?;
        Ok(true)
    }

    fn save_partners(&self, channels: &HashMap<PartnerId, SharedChannel<S, Q>>) -> Result<()> {
        let mut partners: Vec<PartnerId> = channels.keys().copied().collect();
        partners.sort();
        self.store.storage().set_record(PARTNERS_KEY, PARTNERS_VERSION, &partners)?;
        Ok(())
    }

    fn forget_route(&self, partner: &PartnerId) {
        lock(&self.confirm_routes).retain(|_, owner| owner != partner);
    }
}

fn contact_from_received(request: &ReceivedRequest) -> Result<Contact> {
    Ok(Contact {
        id: request.partner,
        dh_public: FfDh::public_key_from_bytes(&request.partner_dh_public)?,
        ownership_proof: Some(OwnershipProof::new(request.ownership_proof)),
        facts: request.facts.clone(),
    })
}

impl<S: Storage, T: Transport, E: Environment, Q: Nike> std::fmt::Debug for Manager<S, T, E, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("me", &self.identity.id())
            .field("partners", &self.partners())
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}
