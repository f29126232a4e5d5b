//! Auth store: durable state of channel negotiations.
//!
//! Tracks at most one outstanding [`SentRequest`] and one [`ReceivedRequest`]
//! per partner, the history of negotiation fingerprints seen from each
//! partner (duplicate detection), and the last confirm sent to each partner
//! (verbatim replay).
//!
//! # Persistence
//!
//! ```text
//! requestMap                         list of (kind, partner)
//! sentRequest/<partner>              SentRequest
//! receivedRequest/<partner>          ReceivedRequest
//! NegotiationPartners                partners with a fingerprint history
//! NegotiationFingerprints/<partner>  fingerprints, oldest first
//! Confirmation/<partner>             Confirmation
//! ```
//!
//! The request map is the authority: a record is written before the map
//! lists it and unlisted before it is deleted. A failed write leaves memory
//! untouched, so memory and the map never disagree.
//!
//! # Locking
//!
//! One coarse mutex guards the partner maps. Each request additionally has
//! its own mutex, held while a handler runs on it and while it is deleted.
//! The coarse mutex is never held while waiting for a request mutex. After
//! taking the request mutex the store re-checks that the request is still the
//! one listed, since it may have been deleted or replaced meanwhile.
//!
//! A handler may delete or replace its own request from inside the handler;
//! the store then leaves the replacement alone.

mod confirmation;
mod error;
mod negotiations;
mod records;

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use base64::{Engine, engine::general_purpose::STANDARD};
pub use error::AuthStoreError;
pub use negotiations::negotiation_fingerprint;
pub use records::{
    Confirmation, NegotiationFingerprint, ReceivedRequest, RequestKind, SentRequest,
};
use records::RequestEntry;
use serde::{Serialize, de::DeserializeOwned};
use sigil_proto::PartnerId;

use crate::storage::Storage;

const REQUEST_MAP_KEY: &str = "requestMap";
const REQUEST_MAP_VERSION: u64 = 0;
const SENT_REQUEST_PREFIX: &str = "sentRequest/";
const RECEIVED_REQUEST_PREFIX: &str = "receivedRequest/";
const REQUEST_VERSION: u64 = 0;

type Result<T> = std::result::Result<T, AuthStoreError>;

/// `<prefix><base64(partner)>`
pub(crate) fn partner_key(prefix: &str, partner: &PartnerId) -> String {
    format!("{prefix}{}", STANDARD.encode(partner.as_bytes()))
}

struct Tracked<R> {
    record: R,
    lock: Mutex<()>,
    /// Thread running a handler on this request
    handler: Mutex<Option<ThreadId>>,
}

impl<R> Tracked<R> {
    fn new(record: R) -> Arc<Self> {
        Arc::new(Self { record, lock: Mutex::new(()), handler: Mutex::new(None) })
    }

    /// Take the request lock. Returns `None` when the calling thread is
    /// inside a handler on this request and so already holds it.
    fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        let current = thread::current().id();
        if *self.handler.lock().unwrap_or_else(PoisonError::into_inner) == Some(current) {
            return None;
        }
        Some(self.lock.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Mark the calling thread as running a handler until the mark drops.
    fn mark_handler(&self) -> HandlerMark<'_> {
        let previous = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(thread::current().id());
        HandlerMark { slot: &self.handler, previous }
    }
}

struct HandlerMark<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
    previous: Option<ThreadId>,
}

impl Drop for HandlerMark<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = self.previous;
    }
}

#[derive(Default)]
struct StoreState {
    sent: HashMap<PartnerId, Arc<Tracked<SentRequest>>>,
    received: HashMap<PartnerId, Arc<Tracked<ReceivedRequest>>>,
    negotiated: BTreeSet<PartnerId>,
}

/// Common handling of the two request maps.
trait RequestRecord: Clone + Serialize + DeserializeOwned {
    const KIND: RequestKind;
    const PREFIX: &'static str;

    fn partner(&self) -> PartnerId;
    fn map(state: &StoreState) -> &HashMap<PartnerId, Arc<Tracked<Self>>>;
    fn map_mut(state: &mut StoreState) -> &mut HashMap<PartnerId, Arc<Tracked<Self>>>;

    fn key(partner: &PartnerId) -> String {
        partner_key(Self::PREFIX, partner)
    }
}

impl RequestRecord for SentRequest {
    const KIND: RequestKind = RequestKind::Sent;
    const PREFIX: &'static str = SENT_REQUEST_PREFIX;

    fn partner(&self) -> PartnerId {
        self.partner
    }

    fn map(state: &StoreState) -> &HashMap<PartnerId, Arc<Tracked<Self>>> {
        &state.sent
    }

    fn map_mut(state: &mut StoreState) -> &mut HashMap<PartnerId, Arc<Tracked<Self>>> {
        &mut state.sent
    }
}

impl RequestRecord for ReceivedRequest {
    const KIND: RequestKind = RequestKind::Received;
    const PREFIX: &'static str = RECEIVED_REQUEST_PREFIX;

    fn partner(&self) -> PartnerId {
        self.partner
    }

    fn map(state: &StoreState) -> &HashMap<PartnerId, Arc<Tracked<Self>>> {
        &state.received
    }

    fn map_mut(state: &mut StoreState) -> &mut HashMap<PartnerId, Arc<Tracked<Self>>> {
        &mut state.received
    }
}

/// Durable negotiation state for one identity.
pub struct AuthStore<S: Storage> {
    storage: S,
    state: Mutex<StoreState>,
}

impl<S: Storage> AuthStore<S> {
    /// Create an empty store, overwriting any request map in `storage`.
    pub fn new(storage: S) -> Result<Self> {
        let store = Self { storage, state: Mutex::new(StoreState::default()) };
        {
            let state = store.state();
            store.save_request_map(&state)?;
            store.save_partners(&state)?;
        }
        Ok(store)
    }

    /// Load the store from `storage`, or create it if nothing was saved.
    pub fn open(storage: S) -> Result<Self> {
        if storage.get(REQUEST_MAP_KEY)?.is_none() {
            return Self::new(storage);
        }
        Self::load(storage)
    }

    /// Load a previously saved store.
    ///
    /// # Errors
    ///
    /// - `AuthStoreError::Corrupt` if the request map is missing or lists a
    ///   record that does not exist
    pub fn load(storage: S) -> Result<Self> {
        let entries: Vec<RequestEntry> = storage
            .get_record(REQUEST_MAP_KEY, REQUEST_MAP_VERSION)?
            .ok_or_else(|| AuthStoreError::Corrupt {
                key: REQUEST_MAP_KEY.to_string(),
                reason: "missing".to_string(),
            })?;

        let mut state = StoreState::default();
        for entry in &entries {
            match entry.kind {
                RequestKind::Sent => {
                    let record = load_record::<S, SentRequest>(&storage, &entry.partner)?;
                    state.sent.insert(entry.partner, Tracked::new(record));
                },
                RequestKind::Received => {
                    let record = load_record::<S, ReceivedRequest>(&storage, &entry.partner)?;
                    state.received.insert(entry.partner, Tracked::new(record));
                },
            }
        }
        state.negotiated = negotiations::load_partners(&storage)?;

        tracing::trace!(
            sent = state.sent.len(),
            received = state.received.len(),
            negotiated = state.negotiated.len(),
            "loaded auth store"
        );

        Ok(Self { storage, state: Mutex::new(state) })
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save_request_map(&self, state: &StoreState) -> Result<()> {
        let mut entries: Vec<RequestEntry> = state
            .sent
            .keys()
            .map(|partner| RequestEntry { kind: RequestKind::Sent, partner: *partner })
            .chain(
                state
                    .received
                    .keys()
                    .map(|partner| RequestEntry { kind: RequestKind::Received, partner: *partner }),
            )
            .collect();
        entries.sort_by_key(|entry| (entry.partner, entry.kind == RequestKind::Received));

        self.storage.set_record(REQUEST_MAP_KEY, REQUEST_MAP_VERSION, &entries)?;
        Ok(())
    }

    /// Record a request we are about to send.
    ///
    /// Returns `(record, true)` when stored. If a sent request for the partner
    /// already exists it is returned unchanged as `(existing, false)`.
    ///
    /// # Errors
    ///
    /// - `AuthStoreError::RequestAlreadyExists` if the partner has an
    ///   outstanding received request
    pub fn add_sent(&self, record: SentRequest) -> Result<(SentRequest, bool)> {
        let partner = record.partner;
        let mut state = self.state();

        if let Some(existing) = state.sent.get(&partner) {
            return Ok((existing.record.clone(), false));
        }
        if state.received.contains_key(&partner) {
            return Err(AuthStoreError::RequestAlreadyExists {
                partner,
                kind: RequestKind::Received,
            });
        }

        self.insert_locked(&mut state, record.clone())?;
        tracing::debug!(%partner, "stored sent request");
        Ok((record, true))
    }

    /// Record a request received from a partner.
    ///
    /// # Errors
    ///
    /// - `AuthStoreError::RequestAlreadyExists` if either request kind is
    ///   outstanding for the partner
    pub fn add_received(&self, record: ReceivedRequest) -> Result<()> {
        let partner = record.partner;
        let mut state = self.state();

        for (exists, kind) in [
            (state.received.contains_key(&partner), RequestKind::Received),
            (state.sent.contains_key(&partner), RequestKind::Sent),
        ] {
            if exists {
                return Err(AuthStoreError::RequestAlreadyExists { partner, kind });
            }
        }

        self.insert_locked(&mut state, record)?;
        tracing::debug!(%partner, "stored received request");
        Ok(())
    }

    fn insert_locked<R: RequestRecord>(&self, state: &mut StoreState, record: R) -> Result<()> {
        let partner = record.partner();
        let key = R::key(&partner);
        self.storage.set_record(&key, REQUEST_VERSION, &record)?;

        R::map_mut(state).insert(partner, Tracked::new(record));
        if let Err(err) = self.save_request_map(state) {
            R::map_mut(state).remove(&partner);
            if let Err(cleanup) = self.storage.delete(&key) {
                tracing::warn!(%partner, error = %cleanup, "orphaned unlisted request record");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Copy of the outstanding sent request for `partner`.
    pub fn get_sent_request(&self, partner: &PartnerId) -> Result<SentRequest> {
        self.get::<SentRequest>(partner)
    }

    /// Copy of the outstanding received request for `partner`.
    pub fn get_received_request(&self, partner: &PartnerId) -> Result<ReceivedRequest> {
        self.get::<ReceivedRequest>(partner)
    }

    fn get<R: RequestRecord>(&self, partner: &PartnerId) -> Result<R> {
        R::map(&self.state())
            .get(partner)
            .map(|tracked| tracked.record.clone())
            .ok_or(AuthStoreError::NotFound { partner: *partner, kind: R::KIND })
    }

    /// All outstanding sent requests, ordered by partner.
    pub fn get_all_sent(&self) -> Vec<SentRequest> {
        self.all::<SentRequest>()
    }

    /// All outstanding received requests, ordered by partner.
    pub fn get_all_received(&self) -> Vec<ReceivedRequest> {
        self.all::<ReceivedRequest>()
    }

    fn all<R: RequestRecord>(&self) -> Vec<R> {
        let mut records: Vec<R> =
            R::map(&self.state()).values().map(|tracked| tracked.record.clone()).collect();
        records.sort_by_key(R::partner);
        records
    }

    /// Run `handler` on the sent request for `partner` and delete the request
    /// if the handler succeeds.
    ///
    /// Only one handler runs on a given request at a time. A handler error is
    /// returned as-is and the request is kept.
    pub fn handle_sent_request<T, E>(
        &self,
        partner: &PartnerId,
        handler: impl FnOnce(&SentRequest) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<AuthStoreError>,
    {
        self.handle::<SentRequest, T, E>(partner, handler)
    }

    /// Run `handler` on the received request for `partner` and delete the
    /// request if the handler succeeds.
    pub fn handle_received_request<T, E>(
        &self,
        partner: &PartnerId,
        handler: impl FnOnce(&ReceivedRequest) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<AuthStoreError>,
    {
        self.handle::<ReceivedRequest, T, E>(partner, handler)
    }

    fn handle<R: RequestRecord, T, E: From<AuthStoreError>>(
        &self,
        partner: &PartnerId,
        handler: impl FnOnce(&R) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let not_found = || AuthStoreError::NotFound { partner: *partner, kind: R::KIND };

        let tracked = R::map(&self.state()).get(partner).cloned().ok_or_else(not_found)?;
        let _guard = tracked.acquire();
        if !self.is_listed(partner, &tracked) {
            return Err(not_found().into());
        }

        let value = {
            let _mark = tracked.mark_handler();
            handler(&tracked.record)?
        };

        if !self.unlist(partner, &tracked)? {
            tracing::debug!(%partner, kind = %R::KIND, "request removed by its own handler");
        }
        Ok(value)
    }

    fn is_listed<R: RequestRecord>(&self, partner: &PartnerId, tracked: &Arc<Tracked<R>>) -> bool {
        R::map(&self.state()).get(partner).is_some_and(|current| Arc::ptr_eq(current, tracked))
    }

    /// Delete the sent request for `partner`.
    pub fn delete_sent_request(&self, partner: &PartnerId) -> Result<()> {
        self.remove::<SentRequest>(partner)
    }

    /// Delete the received request for `partner`.
    pub fn delete_received_request(&self, partner: &PartnerId) -> Result<()> {
        self.remove::<ReceivedRequest>(partner)
    }

    /// Delete every outstanding request for `partner`.
    ///
    /// # Errors
    ///
    /// - `AuthStoreError::NotFound` if neither kind is outstanding
    pub fn delete_request(&self, partner: &PartnerId) -> Result<()> {
        let sent = self.remove::<SentRequest>(partner);
        let received = self.remove::<ReceivedRequest>(partner);
        match (sent, received) {
            (Err(err), _) | (_, Err(err)) if !err.is_not_found() => Err(err),
            (Err(_), Err(_)) => Err(AuthStoreError::NotFound {
                partner: *partner,
                kind: RequestKind::Received,
            }),
            _ => Ok(()),
        }
    }

    /// Delete all outstanding requests of both kinds.
    pub fn delete_all_requests(&self) -> Result<()> {
        self.remove_all::<SentRequest>()?;
        self.remove_all::<ReceivedRequest>()
    }

    /// Delete all outstanding sent requests.
    pub fn delete_sent_requests(&self) -> Result<()> {
        self.remove_all::<SentRequest>()
    }

    /// Delete all outstanding received requests.
    pub fn delete_receive_requests(&self) -> Result<()> {
        self.remove_all::<ReceivedRequest>()
    }

    fn remove<R: RequestRecord>(&self, partner: &PartnerId) -> Result<()> {
        loop {
            let tracked = R::map(&self.state())
                .get(partner)
                .cloned()
                .ok_or(AuthStoreError::NotFound { partner: *partner, kind: R::KIND })?;

            let _guard = tracked.acquire();
            if self.unlist(partner, &tracked)? {
                return Ok(());
            }
            // Replaced while we waited for the request lock.
        }
    }

    fn remove_all<R: RequestRecord>(&self) -> Result<()> {
        let mut listed: Vec<(PartnerId, Arc<Tracked<R>>)> = R::map(&self.state())
            .iter()
            .map(|(partner, tracked)| (*partner, Arc::clone(tracked)))
            .collect();
        listed.sort_by_key(|(partner, _)| *partner);

        let mut count = 0;
        let mut first_failure = None;
        for (partner, tracked) in &listed {
            let _guard = tracked.acquire();
            match self.unlist(partner, tracked) {
                Ok(removed) => count += usize::from(removed),
                Err(err @ AuthStoreError::PartialDelete { .. }) => {
                    count += 1;
                    first_failure.get_or_insert(err);
                },
                Err(err) => return Err(err),
            }
        }
        tracing::debug!(kind = %R::KIND, count, "deleted all requests");

        first_failure.map_or(Ok(()), Err)
    }

    /// Unlist and delete `tracked` if it is still the request listed for
    /// `partner`. The caller holds its request lock.
    fn unlist<R: RequestRecord>(&self, partner: &PartnerId, tracked: &Arc<Tracked<R>>) -> Result<bool> {
        let mut state = self.state();

        let listed = R::map(&state).get(partner).is_some_and(|current| Arc::ptr_eq(current, tracked));
        if !listed {
            return Ok(false);
        }
        let Some(entry) = R::map_mut(&mut state).remove(partner) else {
            return Ok(false);
        };
        if let Err(err) = self.save_request_map(&state) {
            R::map_mut(&mut state).insert(*partner, entry);
            return Err(err);
        }

        self.delete_record::<R>(partner)?;
        tracing::debug!(%partner, kind = %R::KIND, "deleted request");
        Ok(true)
    }

    fn delete_record<R: RequestRecord>(&self, partner: &PartnerId) -> Result<()> {
        self.storage.delete(&R::key(partner)).map_err(|err| {
            tracing::error!(%partner, kind = %R::KIND, error = %err, "request unlinked but not deleted");
            AuthStoreError::PartialDelete {
                partner: *partner,
                kind: R::KIND,
                reason: err.to_string(),
            }
        })
    }

    /// Forget everything about `partner`: requests, negotiation history and
    /// the stored confirm.
    pub fn delete_partner(&self, partner: &PartnerId) -> Result<()> {
        match self.delete_request(partner) {
            Err(err) if !err.is_not_found() => return Err(err),
            _ => {},
        }
        self.delete_negotiation_history(partner)?;
        self.delete_confirmation(partner)?;
        tracing::debug!(%partner, "deleted partner from auth store");
        Ok(())
    }
}

fn load_record<S: Storage, R: RequestRecord>(storage: &S, partner: &PartnerId) -> Result<R> {
    let key = R::key(partner);
    storage.get_record(&key, REQUEST_VERSION)?.ok_or_else(|| AuthStoreError::Corrupt {
        key,
        reason: "listed in request map but missing".to_string(),
    })
}
