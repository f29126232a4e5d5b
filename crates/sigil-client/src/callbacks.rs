//! Application callbacks for negotiation events.
//!
//! One default [`Callbacks`] receives every event. Individual partners can be
//! routed to their own handler, which then replaces the default for that
//! partner only.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use sigil_proto::PartnerId;

use crate::{contact::Contact, transport::Round};

/// Receiver of negotiation events.
///
/// Called after the manager has released its locks, so handlers may call
/// back into the manager.
pub trait Callbacks: Send + Sync {
    /// A partner asked for a channel. Answer with `Manager::confirm`.
    fn request(&self, partner: &Contact, round: Round);

    /// A channel with `partner` is ready.
    fn confirm(&self, partner: &Contact, round: Round);

    /// `partner` replaced its channel with us; the new one is ready.
    fn reset(&self, partner: &Contact, round: Round);
}

/// Kind of a recorded callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// [`Callbacks::request`]
    Request,
    /// [`Callbacks::confirm`]
    Confirm,
    /// [`Callbacks::reset`]
    Reset,
}

/// One recorded callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    /// Which callback fired
    pub kind: CallbackKind,
    /// Partner it fired for
    pub partner: PartnerId,
    /// Facts on the contact
    pub facts: Vec<String>,
    /// Round passed to the callback
    pub round: Round,
}

/// Callbacks that record every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallbacks {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every event recorded so far.
    pub fn take(&self) -> Vec<CallbackEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of events of `kind` recorded so far.
    pub fn count(&self, kind: CallbackKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    fn record(&self, kind: CallbackKind, partner: &Contact, round: Round) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(CallbackEvent {
            kind,
            partner: partner.id,
            facts: partner.facts.clone(),
            round,
        });
    }
}

impl Callbacks for RecordingCallbacks {
    fn request(&self, partner: &Contact, round: Round) {
        self.record(CallbackKind::Request, partner, round);
    }

    fn confirm(&self, partner: &Contact, round: Round) {
        self.record(CallbackKind::Confirm, partner, round);
    }

    fn reset(&self, partner: &Contact, round: Round) {
        self.record(CallbackKind::Reset, partner, round);
    }
}

/// Default handler plus per-partner overrides.
pub(crate) struct CallbackRegistry {
    default: Arc<dyn Callbacks>,
    partners: RwLock<HashMap<PartnerId, Arc<dyn Callbacks>>>,
}

impl CallbackRegistry {
    pub(crate) fn new(default: Arc<dyn Callbacks>) -> Self {
        Self { default, partners: RwLock::new(HashMap::new()) }
    }

    pub(crate) fn add(&self, partner: PartnerId, callbacks: Arc<dyn Callbacks>) {
        self.partners.write().unwrap_or_else(PoisonError::into_inner).insert(partner, callbacks);
    }

    pub(crate) fn delete(&self, partner: &PartnerId) {
        self.partners.write().unwrap_or_else(PoisonError::into_inner).remove(partner);
    }

    /// Handler for `partner`.
    pub(crate) fn get(&self, partner: &PartnerId) -> Arc<dyn Callbacks> {
        self.partners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partner)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::contact::Identity;

    fn contact(byte: u8) -> Contact {
        let mut rng = ChaCha20Rng::seed_from_u64(u64::from(byte));
        Identity::generate(PartnerId::new([byte; PartnerId::LEN]), &mut rng).contact()
    }

    #[test]
    fn partner_override_replaces_default() {
        let default = Arc::new(RecordingCallbacks::new());
        let special = Arc::new(RecordingCallbacks::new());
        let registry = CallbackRegistry::new(default.clone());

        let alice = contact(1);
        let bob = contact(2);
        registry.add(bob.id, special.clone());

        registry.get(&alice.id).request(&alice, 1);
        registry.get(&bob.id).confirm(&bob, 2);
        assert_eq!(default.count(CallbackKind::Request), 1);
        assert_eq!(default.count(CallbackKind::Confirm), 0);
        assert_eq!(special.count(CallbackKind::Confirm), 1);

        registry.delete(&bob.id);
        registry.get(&bob.id).reset(&bob, 3);
        assert_eq!(default.count(CallbackKind::Reset), 1);
    }

    #[test]
    fn take_drains_events() {
        let recorder = RecordingCallbacks::new();
        let alice = contact(3).with_facts(vec!["nick:al".to_string()]);
        recorder.request(&alice, 7);

        assert_eq!(
            recorder.take(),
            [CallbackEvent {
                kind: CallbackKind::Request,
                partner: alice.id,
                facts: vec!["nick:al".to_string()],
                round: 7,
            }]
        );
        assert!(recorder.take().is_empty());
    }
}
