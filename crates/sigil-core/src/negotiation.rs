//! Negotiation state of send ratchets.
//!
//! Every send ratchet of a channel sits in exactly one [`NegotiationState`].
//! Moves are restricted to a fixed table:
//!
//! ```text
//! Unconfirmed <──> Sending ──> Sent ──> Confirmed <──> NewSessionTriggered
//!                     │                   ^                     │
//!                     └───────────────────┘                     ↓
//!                                   Sent <──────────── NewSessionCreated
//! ```
//!
//! `Sending` and `NewSessionTriggered` are in-flight states: they are
//! persisted as `Unconfirmed` and `Confirmed` so a crash mid-send retries the
//! action after reload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sigil_crypto::RatchetId;

use crate::error::NegotiationError;

/// Lifecycle of a send ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NegotiationState {
    /// Rekey offered but never acknowledged
    Unconfirmed,
    /// Rekey being handed to the transport
    Sending,
    /// Rekey handed to the transport
    Sent,
    /// Partner confirmed the ratchet
    Confirmed,
    /// Responder's ratchet awaiting acknowledgement, or a confirmed ratchet
    /// about to spawn its successor
    NewSessionTriggered,
    /// Successor spawned
    NewSessionCreated,
}

impl NegotiationState {
    /// Every state, in table order.
    pub const ALL: [Self; 6] = [
        Self::Unconfirmed,
        Self::Sending,
        Self::Sent,
        Self::Confirmed,
        Self::NewSessionTriggered,
        Self::NewSessionCreated,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Whether moving from `self` to `to` is in the legal-transition table.
    pub fn can_transition_to(self, to: Self) -> bool {
        use NegotiationState::{
            Confirmed, NewSessionCreated, NewSessionTriggered, Sending, Sent, Unconfirmed,
        };

        matches!(
            (self, to),
            (Unconfirmed, Sending)
                | (Sending, Unconfirmed | Sent | Confirmed)
                | (Sent, Confirmed)
                | (Confirmed, NewSessionTriggered)
                | (NewSessionTriggered, Confirmed | NewSessionCreated)
                | (NewSessionCreated, Sent)
        )
    }

    /// State written to disk.
    pub fn persisted(self) -> Self {
        match self {
            Self::Sending => Self::Unconfirmed,
            Self::NewSessionTriggered => Self::Confirmed,
            other => other,
        }
    }
}

/// Send ratchet ids grouped by state.
///
/// Each per-state list is ordered by arrival in that state, newest last.
/// `state_of` is the inverse of the lists.
#[derive(Debug, Clone, Default)]
pub struct NegotiationTracker {
    by_state: [Vec<RatchetId>; 6],
    state_of: HashMap<RatchetId, NegotiationState>,
}

impl NegotiationTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id` in `state`.
    ///
    /// Re-inserting a tracked id moves it without a transition check; this is
    /// for construction and reload only.
    pub fn insert(&mut self, id: RatchetId, state: NegotiationState) {
        self.remove(&id);
        self.by_state[state.index()].push(id);
        self.state_of.insert(id, state);
    }

    /// Stop tracking `id`, returning its last state.
    pub fn remove(&mut self, id: &RatchetId) -> Option<NegotiationState> {
        let state = self.state_of.remove(id)?;
        self.by_state[state.index()].retain(|known| known != id);
        Some(state)
    }

    /// Current state of `id`.
    pub fn state(&self, id: &RatchetId) -> Option<NegotiationState> {
        self.state_of.get(id).copied()
    }

    /// Move `id` to `to`, returning the state it left.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::NotFound` if `id` is not tracked under its
    ///   recorded state
    /// - `NegotiationError::InvalidTransition` if the move is not legal
    ///
    /// On error nothing changes.
    pub fn set_state(
        &mut self,
        id: RatchetId,
        to: NegotiationState,
    ) -> Result<NegotiationState, NegotiationError> {
        let from = self.state(&id).ok_or(NegotiationError::NotFound { id })?;
        if !from.can_transition_to(to) {
            return Err(NegotiationError::InvalidTransition { id, from, to });
        }

        let list = &mut self.by_state[from.index()];
        let position =
            list.iter().position(|known| *known == id).ok_or(NegotiationError::NotFound { id })?;
        list.remove(position);

        self.by_state[to.index()].push(id);
        self.state_of.insert(id, to);
        tracing::debug!(ratchet = %id, ?from, ?to, "negotiation state changed");
        Ok(from)
    }

    /// Ids in `state`, oldest first.
    pub fn ids_in(&self, state: NegotiationState) -> &[RatchetId] {
        &self.by_state[state.index()]
    }

    /// Most recent arrival in `state`.
    pub fn newest_in(&self, state: NegotiationState) -> Option<RatchetId> {
        self.by_state[state.index()].last().copied()
    }

    /// Every tracked id with its state, in table order.
    pub fn iter(&self) -> impl Iterator<Item = (RatchetId, NegotiationState)> + '_ {
        NegotiationState::ALL
            .into_iter()
            .flat_map(move |state| self.ids_in(state).iter().map(move |id| (*id, state)))
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.state_of.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.state_of.is_empty()
    }
}
