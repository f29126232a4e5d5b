//! Send sessions: a send ratchet with its key budget.
//!
//! A ratchet of `num_keys + num_rekeys` keys is split into a normal budget
//! and a reserve. Application traffic draws from the normal budget only, so
//! a session that runs dry can still carry the rekey messages that replace
//! it.
//!
//! ```text
//! used ──────────────────────────────────────────────────────────────>
//! [ Active │ RekeyNeeded (used >= threshold) │ Empty (reserve) │ RekeyEmpty
//! ```

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sigil_crypto::{EncryptedMessage, Nike, RatchetId, SendRatchet, blake2b_256};

use crate::{env::Environment, error::NegotiationError, negotiation::NegotiationState, params::Params};

/// Usage level of a send session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Keys available, below the rekey threshold
    Active,
    /// Keys available, rekey threshold crossed
    RekeyNeeded,
    /// Only reserved rekey keys remain
    Empty,
    /// No keys remain
    RekeyEmpty,
}

/// Key budget of one ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Keys available to application traffic
    pub num_keys: u32,
    /// Used-key count at which a rekey is triggered
    pub rekey_threshold: u32,
    /// Keys reserved for rekey messages
    pub num_rekeys: u32,
}

impl Budget {
    /// Budget both ends derive from a shared `secret`.
    ///
    /// `num_keys` is drawn from `[min_keys, max_keys]` by the first eight
    /// bytes of `H(secret)`.
    pub fn from_secret(params: &Params, secret: &[u8]) -> Self {
        let span = u64::from(params.max_keys.saturating_sub(params.min_keys)) + 1;
        let digest = blake2b_256(&[secret]);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let offset = u64::from_be_bytes(head) % span;
        let num_keys = params.min_keys.saturating_add(u32::try_from(offset).unwrap_or(0));
        Self::with_num_keys(params, num_keys)
    }

    /// Budget of a ratchet holding `size` keys in total.
    pub fn for_size(params: &Params, size: u32) -> Self {
        Self::with_num_keys(params, size.saturating_sub(params.num_rekeys))
    }

    fn with_num_keys(params: &Params, num_keys: u32) -> Self {
        let rekey_threshold = (params.rekey_threshold * f64::from(num_keys)).ceil() as u32;
        Self { num_keys, rekey_threshold, num_rekeys: params.num_rekeys }
    }

    /// Ratchet size: normal budget plus reserve.
    pub fn size(&self) -> u32 {
        self.num_keys.saturating_add(self.num_rekeys)
    }
}

/// A send ratchet and the budget that governs it.
pub struct SendSession<N: Nike> {
    ratchet: SendRatchet<N>,
    budget: Budget,
    parent: Option<RatchetId>,
}

impl<N: Nike> SendSession<N> {
    /// Initial session of a channel, sized from the shared secret.
    pub fn new(
        my_private: N::PrivateKey,
        my_public: N::PublicKey,
        partner_public: N::PublicKey,
        salt: &[u8],
        params: &Params,
    ) -> Self {
        let ratchet = SendRatchet::new_sized(my_private, my_public, partner_public, salt, |secret| {
            Budget::from_secret(params, secret).size()
        });
        Self::wrap(ratchet, params, None)
    }

    /// Rebuild around a restored ratchet.
    pub fn from_parts(ratchet: SendRatchet<N>, params: &Params, parent: Option<RatchetId>) -> Self {
        Self::wrap(ratchet, params, parent)
    }

    fn wrap(ratchet: SendRatchet<N>, params: &Params, parent: Option<RatchetId>) -> Self {
        let budget = Budget::for_size(params, ratchet.size());
        Self { ratchet, budget, parent }
    }

    /// Successor over a fresh ephemeral key pair.
    pub fn next<R: RngCore + CryptoRng + ?Sized>(&self, rng: &mut R, params: &Params) -> Self {
        let ratchet =
            self.ratchet.next_sized(rng, |secret| Budget::from_secret(params, secret).size());
        Self::wrap(ratchet, params, Some(self.id()))
    }

    /// Encrypt under a key from the normal budget.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::KeysExhausted` once only reserved keys remain
    pub fn pop_key(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, NegotiationError> {
        if self.ratchet.num_available() <= self.budget.num_rekeys {
            return Err(NegotiationError::KeysExhausted { id: self.id() });
        }
        Ok(self.ratchet.encrypt(plaintext)?)
    }

    /// Encrypt under any remaining key, reserve included.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::Crypto` with `KeyExhaustion` once every key is
    ///   used
    pub fn pop_rekey(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, NegotiationError> {
        Ok(self.ratchet.encrypt(plaintext)?)
    }

    /// Current usage level.
    pub fn status(&self) -> SessionStatus {
        let available = self.ratchet.num_available();
        if available == 0 {
            SessionStatus::RekeyEmpty
        } else if available <= self.budget.num_rekeys {
            SessionStatus::Empty
        } else if self.ratchet.num_used() >= self.budget.rekey_threshold {
            SessionStatus::RekeyNeeded
        } else {
            SessionStatus::Active
        }
    }

    /// State this session should move to on a trigger pass, if any.
    ///
    /// A confirmed session past its threshold spawns a successor. An
    /// unconfirmed one is resent with probability
    /// `unconfirmed_retry_ratio`.
    pub fn trigger_negotiation<E: Environment>(
        &self,
        state: NegotiationState,
        params: &Params,
        env: &E,
    ) -> Option<NegotiationState> {
        match state {
            NegotiationState::Confirmed
                if self.ratchet.num_used() >= self.budget.rekey_threshold =>
            {
                Some(NegotiationState::NewSessionTriggered)
            },
            NegotiationState::Unconfirmed
                if env.random_unit() < params.unconfirmed_retry_ratio =>
            {
                Some(NegotiationState::Sending)
            },
            _ => None,
        }
    }

    /// Ratchet id.
    pub fn id(&self) -> RatchetId {
        self.ratchet.id()
    }

    /// Session this one replaces.
    pub fn parent(&self) -> Option<RatchetId> {
        self.parent
    }

    /// Budget.
    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Underlying ratchet.
    pub fn ratchet(&self) -> &SendRatchet<N> {
        &self.ratchet
    }
}

impl<N: Nike> Clone for SendSession<N> {
    fn clone(&self) -> Self {
        Self { ratchet: self.ratchet.clone(), budget: self.budget, parent: self.parent }
    }
}

impl<N: Nike> std::fmt::Debug for SendSession<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSession")
            .field("id", &self.id())
            .field("budget", &self.budget)
            .field("status", &self.status())
            .field("parent", &self.parent)
            .finish()
    }
}
