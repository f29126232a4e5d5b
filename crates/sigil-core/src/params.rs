//! Negotiated channel configuration.

use serde::{Deserialize, Serialize};

use crate::error::NegotiationError;

/// Key budget and retry parameters of a channel.
///
/// Both ends must use the same values: ratchet sizes are derived from the
/// shared secret through these bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Params {
    /// Smallest number of usable keys in a ratchet.
    pub min_keys: u32,
    /// Largest number of usable keys in a ratchet.
    pub max_keys: u32,
    /// Fraction of keys used before a rekey is triggered.
    pub rekey_threshold: f64,
    /// Keys held back from normal traffic for rekey messages.
    pub num_rekeys: u32,
    /// Chance per trigger pass of resending an unconfirmed rekey.
    pub unconfirmed_retry_ratio: f64,
    /// Replay stored requests through callbacks when a duplicate arrives.
    pub replay_requests: bool,
}

/// Default [`Params::min_keys`].
pub const DEFAULT_MIN_KEYS: u32 = 1000;
/// Default [`Params::max_keys`].
pub const DEFAULT_MAX_KEYS: u32 = 2000;
/// Default [`Params::rekey_threshold`].
pub const DEFAULT_REKEY_THRESHOLD: f64 = 0.05;
/// Default [`Params::num_rekeys`].
pub const DEFAULT_NUM_REKEYS: u32 = 16;
/// Default [`Params::unconfirmed_retry_ratio`].
pub const DEFAULT_UNCONFIRMED_RETRY_RATIO: f64 = 0.1;

const MIN_KEYS_FLOOR: u32 = 10;

impl Default for Params {
    fn default() -> Self {
        Self {
            min_keys: DEFAULT_MIN_KEYS,
            max_keys: DEFAULT_MAX_KEYS,
            rekey_threshold: DEFAULT_REKEY_THRESHOLD,
            num_rekeys: DEFAULT_NUM_REKEYS,
            unconfirmed_retry_ratio: DEFAULT_UNCONFIRMED_RETRY_RATIO,
            replay_requests: false,
        }
    }
}

impl Params {
    /// Check bounds.
    ///
    /// # Errors
    ///
    /// - `NegotiationError::InvalidParams` if `min_keys < 10`,
    ///   `min_keys > max_keys`, or a ratio is outside `[0, 1]`
    pub fn validate(&self) -> Result<(), NegotiationError> {
        let invalid = |reason: String| Err(NegotiationError::InvalidParams { reason });

        if self.min_keys < MIN_KEYS_FLOOR {
            return invalid(format!("min_keys {} below {MIN_KEYS_FLOOR}", self.min_keys));
        }
        if self.min_keys > self.max_keys {
            return invalid(format!(
                "min_keys {} exceeds max_keys {}",
                self.min_keys, self.max_keys
            ));
        }
        for (name, ratio) in [
            ("rekey_threshold", self.rekey_threshold),
            ("unconfirmed_retry_ratio", self.unconfirmed_retry_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return invalid(format!("{name} {ratio} outside [0, 1]"));
            }
        }
        Ok(())
    }
}
