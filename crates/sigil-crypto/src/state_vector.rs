//! Key usage tracking.
//!
//! A [`StateVector`] records which indices of a fixed-size key space have been
//! consumed. Bits are packed into 64-bit blocks; bit `i % 64` of block
//! `i / 64` is set once key `i` is used.
//!
//! # Invariants
//!
//! - `num_available == num_keys - popcount(vect)`
//! - `first_available` is the lowest unused index, or `num_keys` when every
//!   key is used
//! - No bit at or beyond `num_keys` is ever set
//!
//! The vector carries no lock. The owning ratchet serializes access.

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Bits per storage block.
const BLOCK_BITS: u32 = 64;

/// Bitfield of used key indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    vect: Vec<u64>,
    first_available: u32,
    num_keys: u32,
    num_available: u32,
}

impl StateVector {
    /// Create a vector tracking `num_keys` unused keys.
    pub fn new(num_keys: u32) -> Self {
        Self {
            vect: vec![0; num_blocks(num_keys)],
            first_available: 0,
            num_keys,
            num_available: num_keys,
        }
    }

    /// Mark key `index` as used.
    ///
    /// Already used and out-of-range indices are ignored.
    pub fn use_key(&mut self, index: u32) {
        if index >= self.num_keys {
            tracing::warn!(index, num_keys = self.num_keys, "ignoring use of out-of-range key");
            return;
        }
        if self.used(index) {
            return;
        }

        let (block, mask) = locate(index);
        self.vect[block] |= mask;
        self.num_available -= 1;

        if index == self.first_available {
            self.first_available = self.scan_from(index + 1);
        }
    }

    /// Mark every index in `indices` as used.
    pub fn use_many(&mut self, indices: &[u32]) {
        for &index in indices {
            self.use_key(index);
        }
    }

    /// Return key `index` to the unused pool.
    ///
    /// Unused and out-of-range indices are ignored.
    pub fn unuse(&mut self, index: u32) {
        if index >= self.num_keys {
            tracing::warn!(index, num_keys = self.num_keys, "ignoring unuse of out-of-range key");
            return;
        }
        if !self.used(index) {
            return;
        }

        let (block, mask) = locate(index);
        self.vect[block] &= !mask;
        self.num_available += 1;

        if index < self.first_available {
            self.first_available = index;
        }
    }

    /// Return every index in `indices` to the unused pool.
    pub fn unuse_many(&mut self, indices: &[u32]) {
        for &index in indices {
            self.unuse(index);
        }
    }

    /// Whether key `index` has been used. Out-of-range indices are unused.
    pub fn used(&self, index: u32) -> bool {
        if index >= self.num_keys {
            return false;
        }
        let (block, mask) = locate(index);
        self.vect[block] & mask != 0
    }

    /// Claim and return the lowest unused index.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyExhaustion` when every key is used
    pub fn next(&mut self) -> Result<u32, CryptoError> {
        if self.first_available >= self.num_keys {
            return Err(CryptoError::KeyExhaustion { num_keys: self.num_keys });
        }

        let index = self.first_available;
        self.use_key(index);
        Ok(index)
    }

    /// Number of unused keys.
    pub fn num_available(&self) -> u32 {
        self.num_available
    }

    /// Number of used keys.
    pub fn num_used(&self) -> u32 {
        self.num_keys - self.num_available
    }

    /// Size of the key space.
    pub fn num_keys(&self) -> u32 {
        self.num_keys
    }

    /// Lowest unused index, or `num_keys` when exhausted.
    pub fn first_available(&self) -> u32 {
        self.first_available
    }

    /// All unused indices in ascending order.
    pub fn unused_key_nums(&self) -> Vec<u32> {
        (self.first_available..self.num_keys).filter(|&i| !self.used(i)).collect()
    }

    /// All used indices in ascending order.
    pub fn used_key_nums(&self) -> Vec<u32> {
        (0..self.num_keys).filter(|&i| self.used(i)).collect()
    }

    /// Serialize to CBOR.
    pub fn marshal(&self) -> Result<Vec<u8>, CryptoError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR, rejecting inconsistent counters.
    ///
    /// # Errors
    ///
    /// - `CryptoError::Corrupt` if the blob does not decode or its counters
    ///   disagree with the bitfield
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, CryptoError> {
        let vector: Self = ciborium::from_reader(bytes).map_err(|e| CryptoError::Corrupt {
            what: "state vector",
            reason: e.to_string(),
        })?;
        vector.validate()?;
        Ok(vector)
    }

    fn validate(&self) -> Result<(), CryptoError> {
        let corrupt = |reason: String| CryptoError::Corrupt { what: "state vector", reason };

        if self.vect.len() != num_blocks(self.num_keys) {
            return Err(corrupt(format!(
                "{} blocks for {} keys",
                self.vect.len(),
                self.num_keys
            )));
        }

        let tail_bits = self.num_keys % BLOCK_BITS;
        if tail_bits != 0 {
            let tail_mask = !0u64 << tail_bits;
            if self.vect.last().is_some_and(|block| block & tail_mask != 0) {
                return Err(corrupt("bits set beyond key space".to_string()));
            }
        }

        let used: u32 = self.vect.iter().map(|block| block.count_ones()).sum();
        if self.num_available.checked_add(used) != Some(self.num_keys) {
            return Err(corrupt(format!(
                "{} available + {} used != {} keys",
                self.num_available, used, self.num_keys
            )));
        }

        if self.first_available != self.scan_from(0) {
            return Err(corrupt(format!("first available {} is stale", self.first_available)));
        }

        Ok(())
    }

    /// Lowest zero bit at or after `start`, or `num_keys` if none.
    fn scan_from(&self, start: u32) -> u32 {
        let mut index = start;
        while index < self.num_keys {
            let (block, _) = locate(index);
            let offset = index % BLOCK_BITS;
            let free = !self.vect[block] >> offset;
            if free != 0 {
                return (index + free.trailing_zeros()).min(self.num_keys);
            }
            index = (block as u32 + 1) * BLOCK_BITS;
        }
        self.num_keys
    }
}

fn num_blocks(num_keys: u32) -> usize {
    num_keys.div_ceil(BLOCK_BITS) as usize
}

fn locate(index: u32) -> (usize, u64) {
    ((index / BLOCK_BITS) as usize, 1u64 << (index % BLOCK_BITS))
}
