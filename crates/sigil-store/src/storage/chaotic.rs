//! Fault-injecting storage wrapper.
//!
//! Delegates to an inner backend but fails a seeded fraction of operations
//! with `StorageError::Io`. A failed call never reaches the inner backend, so
//! the inner state is exactly the sequence of successful calls.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::{Storage, StorageError, VersionedObject};

const DEFAULT_SEED: u64 = 0x5161_1c4a_05e0_0001;

/// Storage wrapper that randomly injects failures.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// `f64` bits of the failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha20Rng>>,
    operation_count: Arc<AtomicUsize>,
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate: Arc::new(AtomicU64::new(failure_rate.to_bits())),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Change the failure rate for all clones. Out-of-range values clamp.
    pub fn set_failure_rate(&self, failure_rate: f64) {
        let clamped = failure_rate.clamp(0.0, 1.0);
        self.failure_rate.store(clamped.to_bits(), Ordering::Relaxed);
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn inject(&self, operation: &'static str, key: &str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let rate = f64::from_bits(self.failure_rate.load(Ordering::Relaxed));
        let roll: f64 = self.rng.lock().unwrap_or_else(PoisonError::into_inner).r#gen();
        if roll < rate {
            tracing::trace!(operation, key, "injected storage failure");
            return Err(StorageError::Io(format!("chaotic failure injection: {operation} {key}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn get(&self, key: &str) -> Result<Option<VersionedObject>, StorageError> {
        self.inject("get", key)?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, object: &VersionedObject) -> Result<(), StorageError> {
        self.inject("set", key)?;
        self.inner.set(key, object)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inject("delete", key)?;
        self.inner.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn object(byte: u8) -> VersionedObject {
        VersionedObject::new(0, vec![byte])
    }

    #[test]
    fn zero_failure_rate_never_fails() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 0.0);

        for i in 0..100u8 {
            chaotic.set(&format!("key/{i}"), &object(i)).unwrap();
        }
        assert_eq!(chaotic.inner().len(), 100);
        assert_eq!(chaotic.operation_count(), 100);
    }

    #[test]
    fn full_failure_rate_always_fails() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0);

        assert!(chaotic.set("a", &object(1)).is_err());
        assert!(chaotic.get("a").is_err());
        assert!(chaotic.delete("a").is_err());
        assert!(chaotic.inner().is_empty());
    }

    #[test]
    fn same_seed_same_failures() {
        let first = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);
        let second = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, 42);

        for i in 0..100u8 {
            let key = format!("key/{i}");
            assert_eq!(
                first.set(&key, &object(i)).is_ok(),
                second.set(&key, &object(i)).is_ok(),
                "determinism violated at iteration {i}"
            );
        }
    }

    #[test]
    fn failure_rate_change_is_shared() {
        let chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let clone = chaotic.clone();

        clone.set_failure_rate(0.0);
        chaotic.set("a", &object(1)).unwrap();
        assert_eq!(chaotic.inner().get("a").unwrap(), Some(object(1)));
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between 0.0 and 1.0")]
    fn rejects_invalid_failure_rate() {
        let _chaotic = ChaoticStorage::new(MemoryStorage::new(), 1.5);
    }
}
