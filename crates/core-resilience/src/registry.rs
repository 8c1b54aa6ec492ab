//! Keyed registries of shared primitives
//!
//! Callers that share a connector id must share its breaker, limiter and
//! cache. A [`Registry`] hands out one `Arc` per id, created on first use.
//! The map itself sits behind a `RwLock` that is only held for lookups; each
//! entry carries its own lock, so unrelated ids never contend.
//!
//! # Example
//!
//! ```
//! use lifeline_core_resilience::registry::Registry;
//! use lifeline_core_resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breakers: Registry<CircuitBreaker> = Registry::new("circuit-breakers");
//! let a = breakers.get_or_create("transit", || {
//!     CircuitBreaker::new("transit", CircuitBreakerConfig::default())
//! });
//! let b = breakers.get_or_create("transit", || unreachable!());
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! ```

use crate::cache::ResponseCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::rate_limiter::TokenBucketRateLimiter;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Map from id to a shared instance of `T`
#[derive(Debug)]
pub struct Registry<T> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    /// Create an empty registry; `kind` labels log lines
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<T>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<T>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the entry for `id`, creating it with `make` on first use
    pub fn get_or_create<F>(&self, id: &str, make: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.read().get(id) {
            return Arc::clone(existing);
        }

        let mut entries = self.write();
        // Another caller may have won the race between the two locks
        Arc::clone(entries.entry(id.to_string()).or_insert_with(|| {
            debug!(registry = self.kind, id, "Registry entry created");
            Arc::new(make())
        }))
    }

    /// Like [`get_or_create`](Self::get_or_create), but an existing entry
    /// that `keep` rejects is replaced with a fresh one from `make`
    ///
    /// Holders of the replaced `Arc` keep using it; only later lookups see
    /// the new entry.
    pub fn get_or_replace<K, F>(&self, id: &str, keep: K, make: F) -> Arc<T>
    where
        K: Fn(&T) -> bool,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.read().get(id).filter(|existing| keep(existing)) {
            return Arc::clone(existing);
        }

        let mut entries = self.write();
        if let Some(existing) = entries.get(id).filter(|existing| keep(existing)) {
            return Arc::clone(existing);
        }
        let value = Arc::new(make());
        if entries.insert(id.to_string(), Arc::clone(&value)).is_some() {
            info!(registry = self.kind, id, "Registry entry replaced");
        } else {
            debug!(registry = self.kind, id, "Registry entry created");
        }
        value
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.read().get(id).cloned()
    }

    /// Insert or replace the entry for `id`, returning the previous one
    pub fn insert(&self, id: impl Into<String>, value: T) -> Option<Arc<T>> {
        self.write().insert(id.into(), Arc::new(value))
    }

    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!(registry = self.kind, id, "Registry entry removed");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all entries, sorted by id
    pub fn entries(&self) -> Vec<(String, Arc<T>)> {
        let mut entries: Vec<(String, Arc<T>)> = self
            .read()
            .iter()
            .map(|(id, value)| (id.clone(), Arc::clone(value)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.write().clear();
    }
}

impl Registry<CircuitBreaker> {
    /// Close every breaker
    pub async fn reset_all(&self) {
        for (_, breaker) in self.entries() {
            breaker.reset().await;
        }
    }
}

impl Registry<TokenBucketRateLimiter> {
    /// Refill every bucket and fail their queued callers
    pub fn reset_all(&self) {
        for (_, limiter) in self.entries() {
            limiter.reset();
        }
    }
}

impl<T: Clone> Registry<ResponseCache<T>> {
    /// Empty every cache
    pub fn clear_all(&self) {
        for (_, cache) in self.entries() {
            cache.clear();
        }
    }

    /// Prune every cache, returning the total number of entries removed
    pub fn prune_all(&self) -> usize {
        self.entries().iter().map(|(_, cache)| cache.prune()).sum()
    }
}
