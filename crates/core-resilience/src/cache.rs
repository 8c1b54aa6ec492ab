//! LRU response cache with TTL, tag/pattern invalidation and stale-while-revalidate
//!
//! # Key Concepts
//!
//! - **Capacity**: inserting into a full cache evicts the least-recently-used entry
//! - **TTL**: entries expire `ttl` after being set
//! - **Stale-while-revalidate**: when enabled, an expired entry is still served
//!   (flagged `stale`) for another `stale_ttl` while a refresh runs
//! - **Tags**: entries can be indexed under tags and invalidated as a group
//!
//! The entry map, the LRU order and the tag index are only mutated through
//! `insert_entry` / `remove_entry`, which keep the three in lock-step.
//!
//! # Example
//!
//! ```
//! use lifeline_core_resilience::cache::{CacheConfig, ResponseCache, SetOptions};
//!
//! let cache = ResponseCache::new("morgue-db", CacheConfig::default());
//! cache.set_with("GET:/cases/42", "payload".to_string(), SetOptions::tagged(["cases"]));
//!
//! let hit = cache.get("GET:/cases/42").unwrap();
//! assert_eq!(hit.data, "payload");
//! assert!(!hit.stale);
//!
//! assert_eq!(cache.invalidate_by_tag("cases"), 1);
//! assert!(cache.get("GET:/cases/42").is_none());
//! ```

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Configuration for a response cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Serve expired entries while they are within `stale_ttl`
    pub stale_while_revalidate: bool,
    /// How long past expiry an entry may still be served stale
    pub stale_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 1000,
            stale_while_revalidate: false,
            stale_ttl: Duration::from_secs(60),
        }
    }
}

/// Per-entry options for [`ResponseCache::set_with`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the default TTL
    pub ttl: Option<Duration>,
    /// Tags to index the entry under
    pub tags: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl SetOptions {
    /// Options carrying only tags
    pub fn tagged<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Options carrying only a TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }
}

/// A cached value and its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub cached_at: Instant,
    pub expires_at: Instant,
    /// Last instant the entry may be served stale (revalidation only)
    pub stale_at: Option<Instant>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub hit_count: u64,
    tags: Vec<String>,
    access_tick: u64,
}

impl<T> CacheEntry<T> {
    /// Instant after which the entry can no longer be served at all
    fn hard_expiry(&self) -> Instant {
        self.stale_at.unwrap_or(self.expires_at)
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub data: T,
    /// Expired but served under stale-while-revalidate
    pub stale: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Counters exposed by [`ResponseCache::stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// access tick -> key, oldest first
    lru: BTreeMap<u64, String>,
    tags: HashMap<String, HashSet<String>>,
    /// Keys with a background refresh in flight
    revalidating: HashSet<String>,
    next_tick: u64,
    hits: u64,
    stale_hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
}

impl<T> CacheState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            tags: HashMap::new(),
            revalidating: HashSet::new(),
            next_tick: 0,
            hits: 0,
            stale_hits: 0,
            misses: 0,
            sets: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.access_tick);
            entry.access_tick = tick;
            self.lru.insert(tick, key.to_string());
        }
    }

    fn insert_entry(&mut self, key: String, mut entry: CacheEntry<T>) {
        self.remove_entry(&key);
        let tick = self.tick();
        entry.access_tick = tick;
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.lru.insert(tick, key.clone());
        self.entries.insert(key, entry);
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.access_tick);
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let key = self.lru.values().next()?.clone();
        self.remove_entry(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Capacity-bounded LRU cache shared by every caller of one connector
///
/// Cloning is cheap and yields a handle onto the same entries.
#[derive(Debug)]
pub struct ResponseCache<T> {
    name: Arc<str>,
    config: Arc<CacheConfig>,
    state: Arc<Mutex<CacheState<T>>>,
}

impl<T> Clone for ResponseCache<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CacheState::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deterministic key: method + URL + query parameters sorted by name
    pub fn generate_key<K, V>(method: &str, url: &str, params: &[(K, V)]) -> String
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_ref(), v.as_ref()))
            .collect();
        pairs.sort();
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        if query.is_empty() {
            format!("{}:{}", method.to_uppercase(), url)
        } else {
            format!("{}:{}?{}", method.to_uppercase(), url, query)
        }
    }

    /// Look up a key, marking it most recently used
    pub fn get(&self, key: &str) -> Option<CacheHit<T>> {
        let mut state = self.lock();
        let now = Instant::now();

        let Some((expires_at, stale_at)) = state
            .entries
            .get(key)
            .map(|entry| (entry.expires_at, entry.stale_at))
        else {
            state.misses += 1;
            return None;
        };

        let stale = now > expires_at;
        if stale {
            let servable = self.config.stale_while_revalidate
                && stale_at.is_some_and(|stale_at| now <= stale_at);
            if !servable {
                state.remove_entry(key);
                state.misses += 1;
                trace!(cache = %self.name, key, "Expired entry evicted on read");
                return None;
            }
        }

        state.touch(key);
        if stale {
            state.stale_hits += 1;
        } else {
            state.hits += 1;
        }

        let entry = state.entries.get_mut(key)?;
        entry.hit_count += 1;
        Some(CacheHit {
            data: entry.data.clone(),
            stale,
            etag: entry.etag.clone(),
            last_modified: entry.last_modified.clone(),
        })
    }

    /// Read an entry without touching LRU order or statistics
    pub fn peek(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lock().entries.get(key).cloned()
    }

    /// True if the key is present and can still be served
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock().entries.get(key).is_some_and(|entry| {
            now <= entry.expires_at
                || (self.config.stale_while_revalidate
                    && entry.stale_at.is_some_and(|stale_at| now <= stale_at))
        })
    }

    /// Insert with the default TTL and no tags
    pub fn set(&self, key: impl Into<String>, data: T) {
        self.set_with(key, data, SetOptions::default());
    }

    /// Insert, evicting the least-recently-used entry when at capacity
    pub fn set_with(&self, key: impl Into<String>, data: T, options: SetOptions) {
        let key = key.into();
        let mut state = self.lock();

        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.config.max_entries.max(1) {
                match state.evict_lru() {
                    Some(evicted) => debug!(cache = %self.name, key = %evicted, "LRU eviction"),
                    None => break,
                }
            }
        }

        let now = Instant::now();
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let expires_at = now + ttl;
        let stale_at = self
            .config
            .stale_while_revalidate
            .then(|| expires_at + self.config.stale_ttl);

        let mut tags = options.tags;
        tags.sort();
        tags.dedup();

        state.sets += 1;
        state.insert_entry(
            key,
            CacheEntry {
                data,
                cached_at: now,
                expires_at,
                stale_at,
                etag: options.etag,
                last_modified: options.last_modified,
                hit_count: 0,
                tags,
                access_tick: 0,
            },
        );
    }

    /// Remove one key
    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove_entry(key).is_some()
    }

    /// Remove every entry (statistics are kept)
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.lru.clear();
        state.tags.clear();
    }

    /// Remove every entry registered under `tag`
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut state = self.lock();
        let Some(keys) = state.tags.get(tag).cloned() else {
            return 0;
        };
        let removed = keys
            .iter()
            .filter(|key| state.remove_entry(key).is_some())
            .count();
        debug!(cache = %self.name, tag, removed, "Invalidated by tag");
        removed
    }

    /// Remove every entry whose key matches `pattern`
    pub fn invalidate_by_pattern(&self, pattern: &Regex) -> usize {
        let mut state = self.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        for key in &keys {
            state.remove_entry(key);
        }
        debug!(cache = %self.name, pattern = %pattern, removed = keys.len(), "Invalidated by pattern");
        keys.len()
    }

    /// Sweep entries that can no longer be served
    pub fn prune(&self) -> usize {
        let mut state = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| now > entry.hard_expiry())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove_entry(key);
        }
        if !expired.is_empty() {
            debug!(cache = %self.name, pruned = expired.len(), "Pruned expired entries");
        }
        expired.len()
    }

    /// Number of entries currently stored (including expired, unpruned ones)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from least to most recently used
    pub fn keys(&self) -> Vec<String> {
        self.lock().lru.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.stale_hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.config.max_entries,
            hits: state.hits,
            stale_hits: state.stale_hits,
            misses: state.misses,
            sets: state.sets,
            evictions: state.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (state.hits + state.stale_hits) as f64 / lookups as f64
            },
        }
    }
}

impl<T: Clone + Send + 'static> ResponseCache<T> {
    /// Serve from cache, fetching on a miss
    ///
    /// A stale hit is returned immediately and one background refresh per key
    /// is spawned; concurrent stale reads of the same key do not spawn more.
    /// Failed fetches are not cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        options: SetOptions,
        fetch: F,
    ) -> Result<CacheHit<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        match self.get(key) {
            Some(hit) if !hit.stale => Ok(hit),
            Some(hit) => {
                let first = self.lock().revalidating.insert(key.to_string());
                if first {
                    // Cleared on drop, so a panicking refresh cannot pin the key
                    let marker = RevalidationMarker {
                        cache: self.clone(),
                        key: key.to_string(),
                    };
                    let refresh = fetch();
                    tokio::spawn(async move {
                        let RevalidationMarker { cache, key } = &marker;
                        match refresh.await {
                            Ok(data) => cache.set_with(key.clone(), data, options),
                            Err(e) => {
                                warn!(cache = %cache.name, key = %key, error = %e, "Background revalidation failed")
                            }
                        }
                    });
                }
                Ok(hit)
            }
            None => {
                let data = fetch().await?;
                let hit = CacheHit {
                    data: data.clone(),
                    stale: false,
                    etag: options.etag.clone(),
                    last_modified: options.last_modified.clone(),
                };
                self.set_with(key, data, options);
                Ok(hit)
            }
        }
    }
}

/// A key's in-flight revalidation flag, removed when dropped
struct RevalidationMarker<T: Clone> {
    cache: ResponseCache<T>,
    key: String,
}

impl<T: Clone> Drop for RevalidationMarker<T> {
    fn drop(&mut self) {
        self.cache.lock().revalidating.remove(&self.key);
    }
}
