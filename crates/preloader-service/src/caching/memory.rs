use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::types::{Payload, Priority};

use super::CacheError;

/// An entry in the [`ResourceCache`].
#[derive(Clone, Debug)]
pub struct CachedResource {
    /// The resource identifier.
    pub key: String,
    /// Handle to the loaded resource.
    pub payload: Payload,
    /// The priority the resource was requested with. Kept for diagnostics only.
    pub priority: Priority,
    /// When the entry was inserted. Never changes.
    pub inserted_at: Instant,
    /// When the entry was last returned from [`ResourceCache::get`].
    pub last_accessed_at: Instant,
}

impl CachedResource {
    /// Time elapsed since insertion, as seen at `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.inserted_at)
    }
}

/// Statistics about cache usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently cached.
    pub entries: usize,
    /// The current capacity.
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to satisfy the capacity bound.
    pub evictions: u64,
    /// Entries removed because they outlived the cache duration.
    pub expirations: u64,
}

impl CacheStats {
    /// The cache hit rate, between `0.0` and `1.0`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheState {
    /// Entries in insertion order, oldest first.
    entries: IndexMap<String, CachedResource>,
    capacity: usize,
    stats: CacheStats,
}

impl CacheState {
    /// Removes an entry, keeping the insertion order of the others.
    fn remove(&mut self, key: &str) -> Option<CachedResource> {
        self.entries.shift_remove(key)
    }

    fn evict_oldest(&mut self) -> Option<CachedResource> {
        let (_, entry) = self.entries.shift_remove_index(0)?;
        self.stats.evictions += 1;
        tracing::debug!(key = %entry.key, priority = %entry.priority, "Evicted cached resource");
        Some(entry)
    }

    /// Evicts the oldest entries until at most `target` are left.
    fn evict_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > target && self.evict_oldest().is_some() {
            evicted += 1;
        }
        if evicted > 0 {
            metric!(counter("cache.evictions") += evicted as i64);
        }
        evicted
    }

    fn report(&self) {
        metric!(gauge("cache.entries") = self.entries.len() as u64);
        metric!(gauge("cache.capacity") = self.capacity as u64);
    }
}

/// A capacity-bounded, in-memory cache of loaded resources.
///
/// When an insert would exceed the capacity, the earliest inserted entries are evicted first.
/// The priority of an entry does not influence eviction.
///
/// The cache is cheap to clone; all clones share the same state. Every operation runs as one
/// critical section, so check-then-modify sequences like "evict, then insert" are atomic with
/// respect to concurrent users such as the [`TtlReaper`](super::TtlReaper).
#[derive(Clone)]
pub struct ResourceCache {
    state: Arc<Mutex<CacheState>>,
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ResourceCache");
        if let Some(state) = self.state.try_lock() {
            debug
                .field("entries", &state.entries.len())
                .field("capacity", &state.capacity);
        }
        debug.finish_non_exhaustive()
    }
}

impl ResourceCache {
    /// Creates an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity(capacity));
        }

        let state = CacheState {
            entries: IndexMap::new(),
            capacity,
            stats: CacheStats {
                capacity,
                ..Default::default()
            },
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Looks up an entry, marking it as accessed on a hit.
    pub fn get(&self, key: &str) -> Option<CachedResource> {
        let mut state = self.state.lock();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = Instant::now();
                let entry = entry.clone();
                state.stats.hits += 1;
                Some(entry)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Inserts a new entry, evicting the earliest inserted entries if the cache is full.
    ///
    /// Inserting a key that is already cached is an error; callers have to check first.
    pub fn put(
        &self,
        key: impl Into<String>,
        payload: Payload,
        priority: Priority,
    ) -> Result<(), CacheError> {
        let key = key.into();
        let mut state = self.state.lock();

        if state.entries.contains_key(&key) {
            return Err(CacheError::DuplicateKey(key));
        }

        let target = state.capacity - 1;
        state.evict_to(target);

        let now = Instant::now();
        let entry = CachedResource {
            key: key.clone(),
            payload,
            priority,
            inserted_at: now,
            last_accessed_at: now,
        };
        state.entries.insert(key, entry);
        state.report();

        Ok(())
    }

    /// Removes an entry, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove(key).is_some();
        if removed {
            state.report();
        }
        removed
    }

    /// Removes an entry if it is older than `max_age` at `now`.
    ///
    /// The age check and the removal happen in the same critical section.
    pub fn remove_expired(&self, key: &str, max_age: Duration, now: Instant) -> bool {
        let mut state = self.state.lock();
        let expired = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.age(now) > max_age);
        if expired {
            state.remove(key);
            state.stats.expirations += 1;
            state.report();
        }
        expired
    }

    /// Changes the capacity, evicting the earliest inserted entries if it shrinks below the
    /// current size.
    pub fn set_capacity(&self, capacity: usize) -> Result<(), CacheError> {
        if capacity == 0 {
            return Err(CacheError::InvalidCapacity(capacity));
        }

        let mut state = self.state.lock();
        state.capacity = capacity;
        state.stats.capacity = capacity;
        state.evict_to(capacity);
        state.report();

        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// The number of cached entries.
    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Checks for an entry without touching it.
    pub fn has(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// A snapshot of all cached keys, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    /// Drops all entries, releasing their payload handles.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.report();
    }
}
