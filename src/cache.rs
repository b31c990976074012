//! Bounded key/value cache with per-entry time-to-live.
//!
//! Expiry is lazy: entries older than the TTL are dropped when they are next
//! touched, never by a background sweep. When the entry limit is reached the
//! oldest inserted entry is evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Time source for cache expiry.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Keys in insertion order, oldest first.
    order: VecDeque<String>,
}

/// Expiring, size-bounded cache. Internally synchronised, so a single
/// instance can be shared across concurrently handled events.
pub struct ExpiringCache<V> {
    state: Mutex<CacheState<V>>,
    max_entries: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self::with_clock(max_entries, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(max_entries: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
            ttl,
            clock,
        }
    }

    /// Return a clone of the live value for `key`, dropping it if expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            remove_key(&mut state, key);
            return None;
        }
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Whether `key` holds a live entry. Expired entries count as absent.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace `key`. Replacing refreshes the entry's age.
    ///
    /// May evict an unrelated, older entry when the cache is full.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = self.clock.now();
        let mut state = self.lock();

        if state.entries.contains_key(&key) {
            state.order.retain(|existing| existing != &key);
        } else {
            self.purge_expired(&mut state, now);
            while state.entries.len() >= self.max_entries {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
                tracing::trace!(key = %oldest, "evicted oldest cache entry");
            }
        }

        state.order.push_back(key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
            },
        );
    }

    /// Number of stored entries, including ones that have expired but not yet been touched.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) > self.ttl
    }

    /// Drop expired entries from the front of the insertion queue. Ages are
    /// monotonic in queue order, so the scan stops at the first live entry.
    fn purge_expired(&self, state: &mut CacheState<V>, now: Instant) {
        while let Some(oldest) = state.order.front() {
            let expired = state
                .entries
                .get(oldest)
                .is_none_or(|entry| self.is_expired(entry, now));
            if !expired {
                break;
            }
            if let Some(key) = state.order.pop_front() {
                state.entries.remove(&key);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remove_key<V>(state: &mut CacheState<V>, key: &str) {
    state.entries.remove(key);
    state.order.retain(|existing| existing != key);
}

impl<V> std::fmt::Debug for ExpiringCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringCache")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Manually advanced clock for expiry tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().unwrap()
    }
}
