//! Bounded read-through cache with LRU eviction and TTL expiry.
//!
//! A `parking_lot::RwLock` guards an `rustc_hash::FxHashMap` keyed by id.
//! The cache is strictly a read-through accelerator: callers write to disk
//! first, then call [`Cache::set`]; a failed write must never reach
//! [`Cache::set`].

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_access_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct Inner<V> {
    map: FxHashMap<String, CacheEntry<V>>,
    stats: CacheStats,
}

/// Generic bounded cache keyed by `String` (callers stringify their own key
/// types, e.g. `TaskId::as_str`, to keep this type monomorphic per value).
pub struct Cache<V> {
    inner: RwLock<Inner<V>>,
    max_entries: usize,
    ttl: Duration,
}

impl<V: Clone> Cache<V> {
    #[must_use]
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: FxHashMap::default(),
                stats: CacheStats::default(),
            }),
            max_entries,
            ttl,
        }
    }

    /// Returns the cached value unless it is absent or has aged past `ttl`.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let expired = inner
            .map
            .get(key)
            .is_some_and(|e| now.duration_since(e.inserted_at) > self.ttl);
        if expired {
            inner.map.remove(key);
            inner.stats.misses += 1;
            return None;
        }
        if let Some(entry) = inner.map.get_mut(key) {
            entry.last_access_at = now;
            let value = entry.value.clone();
            inner.stats.hits += 1;
            Some(value)
        } else {
            inner.stats.misses += 1;
            None
        }
    }

    /// Insert or overwrite `key`, evicting the least-recently-accessed
    /// entry first if this would exceed `max_entries`.
    pub fn set(&self, key: String, value: V) {
        let now = Instant::now();
        let mut inner = self.inner.write();
        if !inner.map.contains_key(&key) && inner.map.len() >= self.max_entries {
            if let Some(lru_key) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access_at)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&lru_key);
                inner.stats.evictions += 1;
            }
        }
        inner.map.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_access_at: now,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.write().map.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.map.clear();
    }

    /// Drop every entry whose age exceeds `ttl`. Intended to be driven by a
    /// `tokio::time::interval` sweeper owned by the caller.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        let mut inner = self.inner.write();
        let before = inner.map.len();
        inner.map.retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
        let evicted = before - inner.map.len();
        inner.stats.evictions += evicted as u64;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            entries: inner.map.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_hits() {
        let cache: Cache<i32> = Cache::new(10, Duration::from_secs(60));
        cache.set("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn invalidate_forces_a_miss() {
        let cache: Cache<i32> = Cache::new(10, Duration::from_secs(60));
        cache.set("a".to_string(), 1);
        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn evicts_least_recently_accessed_when_full() {
        let cache: Cache<i32> = Cache::new(2, Duration::from_secs(60));
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        // Touch "a" so "b" becomes the least-recently-accessed entry.
        let _ = cache.get("a");
        cache.set("c".to_string(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn ttl_expires_entries() {
        let cache: Cache<i32> = Cache::new(10, Duration::from_millis(1));
        cache.set("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
    }
}
