//! TTL cache with least-recently-accessed eviction.
//!
//! Entries live in a `DashMap` so lookups from concurrent paths never need an
//! outer lock. A miss is never an error: callers fall back to the source of truth.
//!
//! Eviction order when the cache is full: expired entries first, then the
//! entries with the oldest last access until the size is back under `max_size`.

use dashmap::DashMap;
use serde::Serialize;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_access: Instant,
}

impl<V> CacheEntry<V> {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

pub struct CacheManager<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: config.ttl(),
            max_size: config.max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the value if present and not expired. Expired entries are evicted on read.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Expired: the RefMut above is gone, safe to remove.
        if self
            .entries
            .remove_if(key, |_, e| e.is_expired(now))
            .is_some()
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert with the configured TTL, or `ttl` when given.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            // Make room for exactly one more entry.
            self.evict_to(self.max_size - 1);
        }

        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl.unwrap_or(self.default_ttl),
                last_access: now,
            },
        );
    }

    pub fn delete(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop expired entries; with `force`, also trim least-recently-accessed
    /// entries until the cache is within capacity. Returns the number removed.
    pub fn prune(&self, force: bool) -> usize {
        let removed = self.remove_expired(Instant::now());
        if force || self.entries.len() > self.max_size {
            return removed + self.evict_lru(self.max_size);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size: self.entries.len(),
            max_size: self.max_size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn evict_to(&self, target: usize) -> usize {
        let removed = self.remove_expired(Instant::now());
        removed + self.evict_lru(target)
    }

    fn remove_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn evict_lru(&self, target: usize) -> usize {
        let len = self.entries.len();
        if len <= target {
            return 0;
        }

        let mut by_access: Vec<(Instant, K)> = self
            .entries
            .iter()
            .map(|e| (e.last_access, e.key().clone()))
            .collect();
        by_access.sort_unstable_by_key(|(at, _)| *at);

        let mut removed = 0;
        for (_, key) in by_access.into_iter().take(len - target) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Background pruning loop. Abort the handle to stop it.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let removed = cache.prune(false);
                if removed > 0 {
                    debug!(removed, size = cache.len(), "cache pruned");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize, ttl_ms: u64) -> CacheManager<String, u64> {
        CacheManager::new(&CacheConfig {
            ttl_ms,
            max_size,
            prune_interval_ms: 1_000,
        })
    }

    #[test]
    fn test_get_before_and_after_ttl() {
        let c = cache(10, 60_000);
        c.set("k".into(), 7, Some(Duration::from_millis(50)));
        assert_eq!(c.get(&"k".to_string()), Some(7));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(c.get(&"k".to_string()), None);
        assert!(c.is_empty(), "expired entry should be evicted on read");
    }

    #[test]
    fn test_default_ttl_applies() {
        let c = cache(10, 20);
        c.set("k".into(), 1, None);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(c.get(&"k".to_string()), None);
    }

    #[test]
    fn test_set_at_capacity_evicts_least_recently_accessed() {
        let c = cache(2, 60_000);
        c.set("a".into(), 1, None);
        std::thread::sleep(Duration::from_millis(2));
        c.set("b".into(), 2, None);
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes the oldest access.
        assert_eq!(c.get(&"a".to_string()), Some(1));

        c.set("c".into(), 3, None);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"b".to_string()), None);
        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"c".to_string()), Some(3));
    }

    #[test]
    fn test_set_prefers_expired_victims() {
        let c = cache(2, 60_000);
        c.set("short".into(), 1, Some(Duration::from_millis(5)));
        c.set("long".into(), 2, None);
        std::thread::sleep(Duration::from_millis(15));

        c.set("new".into(), 3, None);
        assert_eq!(c.get(&"long".to_string()), Some(2));
        assert_eq!(c.get(&"new".to_string()), Some(3));
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let c = cache(2, 60_000);
        c.set("a".into(), 1, None);
        c.set("b".into(), 2, None);
        c.set("a".into(), 10, None);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"b".to_string()), Some(2));
        assert_eq!(c.get(&"a".to_string()), Some(10));
    }

    #[test]
    fn test_prune_removes_expired() {
        let c = cache(10, 60_000);
        c.set("a".into(), 1, Some(Duration::from_millis(5)));
        c.set("b".into(), 2, None);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(c.prune(false), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_delete_and_stats() {
        let c = cache(10, 60_000);
        c.set("a".into(), 1, None);
        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"missing".to_string()), None);
        assert!(c.delete(&"a".to_string()));
        assert!(!c.delete(&"a".to_string()));

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_background_pruner() {
        let c = Arc::new(cache(10, 60_000));
        c.set("a".into(), 1, Some(Duration::from_millis(5)));
        let handle = c.spawn_pruner(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(c.is_empty());
    }
}
