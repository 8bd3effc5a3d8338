//! Process-local L1 cache: bounded LRU with per-entry TTL.
//!
//! Expiry is checked lazily on read and periodically by
//! [`sweep_expired`](LocalCache::sweep_expired). Capacity is enforced only on
//! insert, by evicting the least-recently-used entry.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bastion_core::{ConfigError, MetricsStore, METRIC_L1_ENTRIES, METRIC_L1_EVICTIONS};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::sweeper::Sweep;

#[derive(Debug, Clone)]
struct LocalEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> LocalEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded LRU map with TTL, safe to share across tasks.
pub struct LocalCache<V> {
    entries: Mutex<LruCache<String, LocalEntry<V>>>,
    metrics: Option<Arc<MetricsStore>>,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| ConfigError::invalid("l1_capacity", capacity, "must be at least 1"))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Look up `key`, marking it most recently used. Expired entries are
    /// removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let (value, expired, len) = {
            let mut entries = self.entries.lock();
            let found = entries
                .get(key)
                .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));
            match found {
                Some(Some(value)) => (Some(value), false, 0),
                Some(None) => {
                    entries.pop(key);
                    (None, true, entries.len())
                }
                None => (None, false, 0),
            }
        };
        if expired {
            self.record_evictions("expired", 1, len);
        }
        value
    }

    /// Insert or replace `key`. A zero TTL removes any existing entry
    /// instead, since the value would already be expired.
    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        if ttl.is_zero() {
            self.remove(key);
            return;
        }
        let entry = LocalEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let (evicted, len) = {
            let mut entries = self.entries.lock();
            let displaced = entries.push(key.to_string(), entry);
            // `push` hands back either the replaced entry for this key or
            // the evicted LRU entry.
            let evicted = matches!(displaced, Some((ref k, _)) if k != key);
            (evicted, entries.len())
        };
        if evicted {
            self.record_evictions("capacity", 1, len);
        } else {
            self.record_len(len);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let (removed, len) = {
            let mut entries = self.entries.lock();
            let removed = entries.pop(key).is_some();
            (removed, entries.len())
        };
        self.record_len(len);
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.record_len(0);
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let (removed, len) = {
            let mut entries = self.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            (expired.len(), entries.len())
        };
        if removed > 0 {
            self.record_evictions("expired", removed, len);
        }
        removed
    }

    /// Entry count, including entries that expired but were not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Whether `key` is present and live, without touching LRU order.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    fn record_evictions(&self, reason: &str, count: usize, len: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter_by(METRIC_L1_EVICTIONS, count as f64, &[("reason", reason)]);
        }
        self.record_len(len);
    }

    fn record_len(&self, len: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(METRIC_L1_ENTRIES, len as f64, &[]);
        }
    }
}

impl<V: Clone + Send> Sweep for LocalCache<V> {
    fn name(&self) -> &'static str {
        "l1_cache"
    }

    fn sweep(&self) -> usize {
        self.sweep_expired()
    }
}

impl<V> std::fmt::Debug for LocalCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("LocalCache")
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(LocalCache::<u32>::new(0).is_err());
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = LocalCache::new(4).unwrap();
        cache.insert("a", 1u32, TTL);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);

        cache.insert("a", 2, TTL);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used_on_insert() {
        let metrics = Arc::new(MetricsStore::default());
        let cache = LocalCache::new(2).unwrap().with_metrics(metrics.clone());
        cache.insert("a", 1u32, TTL);
        cache.insert("b", 2, TTL);

        // Reading "a" makes "b" the eviction candidate.
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3, TTL);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(
            metrics.get_counter(METRIC_L1_EVICTIONS, &[("reason", "capacity")]),
            1.0
        );
        assert_eq!(metrics.get_gauge(METRIC_L1_ENTRIES, &[]), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_never_returned() {
        let cache = LocalCache::new(4).unwrap();
        cache.insert("a", 1u32, Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(cache.get("a"), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.contains("a"));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let metrics = Arc::new(MetricsStore::default());
        let cache = LocalCache::new(8).unwrap().with_metrics(metrics.clone());
        cache.insert("short-1", 1u32, Duration::from_secs(1));
        cache.insert("short-2", 2, Duration::from_secs(1));
        cache.insert("long", 3, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            metrics.get_counter(METRIC_L1_EVICTIONS, &[("reason", "expired")]),
            2.0
        );
    }

    #[tokio::test]
    async fn test_zero_ttl_removes() {
        let cache = LocalCache::new(4).unwrap();
        cache.insert("a", 1u32, TTL);
        cache.insert("a", 2, Duration::ZERO);
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = LocalCache::new(4).unwrap();
        cache.insert("a", 1u32, TTL);
        cache.insert("b", 2, TTL);
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 4);
    }
}
