//! Two-tier cache: process-local L1 in front of a shared remote L2.
//!
//! Reads check L1 first. An L1 miss becomes a coalesced L2 lookup guarded by
//! the circuit breaker and bounded by `remote_timeout`; an L2 hit is copied
//! into L1 for `l1_backfill_ttl`, capped at the L2 entry's remaining
//! lifetime. Remote failures are absorbed: the caller sees a miss, never a
//! transport error.
//!
//! Writes go to L1 immediately and to L2 on a best-effort basis. A zero TTL
//! means the value is already expired, so it is removed from both tiers.
//!
//! # Example
//!
//! ```ignore
//! let cache: TieredCache<Credential> =
//!     TieredCache::new(config, remote, breaker, metrics)?;
//!
//! let credential = cache
//!     .get_or_compute(&api_key, ttl, move || async move { db.lookup(&api_key).await })
//!     .await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bastion_core::{
    CacheConfig, CacheError, ConfigError, MetricsStore, METRIC_CACHE_REQUESTS,
    METRIC_REMOTE_LATENCY,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::coalesce::RequestCoalescer;
use crate::local::LocalCache;
use crate::remote::{KeyTtl, RemoteStore};
use crate::sweeper::Sweep;

/// Outcome of one guarded L2 read, shared by every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
enum L2Lookup {
    Hit(String, KeyTtl),
    Miss,
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    L1,
    L2,
}

impl Tier {
    fn as_str(&self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
        }
    }
}

struct Inner<V> {
    config: CacheConfig,
    l1: LocalCache<V>,
    remote: Arc<dyn RemoteStore>,
    breaker: Arc<CircuitBreaker>,
    lookups: RequestCoalescer<L2Lookup>,
    computes: RequestCoalescer<Result<V, CacheError>>,
    metrics: Arc<MetricsStore>,
}

/// Cheaply clonable handle to a two-tier cache of `V`.
///
/// L2 holds values as JSON.
pub struct TieredCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let l1 = LocalCache::new(config.l1_capacity)?.with_metrics(Arc::clone(&metrics));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                l1,
                remote,
                breaker,
                lookups: RequestCoalescer::new("l2_get").with_metrics(Arc::clone(&metrics)),
                computes: RequestCoalescer::new("compute").with_metrics(Arc::clone(&metrics)),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn l1(&self) -> &LocalCache<V> {
        &self.inner.l1
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    /// Read `key` from L1, then L2. `None` means absent or unreachable.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.lookup(key, self.inner.config.l1_backfill_ttl).await
    }

    /// Write `key` to both tiers with the same `ttl`.
    ///
    /// L1 is written before L2 is contacted, so the L1 copy never waits on
    /// the network. A failed L2 write is logged and otherwise ignored. Only a
    /// value that cannot be encoded is an error. A zero `ttl` deletes `key`
    /// from both tiers.
    pub async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(&value)?;
        if ttl.is_zero() {
            tracing::debug!(key = %key, "Zero TTL write, removing key from both tiers");
            self.delete(key).await;
            return Ok(());
        }
        self.inner.l1.insert(key, value, ttl);

        let inner = &self.inner;
        let remote_key = inner.remote_key(key);
        let written = inner
            .breaker
            .execute(|| inner.remote_call("set", inner.remote.set(&remote_key, encoded, ttl)))
            .await;
        if written.is_none() {
            tracing::warn!(key = %key, "L2 write failed; value cached in L1 only");
        }
        Ok(())
    }

    /// `set` with `CacheConfig::default_ttl`.
    pub async fn set_default(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.set(key, value, self.inner.config.default_ttl).await
    }

    /// Remove `key` from both tiers. Best-effort on L2.
    pub async fn delete(&self, key: &str) {
        self.inner.l1.remove(key);

        let inner = &self.inner;
        let remote_key = inner.remote_key(key);
        let deleted = inner
            .breaker
            .execute(|| inner.remote_call("delete", inner.remote.delete(&remote_key)))
            .await;
        if deleted.is_none() {
            tracing::warn!(key = %key, "L2 delete failed; stale value may persist until TTL");
        }
    }

    /// Empty L1 and ask L2 to clear. A remote that does not support clearing
    /// is logged and skipped.
    pub async fn clear(&self) {
        self.inner.l1.clear();

        let inner = &self.inner;
        let cleared = inner
            .breaker
            .execute(|| async {
                match inner.remote_call("clear", inner.remote.clear()).await {
                    Ok(()) => Ok(true),
                    Err(CacheError::Unsupported { .. }) => Ok(false),
                    Err(err) => Err(err),
                }
            })
            .await;
        match cleared {
            Some(true) => tracing::debug!(remote = inner.remote.name(), "L2 cleared"),
            Some(false) => tracing::warn!(
                remote = inner.remote.name(),
                "Remote store does not support clear; only L1 was cleared"
            ),
            None => tracing::warn!(remote = inner.remote.name(), "L2 clear failed"),
        }
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Concurrent misses for the same key share a single `compute` call and
    /// all receive its result, or a clone of its error.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let backfill_ttl = self.inner.config.l1_backfill_ttl.min(ttl);
        if let Some(value) = self.lookup(key, backfill_ttl).await {
            return Ok(value);
        }

        let cache = self.clone();
        let owned_key = key.to_string();
        let coalesce_key = self.inner.remote_key(key);
        self.inner
            .computes
            .coalesce(&coalesce_key, move || async move {
                // A run that finished between our miss and joining would
                // have populated L1.
                if let Some(value) = cache.inner.l1.get(&owned_key) {
                    return Ok(value);
                }
                let value = compute().await.map_err(CacheError::compute)?;
                cache.set(&owned_key, value.clone(), ttl).await?;
                Ok(value)
            })
            .await
    }

    /// Drop expired L1 entries.
    pub fn sweep_l1(&self) -> usize {
        self.inner.l1.sweep_expired()
    }

    async fn lookup(&self, key: &str, backfill_ttl: Duration) -> Option<V> {
        let inner = &self.inner;
        if let Some(value) = inner.l1.get(key) {
            inner.record(Tier::L1, "hit");
            tracing::debug!(key = %key, "L1 hit");
            return Some(value);
        }
        inner.record(Tier::L1, "miss");

        match self.l2_get(key).await {
            L2Lookup::Hit(raw, remote_ttl) => match serde_json::from_str::<V>(&raw) {
                Ok(value) => {
                    inner.record(Tier::L2, "hit");
                    match l1_ttl_for(backfill_ttl, remote_ttl) {
                        Some(ttl) => {
                            tracing::debug!(
                                key = %key,
                                ttl_ms = saturating_millis(ttl),
                                "L2 hit, backfilling L1"
                            );
                            inner.l1.insert(key, value.clone(), ttl);
                        }
                        None => {
                            tracing::debug!(key = %key, "L2 hit on an expiring key, not backfilled")
                        }
                    }
                    Some(value)
                }
                Err(err) => {
                    inner.record(Tier::L2, "error");
                    tracing::warn!(key = %key, error = %err, "Discarding undecodable L2 value");
                    None
                }
            },
            L2Lookup::Miss => {
                inner.record(Tier::L2, "miss");
                tracing::debug!(key = %key, "L2 miss");
                None
            }
            L2Lookup::Unavailable => {
                inner.record(Tier::L2, "error");
                None
            }
        }
    }

    async fn l2_get(&self, key: &str) -> L2Lookup {
        let inner = Arc::clone(&self.inner);
        let remote_key = inner.remote_key(key);
        let coalesce_key = remote_key.clone();
        self.inner
            .lookups
            .coalesce(&coalesce_key, move || async move {
                let found = inner
                    .breaker
                    .execute(|| inner.remote_call("get", inner.remote.get_with_ttl(&remote_key)))
                    .await;
                match found {
                    Some(Some((raw, ttl))) => L2Lookup::Hit(raw, ttl),
                    Some(None) => L2Lookup::Miss,
                    None => L2Lookup::Unavailable,
                }
            })
            .await
    }
}

impl<V> Inner<V> {
    fn remote_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    /// Bound a remote call by `remote_timeout` and record its latency.
    async fn remote_call<T, Fut>(&self, operation: &'static str, call: Fut) -> Result<T, CacheError>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                timeout_ms: saturating_millis(self.config.remote_timeout),
            }),
        };
        self.metrics.observe(
            METRIC_REMOTE_LATENCY,
            started.elapsed().as_secs_f64() * 1000.0,
            &[("operation", operation)],
        );
        result
    }

    fn record(&self, tier: Tier, outcome: &str) {
        self.metrics.inc_counter(
            METRIC_CACHE_REQUESTS,
            &[("tier", tier.as_str()), ("outcome", outcome)],
        );
    }
}

/// L1 lifetime for a copy of an L2 entry: never longer than the entry has
/// left. `None` when the entry is already gone.
fn l1_ttl_for(backfill_ttl: Duration, remote_ttl: KeyTtl) -> Option<Duration> {
    match remote_ttl {
        KeyTtl::Expires(remaining) if remaining.is_zero() => None,
        KeyTtl::Expires(remaining) => Some(backfill_ttl.min(remaining)),
        KeyTtl::Persistent => Some(backfill_ttl),
        KeyTtl::Missing => None,
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<V> Sweep for TieredCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "l1_cache"
    }

    fn sweep(&self) -> usize {
        self.sweep_l1()
    }
}

impl<V> std::fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("remote", &self.inner.remote.name())
            .field("breaker", &self.inner.breaker.state())
            .finish()
    }
}
