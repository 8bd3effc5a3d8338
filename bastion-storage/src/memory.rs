//! In-process remote store for tests and single-node development.
//!
//! Behaves like a TTL-aware key-value server and can be told to fail or
//! stall, so breaker and fallback paths can be exercised without a network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bastion_core::CacheError;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::remote::{KeyTtl, RemoteStore};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn key_ttl(&self, now: Instant) -> KeyTtl {
        match self.expires_at {
            Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
            None => KeyTtl::Persistent,
        }
    }
}

/// TTL-aware in-memory [`RemoteStore`] with failure injection.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    data: DashMap<String, StoredValue>,
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU64,
    get_calls: AtomicU64,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a connection error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency` before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Total calls received, including failed ones.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// `get` calls received, including failed ones.
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.data.len())
    }

    async fn enter(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Connection(
                "in-memory store set to fail".to_string(),
            ));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let entry = self.data.get(key)?.clone();
        if entry.is_expired(now) {
            self.data.remove_if(key, |_, v| v.is_expired(now));
            return None;
        }
        Some(entry)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.live(key).map(|v| v.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.enter().await?;
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.data
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.enter().await?;
        self.data.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, expire: Option<Duration>) -> Result<i64, CacheError> {
        self.enter().await?;
        let now = Instant::now();
        let mut entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| StoredValue {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.is_expired(now) {
            *entry = StoredValue {
                value: "0".to_string(),
                expires_at: None,
            };
        }
        let current: i64 = entry.value.parse().map_err(|_| {
            CacheError::Backend(format!("value at {} is not an integer", key))
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        if entry.expires_at.is_none() {
            if let Some(expire) = expire {
                entry.expires_at = Some(now + expire);
            }
        }
        Ok(next)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError> {
        self.enter().await?;
        Ok(match self.live(key) {
            None => KeyTtl::Missing,
            Some(entry) => entry.key_ttl(Instant::now()),
        })
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, KeyTtl)>, CacheError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let now = Instant::now();
        Ok(self.live(key).map(|entry| {
            let ttl = entry.key_ttl(now);
            (entry.value, ttl)
        }))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.enter().await?;
        self.data.clear();
        Ok(())
    }
}
