//! Remote key-value store abstraction (the L2 tier).
//!
//! Implementations may fail or stall on any call; callers in this crate
//! always reach them through a [`CircuitBreaker`](crate::CircuitBreaker)
//! and a timeout.

use std::time::Duration;

use async_trait::async_trait;
use bastion_core::CacheError;

/// Remaining lifetime of a remote key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key exists and expires after this long.
    Expires(Duration),
    /// Key exists with no expiry (`-1`).
    Persistent,
    /// Key does not exist (`-2`).
    Missing,
}

impl KeyTtl {
    /// Decode the integer TTL convention: seconds remaining, `-1` for no
    /// expiry, `-2` (or any other negative) for an absent key.
    pub fn from_seconds(secs: i64) -> Self {
        match secs {
            -1 => Self::Persistent,
            s if s < 0 => Self::Missing,
            s => Self::Expires(Duration::from_secs(s as u64)),
        }
    }

    /// Same convention as [`KeyTtl::from_seconds`], in milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            -1 => Self::Persistent,
            m if m < 0 => Self::Missing,
            m => Self::Expires(Duration::from_millis(m as u64)),
        }
    }

    pub fn as_seconds(&self) -> i64 {
        match self {
            Self::Expires(d) => d.as_secs() as i64,
            Self::Persistent => -1,
            Self::Missing => -2,
        }
    }

    /// Remaining lifetime, if the key exists and expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Self::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Narrow interface the cache and distributed limiter need from a remote
/// store. Values are opaque strings; the caller chooses the encoding.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Human-readable backend name for logs and health output.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value`. A zero `ttl` stores it without expiry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically increment an integer key, creating it at 1 when absent.
    ///
    /// When `expire` is given and the key has no expiry after the
    /// increment, the expiry is set in the same atomic step.
    async fn increment(&self, key: &str, expire: Option<Duration>) -> Result<i64, CacheError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, CacheError>;

    /// Value and remaining lifetime of `key`. Backends that can answer both
    /// in one round trip should override this.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, KeyTtl)>, CacheError> {
        match self.get(key).await? {
            Some(value) => Ok(Some((value, self.ttl(key).await?))),
            None => Ok(None),
        }
    }

    /// Remove every key this store owns. Most shared backends refuse.
    async fn clear(&self) -> Result<(), CacheError> {
        Err(CacheError::Unsupported {
            operation: "clear".to_string(),
        })
    }
}
