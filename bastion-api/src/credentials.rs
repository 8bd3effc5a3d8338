//! API credential verification.
//!
//! An API key resolves to a [`CredentialRecord`] through the tiered cache;
//! the credential database is queried only when both tiers miss, and
//! concurrent misses for one key share a single query. Unknown keys are
//! cached as `None` with the same TTL, so repeated bad keys stay off the
//! database too.
//!
//! Raw keys never leave the process: cache keys are SHA-256 fingerprints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bastion_core::CacheError;
use bastion_storage::TieredCache;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ============================================================================
// TYPES
// ============================================================================

/// What an API key resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Stable identifier, used as the credential rate-limit key.
    pub id: String,
    pub owner: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            scopes: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Failures of the credential database.
#[derive(Debug, Clone, Error)]
pub enum CredentialStoreError {
    #[error("Credential database unavailable: {0}")]
    Unavailable(String),

    #[error("Credential query failed: {0}")]
    Query(String),
}

/// The source of truth for API credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_key(
        &self,
        api_key: &str,
    ) -> Result<Option<CredentialRecord>, CredentialStoreError>;
}

/// Cache key for `api_key`.
pub fn fingerprint(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    format!("credential:{}", hex::encode(hasher.finalize()))
}

// ============================================================================
// VERIFIER
// ============================================================================

/// Resolves API keys through the tiered cache.
pub struct CredentialVerifier {
    cache: TieredCache<Option<CredentialRecord>>,
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
}

impl CredentialVerifier {
    /// Cache lookups for the cache's `default_ttl`.
    pub fn new(cache: TieredCache<Option<CredentialRecord>>, store: Arc<dyn CredentialStore>) -> Self {
        let ttl = cache.config().default_ttl;
        Self { cache, store, ttl }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn cache(&self) -> &TieredCache<Option<CredentialRecord>> {
        &self.cache
    }

    /// `Ok(None)` for unknown and expired keys. `Err` only when the
    /// database itself failed and nothing was cached.
    pub async fn verify(&self, api_key: &str) -> Result<Option<CredentialRecord>, CacheError> {
        let store = Arc::clone(&self.store);
        let key = api_key.to_string();
        let record = self
            .cache
            .get_or_compute(&fingerprint(api_key), self.ttl, move || async move {
                store.find_by_key(&key).await
            })
            .await?;

        match record {
            Some(record) if record.is_expired_at(Utc::now()) => {
                tracing::debug!(credential_id = %record.id, "Credential expired");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Forget any cached result for `api_key`.
    pub async fn invalidate(&self, api_key: &str) {
        self.cache.delete(&fingerprint(api_key)).await;
    }
}

// ============================================================================
// STATIC STORE
// ============================================================================

/// Credentials held in memory, for development and tests.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    records: DashMap<String, CredentialRecord>,
    lookups: AtomicU64,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse comma-separated `id:key` pairs; malformed pairs are skipped.
    pub fn parse(pairs: &str) -> Self {
        let store = Self::new();
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once(':') {
                Some((id, key)) if !id.is_empty() && !key.is_empty() => {
                    store.insert(key, CredentialRecord::new(id, id));
                }
                _ => tracing::warn!("Skipping malformed credential entry"),
            }
        }
        store
    }

    /// Load from `BASTION_API_KEYS` (comma-separated `id:key` pairs).
    pub fn from_env() -> Self {
        std::env::var("BASTION_API_KEYS")
            .map(|pairs| Self::parse(&pairs))
            .unwrap_or_default()
    }

    pub fn insert(&self, api_key: impl Into<String>, record: CredentialRecord) {
        self.records.insert(api_key.into(), record);
    }

    pub fn remove(&self, api_key: &str) -> Option<CredentialRecord> {
        self.records.remove(api_key).map(|(_, record)| record)
    }

    /// How many times `find_by_key` ran.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn find_by_key(
        &self,
        api_key: &str,
    ) -> Result<Option<CredentialRecord>, CredentialStoreError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.get(api_key).map(|record| record.clone()))
    }
}
