//! Error types for bastion operations

use std::sync::Arc;
use thiserror::Error;

/// Remote-store and cache errors.
///
/// `Clone` so one failure can be handed to every caller waiting on the same
/// coalesced operation.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Remote store connection failed: {0}")]
    Connection(String),

    #[error("Remote store operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote store error: {0}")]
    Backend(String),

    #[error("Operation not supported by remote store: {operation}")]
    Unsupported { operation: String },

    #[error("Value computation failed: {0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// Wrap a caller-side computation failure.
    pub fn compute<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Rate-limit policy violations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded for {key}: limit {limit}, retry after {retry_after_secs}s")]
    Exceeded {
        key: String,
        limit: u32,
        retry_after_secs: u64,
    },
}

impl RateLimitError {
    /// Seconds the caller should wait before retrying.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Exceeded {
                retry_after_secs, ..
            } => *retry_after_secs,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(field: &str, value: impl ToString, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Master error type for all bastion errors.
#[derive(Debug, Clone, Error)]
pub enum BastionError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for bastion operations.
pub type BastionResult<T> = Result<T, BastionError>;

// =============================================================================
// TESTS
// =============================================================================
