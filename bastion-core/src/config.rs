//! Configuration Module
//!
//! Every component is configured by a plain struct with `Default`, builder
//! style setters and a `from_env()` constructor reading `BASTION_*`
//! variables. Constructors that consume a config call `validate()` so bad
//! values fail at startup rather than at first use.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn require_nonzero_duration(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(
            field,
            format!("{:?}", value),
            "must be greater than zero",
        ));
    }
    Ok(())
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Configuration for the circuit breaker guarding the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_BREAKER_SUCCESS_THRESHOLD,
            timeout: Duration::from_millis(DEFAULT_BREAKER_TIMEOUT_MS),
        }
    }
}

impl BreakerConfig {
    /// Create BreakerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BASTION_BREAKER_FAILURE_THRESHOLD`: Failures before opening (default: 5)
    /// - `BASTION_BREAKER_SUCCESS_THRESHOLD`: Trial successes before closing (default: 2)
    /// - `BASTION_BREAKER_TIMEOUT_MS`: How long the breaker stays open (default: 10000)
    pub fn from_env() -> Self {
        Self {
            failure_threshold: env_or(
                "BASTION_BREAKER_FAILURE_THRESHOLD",
                DEFAULT_BREAKER_FAILURE_THRESHOLD,
            ),
            success_threshold: env_or(
                "BASTION_BREAKER_SUCCESS_THRESHOLD",
                DEFAULT_BREAKER_SUCCESS_THRESHOLD,
            ),
            timeout: Duration::from_millis(env_or(
                "BASTION_BREAKER_TIMEOUT_MS",
                DEFAULT_BREAKER_TIMEOUT_MS,
            )),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "failure_threshold",
                self.failure_threshold,
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "success_threshold",
                self.success_threshold,
                "must be at least 1",
            ));
        }
        require_nonzero_duration("breaker_timeout", self.timeout)
    }
}

// ============================================================================
// TIERED CACHE
// ============================================================================

/// Configuration for the two-tier cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in the process-local L1 cache.
    pub l1_capacity: usize,
    /// TTL applied when a caller does not pass one.
    pub default_ttl: Duration,
    /// TTL for L1 entries populated from an L2 hit. Independent of, and
    /// normally shorter than, the TTL the L2 entry was written with.
    pub l1_backfill_ttl: Duration,
    /// Bound on each remote-store call made through the circuit breaker.
    pub remote_timeout: Duration,
    /// How often expired L1 entries are swept.
    pub sweep_interval: Duration,
    /// Prefix applied to remote-store keys.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: DEFAULT_L1_CAPACITY,
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            l1_backfill_ttl: Duration::from_secs(DEFAULT_L1_BACKFILL_TTL_SECS),
            remote_timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl CacheConfig {
    /// Create CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BASTION_L1_CAPACITY` (default: 1000)
    /// - `BASTION_CACHE_TTL_SECS` (default: 300)
    /// - `BASTION_L1_BACKFILL_TTL_SECS` (default: 60)
    /// - `BASTION_REMOTE_TIMEOUT_MS` (default: 2000)
    /// - `BASTION_CACHE_SWEEP_INTERVAL_SECS` (default: 60)
    /// - `BASTION_CACHE_KEY_PREFIX` (default: "bastion")
    pub fn from_env() -> Self {
        Self {
            l1_capacity: env_or("BASTION_L1_CAPACITY", DEFAULT_L1_CAPACITY),
            default_ttl: Duration::from_secs(env_or(
                "BASTION_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            l1_backfill_ttl: Duration::from_secs(env_or(
                "BASTION_L1_BACKFILL_TTL_SECS",
                DEFAULT_L1_BACKFILL_TTL_SECS,
            )),
            remote_timeout: Duration::from_millis(env_or(
                "BASTION_REMOTE_TIMEOUT_MS",
                DEFAULT_REMOTE_TIMEOUT_MS,
            )),
            sweep_interval: Duration::from_secs(env_or(
                "BASTION_CACHE_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )),
            key_prefix: std::env::var("BASTION_CACHE_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
        }
    }

    pub fn with_l1_capacity(mut self, capacity: usize) -> Self {
        self.l1_capacity = capacity;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_l1_backfill_ttl(mut self, ttl: Duration) -> Self {
        self.l1_backfill_ttl = ttl;
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.l1_capacity == 0 {
            return Err(ConfigError::invalid(
                "l1_capacity",
                self.l1_capacity,
                "must be at least 1",
            ));
        }
        require_nonzero_duration("default_ttl", self.default_ttl)?;
        require_nonzero_duration("l1_backfill_ttl", self.l1_backfill_ttl)?;
        if self.l1_backfill_ttl > self.default_ttl {
            return Err(ConfigError::invalid(
                "l1_backfill_ttl",
                format!("{:?}", self.l1_backfill_ttl),
                "must not exceed default_ttl",
            ));
        }
        require_nonzero_duration("remote_timeout", self.remote_timeout)?;
        require_nonzero_duration("cache_sweep_interval", self.sweep_interval)
    }
}

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Configuration for the dual-layer rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests per window per caller IP. The stricter layer.
    pub ip_max_requests: u32,
    pub ip_window: Duration,
    /// Requests per window per API credential.
    pub credential_max_requests: u32,
    pub credential_window: Duration,
    pub sweep_interval: Duration,
    /// Count windows in the remote store so limits hold across processes.
    pub distributed: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip_max_requests: DEFAULT_IP_MAX_REQUESTS,
            ip_window: Duration::from_millis(DEFAULT_RATE_LIMIT_WINDOW_MS),
            credential_max_requests: DEFAULT_CREDENTIAL_MAX_REQUESTS,
            credential_window: Duration::from_millis(DEFAULT_RATE_LIMIT_WINDOW_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            distributed: false,
        }
    }
}

impl RateLimitConfig {
    /// Create RateLimitConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BASTION_RATE_LIMIT_ENABLED`: "true" or "false" (default: true)
    /// - `BASTION_RATE_LIMIT_IP_MAX`: Requests per window per IP (default: 100)
    /// - `BASTION_RATE_LIMIT_IP_WINDOW_MS` (default: 60000)
    /// - `BASTION_RATE_LIMIT_CREDENTIAL_MAX`: Requests per window per credential (default: 1000)
    /// - `BASTION_RATE_LIMIT_CREDENTIAL_WINDOW_MS` (default: 60000)
    /// - `BASTION_RATE_LIMIT_SWEEP_INTERVAL_SECS` (default: 60)
    /// - `BASTION_RATE_LIMIT_DISTRIBUTED`: "true" to count in the remote store (default: false)
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("BASTION_RATE_LIMIT_ENABLED", true),
            ip_max_requests: env_or("BASTION_RATE_LIMIT_IP_MAX", DEFAULT_IP_MAX_REQUESTS),
            ip_window: Duration::from_millis(env_or(
                "BASTION_RATE_LIMIT_IP_WINDOW_MS",
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            )),
            credential_max_requests: env_or(
                "BASTION_RATE_LIMIT_CREDENTIAL_MAX",
                DEFAULT_CREDENTIAL_MAX_REQUESTS,
            ),
            credential_window: Duration::from_millis(env_or(
                "BASTION_RATE_LIMIT_CREDENTIAL_WINDOW_MS",
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            )),
            sweep_interval: Duration::from_secs(env_or(
                "BASTION_RATE_LIMIT_SWEEP_INTERVAL_SECS",
                DEFAULT_SWEEP_INTERVAL_SECS,
            )),
            distributed: env_flag("BASTION_RATE_LIMIT_DISTRIBUTED", false),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip_max_requests == 0 {
            return Err(ConfigError::invalid(
                "ip_max_requests",
                self.ip_max_requests,
                "must be at least 1",
            ));
        }
        if self.credential_max_requests == 0 {
            return Err(ConfigError::invalid(
                "credential_max_requests",
                self.credential_max_requests,
                "must be at least 1",
            ));
        }
        require_nonzero_duration("ip_window", self.ip_window)?;
        require_nonzero_duration("credential_window", self.credential_window)?;
        require_nonzero_duration("rate_limit_sweep_interval", self.sweep_interval)
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Configuration for the in-process metrics store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Samples kept per histogram series for percentile queries.
    pub max_samples_per_series: usize,
    /// Finite bucket upper bounds, ascending. `+Inf` is implicit.
    pub buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_samples_per_series: DEFAULT_MAX_SAMPLES_PER_SERIES,
            buckets: DEFAULT_HISTOGRAM_BUCKETS.to_vec(),
        }
    }
}

impl MetricsConfig {
    /// Create MetricsConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BASTION_METRICS_MAX_SAMPLES` (default: 10000)
    pub fn from_env() -> Self {
        Self {
            max_samples_per_series: env_or(
                "BASTION_METRICS_MAX_SAMPLES",
                DEFAULT_MAX_SAMPLES_PER_SERIES,
            ),
            ..Self::default()
        }
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_max_samples(mut self, max: usize) -> Self {
        self.max_samples_per_series = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_samples_per_series == 0 {
            return Err(ConfigError::invalid(
                "max_samples_per_series",
                self.max_samples_per_series,
                "must be at least 1",
            ));
        }
        if self.buckets.iter().any(|b| !b.is_finite()) {
            return Err(ConfigError::invalid(
                "buckets",
                format!("{:?}", self.buckets),
                "bounds must be finite; +Inf is implicit",
            ));
        }
        if self.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid(
                "buckets",
                format!("{:?}", self.buckets),
                "bounds must be strictly ascending",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// REDIS
// ============================================================================

/// Connection settings for the Redis-backed remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub max_connections: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            max_connections: DEFAULT_REDIS_MAX_CONNECTIONS,
        }
    }
}

impl RedisConfig {
    /// Create RedisConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BASTION_REDIS_URL` (default: "redis://127.0.0.1:6379")
    /// - `BASTION_REDIS_MAX_CONNECTIONS` (default: 16)
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("BASTION_REDIS_URL")
                .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            max_connections: env_or(
                "BASTION_REDIS_MAX_CONNECTIONS",
                DEFAULT_REDIS_MAX_CONNECTIONS,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "redis_max_connections",
                self.max_connections,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// AGGREGATE
// ============================================================================

/// Process-wide configuration, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BastionConfig {
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
    pub redis: RedisConfig,
}

impl BastionConfig {
    pub fn from_env() -> Self {
        Self {
            breaker: BreakerConfig::from_env(),
            cache: CacheConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            metrics: MetricsConfig::from_env(),
            redis: RedisConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate()?;
        self.cache.validate()?;
        self.rate_limit.validate()?;
        self.metrics.validate()?;
        self.redis.validate()
    }
}
