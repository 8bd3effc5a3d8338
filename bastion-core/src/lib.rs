//! BASTION Core - Errors, Configuration and Metrics
//!
//! Shared types for the bastion cache layer. Every other crate depends on
//! this one; it has no async runtime dependency.

pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;

pub use config::{
    BastionConfig, BreakerConfig, CacheConfig, MetricsConfig, RateLimitConfig, RedisConfig,
};
pub use error::{BastionError, BastionResult, CacheError, ConfigError, RateLimitError};
pub use metrics::{HistogramSnapshot, Labels, MetricKind, MetricsStore, SeriesKey};

// ============================================================================
// METRIC NAMES
// ============================================================================

/// Cache lookups by `tier` (`l1`, `l2`) and `outcome` (`hit`, `miss`, `error`).
pub const METRIC_CACHE_REQUESTS: &str = "bastion_cache_requests_total";

/// Current number of L1 entries.
pub const METRIC_L1_ENTRIES: &str = "bastion_cache_l1_entries";

/// L1 entries removed for capacity or expiry, by `reason`.
pub const METRIC_L1_EVICTIONS: &str = "bastion_cache_l1_evictions_total";

/// Callers that joined an in-flight operation instead of starting one, by `operation`.
pub const METRIC_COALESCED: &str = "bastion_cache_coalesced_total";

/// Remote-store call latency in milliseconds, by `operation`.
pub const METRIC_REMOTE_LATENCY: &str = "bastion_remote_latency_ms";

/// Breaker state: 0 closed, 1 open, 2 half-open.
pub const METRIC_BREAKER_STATE: &str = "bastion_breaker_state";

/// Breaker transitions, by `from` and `to`.
pub const METRIC_BREAKER_TRANSITIONS: &str = "bastion_breaker_transitions_total";

/// Operations answered by the fallback path, by `reason`.
pub const METRIC_BREAKER_FALLBACKS: &str = "bastion_breaker_fallbacks_total";

/// Rate-limit decisions, by `layer` and `decision`.
pub const METRIC_RATE_LIMIT_DECISIONS: &str = "bastion_rate_limit_decisions_total";

/// Register help text for every metric this workspace emits.
pub fn describe_metrics(store: &MetricsStore) {
    store.describe(METRIC_CACHE_REQUESTS, "Cache lookups by tier and outcome");
    store.describe(METRIC_L1_ENTRIES, "Entries currently held in the local cache");
    store.describe(METRIC_L1_EVICTIONS, "Local cache entries removed by capacity or expiry");
    store.describe(METRIC_COALESCED, "Callers that joined an in-flight operation");
    store.describe(METRIC_REMOTE_LATENCY, "Remote store call latency in milliseconds");
    store.describe(METRIC_BREAKER_STATE, "Circuit breaker state (0 closed, 1 open, 2 half-open)");
    store.describe(METRIC_BREAKER_TRANSITIONS, "Circuit breaker state transitions");
    store.describe(METRIC_BREAKER_FALLBACKS, "Operations answered by the fallback path");
    store.describe(METRIC_RATE_LIMIT_DECISIONS, "Rate limit decisions by layer");
}
