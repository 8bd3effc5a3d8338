//! Default values for every tunable in the workspace.
//!
//! Configuration structs fall back to these when neither a builder call nor
//! a `BASTION_*` environment variable provides a value.

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive failures in CLOSED before the breaker opens.
pub const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Successful trials in HALF_OPEN before the breaker closes.
pub const DEFAULT_BREAKER_SUCCESS_THRESHOLD: u32 = 2;

/// How long the breaker stays OPEN before admitting a trial (10 seconds).
pub const DEFAULT_BREAKER_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// TIERED CACHE
// ============================================================================

/// Maximum number of entries held in the process-local L1 cache.
pub const DEFAULT_L1_CAPACITY: usize = 1000;

/// TTL used by `set` when the caller does not pass one (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// TTL for L1 entries backfilled from an L2 hit (1 minute).
pub const DEFAULT_L1_BACKFILL_TTL_SECS: u64 = 60;

/// Upper bound on a single remote-store call (2 seconds).
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 2_000;

/// Interval between expired-entry sweeps of in-process stores (1 minute).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Prefix applied to every key written to the remote store.
pub const DEFAULT_KEY_PREFIX: &str = "bastion";

// ============================================================================
// RATE LIMITING
// ============================================================================

/// Requests allowed per IP address per window.
pub const DEFAULT_IP_MAX_REQUESTS: u32 = 100;

/// Requests allowed per API credential per window.
pub const DEFAULT_CREDENTIAL_MAX_REQUESTS: u32 = 1000;

/// Fixed window length for both layers (1 minute).
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;

/// Namespace for IP-scoped rate-limit keys.
pub const IP_KEY_NAMESPACE: &str = "ip";

/// Namespace for credential-scoped rate-limit keys.
pub const CREDENTIAL_KEY_NAMESPACE: &str = "key";

// ============================================================================
// METRICS
// ============================================================================

/// Samples retained per histogram series for percentile queries.
pub const DEFAULT_MAX_SAMPLES_PER_SERIES: usize = 10_000;

/// Upper bounds for exported histogram buckets (milliseconds).
/// `+Inf` is always appended on export.
pub const DEFAULT_HISTOGRAM_BUCKETS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

// ============================================================================
// REDIS
// ============================================================================

/// Redis URL used when `BASTION_REDIS_URL` is unset.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Connection pool size for the Redis remote store.
pub const DEFAULT_REDIS_MAX_CONNECTIONS: usize = 16;
