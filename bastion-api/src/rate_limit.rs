//! Fixed-window rate limiting.
//!
//! A window opens on the first request for a key and lasts `window`. Every
//! request inside it shares one counter. The first request seen after the
//! window ends starts a fresh window at count 1; windows are never closed
//! ahead of time.
//!
//! - [`RateLimiter`] counts in-process.
//! - [`RemoteRateLimiter`] counts in the remote store so limits hold across
//!   processes, and counts locally while the remote store is unreachable.
//! - [`DualLayerLimiter`] applies the per-IP rule, then the per-credential
//!   rule.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use bastion_core::constants::{
    CREDENTIAL_KEY_NAMESPACE, DEFAULT_KEY_PREFIX, DEFAULT_REMOTE_TIMEOUT_MS, IP_KEY_NAMESPACE,
};
use bastion_core::{
    CacheError, ConfigError, MetricsStore, RateLimitConfig, RateLimitError,
    METRIC_RATE_LIMIT_DECISIONS,
};
use bastion_storage::{CircuitBreaker, RemoteStore, Sweep};
use dashmap::DashMap;
use tokio::time::Instant;

// ============================================================================
// RULES AND DECISIONS
// ============================================================================

/// `max_requests` per `window`, both non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    max_requests: u32,
    window: Duration,
}

impl RateLimitRule {
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::invalid(
                "max_requests",
                max_requests,
                "must be at least 1",
            ));
        }
        if window.is_zero() {
            return Err(ConfigError::invalid(
                "window",
                "0ms",
                "must be greater than zero",
            ));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    /// Requests still admitted in the current window.
    pub remaining: u32,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

impl RateDecision {
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Whole seconds until the window resets, rounded up, never below 1.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs() + u64::from(self.reset_after.subsec_nanos() > 0);
        secs.max(1)
    }

    /// `Ok(self)` when allowed, otherwise the typed rejection for `key`.
    pub fn into_result(self, key: &str) -> Result<Self, RateLimitError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitError::Exceeded {
                key: key.to_string(),
                limit: self.limit,
                retry_after_secs: self.retry_after_secs(),
            })
        }
    }

    /// Write `x-ratelimit-limit`, `x-ratelimit-remaining` and
    /// `x-ratelimit-reset` (seconds).
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.retry_after_secs()));
    }
}

fn log_decision(key: &str, decision: &RateDecision) {
    if decision.allowed {
        tracing::debug!(key = %key, remaining = decision.remaining, "Rate limit check passed");
    } else {
        tracing::warn!(
            key = %key,
            limit = decision.limit,
            retry_after_secs = decision.retry_after_secs(),
            "Rate limit exceeded"
        );
    }
}

// ============================================================================
// BACKENDS
// ============================================================================

/// Where fixed-window counters live.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Count one request against `key` and decide it.
    async fn hit(&self, key: &str, rule: &RateLimitRule) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// In-process fixed-window counters.
///
/// Expiry is decided on each check; [`sweep_expired`](Self::sweep_expired)
/// only bounds memory.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key`. A rejected request is not counted.
    pub fn check(&self, key: &str, rule: &RateLimitRule) -> RateDecision {
        let now = Instant::now();
        let fresh = Window {
            count: 0,
            reset_at: now + rule.window,
        };
        let mut window = self.windows.entry(key.to_string()).or_insert(fresh);
        if now >= window.reset_at {
            *window = fresh;
        }
        let reset_after = window.reset_at.saturating_duration_since(now);

        if window.count >= rule.max_requests {
            return RateDecision {
                allowed: false,
                limit: rule.max_requests,
                remaining: 0,
                reset_after,
            };
        }
        window.count += 1;
        RateDecision {
            allowed: true,
            limit: rule.max_requests,
            remaining: rule.max_requests - window.count,
            reset_after,
        }
    }

    /// [`check`](Self::check), turning a rejection into [`RateLimitError`].
    pub fn enforce(&self, key: &str, rule: &RateLimitRule) -> Result<RateDecision, RateLimitError> {
        let decision = self.check(key, rule);
        log_decision(key, &decision);
        decision.into_result(key)
    }

    /// Requests counted in `key`'s live window, if it has one.
    pub fn count(&self, key: &str) -> Option<u32> {
        let now = Instant::now();
        self.windows
            .get(key)
            .filter(|window| now < window.reset_at)
            .map(|window| window.count)
    }

    pub fn reset_key(&self, key: &str) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Drop every window.
    pub fn reset(&self) {
        self.windows.clear();
    }

    /// Remove every elapsed window, returning how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.windows.retain(|_, window| {
            let live = now < window.reset_at;
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl RateLimitBackend for RateLimiter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn hit(&self, key: &str, rule: &RateLimitRule) -> RateDecision {
        self.check(key, rule)
    }
}

impl Sweep for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limit_store"
    }

    fn sweep(&self) -> usize {
        self.sweep_expired()
    }
}

/// Fixed-window counters kept in the remote store.
///
/// Each window is one integer key created by `increment` with the window as
/// its expiry. Calls go through the circuit breaker; while it yields no
/// value the request is counted by the local `fallback` limiter instead.
pub struct RemoteRateLimiter {
    remote: Arc<dyn RemoteStore>,
    breaker: Arc<CircuitBreaker>,
    fallback: Arc<RateLimiter>,
    key_prefix: String,
    timeout: Duration,
}

impl RemoteRateLimiter {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<RateLimiter>,
    ) -> Self {
        Self {
            remote,
            breaker,
            fallback,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: Duration::from_millis(DEFAULT_REMOTE_TIMEOUT_MS),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fallback(&self) -> &Arc<RateLimiter> {
        &self.fallback
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}:ratelimit:{}", self.key_prefix, key)
    }

    async fn count_remote(&self, key: &str, rule: &RateLimitRule) -> Result<RateDecision, CacheError> {
        let call = async {
            let count = self.remote.increment(key, Some(rule.window)).await?;
            let ttl = self.remote.ttl(key).await?;
            Ok::<_, CacheError>((count, ttl))
        };
        let (count, ttl) = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| CacheError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        Ok(RateDecision {
            allowed: count <= rule.max_requests,
            limit: rule.max_requests,
            remaining: rule.max_requests.saturating_sub(count),
            reset_after: ttl.remaining().unwrap_or(rule.window),
        })
    }
}

#[async_trait]
impl RateLimitBackend for RemoteRateLimiter {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn hit(&self, key: &str, rule: &RateLimitRule) -> RateDecision {
        let remote_key = self.remote_key(key);
        self.breaker
            .execute_or_else(
                || self.count_remote(&remote_key, rule),
                || {
                    tracing::debug!(key = %key, "Counting rate limit locally");
                    self.fallback.check(key, rule)
                },
            )
            .await
    }
}

// ============================================================================
// DUAL LAYER
// ============================================================================

/// Which rule decided a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Ip,
    Credential,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Credential => "credential",
        }
    }

    /// Namespaced counter key, e.g. `ip:10.0.0.1` or `key:cred-42`.
    pub fn key(&self, id: impl fmt::Display) -> String {
        let namespace = match self {
            Self::Ip => IP_KEY_NAMESPACE,
            Self::Credential => CREDENTIAL_KEY_NAMESPACE,
        };
        format!("{}:{}", namespace, id)
    }
}

/// A decision together with the layer and key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayeredDecision {
    pub layer: Layer,
    pub key: String,
    pub decision: RateDecision,
}

impl LayeredDecision {
    pub fn allowed(&self) -> bool {
        self.decision.allowed
    }

    pub fn into_result(self) -> Result<Self, RateLimitError> {
        match self.decision.into_result(&self.key) {
            Ok(_) => Ok(self),
            Err(err) => Err(err),
        }
    }

    /// The decision with fewer requests left, preferring `self` on a tie.
    pub fn tighter(self, other: Self) -> Self {
        if other.decision.remaining < self.decision.remaining {
            other
        } else {
            self
        }
    }
}

/// Per-IP limit, then per-credential limit.
///
/// The IP rule is meant to be the stricter one. A request rejected by it
/// never reaches the credential counter, so a shared credential's quota is
/// not charged for traffic that was never admitted.
pub struct DualLayerLimiter {
    backend: Arc<dyn RateLimitBackend>,
    ip_rule: RateLimitRule,
    credential_rule: RateLimitRule,
    metrics: Option<Arc<MetricsStore>>,
}

impl DualLayerLimiter {
    pub fn new(
        backend: Arc<dyn RateLimitBackend>,
        ip_rule: RateLimitRule,
        credential_rule: RateLimitRule,
    ) -> Self {
        Self {
            backend,
            ip_rule,
            credential_rule,
            metrics: None,
        }
    }

    pub fn from_config(
        backend: Arc<dyn RateLimitBackend>,
        config: &RateLimitConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            backend,
            RateLimitRule::new(config.ip_max_requests, config.ip_window)?,
            RateLimitRule::new(config.credential_max_requests, config.credential_window)?,
        ))
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> &Arc<dyn RateLimitBackend> {
        &self.backend
    }

    pub fn ip_rule(&self) -> &RateLimitRule {
        &self.ip_rule
    }

    pub fn credential_rule(&self) -> &RateLimitRule {
        &self.credential_rule
    }

    pub async fn check_ip(&self, ip: IpAddr) -> LayeredDecision {
        self.check_layer(Layer::Ip, &ip.to_string()).await
    }

    pub async fn check_credential(&self, credential_id: &str) -> LayeredDecision {
        self.check_layer(Layer::Credential, credential_id).await
    }

    /// Check the IP layer and, when it admits the request and a credential
    /// is present, the credential layer.
    ///
    /// Returns the rejecting layer's decision, or the tighter of the
    /// admitting ones.
    pub async fn check(&self, ip: IpAddr, credential_id: Option<&str>) -> LayeredDecision {
        let by_ip = self.check_ip(ip).await;
        if !by_ip.allowed() {
            return by_ip;
        }
        match credential_id {
            Some(id) => {
                let by_credential = self.check_credential(id).await;
                if by_credential.allowed() {
                    by_ip.tighter(by_credential)
                } else {
                    by_credential
                }
            }
            None => by_ip,
        }
    }

    pub async fn enforce(
        &self,
        ip: IpAddr,
        credential_id: Option<&str>,
    ) -> Result<LayeredDecision, RateLimitError> {
        self.check(ip, credential_id).await.into_result()
    }

    async fn check_layer(&self, layer: Layer, id: &str) -> LayeredDecision {
        let key = layer.key(id);
        let rule = match layer {
            Layer::Ip => &self.ip_rule,
            Layer::Credential => &self.credential_rule,
        };
        let decision = self.backend.hit(&key, rule).await;
        log_decision(&key, &decision);
        if let Some(metrics) = &self.metrics {
            let outcome = if decision.allowed { "allowed" } else { "rejected" };
            metrics.inc_counter(
                METRIC_RATE_LIMIT_DECISIONS,
                &[("layer", layer.as_str()), ("decision", outcome)],
            );
        }
        LayeredDecision {
            layer,
            key,
            decision,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::BreakerConfig;
    use bastion_storage::InMemoryRemoteStore;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn rule(max: u32, window_ms: u64) -> RateLimitRule {
        RateLimitRule::new(max, Duration::from_millis(window_ms)).unwrap()
    }

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[test]
    fn test_zero_rules_rejected() {
        assert!(RateLimitRule::new(0, Duration::from_secs(1)).is_err());
        let err = RateLimitRule::new(1, Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let mut decision = RateDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_after: Duration::from_millis(1200),
        };
        assert_eq!(decision.retry_after_secs(), 2);
        decision.reset_after = Duration::from_secs(3);
        assert_eq!(decision.retry_after_secs(), 3);
        decision.reset_after = Duration::ZERO;
        assert_eq!(decision.retry_after_secs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_per_fifty_millis() {
        let limiter = RateLimiter::new();
        let rule = rule(3, 50);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.enforce("ip:10.0.0.1", &rule).unwrap();
            assert_eq!(decision.remaining, expected_remaining);
        }

        let err = limiter.enforce("ip:10.0.0.1", &rule).unwrap_err();
        assert_eq!(
            err,
            RateLimitError::Exceeded {
                key: "ip:10.0.0.1".to_string(),
                limit: 3,
                retry_after_secs: 1,
            }
        );

        tokio::time::advance(Duration::from_millis(60)).await;
        let decision = limiter.enforce("ip:10.0.0.1", &rule).unwrap();
        assert_eq!(decision.remaining, 2);
        assert_eq!(limiter.count("ip:10.0.0.1"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_not_counted() {
        let limiter = RateLimiter::new();
        let rule = rule(2, 1000);
        for _ in 0..5 {
            limiter.check("k", &rule);
        }
        assert_eq!(limiter.count("k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_starts_at_first_request() {
        let limiter = RateLimiter::new();
        let rule = rule(1, 100);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check("k", &rule).allowed());

        tokio::time::advance(Duration::from_millis(99)).await;
        let decision = limiter.check("k", &rule);
        assert!(!decision.allowed());
        assert_eq!(decision.reset_after, Duration::from_millis(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.check("k", &rule).allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let rule = rule(1, 1000);
        assert!(limiter.check("ip:a", &rule).allowed());
        assert!(limiter.check("ip:b", &rule).allowed());
        assert!(!limiter.check("ip:a", &rule).allowed());
        assert!(limiter.reset_key("ip:a"));
        assert!(limiter.check("ip:a", &rule).allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_only_elapsed_windows() {
        let limiter = RateLimiter::new();
        limiter.check("short", &rule(5, 100));
        limiter.check("long", &rule(5, 10_000));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.count("long"), Some(1));

        limiter.reset();
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_headers_applied() {
        let decision = RateDecision {
            allowed: true,
            limit: 100,
            remaining: 99,
            reset_after: Duration::from_millis(59_500),
        };
        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "99");
        assert_eq!(headers["x-ratelimit-reset"], "60");
    }

    #[test]
    fn test_layer_keys_are_namespaced() {
        assert_eq!(Layer::Ip.key(client()), "ip:10.0.0.1");
        assert_eq!(Layer::Credential.key("cred-42"), "key:cred-42");
    }

    fn dual(ip_max: u32, credential_max: u32) -> (DualLayerLimiter, Arc<RateLimiter>, Arc<MetricsStore>) {
        let local = Arc::new(RateLimiter::new());
        let metrics = Arc::new(MetricsStore::default());
        let limiter = DualLayerLimiter::new(
            local.clone(),
            rule(ip_max, 60_000),
            rule(credential_max, 60_000),
        )
        .with_metrics(metrics.clone());
        (limiter, local, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_rejection_leaves_credential_untouched() {
        let (limiter, local, metrics) = dual(2, 10);

        for _ in 0..2 {
            assert!(limiter.check(client(), Some("cred-1")).await.allowed());
        }
        assert_eq!(local.count("key:cred-1"), Some(2));

        let rejected = limiter.check(client(), Some("cred-1")).await;
        assert!(!rejected.allowed());
        assert_eq!(rejected.layer, Layer::Ip);
        assert_eq!(rejected.key, "ip:10.0.0.1");
        assert_eq!(local.count("key:cred-1"), Some(2));

        assert_eq!(
            metrics.get_counter(
                METRIC_RATE_LIMIT_DECISIONS,
                &[("layer", "ip"), ("decision", "rejected")]
            ),
            1.0
        );
        assert_eq!(
            metrics.get_counter(
                METRIC_RATE_LIMIT_DECISIONS,
                &[("layer", "credential"), ("decision", "allowed")]
            ),
            2.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_layer_rejects_across_ips() {
        let (limiter, _local, _metrics) = dual(10, 3);
        let ips = [1u8, 2, 3].map(|n| IpAddr::V4(Ipv4Addr::new(192, 168, 0, n)));

        for ip in ips {
            limiter.enforce(ip, Some("shared")).await.unwrap();
        }
        let err = limiter
            .enforce(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 4)), Some("shared"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RateLimitError::Exceeded { ref key, limit: 3, .. } if key == "key:shared"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tighter_layer_reported() {
        let (limiter, _local, _metrics) = dual(5, 2);
        let outcome = limiter.check(client(), Some("cred")).await;
        assert_eq!(outcome.layer, Layer::Credential);
        assert_eq!(outcome.decision.remaining, 1);

        let anonymous = limiter.check(IpAddr::V4(Ipv4Addr::LOCALHOST), None).await;
        assert_eq!(anonymous.layer, Layer::Ip);
        assert_eq!(anonymous.decision.remaining, 4);
    }

    fn remote_limiter(
        remote: Arc<InMemoryRemoteStore>,
    ) -> (RemoteRateLimiter, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new("l2", BreakerConfig::default()).unwrap());
        let limiter = RemoteRateLimiter::new(remote, breaker.clone(), Arc::new(RateLimiter::new()));
        (limiter, breaker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_windows_are_shared_between_processes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let (first, _) = remote_limiter(remote.clone());
        let (second, _) = remote_limiter(remote.clone());
        let rule = rule(3, 1000);

        assert!(first.hit("ip:a", &rule).await.allowed());
        assert!(second.hit("ip:a", &rule).await.allowed());
        let third = first.hit("ip:a", &rule).await;
        assert!(third.allowed());
        assert_eq!(third.remaining, 0);

        let rejected = second.hit("ip:a", &rule).await;
        assert!(!rejected.allowed());
        assert!(rejected.reset_after <= Duration::from_secs(1));
        assert_eq!(
            remote.get("bastion:ratelimit:ip:a").await.unwrap().as_deref(),
            Some("4")
        );

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(first.hit("ip:a", &rule).await.allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_counts_locally() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_failing(true);
        let (limiter, _breaker) = remote_limiter(remote);
        let rule = rule(2, 1000);

        assert!(limiter.hit("ip:a", &rule).await.allowed());
        assert!(limiter.hit("ip:a", &rule).await.allowed());
        assert!(!limiter.hit("ip:a", &rule).await.allowed());
        assert_eq!(limiter.fallback().count("ip:a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_times_out_and_counts_locally() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Some(Duration::from_secs(5)));
        let (limiter, _breaker) = remote_limiter(remote);
        let limiter = limiter.with_timeout(Duration::from_millis(50));
        let rule = rule(2, 1000);

        assert!(matches!(
            limiter.count_remote("ip:a", &rule).await,
            Err(CacheError::Timeout { timeout_ms: 50 })
        ));
        assert!(limiter.hit("ip:a", &rule).await.allowed());
        assert_eq!(limiter.fallback().count("ip:a"), Some(1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Exactly `max` of any burst inside one window are admitted, and
        /// the first call after the window starts again at count 1.
        #[test]
        fn prop_fixed_window_law(max in 1u32..20, extra in 0u32..10, window_ms in 1u64..500) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let (admitted, after) = runtime.block_on(async {
                let limiter = RateLimiter::new();
                let rule = rule(max, window_ms);
                let admitted = (0..max + extra)
                    .filter(|_| limiter.check("k", &rule).allowed())
                    .count() as u32;
                tokio::time::advance(Duration::from_millis(window_ms)).await;
                let after = limiter.check("k", &rule);
                (admitted, after)
            });
            prop_assert_eq!(admitted, max);
            prop_assert!(after.allowed());
            prop_assert_eq!(after.remaining, max - 1);
        }
    }
}
