//! Circuit breaker for remote-store calls.
//!
//! The state machine is a pure function, [`transition`], over
//! [`BreakerState`]. [`CircuitBreaker`] owns one state behind a mutex, decides
//! admission, runs the operation with the lock released, and feeds the
//! outcome back through `transition`.
//!
//! Operation failures never escape: callers get `None` or their fallback
//! value and must read that as "remote store unavailable", not "absent".

use std::future::Future;
use std::sync::Arc;

use bastion_core::{
    BreakerConfig, ConfigError, MetricsStore, METRIC_BREAKER_FALLBACKS, METRIC_BREAKER_STATE,
    METRIC_BREAKER_TRANSITIONS,
};
use parking_lot::Mutex;
use tokio::time::Instant;

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Coarse breaker state, for health output and the state gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    /// Requests flow normally
    Closed = 0,
    /// Requests are rejected until the cool-down ends
    Open = 1,
    /// Trial requests probe whether the remote recovered
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn as_gauge(&self) -> f64 {
        *self as u8 as f64
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full breaker state with the counters each variant needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { successes: u32 },
}

impl BreakerState {
    pub fn initial() -> Self {
        Self::Closed { failures: 0 }
    }

    pub fn kind(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Success,
    Failure { at: Instant },
    /// A caller wants to run an operation at `at`.
    Probe { at: Instant },
}

/// Pure breaker transition.
///
/// - CLOSED: failures accumulate; reaching `failure_threshold` opens until
///   `at + timeout`. A success resets the failure count.
/// - OPEN: a probe at or after `until` moves to HALF_OPEN. Outcomes are
///   ignored.
/// - HALF_OPEN: successes accumulate; reaching `success_threshold` closes.
///   Any failure reopens.
pub fn transition(state: BreakerState, event: BreakerEvent, config: &BreakerConfig) -> BreakerState {
    use BreakerEvent::*;
    use BreakerState::*;

    match (state, event) {
        (Closed { .. }, Success) => Closed { failures: 0 },
        (Closed { failures }, Failure { at }) => {
            let failures = failures.saturating_add(1);
            if failures >= config.failure_threshold {
                Open {
                    until: at + config.timeout,
                }
            } else {
                Closed { failures }
            }
        }
        (Open { until }, Probe { at }) if at >= until => HalfOpen { successes: 0 },
        (HalfOpen { successes }, Success) => {
            let successes = successes.saturating_add(1);
            if successes >= config.success_threshold {
                Closed { failures: 0 }
            } else {
                HalfOpen { successes }
            }
        }
        (HalfOpen { .. }, Failure { at }) => Open {
            until: at + config.timeout,
        },
        (state, _) => state,
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Why an operation produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// Breaker is open; the operation was not invoked.
    Open,
    /// Breaker is half-open and its single trial slot is taken.
    TrialInFlight,
    /// The operation ran and failed.
    Failed(String),
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::TrialInFlight => "trial_in_flight",
            Self::Failed(_) => "failure",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Bumped on every change of state kind. Outcomes of calls admitted under
    /// an older generation are discarded.
    generation: u64,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one remote dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: Option<Arc<MetricsStore>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::initial(),
                generation: 0,
                trial_in_flight: false,
            }),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        metrics.set_gauge(
            METRIC_BREAKER_STATE,
            self.state().as_gauge(),
            &[("breaker", self.name.as_str())],
        );
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state.kind()
    }

    pub fn snapshot(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `operation` if the breaker admits it. Returns `None` when the
    /// breaker is open or the operation fails.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match self.call(operation).await {
            Ok(value) => Some(value),
            Err(reason) => {
                self.note_fallback(&reason);
                None
            }
        }
    }

    /// Like [`execute`](Self::execute), producing `fallback()` instead of
    /// `None`.
    pub async fn execute_or_else<T, E, F, Fut, G>(&self, operation: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        G: FnOnce() -> T,
    {
        match self.call(operation).await {
            Ok(value) => value,
            Err(reason) => {
                self.note_fallback(&reason);
                fallback()
            }
        }
    }

    /// Force the breaker back to CLOSED with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let from = inner.state.kind();
        inner.state = BreakerState::initial();
        inner.generation += 1;
        inner.trial_in_flight = false;
        tracing::info!(breaker = %self.name, from = %from, "Circuit breaker reset");
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge(
                METRIC_BREAKER_STATE,
                CircuitState::Closed.as_gauge(),
                &[("breaker", self.name.as_str())],
            );
        }
    }

    async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, FallbackReason>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut permit = self.admit()?;
        match operation().await {
            Ok(value) => {
                self.settle(&mut permit, BreakerEvent::Success);
                Ok(value)
            }
            Err(err) => {
                self.settle(
                    &mut permit,
                    BreakerEvent::Failure { at: Instant::now() },
                );
                Err(FallbackReason::Failed(err.to_string()))
            }
        }
    }

    fn admit(&self) -> Result<Permit<'_>, FallbackReason> {
        let mut inner = self.inner.lock();
        if let BreakerState::Open { .. } = inner.state {
            let next = transition(
                inner.state,
                BreakerEvent::Probe { at: Instant::now() },
                &self.config,
            );
            self.apply(&mut inner, next);
        }

        let trial = match inner.state {
            BreakerState::Closed { .. } => false,
            BreakerState::Open { .. } => return Err(FallbackReason::Open),
            BreakerState::HalfOpen { .. } => {
                if inner.trial_in_flight {
                    return Err(FallbackReason::TrialInFlight);
                }
                inner.trial_in_flight = true;
                tracing::debug!(breaker = %self.name, "Admitting half-open trial call");
                true
            }
        };

        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            trial,
            settled: false,
        })
    }

    fn settle(&self, permit: &mut Permit<'_>, event: BreakerEvent) {
        permit.settled = true;
        let mut inner = self.inner.lock();
        if inner.generation != permit.generation {
            return;
        }
        if permit.trial {
            inner.trial_in_flight = false;
        }
        let next = transition(inner.state, event, &self.config);
        self.apply(&mut inner, next);
    }

    fn apply(&self, inner: &mut Inner, next: BreakerState) {
        let from = inner.state.kind();
        let to = next.kind();
        inner.state = next;
        if from == to {
            return;
        }

        inner.generation += 1;
        inner.trial_in_flight = false;
        tracing::warn!(
            breaker = %self.name,
            from = %from,
            to = %to,
            "Circuit breaker state transition"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(
                METRIC_BREAKER_TRANSITIONS,
                &[("breaker", self.name.as_str()), ("from", from.as_str()), ("to", to.as_str())],
            );
            metrics.set_gauge(METRIC_BREAKER_STATE, to.as_gauge(), &[("breaker", self.name.as_str())]);
        }
    }

    fn note_fallback(&self, reason: &FallbackReason) {
        match reason {
            FallbackReason::Failed(error) => tracing::warn!(
                breaker = %self.name,
                reason = reason.as_str(),
                error = %error,
                "Circuit breaker fallback"
            ),
            _ => tracing::warn!(
                breaker = %self.name,
                reason = reason.as_str(),
                "Circuit breaker fallback"
            ),
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(
                METRIC_BREAKER_FALLBACKS,
                &[("breaker", self.name.as_str()), ("reason", reason.as_str())],
            );
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("trial_in_flight", &inner.trial_in_flight)
            .finish()
    }
}

/// Admission ticket for one call. Dropping it unsettled (the caller was
/// cancelled) frees the half-open trial slot without recording an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.generation == self.generation {
            inner.trial_in_flight = false;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(failures: u32, successes: u32, timeout_ms: u64) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(failures)
            .with_success_threshold(successes)
            .with_timeout(Duration::from_millis(timeout_ms))
    }

    async fn fail() -> Result<u32, &'static str> {
        Err("remote down")
    }

    async fn succeed() -> Result<u32, &'static str> {
        Ok(7)
    }

    #[test]
    fn test_transition_closed_to_open_at_threshold() {
        let cfg = config(3, 1, 1000);
        let at = Instant::now();
        let mut state = BreakerState::initial();
        for _ in 0..2 {
            state = transition(state, BreakerEvent::Failure { at }, &cfg);
            assert_eq!(state.kind(), CircuitState::Closed);
        }
        state = transition(state, BreakerEvent::Failure { at }, &cfg);
        assert_eq!(
            state,
            BreakerState::Open {
                until: at + Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_transition_success_resets_failures() {
        let cfg = config(2, 1, 1000);
        let at = Instant::now();
        let state = transition(BreakerState::initial(), BreakerEvent::Failure { at }, &cfg);
        let state = transition(state, BreakerEvent::Success, &cfg);
        assert_eq!(state, BreakerState::Closed { failures: 0 });
    }

    #[test]
    fn test_transition_open_waits_for_deadline() {
        let cfg = config(1, 1, 100);
        let at = Instant::now();
        let open = BreakerState::Open {
            until: at + Duration::from_millis(100),
        };
        assert_eq!(transition(open, BreakerEvent::Probe { at }, &cfg), open);
        assert_eq!(transition(open, BreakerEvent::Success, &cfg), open);
        assert_eq!(
            transition(
                open,
                BreakerEvent::Probe {
                    at: at + Duration::from_millis(100)
                },
                &cfg
            ),
            BreakerState::HalfOpen { successes: 0 }
        );
    }

    #[test]
    fn test_transition_half_open_outcomes() {
        let cfg = config(1, 2, 100);
        let at = Instant::now();
        let half = BreakerState::HalfOpen { successes: 0 };

        let once = transition(half, BreakerEvent::Success, &cfg);
        assert_eq!(once, BreakerState::HalfOpen { successes: 1 });
        assert_eq!(
            transition(once, BreakerEvent::Success, &cfg),
            BreakerState::Closed { failures: 0 }
        );
        assert_eq!(
            transition(once, BreakerEvent::Failure { at }, &cfg),
            BreakerState::Open {
                until: at + Duration::from_millis(100)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_scenario_open_then_recover() {
        let breaker = CircuitBreaker::new("remote", config(2, 1, 100)).unwrap();

        assert_eq!(breaker.execute(fail).await, None);
        assert_eq!(breaker.execute(fail).await, None);
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute_or_else(
                || async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>(1)
                },
                || 99,
            )
            .await;
        assert_eq!(result, 99);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(breaker.execute(succeed).await, Some(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("remote", config(1, 1, 50)).unwrap();
        breaker.execute(fail).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(50)).await;
        breaker.execute(fail).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The cool-down restarted from the trial failure.
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(breaker.execute(succeed).await, None);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let breaker = Arc::new(CircuitBreaker::new("remote", config(1, 1, 10)).unwrap());
        breaker.execute(fail).await;
        tokio::time::advance(Duration::from_millis(10)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Ok::<_, &str>(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let invoked = AtomicU32::new(0);
        let second = breaker
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(2)
            })
            .await;
        assert_eq!(second, None);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), Some(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_slot() {
        let breaker = CircuitBreaker::new("remote", config(1, 1, 10)).unwrap();
        breaker.execute(fail).await;
        tokio::time::advance(Duration::from_millis(10)).await;

        let stalled = breaker.execute(|| std::future::pending::<Result<u32, &str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(5), stalled).await;
        assert!(timed_out.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(breaker.execute(succeed).await, Some(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_outcome_is_ignored() {
        let breaker = Arc::new(CircuitBreaker::new("remote", config(1, 1, 10)).unwrap());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = release_rx.await;
                        Err::<u32, _>("late failure")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        breaker.execute(fail).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(breaker.execute(succeed).await, Some(7));
        assert_eq!(breaker.state(), CircuitState::Closed);

        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap(), None);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_metrics_and_reset() {
        let metrics = Arc::new(MetricsStore::default());
        let breaker = CircuitBreaker::new("l2", config(1, 1, 10_000))
            .unwrap()
            .with_metrics(metrics.clone());
        assert_eq!(metrics.get_gauge(METRIC_BREAKER_STATE, &[("breaker", "l2")]), Some(0.0));

        breaker.execute(fail).await;
        breaker.execute(succeed).await;
        assert_eq!(metrics.get_gauge(METRIC_BREAKER_STATE, &[("breaker", "l2")]), Some(1.0));
        assert_eq!(
            metrics.get_counter(
                METRIC_BREAKER_TRANSITIONS,
                &[("breaker", "l2"), ("from", "closed"), ("to", "open")]
            ),
            1.0
        );
        assert_eq!(
            metrics.get_counter(METRIC_BREAKER_FALLBACKS, &[("breaker", "l2"), ("reason", "failure")]),
            1.0
        );
        assert_eq!(
            metrics.get_counter(METRIC_BREAKER_FALLBACKS, &[("breaker", "l2"), ("reason", "open")]),
            1.0
        );

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(metrics.get_gauge(METRIC_BREAKER_STATE, &[("breaker", "l2")]), Some(0.0));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        assert!(CircuitBreaker::new("x", config(0, 1, 10)).is_err());
        assert!(CircuitBreaker::new("x", config(1, 0, 10)).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// In CLOSED, the breaker opens exactly when a run of
        /// `failure_threshold` consecutive failures occurs.
        #[test]
        fn prop_closed_opens_on_consecutive_failures(
            threshold in 1u32..6,
            outcomes in prop::collection::vec(any::<bool>(), 0..40),
        ) {
            let cfg = config(threshold, 1, 1000);
            let at = Instant::now();
            let mut state = BreakerState::initial();
            let mut run = 0u32;

            for ok in outcomes {
                let event = if ok { BreakerEvent::Success } else { BreakerEvent::Failure { at } };
                state = transition(state, event, &cfg);
                run = if ok { 0 } else { run + 1 };
                if run >= threshold {
                    prop_assert_eq!(state.kind(), CircuitState::Open);
                    break;
                }
                prop_assert_eq!(state, BreakerState::Closed { failures: run });
            }
        }

        /// Any failure in HALF_OPEN reopens regardless of prior successes.
        #[test]
        fn prop_half_open_failure_reopens(successes in 0u32..10, threshold in 1u32..12) {
            prop_assume!(successes < threshold);
            let cfg = config(1, threshold, 100);
            let at = Instant::now();
            let state = transition(
                BreakerState::HalfOpen { successes },
                BreakerEvent::Failure { at },
                &cfg,
            );
            prop_assert_eq!(state, BreakerState::Open { until: at + Duration::from_millis(100) });
        }
    }
}
