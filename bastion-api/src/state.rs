//! Shared application state for Axum routers.
//!
//! Everything here is constructed once at startup by [`AppState::build`]
//! and lives until the process exits; handlers receive clones of the `Arc`s.

use std::sync::Arc;

use bastion_core::{describe_metrics, BastionConfig, ConfigError, MetricsStore};
use bastion_storage::{spawn_sweeper, CircuitBreaker, RemoteStore, SweepStats, TieredCache};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::credentials::{CredentialStore, CredentialVerifier};
use crate::rate_limit::{DualLayerLimiter, RateLimitBackend, RateLimiter, RemoteRateLimiter};

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BastionConfig>,
    pub metrics: Arc<MetricsStore>,
    /// The L2 backend, shared by the credential cache and the distributed
    /// rate limiter.
    pub remote: Arc<dyn RemoteStore>,
    /// One breaker per remote binding.
    pub breaker: Arc<CircuitBreaker>,
    pub credentials: Arc<CredentialVerifier>,
    /// In-process windows. The limiter's backend when rate limiting is
    /// local, its fallback when distributed.
    pub local_limits: Arc<RateLimiter>,
    pub limiter: Arc<DualLayerLimiter>,
    pub start_time: std::time::Instant,
}

macro_rules! impl_from_ref {
    ($type:ty, $field:ident) => {
        impl axum::extract::FromRef<AppState> for $type {
            fn from_ref(state: &AppState) -> Self {
                state.$field.clone()
            }
        }
    };
}

impl_from_ref!(Arc<BastionConfig>, config);
impl_from_ref!(Arc<MetricsStore>, metrics);
impl_from_ref!(Arc<CircuitBreaker>, breaker);
impl_from_ref!(Arc<CredentialVerifier>, credentials);
impl_from_ref!(Arc<DualLayerLimiter>, limiter);

impl AppState {
    /// Validate `config` and wire every component around `remote`.
    pub fn build(
        config: BastionConfig,
        remote: Arc<dyn RemoteStore>,
        credential_store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let metrics = Arc::new(MetricsStore::new(config.metrics.clone())?);
        describe_metrics(&metrics);

        let breaker = Arc::new(
            CircuitBreaker::new(remote.name(), config.breaker.clone())?
                .with_metrics(Arc::clone(&metrics)),
        );

        let cache = TieredCache::new(
            config.cache.clone(),
            Arc::clone(&remote),
            Arc::clone(&breaker),
            Arc::clone(&metrics),
        )?;
        let credentials = Arc::new(CredentialVerifier::new(cache, credential_store));

        let local_limits = Arc::new(RateLimiter::new());
        let backend: Arc<dyn RateLimitBackend> = if config.rate_limit.distributed {
            Arc::new(
                RemoteRateLimiter::new(
                    Arc::clone(&remote),
                    Arc::clone(&breaker),
                    Arc::clone(&local_limits),
                )
                .with_key_prefix(config.cache.key_prefix.clone())
                .with_timeout(config.cache.remote_timeout),
            )
        } else {
            local_limits.clone()
        };
        let limiter = Arc::new(
            DualLayerLimiter::from_config(backend, &config.rate_limit)?
                .with_metrics(Arc::clone(&metrics)),
        );

        tracing::info!(
            remote = remote.name(),
            rate_limit_backend = limiter.backend().name(),
            rate_limit_enabled = config.rate_limit.enabled,
            "Application state ready"
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            remote,
            breaker,
            credentials,
            local_limits,
            limiter,
            start_time: std::time::Instant::now(),
        })
    }

    /// Spawn the L1 and local rate-limit sweepers. They stop when
    /// `shutdown_rx` carries `true`.
    pub fn spawn_sweepers(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<Arc<SweepStats>>> {
        vec![
            spawn_sweeper(
                Arc::new(self.credentials.cache().clone()),
                self.config.cache.sweep_interval,
                shutdown_rx.clone(),
            ),
            spawn_sweeper(
                self.local_limits.clone(),
                self.config.rate_limit.sweep_interval,
                shutdown_rx,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentialStore;
    use bastion_storage::InMemoryRemoteStore;
    use std::time::Duration;

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = BastionConfig::default();
        config.rate_limit.ip_window = Duration::ZERO;
        let result = AppState::build(
            config,
            Arc::new(InMemoryRemoteStore::new()),
            Arc::new(StaticCredentialStore::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_build_selects_backend() {
        let local = AppState::build(
            BastionConfig::default(),
            Arc::new(InMemoryRemoteStore::new()),
            Arc::new(StaticCredentialStore::new()),
        )
        .unwrap();
        assert_eq!(local.limiter.backend().name(), "local");
        assert_eq!(local.breaker.name(), "memory");

        let mut config = BastionConfig::default();
        config.rate_limit.distributed = true;
        let distributed = AppState::build(
            config,
            Arc::new(InMemoryRemoteStore::new()),
            Arc::new(StaticCredentialStore::new()),
        )
        .unwrap();
        assert_eq!(distributed.limiter.backend().name(), "remote");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweepers_stop_on_shutdown() {
        let state = AppState::build(
            BastionConfig::default(),
            Arc::new(InMemoryRemoteStore::new()),
            Arc::new(StaticCredentialStore::new()),
        )
        .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = state.spawn_sweepers(shutdown_rx);

        tokio::time::sleep(state.config.cache.sweep_interval + Duration::from_millis(1)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            let stats = handle.await.unwrap();
            assert_eq!(stats.cycles(), 1);
        }
    }
}
