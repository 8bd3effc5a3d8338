//! BASTION API - Rate Limiting, Credential Verification and HTTP Surface
//!
//! Sits on top of `bastion-storage`:
//!
//! - [`rate_limit`] - fixed-window limiters and the IP-then-credential
//!   [`DualLayerLimiter`]
//! - [`credentials`] - API key lookups through the tiered cache
//! - [`middleware`] - axum middleware applying both
//! - [`routes`] - `/health`, `/metrics` and the router
//! - [`state`] - the dependency container built once at startup

pub mod credentials;
pub mod error;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use credentials::{
    fingerprint, CredentialRecord, CredentialStore, CredentialStoreError, CredentialVerifier,
    StaticCredentialStore,
};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use middleware::{extract_client_ip, rate_limit_middleware, API_KEY_HEADER};
pub use rate_limit::{
    DualLayerLimiter, Layer, LayeredDecision, RateDecision, RateLimitBackend, RateLimitRule,
    RateLimiter, RemoteRateLimiter,
};
pub use routes::create_router;
pub use state::AppState;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
