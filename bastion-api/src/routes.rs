//! HTTP endpoints.
//!
//! - `GET /health` - breaker state and cache occupancy, no rate limit
//! - `GET /metrics` - [`MetricsStore::export_text`], no rate limit
//! - `GET /v1/identity` - the credential behind `x-api-key`, rate limited

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use bastion_core::MetricsStore;
use bastion_storage::{CircuitState, RemoteStore};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::credentials::CredentialRecord;
use crate::error::{ApiError, ApiResult};
use crate::middleware::rate_limit_middleware;
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub remote: RemoteHealth,
    pub l1_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHealth {
    pub backend: String,
    pub breaker: String,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health
///
/// An open or half-open breaker reports `degraded` with 200: reads still
/// fall through to L1 and the database.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let breaker = state.breaker.state();
    let status = if breaker == CircuitState::Closed {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        remote: RemoteHealth {
            backend: state.remote.name().to_string(),
            breaker: breaker.as_str().to_string(),
        },
        l1_entries: state.credentials.cache().l1().len(),
    };
    (StatusCode::OK, Json(response))
}

/// GET /metrics
pub async fn metrics_handler(State(metrics): State<Arc<MetricsStore>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.export_text(),
    )
}

/// GET /v1/identity
pub async fn identity(
    record: Option<Extension<CredentialRecord>>,
) -> ApiResult<Json<CredentialRecord>> {
    record
        .map(|Extension(record)| Json(record))
        .ok_or_else(|| ApiError::unauthorized("API key required"))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Build the application router.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// rate limiter needs the peer address.
pub fn create_router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/v1/identity", get(identity))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .merge(limited)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: HealthStatus::Degraded,
            version: "0.4.0".to_string(),
            uptime_seconds: 12,
            remote: RemoteHealth {
                backend: "memory".to_string(),
                breaker: "open".to_string(),
            },
            l1_entries: 3,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["remote"]["breaker"], "open");
    }
}
