//! Rate limiting middleware.
//!
//! Every request is charged to its client IP first. Requests carrying an
//! `x-api-key` header are then verified and charged to the credential. The
//! resolved [`CredentialRecord`] is stored in the request extensions for
//! handlers.

use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use bastion_core::RateLimitError;

use crate::credentials::CredentialRecord;
use crate::error::ApiError;
use crate::rate_limit::LayeredDecision;
use crate::state::AppState;

/// Header carrying the API credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Client IP from `x-forwarded-for` (first entry), then `x-real-ip`, then
/// the connection's peer address.
pub fn extract_client_ip(request: &Request, fallback: SocketAddr) -> IpAddr {
    let headers = request.headers();

    if let Some(forwarded_for) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(Ok(ip)) = forwarded_for.split(',').next().map(|first| first.trim().parse()) {
            return ip;
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        if let Ok(ip) = real_ip.trim().parse() {
            return ip;
        }
    }

    fallback.ip()
}

fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

fn reject(outcome: LayeredDecision) -> ApiError {
    let err = RateLimitError::Exceeded {
        key: outcome.key,
        limit: outcome.decision.limit,
        retry_after_secs: outcome.decision.retry_after_secs(),
    };
    ApiError::from(err).with_rate_limit(outcome.decision)
}

/// Dual-layer rate limiting middleware.
///
/// Rejections are 429 with `Retry-After`; admitted responses carry the
/// tighter layer's `x-ratelimit-*` headers. An unknown or expired API key is
/// 401, and is only looked up after the IP layer admitted the request.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.config.rate_limit.enabled {
        return Ok(next.run(request).await);
    }

    let ip = extract_client_ip(&request, addr);
    let by_ip = state.limiter.check_ip(ip).await;
    if !by_ip.allowed() {
        return Err(reject(by_ip));
    }

    let mut outcome = by_ip;
    if let Some(api_key) = extract_api_key(&request) {
        let record: CredentialRecord = state
            .credentials
            .verify(&api_key)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Invalid or expired API key"))?;

        let by_credential = state.limiter.check_credential(&record.id).await;
        if !by_credential.allowed() {
            return Err(reject(by_credential));
        }
        outcome = outcome.tighter(by_credential);
        request.extensions_mut().insert(record);
    }

    let mut response = next.run(request).await;
    outcome.decision.apply_headers(response.headers_mut());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 7], 41000))
    }

    fn request_with(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let request = request_with(&[
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(extract_client_ip(&request, peer()).to_string(), "203.0.113.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip_then_peer() {
        let request = request_with(&[("x-forwarded-for", "garbage"), ("x-real-ip", "198.51.100.1")]);
        assert_eq!(extract_client_ip(&request, peer()).to_string(), "198.51.100.1");

        let request = request_with(&[]);
        assert_eq!(extract_client_ip(&request, peer()).to_string(), "192.0.2.7");
    }

    #[test]
    fn test_blank_api_key_ignored() {
        assert_eq!(extract_api_key(&request_with(&[(API_KEY_HEADER, "  ")])), None);
        assert_eq!(
            extract_api_key(&request_with(&[(API_KEY_HEADER, "key-a")])).as_deref(),
            Some("key-a")
        );
    }
}
