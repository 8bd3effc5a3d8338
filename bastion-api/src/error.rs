//! Error Types for the BASTION API
//!
//! `ApiError` is the one error shape every handler and middleware returns.
//! It serializes as JSON and carries its own HTTP status; rate-limit
//! rejections additionally set `Retry-After` and `x-ratelimit-*` headers.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bastion_core::{CacheError, ConfigError, RateLimitError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rate_limit::RateDecision;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request lacks a valid API credential
    Unauthorized,

    /// Request contains invalid input data
    InvalidInput,

    /// Request rate limit exceeded
    TooManyRequests,

    /// Internal server error
    InternalError,

    /// Credential database query failed
    DatabaseError,

    /// A dependency is temporarily unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError | ErrorCode::DatabaseError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::TooManyRequests => "Rate limit exceeded",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds until a rate-limited caller may retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Decision behind a rate-limit rejection, rendered as headers only.
    #[serde(skip)]
    pub rate_limit: Option<RateDecision>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after_secs: None,
            rate_limit: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach the decision that rejected the request.
    pub fn with_rate_limit(mut self, decision: RateDecision) -> Self {
        self.retry_after_secs = Some(decision.retry_after_secs());
        self.rate_limit = Some(decision);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn too_many_requests(retry_after_secs: Option<u64>) -> Self {
        let message = match retry_after_secs {
            Some(secs) => format!("Rate limit exceeded. Retry after {} seconds", secs),
            None => "Rate limit exceeded".to_string(),
        };
        let mut err = Self::new(ErrorCode::TooManyRequests, message);
        err.retry_after_secs = retry_after_secs;
        err
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after_secs;
        let decision = self.rate_limit;

        let mut response = (status, Json(self)).into_response();
        let headers = response.headers_mut();
        if let Some(decision) = decision {
            decision.apply_headers(headers);
        }
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match &err {
            RateLimitError::Exceeded {
                limit,
                retry_after_secs,
                ..
            } => ApiError::too_many_requests(Some(*retry_after_secs))
                .with_details(serde_json::json!({ "limit": limit })),
        }
    }
}

/// Cache faults never expose backend detail to the caller.
impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        tracing::error!(error = %err, "Cache operation failed");
        match err {
            CacheError::Connection(_) | CacheError::Timeout { .. } | CacheError::Unsupported { .. } => {
                ApiError::service_unavailable("Cache temporarily unavailable")
            }
            CacheError::Compute(_) => ApiError::database_error("Credential lookup failed"),
            CacheError::Serialization(_) | CacheError::Backend(_) => {
                ApiError::from_code(ErrorCode::InternalError)
            }
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::internal_error(format!("Invalid configuration: {}", err))
    }
}

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    struct Down;

    impl fmt::Display for Down {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connection refused")
        }
    }

    impl std::error::Error for Down {}

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::TooManyRequests.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::DatabaseError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::ServiceUnavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rate_limit_error_becomes_429_with_headers() {
        let err = ApiError::from(RateLimitError::Exceeded {
            key: "ip:10.0.0.1".to_string(),
            limit: 100,
            retry_after_secs: 42,
        })
        .with_rate_limit(RateDecision {
            allowed: false,
            limit: 100,
            remaining: 0,
            reset_after: Duration::from_millis(41_100),
        });
        assert!(!err.message.contains("10.0.0.1"));

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[header::RETRY_AFTER], "42");
        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_cache_error_mapping() {
        let unavailable = ApiError::from(CacheError::Timeout { timeout_ms: 10 });
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let compute = ApiError::from(CacheError::Compute(Arc::new(Down)));
        assert_eq!(compute.code, ErrorCode::DatabaseError);
        assert!(!compute.message.contains("connection refused"));

        let backend = ApiError::from(CacheError::Backend("WRONGTYPE".to_string()));
        assert_eq!(backend.code, ErrorCode::InternalError);
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::too_many_requests(Some(5));
        let json = serde_json::to_string(&err)?;
        assert!(json.contains("TOO_MANY_REQUESTS"));
        assert!(json.contains("\"retry_after_secs\":5"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::unauthorized("Unknown API key");
        let display = format!("{}", err);
        assert!(display.contains("Unauthorized"));
        assert!(display.contains("Unknown API key"));
    }
}
