//! HTTP rendering of relay outcomes.
//!
//! Error bodies are `{errorKind, message, retryAfterSeconds?, fields?}`. Quota headers follow the
//! `X-RateLimit-*` convention with the reset in epoch seconds.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::HeaderMap;
use serde::Serialize;

use crate::classify::FieldError;
use crate::error::RelayError;
use crate::rate_limit::{Decision, RateLimitRejection};

/// Units allowed per window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Units left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which capacity returns.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Stable machine-readable kind.
    pub error_kind: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Seconds to wait before retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// Offending fields of a validation failure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl From<&RelayError> for ErrorBody {
    fn from(err: &RelayError) -> Self {
        Self {
            error_kind: err.error_code(),
            message: err.user_message(),
            retry_after_seconds: err.retry_after_secs(),
            fields: err.field_errors().to_vec(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self);
        let mut response = (self.status_code(), Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = self.retry_after_secs() {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        if let RelayError::RateLimited(rejection) = &self {
            apply_rejection_headers(headers, rejection);
        }
        response
    }
}

/// Stamp quota headers for an admitted request.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_epoch_secs()));
}

fn apply_rejection_headers(headers: &mut HeaderMap, rejection: &RateLimitRejection) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(rejection.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(rejection.reset_at.div_ceil(1000)));
}
