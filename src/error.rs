//! Final outcome of a relayed call.
//!
//! Only these values cross into the request layer. Each carries a stable machine-readable kind
//! and a human message; neither ever contains upstream credentials.

use std::time::Duration;

use http::StatusCode;

use crate::classify::{ErrorClassification, ErrorKind, FieldError};
use crate::rate_limit::RateLimitRejection;

/// Unified error type surfaced by the relay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The upstream failed with a non-retryable (or not-retried) classification.
    #[error("upstream call failed: {0}")]
    Upstream(ErrorClassification),
    /// A retryable failure persisted through the whole budget.
    #[error("retry exhausted after {attempts} attempts; last error: {last}")]
    RetryExhausted {
        /// Attempts made
        attempts: u32,
        /// Classification of the final attempt
        last: ErrorClassification,
    },
    /// The dependency's circuit breaker short-circuited the call.
    #[error("circuit breaker for '{dependency}' is open ({failures} failures, retry in {retry_in:?})")]
    BreakerOpen {
        /// Protected dependency
        dependency: String,
        /// Consecutive failures recorded
        failures: u32,
        /// Time until trial calls are admitted
        retry_in: Duration,
    },
    /// Local admission control rejected the caller.
    #[error("rate limited by policy '{}' (retry in {}s)", .0.policy, .0.retry_after_secs)]
    RateLimited(RateLimitRejection),
    /// The call was abandoned before it completed.
    #[error("request cancelled")]
    Cancelled,
}

impl RelayError {
    /// Classification behind an upstream failure.
    pub fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            Self::Upstream(c) | Self::RetryExhausted { last: c, .. } => Some(c),
            _ => None,
        }
    }

    /// Kind in the classifier taxonomy. A breaker-open rejection reports `ServerError`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Upstream(c) | Self::RetryExhausted { last: c, .. } => c.kind().clone(),
            Self::BreakerOpen { .. } => ErrorKind::ServerError,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Cancelled => ErrorKind::Unknown,
        }
    }

    /// Stable machine-readable kind for response bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Upstream(c) | Self::RetryExhausted { last: c, .. } => c.kind().code(),
            Self::BreakerOpen { .. } => ErrorKind::ServerError.code(),
            Self::RateLimited(_) => ErrorKind::RateLimited.code(),
            Self::Cancelled => ErrorKind::Unknown.code(),
        }
    }

    /// Status returned to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream(c) | Self::RetryExhausted { last: c, .. } => status_for(c),
            Self::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Message safe to show to the caller.
    pub fn user_message(&self) -> String {
        match self {
            Self::Upstream(c) => c.message().to_string(),
            Self::RetryExhausted { attempts, last } => {
                format!("{} (gave up after {} attempts)", last.message(), attempts)
            }
            Self::BreakerOpen { .. } => {
                "The content service is temporarily unavailable; please retry later".to_string()
            }
            Self::RateLimited(rejection) => {
                format!("Too many requests; retry in {} seconds", rejection.retry_after_secs)
            }
            Self::Cancelled => "The request was cancelled".to_string(),
        }
    }

    /// Seconds the caller should wait, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Upstream(c) | Self::RetryExhausted { last: c, .. } => c.retry_after_secs(),
            Self::BreakerOpen { retry_in, .. } => {
                let millis = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX);
                Some(millis.div_ceil(1000).max(1))
            }
            Self::RateLimited(rejection) => Some(rejection.retry_after_secs),
            Self::Cancelled => None,
        }
    }

    /// Offending fields of a validation failure.
    pub fn field_errors(&self) -> &[FieldError] {
        self.classification().map(ErrorClassification::field_errors).unwrap_or(&[])
    }

    /// Whether this is a local breaker short-circuit.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    /// Whether this is a retry exhaustion.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }
}

impl From<RateLimitRejection> for RelayError {
    fn from(rejection: RateLimitRejection) -> Self {
        Self::RateLimited(rejection)
    }
}

/// Caller-facing status for an upstream classification.
pub fn status_for(classification: &ErrorClassification) -> StatusCode {
    let code = match classification.kind() {
        ErrorKind::Unauthorized => 401,
        ErrorKind::Forbidden | ErrorKind::MissingPermissions => 403,
        ErrorKind::Validation(_) => 400,
        ErrorKind::NotFound => 404,
        ErrorKind::RateLimited => 429,
        ErrorKind::ServerError => match classification.http_status() {
            s @ (500 | 502 | 503) => s,
            _ => 502,
        },
        ErrorKind::NetworkError => 503,
        ErrorKind::Unknown => match classification.http_status() {
            s @ 400..=599 => s,
            _ => 500,
        },
    };
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
