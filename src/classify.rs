//! Upstream failure classification.
//!
//! Turns a raw upstream failure (a transport error with no response, or a response with status,
//! headers and body) into one [`ErrorClassification`]. Rules are priority-ordered and the first
//! match wins:
//!
//! 1. no response at all → `NetworkError` (retryable, status 0)
//! 2. `429` → `RateLimited` (retryable, `Retry-After` or the configured default)
//! 3. `401` → `Unauthorized`; `403` → `MissingPermissions` when the body names missing scopes,
//!    otherwise `Forbidden`
//! 4. `404` → `NotFound`
//! 5. `400` with a structured field-error body → `Validation` carrying every offending field
//! 6. `>= 500` → `ServerError` (retryable)
//! 7. anything else → `Unknown`, status preserved
//!
//! Classification is pure: no I/O, no clocks, no shared state. The same input always yields the
//! same output.

use http::HeaderMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Wait used for a `429` that carries no usable `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Raw bodies kept in the context are truncated to this many bytes.
const MAX_CONTEXT_BODY: usize = 8 * 1024;

/// Response headers copied into the classification context. Credentials are never among them.
const HEADERS_OF_INTEREST: &[&str] = &[
    "retry-after",
    "x-ratelimit-limit",
    "x-ratelimit-remaining",
    "x-ratelimit-reset",
    "x-request-id",
    "content-type",
];

const MISSING_PERMISSION_SIGNATURES: &[&str] = &[
    "missing scope",
    "missing_scope",
    "missing permission",
    "missing_permission",
    "insufficient scope",
    "insufficient_scope",
    "insufficient permission",
];

/// Keys that hold field errors inside a validation body.
const FIELD_ERROR_CONTAINERS: &[&str] =
    &["details", "errors", "fieldErrors", "field_errors", "validationErrors", "problems"];

/// Keys that mark a body as an error envelope rather than a bare field map. Article fields such as
/// `name` or `status` must not appear here.
const ENVELOPE_KEYS: &[&str] = &["message", "code", "error", "requestId", "msg"];

/// What the upstream call produced instead of a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// No response was received (refused, timeout, DNS failure, abort).
    Transport {
        /// Underlying failure description.
        reason: String,
    },
    /// The upstream answered with a non-success status.
    Response {
        /// HTTP status code.
        status: u16,
        /// Response headers.
        headers: HeaderMap,
        /// Raw response body.
        body: String,
    },
}

impl UpstreamFailure {
    /// Failure with no response object.
    pub fn transport(reason: impl Into<String>) -> Self {
        UpstreamFailure::Transport { reason: reason.into() }
    }

    /// Failure carrying a response.
    pub fn response(status: u16, headers: HeaderMap, body: impl Into<String>) -> Self {
        UpstreamFailure::Response { status, headers, body: body.into() }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Transport { reason } => write!(f, "transport failure: {reason}"),
            UpstreamFailure::Response { status, .. } => write!(f, "upstream responded {status}"),
        }
    }
}

/// One offending field of a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Field name or dotted path.
    pub field: String,
    /// Upstream explanation.
    pub message: String,
    /// Rejected value, when the upstream echoed it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FieldError {
    /// Build an entry without an echoed value.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into(), value: None }
    }
}

/// Closed taxonomy of upstream failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials rejected.
    Unauthorized,
    /// Access refused.
    Forbidden,
    /// Access refused because the token lacks scopes.
    MissingPermissions,
    /// Upstream throttling.
    RateLimited,
    /// Request payload rejected, one entry per offending field.
    Validation(Vec<FieldError>),
    /// Resource missing.
    NotFound,
    /// Upstream 5xx.
    ServerError,
    /// No response received.
    NetworkError,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::MissingPermissions => "MissingPermissions",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::Validation(_) => "Validation",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ServerError => "ServerError",
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Kinds that signal a degraded dependency and count against the circuit breaker.
    ///
    /// Client-side rejections and throttling mean the dependency answered correctly.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, ErrorKind::ServerError | ErrorKind::NetworkError)
    }
}

/// Quota telemetry echoed from upstream rate-limit headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaEcho {
    /// `X-RateLimit-Limit`.
    pub limit: Option<u64>,
    /// `X-RateLimit-Remaining`.
    pub remaining: Option<u64>,
    /// `X-RateLimit-Reset`.
    pub reset: Option<u64>,
}

/// Diagnostic context kept alongside a classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureContext {
    /// Response headers of interest, lowercase names.
    pub headers: Vec<(String, String)>,
    /// Raw response body (truncated).
    pub body: Option<String>,
    /// Transport failure reason.
    pub reason: Option<String>,
    /// Upstream quota headers, for `429`s.
    pub quota: Option<QuotaEcho>,
}

impl FailureContext {
    fn from_response(headers: &HeaderMap, body: &str) -> Self {
        let headers = HEADERS_OF_INTEREST
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?;
                Some(((*name).to_string(), value.to_string()))
            })
            .collect();
        let body = (!body.is_empty()).then(|| truncate(body, MAX_CONTEXT_BODY).to_string());
        Self { headers, body, reason: None, quota: None }
    }

    /// Look up a captured header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// Typed, immutable interpretation of one upstream failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassification {
    kind: ErrorKind,
    http_status: u16,
    retryable: bool,
    retry_after_secs: Option<u64>,
    message: String,
    context: FailureContext,
}

impl ErrorClassification {
    pub(crate) fn new(
        kind: ErrorKind,
        http_status: u16,
        retryable: bool,
        message: impl Into<String>,
        context: FailureContext,
    ) -> Self {
        Self { kind, http_status, retryable, retry_after_secs: None, message: message.into(), context }
    }

    pub(crate) fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// Non-retryable `Unknown` used when something inside the pipeline itself broke.
    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        let context = FailureContext { reason: Some(reason.into()), ..FailureContext::default() };
        Self::new(ErrorKind::Unknown, 500, false, "An unexpected internal error occurred", context)
    }

    /// Failure kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Upstream status (0 when no response was received).
    pub fn http_status(&self) -> u16 {
        self.http_status
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Seconds the upstream asked us to wait, for `RateLimited`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_secs
    }

    /// Human-readable, credential-free message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Diagnostics captured at classification time.
    pub fn context(&self) -> &FailureContext {
        &self.context
    }

    /// Offending fields of a `Validation` failure; empty otherwise.
    pub fn field_errors(&self) -> &[FieldError] {
        match &self.kind {
            ErrorKind::Validation(fields) => fields,
            _ => &[],
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {}): {}", self.kind.code(), self.http_status, self.message)
    }
}

/// Configurable classifier. Only the `Retry-After` fallback is tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    default_retry_after_secs: u64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self { default_retry_after_secs: DEFAULT_RETRY_AFTER_SECS }
    }
}

impl Classifier {
    /// Classifier with a custom `Retry-After` fallback.
    pub fn new(default_retry_after_secs: u64) -> Self {
        Self { default_retry_after_secs }
    }

    /// Fallback wait for `429`s without a usable header.
    pub fn default_retry_after_secs(&self) -> u64 {
        self.default_retry_after_secs
    }

    /// Classify one failure.
    pub fn classify(&self, failure: &UpstreamFailure) -> ErrorClassification {
        match failure {
            UpstreamFailure::Transport { reason } => classify_transport(reason),
            UpstreamFailure::Response { status, headers, body } => {
                self.classify_response(*status, headers, body)
            }
        }
    }

    fn classify_response(&self, status: u16, headers: &HeaderMap, body: &str) -> ErrorClassification {
        let mut context = FailureContext::from_response(headers, body);
        match status {
            429 => {
                let retry_after =
                    parse_retry_after(headers).unwrap_or(self.default_retry_after_secs);
                context.quota = Some(QuotaEcho {
                    limit: header_u64(headers, "x-ratelimit-limit"),
                    remaining: header_u64(headers, "x-ratelimit-remaining"),
                    reset: header_u64(headers, "x-ratelimit-reset"),
                });
                ErrorClassification::new(
                    ErrorKind::RateLimited,
                    status,
                    true,
                    format!("The upstream API is rate limiting requests; retry in {retry_after} seconds"),
                    context,
                )
                .with_retry_after(retry_after)
            }
            401 => ErrorClassification::new(
                ErrorKind::Unauthorized,
                status,
                false,
                "The upstream API rejected the configured credentials",
                context,
            ),
            403 if names_missing_permissions(body) => ErrorClassification::new(
                ErrorKind::MissingPermissions,
                status,
                false,
                "The upstream API token is missing required permissions",
                context,
            ),
            403 => ErrorClassification::new(
                ErrorKind::Forbidden,
                status,
                false,
                "The upstream API refused access to this resource",
                context,
            ),
            404 => ErrorClassification::new(
                ErrorKind::NotFound,
                status,
                false,
                "The requested upstream resource was not found",
                context,
            ),
            400 => match parse_field_errors(body) {
                Some(fields) => {
                    let message = format!("The upstream API rejected {} field(s)", fields.len());
                    ErrorClassification::new(ErrorKind::Validation(fields), status, false, message, context)
                }
                None => unknown(status, context),
            },
            s if s >= 500 => ErrorClassification::new(
                ErrorKind::ServerError,
                status,
                true,
                format!("The upstream API failed with status {s}"),
                context,
            ),
            _ => unknown(status, context),
        }
    }
}

/// Classify with the default configuration.
pub fn classify(failure: &UpstreamFailure) -> ErrorClassification {
    Classifier::default().classify(failure)
}

fn unknown(status: u16, context: FailureContext) -> ErrorClassification {
    ErrorClassification::new(
        ErrorKind::Unknown,
        status,
        false,
        format!("The upstream API returned an unexpected status {status}"),
        context,
    )
}

fn classify_transport(reason: &str) -> ErrorClassification {
    let lowered = reason.to_ascii_lowercase();
    let message = if lowered.contains("timeout") || lowered.contains("timed out") {
        "The upstream API did not respond in time"
    } else if lowered.contains("abort") {
        "The upstream request was aborted"
    } else if lowered.contains("fetch") || lowered.contains("connect") || lowered.contains("dns") {
        "Could not reach the upstream API"
    } else {
        "A network error occurred while contacting the upstream API"
    };
    let context = FailureContext { reason: Some(reason.to_string()), ..FailureContext::default() };
    ErrorClassification::new(ErrorKind::NetworkError, 0, true, message, context)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }
    let secs = raw.parse::<f64>().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| secs.ceil() as u64)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn names_missing_permissions(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    MISSING_PERMISSION_SIGNATURES.iter().any(|signature| lowered.contains(signature))
}

/// Extract field errors from a `400` body. `None` when the body carries no structured entries.
fn parse_field_errors(body: &str) -> Option<Vec<FieldError>> {
    let value: Value = serde_json::from_str(body).ok()?;
    let fields = match &value {
        Value::Array(items) => items.iter().filter_map(entry_from_object).collect(),
        Value::Object(map) => {
            let container = FIELD_ERROR_CONTAINERS.iter().find_map(|key| map.get(*key));
            match container {
                Some(Value::Array(items)) => items.iter().filter_map(entry_from_object).collect(),
                Some(Value::Object(fields)) => from_field_map(fields),
                Some(_) => Vec::new(),
                None if map.keys().any(|k| ENVELOPE_KEYS.contains(&k.as_str())) => Vec::new(),
                None => from_field_map(map),
            }
        }
        _ => Vec::new(),
    };
    (!fields.is_empty()).then_some(fields)
}

/// `{"email": "invalid"}`, `{"tags": ["too long", "duplicate"]}` or `{"slug": {"message": ..}}`.
fn from_field_map(map: &Map<String, Value>) -> Vec<FieldError> {
    let mut fields = Vec::new();
    for (field, value) in map {
        match value {
            Value::String(message) => fields.push(FieldError::new(field, message)),
            Value::Array(messages) => fields.extend(
                messages.iter().filter_map(Value::as_str).map(|m| FieldError::new(field, m)),
            ),
            Value::Object(detail) => {
                if let Some(message) = first_string(detail, &["message", "description", "msg"]) {
                    fields.push(FieldError {
                        field: field.clone(),
                        message,
                        value: detail.get("value").and_then(value_to_string),
                    });
                }
            }
            _ => {}
        }
    }
    fields
}

/// `{"param": "fieldData.slug", "description": "..."}` and its common spellings.
fn entry_from_object(item: &Value) -> Option<FieldError> {
    let entry = item.as_object()?;
    let field = match entry.get("path") {
        Some(Value::Array(parts)) => {
            let parts: Vec<String> = parts.iter().filter_map(value_to_string).collect();
            Some(parts.join("."))
        }
        _ => first_string(entry, &["param", "field", "path", "name"]),
    }?;
    let message = first_string(entry, &["description", "message", "msg", "error"])?;
    Some(FieldError { field, message, value: entry.get("value").and_then(value_to_string) })
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| map.get(*key).and_then(Value::as_str)).map(str::to_string)
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
