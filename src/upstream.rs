//! reqwest adapter for the content-management API.
//!
//! Converts everything that is not a 2xx into an [`UpstreamFailure`] so the classifier sees the
//! raw status, headers and body.

use reqwest::Client;
use serde_json::Value;

use crate::classify::UpstreamFailure;

/// Thin client for the CMS item endpoints.
#[derive(Debug, Clone)]
pub struct CmsClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl CmsClient {
    /// Client for `base_url`, authenticating with `token` when present.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    /// Reuse an existing reqwest client (connection pool, proxies, TLS settings).
    pub fn with_client(http: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url, token }
    }

    /// API root.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create an item in `collection`. Returns the upstream JSON (or `Null` for an empty body).
    pub async fn publish(&self, collection: &str, payload: &Value) -> Result<Value, UpstreamFailure> {
        let url = format!("{}/collections/{}/items", self.base_url, collection);
        let mut request = self.http.post(url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_failure)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamFailure::response(status.as_u16(), headers, body));
        }

        let text = response.text().await.map_err(transport_failure)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Map a reqwest error (no usable response) to a transport failure.
pub fn transport_failure(err: reqwest::Error) -> UpstreamFailure {
    let reason = if err.is_timeout() {
        format!("timeout: {err}")
    } else if err.is_connect() {
        format!("fetch failed: {err}")
    } else {
        format!("network error: {err}")
    };
    UpstreamFailure::transport(reason)
}
