//! Caller identity used as the rate-limit key.
//!
//! Resolution order, first match wins:
//! 1. first entry of `X-Forwarded-For`
//! 2. `X-Real-IP`
//! 3. the direct connection address (axum `ConnectInfo<SocketAddr>`)
//! 4. `anon:<user-agent>|<accept-language>`, truncated
//!
//! Recomputed for every request; nothing is cached.

use std::fmt;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use http::header::{ACCEPT_LANGUAGE, USER_AGENT};
use http::{HeaderMap, Request};

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const MAX_FALLBACK_LEN: usize = 128;

/// String key identifying one caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Resolve from request headers and, when known, the peer address.
    pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        if let Some(ip) = header_str(headers, FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
        {
            return Self(ip.to_string());
        }
        if let Some(ip) = header_str(headers, REAL_IP).map(str::trim).filter(|ip| !ip.is_empty()) {
            return Self(ip.to_string());
        }
        if let Some(addr) = peer {
            return Self(addr.ip().to_string());
        }

        let agent = header_str(headers, USER_AGENT.as_str()).unwrap_or("unknown");
        let language = header_str(headers, ACCEPT_LANGUAGE.as_str()).unwrap_or("unknown");
        let composite: String = format!("anon:{agent}|{language}").chars().take(MAX_FALLBACK_LEN).collect();
        Self(composite)
    }

    /// Resolve from a request, reading the peer address from its `ConnectInfo` extension.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let peer = request.extensions().get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| *addr);
        Self::resolve(request.headers(), peer)
    }

    /// The key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}
