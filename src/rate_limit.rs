//! Admission control (rate limiting).
//!
//! - [`RateLimitPolicy`]: immutable `{name, window, max_units, algorithm}`.
//! - [`Decision`]: the algorithm-agnostic result of one `check_and_consume`.
//! - [`strategies`]: fixed-window counter and sliding-window log behind one trait.
//! - [`store`]: sharded per-`(client, policy)` state with an idle sweep.
//! - [`controller`]: the [`AdmissionController`] evaluating several policies per request.
//! - [`middleware`]: tower layer that rejects with `429` or stamps quota headers.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub mod controller;
pub mod middleware;
pub mod store;
pub mod strategies;

pub use controller::{Admission, AdmissionController, PolicySet, RateLimitRejection};
pub use middleware::{RateLimitLayer, RateLimitService};

/// Largest supported window; idle state older than this is swept.
pub const MAX_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Counting algorithm used by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Counter reset on window rollover.
    #[default]
    Fixed,
    /// Weighted log over a moving window.
    Sliding,
}

/// Errors produced when constructing a policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// `max_units` must be > 0.
    #[error("policy '{name}': max_units must be > 0")]
    ZeroUnits {
        /// Policy name.
        name: String,
    },
    /// Window must be in `(0, MAX_WINDOW]`.
    #[error("policy '{name}': window must be between 1ms and {max:?} (got {window:?})")]
    InvalidWindow {
        /// Policy name.
        name: String,
        /// Rejected window.
        window: Duration,
        /// Largest supported window.
        max: Duration,
    },
}

/// Immutable rate-limit policy. Clones are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    name: Arc<str>,
    window: Duration,
    max_units: u64,
    algorithm: Algorithm,
}

impl RateLimitPolicy {
    /// Validated policy.
    pub fn new(
        name: impl Into<Arc<str>>,
        max_units: u64,
        window: Duration,
        algorithm: Algorithm,
    ) -> Result<Self, PolicyError> {
        let name = name.into();
        if max_units == 0 {
            return Err(PolicyError::ZeroUnits { name: name.to_string() });
        }
        if window.is_zero() || window > MAX_WINDOW || window.as_millis() == 0 {
            return Err(PolicyError::InvalidWindow {
                name: name.to_string(),
                window,
                max: MAX_WINDOW,
            });
        }
        Ok(Self { name, window, max_units, algorithm })
    }

    /// Fixed-window policy.
    pub fn fixed(name: impl Into<Arc<str>>, max_units: u64, window: Duration) -> Result<Self, PolicyError> {
        Self::new(name, max_units, window, Algorithm::Fixed)
    }

    /// Sliding-window policy.
    pub fn sliding(name: impl Into<Arc<str>>, max_units: u64, window: Duration) -> Result<Self, PolicyError> {
        Self::new(name, max_units, window, Algorithm::Sliding)
    }

    /// Policy name; part of the state key.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn window_millis(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    /// Units admitted per window.
    pub fn max_units(&self) -> u64 {
        self.max_units
    }

    /// Counting algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

/// Result of one `check_and_consume`, identical for both algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Policy that produced the decision.
    pub policy: Arc<str>,
    /// Configured `max_units`.
    pub limit: u64,
    /// Units left in the current window (0 when denied).
    pub remaining: u64,
    /// Epoch milliseconds at which capacity returns.
    pub reset_at: u64,
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// `ceil((reset_at - now) / 1000)`, at least one second for a denial.
    pub fn retry_after_secs(&self, now_millis: u64) -> u64 {
        let secs = self.reset_at.saturating_sub(now_millis).div_ceil(1000);
        if self.allowed {
            secs
        } else {
            secs.max(1)
        }
    }

    /// `X-RateLimit-Reset` value (epoch seconds, rounded up).
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }

    /// Whether `self` binds harder than `other`: denials beat admissions, then fewer remaining
    /// units, then the later reset.
    pub fn is_more_restrictive_than(&self, other: &Decision) -> bool {
        if self.allowed != other.allowed {
            return !self.allowed;
        }
        if self.allowed && self.remaining != other.remaining {
            return self.remaining < other.remaining;
        }
        self.reset_at > other.reset_at
    }
}
