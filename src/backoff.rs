//! Backoff strategies for retry schedules.
//!
//! Attempt semantics: `delay(n)` is the wait after the `n`-th failed attempt (1-indexed), so the
//! first retry waits `delay(1)`. `delay(0)` is always zero. Exponential delays follow
//! `base * multiplier^(n-1)` and saturate at [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use article_relay::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_secs(5), 2.0).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_secs(5));
//! assert_eq!(backoff.delay(2), Duration::from_secs(10));
//!
//! let gentle = Backoff::exponential(Duration::from_millis(1000), 1.5)
//!     .unwrap()
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(gentle.delay(2), Duration::from_millis(1500));
//! assert_eq!(gentle.delay(5), Duration::from_secs(2));
//! ```

use std::time::Duration;

/// Upper bound applied when a calculation would overflow (1 hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    /// Multiplier must be finite and at least 1.0.
    #[error("backoff multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    /// `with_max` is meaningless for a constant delay.
    #[error("with_max is only valid for exponential backoff")]
    ConstantDoesNotSupportMax,
    /// Max must be positive.
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    /// Max below the base delay.
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase {
        /// Configured base delay.
        base: Duration,
        /// Rejected maximum.
        max: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum BackoffKind {
    Constant { delay: Duration },
    Exponential { base: Duration, multiplier: f64, max: Option<Duration> },
}

/// Delay schedule used between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// `base * multiplier^(n-1)`; the multiplier must be finite and `>= 1.0`.
    pub fn exponential(base: Duration, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        Ok(Self { kind: BackoffKind::Exponential { base, multiplier, max: None } })
    }

    /// Cap an exponential schedule.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Exponential { base, max: existing, .. } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Constant { .. } => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Growth factor between consecutive delays (1.0 for constant schedules).
    pub fn multiplier(&self) -> f64 {
        match self.kind {
            BackoffKind::Constant { .. } => 1.0,
            BackoffKind::Exponential { multiplier, .. } => multiplier,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.kind {
            BackoffKind::Constant { delay } => delay.min(MAX_BACKOFF),
            BackoffKind::Exponential { base, multiplier, max } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let millis = base.as_millis() as f64 * multiplier.powi(exponent);
                let ceiling = max.unwrap_or(MAX_BACKOFF).min(MAX_BACKOFF);
                if !millis.is_finite() || millis >= ceiling.as_millis() as f64 {
                    return ceiling;
                }
                Duration::from_millis(millis.round() as u64)
            }
        }
    }
}
