//! Retry decisions per error kind.
//!
//! Semantics:
//! - `attempt` is 1-indexed and counts the attempt that just failed; `max_attempts` counts total
//!   attempts (initial try + retries).
//! - `RateLimited` waits exactly the upstream `Retry-After`, never jittered. A wait longer than
//!   `max_retry_after` is surfaced instead of slept on.
//! - `ServerError` and `NetworkError` wait `base * multiplier^(n-1)`, optionally jittered.
//! - Every other kind, and every non-retryable classification, is surfaced immediately.
//!
//! ```rust
//! use article_relay::{classify, RetryPolicy, UpstreamFailure};
//! use http::HeaderMap;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! let unavailable = classify(&UpstreamFailure::response(503, HeaderMap::new(), ""));
//!
//! let first = policy.decide(&unavailable, 1);
//! assert!(first.should_retry);
//! assert_eq!(first.delay, Duration::from_secs(5));
//! assert_eq!(policy.decide(&unavailable, 2).delay, Duration::from_secs(10));
//! assert!(policy.decide(&unavailable, 3).exhausted);
//! ```

use std::time::Duration;

use crate::classify::{ErrorClassification, ErrorKind};
use crate::{Backoff, Jitter};

/// Outcome of consulting the retry policy after a failed attempt. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    /// Whether another attempt should be made.
    pub should_retry: bool,
    /// Wait before the next attempt (zero when not retrying).
    pub delay: Duration,
    /// Attempts made so far, including the one that just failed.
    pub attempts_so_far: u32,
    /// Budget for this error kind.
    pub max_attempts: u32,
    /// Growth factor of this kind's backoff.
    pub backoff_multiplier: f64,
    /// The failure was retryable but the budget ran out.
    pub exhausted: bool,
}

/// Budget and schedule for one retryable kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindBudget {
    max_attempts: u32,
    backoff: Backoff,
}

impl KindBudget {
    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay schedule.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A budget must allow at least the initial attempt.
    #[error("{kind} max_attempts must be > 0 (got {provided})")]
    InvalidMaxAttempts {
        /// Error kind the budget applies to.
        kind: &'static str,
        /// Value provided by caller.
        provided: u32,
    },
    /// The longest acceptable upstream wait must be positive.
    #[error("max_retry_after must be > 0")]
    InvalidMaxRetryAfter,
}

/// Per-kind retry policy.
///
/// `RateLimited` failures are retried after exactly the upstream `Retry-After`, with one
/// exception: a wait longer than [`max_retry_after`](Self::max_retry_after) (60s unless set
/// through the builder or `retry.max_retry_after_ms`) is not slept on. The 429 is surfaced with
/// its `retry_after_secs` so the caller decides when to come back. Raise the cap to restore
/// unconditional waiting.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    rate_limited_attempts: u32,
    server_error: KindBudget,
    network_error: KindBudget,
    max_retry_after: Duration,
    jitter: Jitter,
}

impl Default for RetryPolicy {
    /// `RateLimited`: 3 attempts. `ServerError`: 3 attempts from 5s doubling. `NetworkError`:
    /// 2 attempts from 2s growing by 1.5. Upstream waits above 60s are not retried.
    fn default() -> Self {
        Self {
            rate_limited_attempts: 3,
            server_error: KindBudget {
                max_attempts: 3,
                backoff: exponential(Duration::from_secs(5), 2.0),
            },
            network_error: KindBudget {
                max_attempts: 2,
                backoff: exponential(Duration::from_secs(2), 1.5),
            },
            max_retry_after: Duration::from_secs(60),
            jitter: Jitter::None,
        }
    }
}

// Only called with literal multipliers >= 1.0.
fn exponential(base: Duration, multiplier: f64) -> Backoff {
    Backoff::exponential(base, multiplier).unwrap_or_else(|_| Backoff::constant(base))
}

impl RetryPolicy {
    /// Builder starting from the defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Total attempts allowed for `kind` (1 for kinds that are never retried).
    pub fn max_attempts_for(&self, kind: &ErrorKind) -> u32 {
        match kind {
            ErrorKind::RateLimited => self.rate_limited_attempts,
            ErrorKind::ServerError => self.server_error.max_attempts,
            ErrorKind::NetworkError => self.network_error.max_attempts,
            _ => 1,
        }
    }

    /// `ServerError` budget.
    pub fn server_error(&self) -> &KindBudget {
        &self.server_error
    }

    /// `NetworkError` budget.
    pub fn network_error(&self) -> &KindBudget {
        &self.network_error
    }

    /// Longest upstream `Retry-After` the policy will sleep on. Longer waits give up without
    /// counting as exhaustion.
    pub fn max_retry_after(&self) -> Duration {
        self.max_retry_after
    }

    /// Jitter applied to computed backoff delays.
    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Decide what to do after failed attempt `attempt` (1-indexed).
    pub fn decide(&self, failure: &ErrorClassification, attempt: u32) -> RetryDecision {
        let kind = failure.kind();
        let max_attempts = self.max_attempts_for(kind);
        let backoff_multiplier = match kind {
            ErrorKind::ServerError => self.server_error.backoff.multiplier(),
            ErrorKind::NetworkError => self.network_error.backoff.multiplier(),
            _ => 1.0,
        };
        let give_up = |exhausted: bool| RetryDecision {
            should_retry: false,
            delay: Duration::ZERO,
            attempts_so_far: attempt,
            max_attempts,
            backoff_multiplier,
            exhausted,
        };

        let retried_kind =
            matches!(kind, ErrorKind::RateLimited | ErrorKind::ServerError | ErrorKind::NetworkError);
        if !failure.is_retryable() || !retried_kind {
            return give_up(false);
        }
        if attempt >= max_attempts {
            return give_up(true);
        }

        let delay = match kind {
            ErrorKind::RateLimited => {
                let wait = Duration::from_secs(failure.retry_after_secs().unwrap_or_default());
                if wait > self.max_retry_after {
                    return give_up(false);
                }
                wait
            }
            ErrorKind::ServerError => self.jitter.apply(self.server_error.backoff.delay(attempt)),
            ErrorKind::NetworkError => self.jitter.apply(self.network_error.backoff.delay(attempt)),
            _ => return give_up(false),
        };

        RetryDecision {
            should_retry: true,
            delay,
            attempts_so_far: attempt,
            max_attempts,
            backoff_multiplier,
            exhausted: false,
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Total attempts for upstream throttling.
    pub fn rate_limited_attempts(mut self, attempts: u32) -> Self {
        self.policy.rate_limited_attempts = attempts;
        self
    }

    /// Total attempts and schedule for upstream 5xx.
    pub fn server_error(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.policy.server_error = KindBudget { max_attempts, backoff };
        self
    }

    /// Total attempts and schedule for transport failures.
    pub fn network_error(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.policy.network_error = KindBudget { max_attempts, backoff };
        self
    }

    /// Longest upstream `Retry-After` to sleep on.
    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.policy.max_retry_after = max;
        self
    }

    /// Jitter for computed backoff delays.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, BuildError> {
        let p = &self.policy;
        for (kind, provided) in [
            ("RateLimited", p.rate_limited_attempts),
            ("ServerError", p.server_error.max_attempts),
            ("NetworkError", p.network_error.max_attempts),
        ] {
            if provided == 0 {
                return Err(BuildError::InvalidMaxAttempts { kind, provided });
            }
        }
        if p.max_retry_after.is_zero() {
            return Err(BuildError::InvalidMaxRetryAfter);
        }
        Ok(self.policy)
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, UpstreamFailure};
    use http::{HeaderMap, HeaderValue};

    fn status(code: u16) -> ErrorClassification {
        classify(&UpstreamFailure::response(code, HeaderMap::new(), ""))
    }

    fn throttled(retry_after: &'static str) -> ErrorClassification {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static(retry_after));
        classify(&UpstreamFailure::response(429, headers, ""))
    }

    #[test]
    fn server_errors_back_off_exponentially_within_budget() {
        let policy = RetryPolicy::default();
        let failure = status(503);

        let first = policy.decide(&failure, 1);
        assert!(first.should_retry);
        assert_eq!(first.delay, Duration::from_millis(5_000));
        assert_eq!(first.max_attempts, 3);
        assert_eq!(first.backoff_multiplier, 2.0);

        assert_eq!(policy.decide(&failure, 2).delay, Duration::from_millis(10_000));

        let last = policy.decide(&failure, 3);
        assert!(!last.should_retry);
        assert!(last.exhausted);
        assert_eq!(last.attempts_so_far, 3);
    }

    #[test]
    fn network_errors_use_the_gentler_budget() {
        let policy = RetryPolicy::default();
        let failure = classify(&UpstreamFailure::transport("connection refused"));

        let first = policy.decide(&failure, 1);
        assert_eq!(first.delay, Duration::from_millis(2_000));
        assert_eq!(first.backoff_multiplier, 1.5);
        assert!(policy.decide(&failure, 2).exhausted);
    }

    #[test]
    fn rate_limited_waits_exactly_retry_after() {
        let policy = RetryPolicy::builder().with_jitter(Jitter::Full).build().unwrap();
        let failure = throttled("30");
        for attempt in 1..3 {
            let decision = policy.decide(&failure, attempt);
            assert!(decision.should_retry);
            assert_eq!(decision.delay, Duration::from_millis(30_000));
        }
        assert!(policy.decide(&failure, 3).exhausted);
    }

    #[test]
    fn waits_longer_than_the_cap_are_surfaced() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&throttled("120"), 1);
        assert!(!decision.should_retry);
        assert!(!decision.exhausted);

        let at_cap = policy.decide(&throttled("60"), 1);
        assert!(at_cap.should_retry);
        assert_eq!(at_cap.delay, Duration::from_secs(60));

        let patient = RetryPolicy::builder().max_retry_after(Duration::from_secs(300)).build().unwrap();
        let decision = patient.decide(&throttled("120"), 1);
        assert!(decision.should_retry);
        assert_eq!(decision.delay, Duration::from_secs(120));
    }

    #[test]
    fn non_retryable_kinds_are_never_retried() {
        let policy = RetryPolicy::default();
        for code in [400, 401, 403, 404, 409] {
            let decision = policy.decide(&status(code), 1);
            assert!(!decision.should_retry, "status {code}");
            assert!(!decision.exhausted);
            assert_eq!(decision.max_attempts, 1);
        }
    }

    #[test]
    fn jitter_only_shrinks_backoff_delays() {
        let policy = RetryPolicy::builder().with_jitter(Jitter::Full).build().unwrap();
        let failure = status(500);
        for _ in 0..50 {
            assert!(policy.decide(&failure, 2).delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn builder_validates_budgets() {
        assert_eq!(
            RetryPolicy::builder().rate_limited_attempts(0).build(),
            Err(BuildError::InvalidMaxAttempts { kind: "RateLimited", provided: 0 })
        );
        assert_eq!(
            RetryPolicy::builder().max_retry_after(Duration::ZERO).build(),
            Err(BuildError::InvalidMaxRetryAfter)
        );

        let backoff = Backoff::constant(Duration::from_millis(100));
        let policy = RetryPolicy::builder().server_error(5, backoff.clone()).build().unwrap();
        assert_eq!(policy.server_error().max_attempts(), 5);
        assert_eq!(policy.decide(&status(502), 4).delay, Duration::from_millis(100));
        assert!(policy.decide(&status(502), 5).exhausted);
    }
}
