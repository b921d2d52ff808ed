//! Structured policy telemetry.
//!
//! Admission, retry and breaker decisions emit [`PolicyEvent`]s into a sink. Sinks are
//! `tower::Service<PolicyEvent>` so they compose with the usual tower combinators; emission is
//! best-effort and never fails the request that produced the event.
//!
//! - **Admission**: `Allowed`, `Denied`
//! - **Retry**: `Attempt`, `Exhausted`
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`
//! - **Request**: `Success`, `Failure`
//!
//! ```rust
//! use article_relay::telemetry::{PolicyEvent, RetryEvent};
//! use std::time::Duration;
//!
//! let event = PolicyEvent::Retry(RetryEvent::Attempt {
//!     attempt: 1,
//!     delay: Duration::from_secs(5),
//!     kind: "ServerError",
//! });
//! assert_eq!(event.to_string(), "Retry::Attempt(#1, delay=5s, kind=ServerError)");
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tower::Service;

/// A telemetry sink that consumes policy events.
pub trait TelemetrySink:
    Service<PolicyEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Policy events emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    /// Rate-limit admission decisions
    Admission(AdmissionEvent),
    /// Retry decisions
    Retry(RetryEvent),
    /// Circuit breaker transitions
    CircuitBreaker(CircuitBreakerEvent),
    /// Outcome of one relayed upstream call
    Request(RequestOutcome),
}

/// Events emitted by the admission controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// Every applicable policy admitted the request.
    Allowed {
        /// Binding policy
        policy: String,
        /// Units left under the binding policy
        remaining: u64,
    },
    /// A policy rejected the request.
    Denied {
        /// Denying policy
        policy: String,
        /// Seconds until capacity returns
        retry_after_secs: u64,
    },
}

/// Events emitted by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to be made after `delay`.
    Attempt {
        /// The attempt that just failed (1-indexed)
        attempt: u32,
        /// Wait before the next attempt
        delay: Duration,
        /// Error kind that triggered the retry
        kind: &'static str,
    },
    /// The retry budget ran out and the call still fails.
    Exhausted {
        /// Total number of attempts made
        total_attempts: u32,
        /// Time spent across all attempts and waits
        total_duration: Duration,
    },
}

/// Events emitted on circuit breaker transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit opened; calls fail fast until the cooldown elapses.
    Opened {
        /// Protected dependency
        dependency: String,
        /// Consecutive failures that tripped the breaker
        failure_count: u32,
    },
    /// Cooldown elapsed; trial calls are admitted.
    HalfOpen {
        /// Protected dependency
        dependency: String,
    },
    /// Trials succeeded; normal operation resumes.
    Closed {
        /// Protected dependency
        dependency: String,
    },
}

/// Outcome of a relayed call after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Call completed successfully.
    Success {
        /// Time taken including retries
        duration: Duration,
    },
    /// Call failed.
    Failure {
        /// Time taken before giving up
        duration: Duration,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Admission(event) => write!(f, "Admission::{}", event),
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Allowed { policy, remaining } => {
                write!(f, "Allowed({}, remaining={})", policy, remaining)
            }
            AdmissionEvent::Denied { policy, retry_after_secs } => {
                write!(f, "Denied({}, retry_after={}s)", policy, retry_after_secs)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay, kind } => {
                write!(f, "Attempt(#{}, delay={:?}, kind={})", attempt, delay, kind)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { dependency, failure_count } => {
                write!(f, "Opened({}, failures={})", dependency, failure_count)
            }
            CircuitBreakerEvent::HalfOpen { dependency } => write!(f, "HalfOpen({})", dependency),
            CircuitBreakerEvent::Closed { dependency } => write!(f, "Closed({})", dependency),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success({:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure({:?})", duration),
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Logs every event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(event = %event, "policy_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps events in memory, evicting the oldest past its capacity. Useful in tests.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Bounded sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no events are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
