//! Convenient re-exports for common relay types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    classify::{classify, ErrorClassification, ErrorKind, UpstreamFailure},
    error::RelayError,
    invoker::UpstreamController,
    jitter::Jitter,
    rate_limit::{AdmissionController, PolicySet, RateLimitLayer, RateLimitPolicy},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    telemetry::{LogSink, MemorySink, NullSink, PolicyEvent},
};
