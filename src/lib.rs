#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Article Relay
//!
//! Resilience core for an HTTP service that publishes articles into a third-party content
//! management API.
//!
//! ## Features
//!
//! - **Admission control** per client with fixed-window and sliding-window policies
//! - **Error classification** of upstream failures into a small retry-relevant taxonomy
//! - **Circuit breaker** per upstream dependency with half-open recovery
//! - **Retry policy** with per-kind budgets, `Retry-After` honoring and exponential backoff
//! - **Upstream controller** combining all of the above for one logical call
//! - **Lock-free breaker** and sharded rate-limit state
//!
//! ## Quick Start
//!
//! ```rust
//! use article_relay::{classify, Backoff, CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use article_relay::{RetryPolicy, UpstreamFailure};
//! use http::HeaderMap;
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "cms",
//!     CircuitBreakerConfig::new(5, 2, Duration::from_secs(30), 1).unwrap(),
//! );
//! assert_eq!(breaker.state(), CircuitState::Closed);
//!
//! let failure = UpstreamFailure::response(503, HeaderMap::new(), "");
//! let classification = classify(&failure);
//! let decision = RetryPolicy::default().decide(&classification, 1);
//! assert!(decision.should_retry);
//! assert_eq!(decision.delay, Duration::from_secs(5));
//! # let _ = Backoff::constant(Duration::from_secs(1));
//! ```

pub mod adaptive;
pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod classify;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod invoker;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod response;
pub mod retry;
pub mod telemetry;
pub mod time;
pub mod upstream;

// Re-exports
pub use adaptive::DynamicConfig;
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use circuit_breaker::{
    BreakerPermit, BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitState,
};
pub use circuit_breaker_registry::{BreakerRegistry, RegistryError};
pub use classify::{
    classify, Classifier, ErrorClassification, ErrorKind, FailureContext, FieldError, QuotaEcho,
    UpstreamFailure,
};
pub use config::{ConfigError, RelayConfig};
pub use error::RelayError;
pub use health::HealthReport;
pub use identity::ClientIdentity;
pub use invoker::UpstreamController;
pub use jitter::Jitter;
pub use rate_limit::{
    Admission, AdmissionController, Algorithm, Decision, PolicySet, RateLimitLayer,
    RateLimitPolicy, RateLimitRejection,
};
pub use retry::{BuildError, RetryDecision, RetryPolicy, RetryPolicyBuilder};
pub use time::{Clock, InstantSleeper, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use upstream::CmsClient;
