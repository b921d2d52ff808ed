//! Upstream invoker: classify → breaker → retry → sleep.
//!
//! [`UpstreamController::call`] runs one logical upstream call. Every attempt asks the
//! dependency's breaker for a permit, runs under the optional per-attempt timeout, and reports
//! its outcome: only `ServerError`/`NetworkError` count as breaker failures, every other answer
//! proves the dependency is alive. The retry policy then decides whether to wait and go again.
//!
//! Dropping the returned future abandons the call. A pending wait is simply cancelled, and an
//! attempt in flight releases its half-open trial slot without recording an outcome.
//! [`UpstreamController::call_within`] does the same when a deadline passes and reports it as
//! [`RelayError::Cancelled`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tower::Service;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::classify::{Classifier, ErrorClassification, UpstreamFailure};
use crate::error::RelayError;
use crate::retry::RetryPolicy;
use crate::telemetry::{
    emit_best_effort, CircuitBreakerEvent, NullSink, PolicyEvent, RequestOutcome, RetryEvent,
};
use crate::time::{Clock, Sleeper, SystemClock, TokioSleeper};

/// Resilient caller for one upstream dependency.
#[derive(Debug, Clone)]
pub struct UpstreamController<K = NullSink> {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    classifier: Classifier,
    attempt_timeout: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink: K,
}

impl UpstreamController {
    /// Controller using the tokio timer and the system clock.
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self {
            breaker,
            retry,
            classifier: Classifier::default(),
            attempt_timeout: None,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl<K> UpstreamController<K> {
    /// Override the classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Fail an attempt that takes longer than `timeout` as a `NetworkError`.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Override how waits between attempts are performed.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Override the clock used for call durations.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Emit retry, breaker and outcome events into `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> UpstreamController<K2> {
        UpstreamController {
            breaker: self.breaker,
            retry: self.retry,
            classifier: self.classifier,
            attempt_timeout: self.attempt_timeout,
            sleeper: self.sleeper,
            clock: self.clock,
            sink,
        }
    }

    /// The dependency's breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Active retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

enum Attempt<T> {
    Succeeded(T),
    Failed(UpstreamFailure),
    Panicked(String),
}

impl<K> UpstreamController<K>
where
    K: Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    K::Error: std::error::Error + Send + 'static,
    K::Future: Send + 'static,
{
    /// Run `op` under breaker and retry protection. `op` receives the 1-indexed attempt number.
    ///
    /// # Errors
    /// - [`RelayError::BreakerOpen`] when the breaker short-circuits an attempt
    /// - [`RelayError::RetryExhausted`] when a retryable failure outlives its budget
    /// - [`RelayError::Upstream`] for failures that are not retried
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let started = self.clock.now_millis();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(rejection) => {
                    tracing::warn!(
                        dependency = %rejection.dependency,
                        state = %rejection.state,
                        retry_in_ms = rejection.retry_in.as_millis() as u64,
                        "Upstream call short-circuited"
                    );
                    self.finish(started, false).await;
                    return Err(RelayError::BreakerOpen {
                        dependency: rejection.dependency.to_string(),
                        failures: rejection.failures,
                        retry_in: rejection.retry_in,
                    });
                }
            };

            let failure = match self.run_attempt(op(attempt)).await {
                Attempt::Succeeded(value) => {
                    let transition = permit.record_success();
                    self.report_transition(transition).await;
                    self.finish(started, true).await;
                    return Ok(value);
                }
                Attempt::Failed(failure) => failure,
                Attempt::Panicked(reason) => {
                    drop(permit);
                    tracing::error!(dependency = %self.breaker.name(), %reason, "Upstream attempt panicked");
                    self.finish(started, false).await;
                    return Err(RelayError::Upstream(ErrorClassification::internal(reason)));
                }
            };

            let classification = self.classify(&failure);
            let transition = if classification.kind().trips_breaker() {
                permit.record_failure()
            } else {
                permit.record_success()
            };
            self.report_transition(transition).await;

            let decision = self.retry.decide(&classification, attempt);
            if !decision.should_retry {
                if decision.exhausted {
                    tracing::warn!(
                        dependency = %self.breaker.name(),
                        attempts = attempt,
                        kind = classification.kind().code(),
                        "Retry budget exhausted"
                    );
                    let total_duration =
                        Duration::from_millis(self.clock.now_millis().saturating_sub(started));
                    self.emit(PolicyEvent::Retry(RetryEvent::Exhausted { total_attempts: attempt, total_duration }))
                        .await;
                    self.finish(started, false).await;
                    return Err(RelayError::RetryExhausted { attempts: attempt, last: classification });
                }
                self.finish(started, false).await;
                return Err(RelayError::Upstream(classification));
            }

            tracing::warn!(
                dependency = %self.breaker.name(),
                attempt,
                max_attempts = decision.max_attempts,
                delay_ms = decision.delay.as_millis() as u64,
                kind = classification.kind().code(),
                "Retrying upstream call"
            );
            self.emit(PolicyEvent::Retry(RetryEvent::Attempt {
                attempt,
                delay: decision.delay,
                kind: classification.kind().code(),
            }))
            .await;
            self.sleeper.sleep(decision.delay).await;
        }
    }

    /// [`call`](Self::call) bounded by `deadline`, retries and waits included.
    ///
    /// # Errors
    /// [`RelayError::Cancelled`] when the deadline passes first, plus everything `call` returns.
    pub async fn call_within<T, F, Fut>(&self, deadline: Duration, op: F) -> Result<T, RelayError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let started = self.clock.now_millis();
        match tokio::time::timeout(deadline, self.call(op)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    dependency = %self.breaker.name(),
                    deadline_ms = deadline.as_millis() as u64,
                    "Upstream call abandoned at deadline"
                );
                self.finish(started, false).await;
                Err(RelayError::Cancelled)
            }
        }
    }

    async fn run_attempt<T, Fut>(&self, fut: Fut) -> Attempt<T>
    where
        Fut: Future<Output = Result<T, UpstreamFailure>>,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Attempt::Failed(UpstreamFailure::transport(format!(
                        "timeout: no response within {limit:?}"
                    )))
                }
            },
            None => guarded.await,
        };
        match outcome {
            Ok(Ok(value)) => Attempt::Succeeded(value),
            Ok(Err(failure)) => Attempt::Failed(failure),
            Err(payload) => Attempt::Panicked(panic_message(payload.as_ref())),
        }
    }

    fn classify(&self, failure: &UpstreamFailure) -> ErrorClassification {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.classifier.classify(failure)))
            .unwrap_or_else(|payload| ErrorClassification::internal(panic_message(payload.as_ref())))
    }

    async fn report_transition(&self, transition: Option<CircuitState>) {
        let dependency = self.breaker.name().to_string();
        let event = match transition {
            Some(CircuitState::Open) => CircuitBreakerEvent::Opened {
                dependency,
                failure_count: self.breaker.snapshot().consecutive_failures,
            },
            Some(CircuitState::Closed) => CircuitBreakerEvent::Closed { dependency },
            Some(CircuitState::HalfOpen) => CircuitBreakerEvent::HalfOpen { dependency },
            None => return,
        };
        self.emit(PolicyEvent::CircuitBreaker(event)).await;
    }

    async fn finish(&self, started: u64, succeeded: bool) {
        let duration = Duration::from_millis(self.clock.now_millis().saturating_sub(started));
        let outcome = if succeeded {
            RequestOutcome::Success { duration }
        } else {
            RequestOutcome::Failure { duration }
        };
        self.emit(PolicyEvent::Request(outcome)).await;
    }

    async fn emit(&self, event: PolicyEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
