//! Circuit breaker implementation with lock-free atomics.
//!
//! One [`CircuitBreaker`] guards one upstream dependency. Callers ask for a [`BreakerPermit`]
//! before each attempt and report the outcome through it:
//!
//! - **Closed**: every call is admitted; `failure_threshold` consecutive failures open the circuit.
//! - **Open**: calls are rejected until `cooldown` has elapsed since opening.
//! - **HalfOpen**: at most `half_open_max_calls` trial calls run concurrently. `success_threshold`
//!   trial successes close the circuit; any trial failure reopens it.
//!
//! Only permits issued as half-open trials drive half-open transitions. An outcome reported
//! through a permit from an earlier phase is ignored and touches no counter. A permit dropped
//! without an outcome (cancelled, panicked) frees its trial slot and records nothing.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::time::{Clock, SystemClock};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

const TRIAL_MASK: u64 = 0x00FF_FFFF;
const TRIAL_LIMIT: u32 = 0x00FF_FFFF;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// Trial mode allowing a bounded number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// Success threshold must be > 0.
    #[error("success_threshold must be > 0 (got {provided})")]
    InvalidSuccessThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// Cooldown must be > 0 unless the breaker is disabled.
    #[error("cooldown must be > 0 unless breaker is disabled (got {0:?})")]
    InvalidCooldown(Duration),
    /// Half-open trial limit must be > 0.
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit {
        /// Value provided by caller.
        provided: u32,
    },
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    /// 5 failures to open, 30s cooldown, 2 trial successes to close, one trial at a time.
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        cooldown: Duration,
        half_open_max_calls: u32,
    ) -> Result<Self, CircuitBreakerError> {
        let cfg = Self { failure_threshold, success_threshold, cooldown, half_open_max_calls };
        cfg.validate()?;
        Ok(cfg)
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: u32::MAX,
            success_threshold: 1,
            cooldown: Duration::MAX,
            half_open_max_calls: u32::MAX,
        }
    }

    fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 });
        }
        if self.half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        if self.cooldown.is_zero() && !self.is_disabled() {
            return Err(CircuitBreakerError::InvalidCooldown(self.cooldown));
        }
        Ok(())
    }

    fn is_disabled(&self) -> bool {
        self.failure_threshold == u32::MAX
    }

    /// Consecutive failures that open a closed circuit.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Trial successes that close a half-open circuit.
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Time spent Open before trial calls are admitted.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Maximum concurrent trial calls while Half-Open.
    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }

    fn cooldown_millis(&self) -> u64 {
        u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX)
    }
}

/// State, in-flight trials and epoch. Packed into one word so a transition publishes all three
/// at once: `epoch << 32 | trials << 8 | state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Phase {
    state: CircuitState,
    trials: u32,
    // Bumped on every transition so outcomes from an earlier phase can be told apart.
    epoch: u32,
}

impl Phase {
    const INITIAL: Phase = Phase { state: CircuitState::Closed, trials: 0, epoch: 0 };

    fn pack(self) -> u64 {
        u64::from(self.epoch) << 32
            | (u64::from(self.trials) & TRIAL_MASK) << 8
            | u64::from(self.state.to_u8())
    }

    fn unpack(raw: u64) -> Self {
        Self {
            state: CircuitState::from_u8((raw & 0xFF) as u8),
            trials: ((raw >> 8) & TRIAL_MASK) as u32,
            epoch: (raw >> 32) as u32,
        }
    }

    fn next(self, state: CircuitState) -> Self {
        Self { state, trials: 0, epoch: self.epoch.wrapping_add(1) }
    }

    fn is(self, state: CircuitState, epoch: u32) -> bool {
        self.state == state && self.epoch == epoch
    }
}

#[derive(Debug)]
struct BreakerState {
    phase: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    opened_at_millis: AtomicU64,
    last_failure_at: AtomicU64,
    last_state_change_at: AtomicU64,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
}

impl BreakerState {
    fn new(now: u64) -> Self {
        Self {
            phase: AtomicU64::new(Phase::INITIAL.pack()),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            last_failure_at: AtomicU64::new(0),
            last_state_change_at: AtomicU64::new(now),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }
}

/// Why a call was short-circuited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRejection {
    /// Protected dependency.
    pub dependency: Arc<str>,
    /// State at rejection time (`Open`, or `HalfOpen` with every trial slot taken).
    pub state: CircuitState,
    /// Consecutive failures recorded.
    pub failures: u32,
    /// Time until trial calls are admitted again; zero when waiting on in-flight trials.
    pub retry_in: Duration,
}

/// Point-in-time view of a breaker, for health reporting. Reads may be slightly stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Protected dependency.
    pub dependency: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures in the current phase.
    pub consecutive_failures: u32,
    /// Consecutive successes in the current phase.
    pub consecutive_successes: u32,
    /// Permits issued.
    pub total_calls: u64,
    /// Failures recorded.
    pub total_failures: u64,
    /// Calls short-circuited.
    pub rejected_calls: u64,
    /// Epoch ms of the last failure.
    pub last_failure_at: Option<u64>,
    /// Epoch ms of the last transition (or creation).
    pub last_state_change_at: u64,
}

/// Circuit breaker for one upstream dependency.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Breaker for `name` using the system clock.
    ///
    /// # Examples
    /// ```
    /// use article_relay::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    /// use std::time::Duration;
    ///
    /// let config = CircuitBreakerConfig::new(5, 2, Duration::from_secs(30), 1).unwrap();
    /// let breaker = CircuitBreaker::new("cms", config);
    /// assert_eq!(breaker.state(), CircuitState::Closed);
    /// ```
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(BreakerState::new(clock.now_millis()));
        Self { name: name.into(), state, config, clock }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.state.last_state_change_at.store(clock.now_millis(), Ordering::Release);
        self.clock = Arc::new(clock);
        self
    }

    /// Protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. An Open circuit past its cooldown is reported Open until a call arrives.
    pub fn state(&self) -> CircuitState {
        self.phase().state
    }

    /// Healthy iff Closed.
    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Ask to make one call.
    ///
    /// # Errors
    /// Returns a [`BreakerRejection`] while Open within the cooldown, or while Half-Open with
    /// every trial slot taken.
    pub fn try_acquire(&self) -> Result<BreakerPermit, BreakerRejection> {
        loop {
            let phase = self.phase();
            match phase.state {
                CircuitState::Closed => return Ok(self.permit(phase.epoch, false)),
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    let cooldown = self.config.cooldown_millis();

                    if elapsed < cooldown {
                        return Err(self.reject(
                            CircuitState::Open,
                            Duration::from_millis(cooldown - elapsed),
                        ));
                    }
                    if self.transition(CircuitState::Open, phase.epoch, CircuitState::HalfOpen, now) {
                        tracing::info!(dependency = %self.name, "Circuit breaker → half-open");
                    }
                }
                CircuitState::HalfOpen => {
                    let max = self.config.half_open_max_calls.min(TRIAL_LIMIT);
                    let taken = self.state.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                        let current = Phase::unpack(raw);
                        (current.state == CircuitState::HalfOpen && current.trials < max)
                            .then(|| Phase { trials: current.trials + 1, ..current }.pack())
                    });
                    match taken {
                        Ok(raw) => {
                            let taken = Phase::unpack(raw);
                            tracing::debug!(
                                dependency = %self.name,
                                in_flight = taken.trials + 1,
                                max,
                                "Circuit breaker: half-open trial"
                            );
                            return Ok(self.permit(taken.epoch, true));
                        }
                        Err(raw) if Phase::unpack(raw).state == CircuitState::HalfOpen => {
                            return Err(self.reject(CircuitState::HalfOpen, Duration::ZERO));
                        }
                        // Left half-open under us; look again.
                        Err(_) => {}
                    }
                }
            }
        }
    }

    /// Force the breaker back to Closed and clear its counters.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let _ = self.state.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            Some(Phase::unpack(raw).next(CircuitState::Closed).pack())
        });
        self.state.consecutive_failures.store(0, Ordering::Release);
        self.state.consecutive_successes.store(0, Ordering::Release);
        self.state.opened_at_millis.store(0, Ordering::Release);
        self.state.last_state_change_at.store(now, Ordering::Release);
        tracing::info!(dependency = %self.name, "Circuit breaker reset → closed");
    }

    /// Current counters and state.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = &self.state;
        let last_failure_at = s.last_failure_at.load(Ordering::Acquire);
        BreakerSnapshot {
            dependency: self.name.to_string(),
            state: self.state(),
            consecutive_failures: s.consecutive_failures.load(Ordering::Acquire),
            consecutive_successes: s.consecutive_successes.load(Ordering::Acquire),
            total_calls: s.total_calls.load(Ordering::Relaxed),
            total_failures: s.total_failures.load(Ordering::Relaxed),
            rejected_calls: s.rejected_calls.load(Ordering::Relaxed),
            last_failure_at: (last_failure_at > 0).then_some(last_failure_at),
            last_state_change_at: s.last_state_change_at.load(Ordering::Acquire),
        }
    }

    fn phase(&self) -> Phase {
        Phase::unpack(self.state.phase.load(Ordering::Acquire))
    }

    fn permit(&self, epoch: u32, trial: bool) -> BreakerPermit {
        self.state.total_calls.fetch_add(1, Ordering::Relaxed);
        BreakerPermit { breaker: self.clone(), trial, epoch }
    }

    fn reject(&self, state: CircuitState, retry_in: Duration) -> BreakerRejection {
        self.state.rejected_calls.fetch_add(1, Ordering::Relaxed);
        BreakerRejection {
            dependency: self.name.clone(),
            state,
            failures: self.state.consecutive_failures.load(Ordering::Acquire),
            retry_in,
        }
    }

    /// Move from `from` at `epoch` to `to`, bumping the epoch and clearing the trial count in the
    /// same store. Fails if another transition got there first.
    fn transition(&self, from: CircuitState, epoch: u32, to: CircuitState, now: u64) -> bool {
        if to == CircuitState::Open {
            // Readers that observe Open must see the new opening time.
            self.state.opened_at_millis.store(now, Ordering::Release);
        }
        let swapped = self
            .state
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let current = Phase::unpack(raw);
                current.is(from, epoch).then(|| current.next(to).pack())
            })
            .is_ok();
        if swapped {
            self.state.last_state_change_at.store(now, Ordering::Release);
        }
        swapped
    }

    // A permit issued while Closed is never a trial; one issued while Half-Open always is.
    fn issued_in(trial: bool) -> CircuitState {
        if trial {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    fn on_success(&self, trial: bool, epoch: u32) -> Option<CircuitState> {
        if !self.phase().is(Self::issued_in(trial), epoch) {
            return None;
        }
        if !trial {
            self.state.consecutive_failures.store(0, Ordering::Release);
            self.state.consecutive_successes.fetch_add(1, Ordering::AcqRel);
            return None;
        }

        let successes = self.state.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= self.config.success_threshold
            && self.transition(CircuitState::HalfOpen, epoch, CircuitState::Closed, self.clock.now_millis())
        {
            self.state.consecutive_failures.store(0, Ordering::Release);
            self.state.consecutive_successes.store(0, Ordering::Release);
            self.state.opened_at_millis.store(0, Ordering::Release);
            tracing::info!(dependency = %self.name, successes, "Circuit breaker → closed");
            return Some(CircuitState::Closed);
        }
        None
    }

    fn on_failure(&self, trial: bool, epoch: u32) -> Option<CircuitState> {
        if !self.phase().is(Self::issued_in(trial), epoch) {
            return None;
        }
        let now = self.clock.now_millis();
        self.state.total_failures.fetch_add(1, Ordering::Relaxed);
        self.state.last_failure_at.store(now, Ordering::Release);
        self.state.consecutive_successes.store(0, Ordering::Release);

        if trial {
            if self.transition(CircuitState::HalfOpen, epoch, CircuitState::Open, now) {
                let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::warn!(dependency = %self.name, failures, "Circuit breaker: trial failed → open");
                return Some(CircuitState::Open);
            }
            return None;
        }

        let failures = self.state.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold
            && self.transition(CircuitState::Closed, epoch, CircuitState::Open, now)
        {
            tracing::error!(
                dependency = %self.name,
                failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker → open"
            );
            return Some(CircuitState::Open);
        }
        None
    }

    fn release_trial(&self, epoch: u32) {
        let _ = self.state.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            let current = Phase::unpack(raw);
            (current.is(CircuitState::HalfOpen, epoch) && current.trials > 0)
                .then(|| Phase { trials: current.trials - 1, ..current }.pack())
        });
    }
}

/// Admission to make one call through a [`CircuitBreaker`].
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping the permit without reporting records
/// nothing and frees a half-open trial slot.
#[derive(Debug)]
#[must_use = "a permit records nothing unless its outcome is reported"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    trial: bool,
    epoch: u32,
}

impl BreakerPermit {
    /// Whether this permit is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The dependency answered correctly. Returns the new state if this caused a transition.
    pub fn record_success(self) -> Option<CircuitState> {
        self.breaker.on_success(self.trial, self.epoch)
    }

    /// The dependency is degraded. Returns the new state if this caused a transition.
    pub fn record_failure(self) -> Option<CircuitState> {
        self.breaker.on_failure(self.trial, self.epoch)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.release_trial(self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn breaker(failures: u32, successes: u32, half_open: u32) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new(1_000);
        let config = CircuitBreakerConfig::new(failures, successes, Duration::from_secs(30), half_open)
            .expect("valid config");
        (CircuitBreaker::new("cms", config).with_clock(clock.clone()), clock)
    }

    fn fail(breaker: &CircuitBreaker) -> Option<CircuitState> {
        breaker.try_acquire().expect("admitted").record_failure()
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            CircuitBreakerConfig::new(0, 1, Duration::from_secs(1), 1),
            Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 })
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 0, Duration::from_secs(1), 1),
            Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 })
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 1, Duration::ZERO, 1),
            Err(CircuitBreakerError::InvalidCooldown(Duration::ZERO))
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 1, Duration::from_secs(1), 0),
            Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 })
        );
    }

    #[test]
    fn opens_after_threshold_and_rejects_while_open() {
        let (breaker, clock) = breaker(5, 1, 1);
        for _ in 0..4 {
            assert_eq!(fail(&breaker), None);
        }
        assert_eq!(fail(&breaker), Some(CircuitState::Open));
        assert!(!breaker.is_healthy());

        clock.advance(Duration::from_secs(10));
        let rejection = breaker.try_acquire().expect_err("open circuit rejects");
        assert_eq!(rejection.state, CircuitState::Open);
        assert_eq!(rejection.failures, 5);
        assert_eq!(rejection.retry_in, Duration::from_secs(20));
        assert_eq!(&*rejection.dependency, "cms");
        assert_eq!(breaker.snapshot().rejected_calls, 1);
    }

    #[test]
    fn successes_in_closed_state_reset_failure_count() {
        let (breaker, _) = breaker(3, 1, 1);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.try_acquire().unwrap().record_success(), None);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 2);
    }

    #[test]
    fn one_trial_after_cooldown_then_closes_on_success_threshold() {
        let (breaker, clock) = breaker(1, 2, 1);
        fail(&breaker);
        clock.advance(Duration::from_secs(30));

        let trial = breaker.try_acquire().expect("trial admitted after cooldown");
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.try_acquire().expect_err("only one trial at a time");
        assert_eq!(second.state, CircuitState::HalfOpen);
        assert_eq!(second.retry_in, Duration::ZERO);

        assert_eq!(trial.record_success(), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let trial = breaker.try_acquire().expect("slot freed");
        assert_eq!(trial.record_success(), Some(CircuitState::Closed));
        assert!(breaker.is_healthy());
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn trial_failure_reopens_and_restarts_cooldown() {
        let (breaker, clock) = breaker(1, 1, 1);
        fail(&breaker);
        clock.advance(Duration::from_secs(31));

        assert_eq!(fail(&breaker), Some(CircuitState::Open));
        let rejection = breaker.try_acquire().expect_err("reopened");
        assert_eq!(rejection.retry_in, Duration::from_secs(30));
    }

    #[test]
    fn dropped_trial_frees_its_slot_without_recording() {
        let (breaker, clock) = breaker(1, 1, 1);
        fail(&breaker);
        clock.advance(Duration::from_secs(30));

        let trial = breaker.try_acquire().unwrap();
        drop(trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().total_failures, 1);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn late_outcomes_from_before_half_open_do_not_drive_transitions() {
        let (breaker, clock) = breaker(2, 1, 1);
        let straggler = breaker.try_acquire().unwrap();
        fail(&breaker);
        fail(&breaker);
        clock.advance(Duration::from_secs(30));
        let trial = breaker.try_acquire().unwrap();

        assert_eq!(straggler.record_success(), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(trial.record_success(), Some(CircuitState::Closed));
    }

    #[test]
    fn stale_trial_from_an_earlier_half_open_phase_is_ignored() {
        let (breaker, clock) = breaker(1, 1, 2);
        fail(&breaker);
        clock.advance(Duration::from_secs(30));
        let stale = breaker.try_acquire().unwrap();
        assert_eq!(breaker.try_acquire().unwrap().record_failure(), Some(CircuitState::Open));

        clock.advance(Duration::from_secs(30));
        let fresh = breaker.try_acquire().unwrap();
        assert_eq!(stale.record_success(), None);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(fresh.record_success(), Some(CircuitState::Closed));
    }

    #[test]
    fn reset_closes_and_clears_counters() {
        let (breaker, clock) = breaker(1, 1, 1);
        fail(&breaker);
        clock.advance(Duration::from_secs(1));
        breaker.reset();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.last_state_change_at, 2_000);
        assert_eq!(snapshot.last_failure_at, Some(1_000));
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::new("cms", CircuitBreakerConfig::disabled());
        for _ in 0..1_000 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().total_failures, 1_000);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let (breaker, _) = breaker(1, 1, 1);
        fail(&breaker);
        let json = serde_json::to_value(breaker.snapshot()).unwrap();
        assert_eq!(json["state"], "Open");
        assert_eq!(json["consecutiveFailures"], 1);
        assert_eq!(json["totalCalls"], 1);
        assert_eq!(json["lastFailureAt"], 1_000);
        assert_eq!(json["lastStateChangeAt"], 1_000);
    }

    #[test]
    fn concurrent_trials_never_exceed_the_limit() {
        let (breaker, clock) = breaker(1, 5, 3);
        fail(&breaker);
        clock.advance(Duration::from_secs(30));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.try_acquire().ok())
            })
            .collect();
        let permits: Vec<BreakerPermit> =
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(permits.len(), 3);
        assert_eq!(breaker.phase().trials, 3);
        let epoch = breaker.phase().epoch;

        drop(permits);
        assert_eq!(breaker.phase(), Phase { state: CircuitState::HalfOpen, trials: 0, epoch });
    }

    #[test]
    fn stale_failure_between_trial_successes_changes_nothing() {
        let (breaker, clock) = breaker(2, 2, 1);
        let straggler = breaker.try_acquire().unwrap();
        fail(&breaker);
        fail(&breaker);
        clock.advance(Duration::from_secs(30));

        assert_eq!(breaker.try_acquire().unwrap().record_success(), None);
        let before = breaker.snapshot();
        assert_eq!(before.consecutive_successes, 1);

        assert_eq!(straggler.record_failure(), None);
        assert_eq!(breaker.snapshot(), before);

        assert_eq!(breaker.try_acquire().unwrap().record_success(), Some(CircuitState::Closed));
    }

    #[test]
    fn closed_outcomes_from_before_a_reset_are_ignored() {
        let (breaker, _) = breaker(2, 1, 1);
        let straggler = breaker.try_acquire().unwrap();
        fail(&breaker);
        breaker.reset();

        assert_eq!(straggler.record_failure(), None);
        fail(&breaker);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.total_failures, 2);
    }

    #[test]
    fn transitions_publish_state_epoch_and_trials_together() {
        let (breaker, clock) = breaker(1, 1, 2);
        let closed = breaker.phase();
        fail(&breaker);
        assert_eq!(breaker.phase(), closed.next(CircuitState::Open));

        clock.advance(Duration::from_secs(30));
        let first = breaker.try_acquire().unwrap();
        let _second = breaker.try_acquire().unwrap();
        let half_open = breaker.phase();
        assert_eq!(half_open.trials, 2);

        assert_eq!(first.record_failure(), Some(CircuitState::Open));
        assert_eq!(breaker.phase(), half_open.next(CircuitState::Open));
        assert_eq!(breaker.phase().trials, 0);
    }

    #[test]
    fn phase_word_round_trips_at_the_edges() {
        let phase = Phase { state: CircuitState::HalfOpen, trials: TRIAL_LIMIT, epoch: u32::MAX };
        assert_eq!(Phase::unpack(phase.pack()), phase);
        assert_eq!(phase.next(CircuitState::Closed).epoch, 0);
    }
}
