use std::collections::VecDeque;

use crate::rate_limit::{Algorithm, RateLimitPolicy};

/// Outcome of consuming from one window, before it is tagged with the policy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    /// Whether the units were admitted.
    pub allowed: bool,
    /// Units left in the window.
    pub remaining: u64,
    /// Epoch milliseconds at which capacity returns.
    pub reset_at: u64,
}

/// Shared interface of the counting algorithms.
///
/// Implementations are plain state; the store serializes access per key.
pub trait WindowAlgorithm: Send + Sync + std::fmt::Debug {
    /// Try to admit `weight` units at `now` (epoch ms).
    fn consume(&mut self, now: u64, policy: &RateLimitPolicy, weight: u64) -> Consumed;

    /// Epoch ms of the most recent request seen.
    fn last_activity(&self) -> u64;
}

/// `{count, window_start}`: reset on rollover, otherwise incremented.
///
/// Denied requests still increment the count; the window resets regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindowCounter {
    count: u64,
    window_start: u64,
    last_seen: u64,
}

impl FixedWindowCounter {
    /// Counter whose first window starts at `now`.
    pub fn new(now: u64) -> Self {
        Self { count: 0, window_start: now, last_seen: now }
    }

    /// Units counted in the current window.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl WindowAlgorithm for FixedWindowCounter {
    fn consume(&mut self, now: u64, policy: &RateLimitPolicy, weight: u64) -> Consumed {
        let window = policy.window_millis();
        if now.saturating_sub(self.window_start) > window {
            self.count = weight;
            self.window_start = now;
        } else {
            self.count = self.count.saturating_add(weight);
        }
        self.last_seen = self.last_seen.max(now);

        let max = policy.max_units();
        Consumed {
            allowed: self.count <= max,
            remaining: max.saturating_sub(self.count),
            reset_at: self.window_start.saturating_add(window),
        }
    }

    fn last_activity(&self) -> u64 {
        self.last_seen
    }
}

/// Ordered `{timestamp, weight}` entries over a moving window.
///
/// Entries with `timestamp + window <= now` have left the window. Denied requests are not
/// logged, so a client hammering a full window regains capacity as old entries expire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlidingWindowLog {
    entries: VecDeque<(u64, u64)>,
    total: u64,
    last_seen: u64,
}

impl SlidingWindowLog {
    /// Empty log.
    pub fn new(now: u64) -> Self {
        Self { entries: VecDeque::new(), total: 0, last_seen: now }
    }

    /// Weighted sum of entries still inside the window as of the last prune.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of logged entries as of the last prune.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self, now: u64, window: u64) {
        while let Some(&(ts, weight)) = self.entries.front() {
            if ts.saturating_add(window) > now {
                break;
            }
            self.total = self.total.saturating_sub(weight);
            self.entries.pop_front();
        }
    }

    /// Earliest instant at which `weight` more units would fit.
    fn reset_for(&self, window: u64, max: u64, weight: u64) -> u64 {
        let mut freed = 0u64;
        for &(ts, w) in &self.entries {
            freed = freed.saturating_add(w);
            if self.total.saturating_sub(freed).saturating_add(weight) <= max {
                return ts.saturating_add(window);
            }
        }
        self.entries.back().map(|&(ts, _)| ts.saturating_add(window)).unwrap_or(self.last_seen)
    }
}

impl WindowAlgorithm for SlidingWindowLog {
    fn consume(&mut self, now: u64, policy: &RateLimitPolicy, weight: u64) -> Consumed {
        let window = policy.window_millis();
        let max = policy.max_units();
        self.prune(now, window);
        self.last_seen = self.last_seen.max(now);

        if self.total.saturating_add(weight) > max {
            return Consumed { allowed: false, remaining: 0, reset_at: self.reset_for(window, max, weight) };
        }

        self.entries.push_back((now, weight));
        self.total = self.total.saturating_add(weight);
        let oldest = self.entries.front().map(|&(ts, _)| ts).unwrap_or(now);
        Consumed {
            allowed: true,
            remaining: max - self.total,
            reset_at: oldest.saturating_add(window),
        }
    }

    fn last_activity(&self) -> u64 {
        self.last_seen
    }
}

/// Per-key state, dispatching to the policy's algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowState {
    /// Fixed-window counter.
    Fixed(FixedWindowCounter),
    /// Sliding-window log.
    Sliding(SlidingWindowLog),
}

impl WindowState {
    /// Fresh state for `algorithm`.
    pub fn for_algorithm(algorithm: Algorithm, now: u64) -> Self {
        match algorithm {
            Algorithm::Fixed => WindowState::Fixed(FixedWindowCounter::new(now)),
            Algorithm::Sliding => WindowState::Sliding(SlidingWindowLog::new(now)),
        }
    }

    /// Algorithm this state counts with.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            WindowState::Fixed(_) => Algorithm::Fixed,
            WindowState::Sliding(_) => Algorithm::Sliding,
        }
    }
}

impl WindowAlgorithm for WindowState {
    fn consume(&mut self, now: u64, policy: &RateLimitPolicy, weight: u64) -> Consumed {
        match self {
            WindowState::Fixed(counter) => counter.consume(now, policy, weight),
            WindowState::Sliding(log) => log.consume(now, policy, weight),
        }
    }

    fn last_activity(&self) -> u64 {
        match self {
            WindowState::Fixed(counter) => counter.last_activity(),
            WindowState::Sliding(log) => log.last_activity(),
        }
    }
}
