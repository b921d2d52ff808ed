use std::sync::Arc;

use dashmap::DashMap;

use crate::rate_limit::strategies::{Consumed, WindowAlgorithm, WindowState};
use crate::rate_limit::RateLimitPolicy;

/// Key of one window: the client identity and the policy name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    client: Box<str>,
    policy: Arc<str>,
}

impl WindowKey {
    /// Build a key.
    pub fn new(client: &str, policy: &RateLimitPolicy) -> Self {
        Self { client: client.into(), policy: policy.shared_name() }
    }

    /// Client identity part.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Policy name part.
    pub fn policy(&self) -> &str {
        &self.policy
    }
}

/// In-memory window store.
///
/// Backed by a sharded concurrent map: consuming holds the write lock of one shard for the
/// duration of a single increment-and-compare, so requests from the same client are atomic
/// while unrelated clients only contend when they hash to the same shard. The sweep visits
/// shards one at a time.
#[derive(Debug, Default)]
pub struct WindowStore {
    windows: DashMap<WindowKey, WindowState>,
}

impl WindowStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or lazily create the window for `(client, policy)` and consume `weight` units.
    ///
    /// A policy whose algorithm changed since the state was created starts from a fresh window.
    pub fn consume(&self, client: &str, policy: &RateLimitPolicy, now: u64, weight: u64) -> Consumed {
        let mut entry = self
            .windows
            .entry(WindowKey::new(client, policy))
            .or_insert_with(|| WindowState::for_algorithm(policy.algorithm(), now));
        if entry.algorithm() != policy.algorithm() {
            *entry = WindowState::for_algorithm(policy.algorithm(), now);
        }
        entry.consume(now, policy, weight)
    }

    /// Remove windows whose last activity is at least `max_idle_millis` old. Returns how many
    /// were removed.
    pub fn sweep(&self, now: u64, max_idle_millis: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, state| now.saturating_sub(state.last_activity()) < max_idle_millis);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether no window is tracked.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Drop every window, e.g. after a policy reload.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::Algorithm;
    use std::time::Duration;

    fn policy(name: &str, algorithm: Algorithm) -> RateLimitPolicy {
        RateLimitPolicy::new(name, 2, Duration::from_secs(60), algorithm).unwrap()
    }

    #[test]
    fn windows_are_keyed_by_client_and_policy() {
        let store = WindowStore::new();
        let global = policy("global", Algorithm::Fixed);
        let articles = policy("articles", Algorithm::Fixed);

        store.consume("a", &global, 0, 1);
        store.consume("a", &global, 0, 1);
        assert!(!store.consume("a", &global, 0, 1).allowed);
        assert!(store.consume("a", &articles, 0, 1).allowed);
        assert!(store.consume("b", &global, 0, 1).allowed);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn algorithm_change_restarts_the_window() {
        let store = WindowStore::new();
        store.consume("a", &policy("p", Algorithm::Fixed), 0, 1);
        store.consume("a", &policy("p", Algorithm::Fixed), 0, 1);
        let switched = store.consume("a", &policy("p", Algorithm::Sliding), 0, 1);
        assert!(switched.allowed);
        assert_eq!(switched.remaining, 1);
    }

    #[test]
    fn sweep_removes_only_idle_windows() {
        let store = WindowStore::new();
        let p = policy("p", Algorithm::Sliding);
        store.consume("idle", &p, 0, 1);
        store.consume("busy", &p, 3_000_000, 1);

        let removed = store.sweep(3_600_000, 3_600_000);
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.consume("busy", &p, 3_600_000, 1).allowed);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn concurrent_consumers_never_overshoot() {
        let store = Arc::new(WindowStore::new());
        let p = RateLimitPolicy::fixed("p", 100, Duration::from_secs(60)).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let p = p.clone();
                std::thread::spawn(move || (0..50).filter(|_| store.consume("shared", &p, 0, 1).allowed).count())
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
    }
}
