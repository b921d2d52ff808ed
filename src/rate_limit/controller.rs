use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adaptive::DynamicConfig;
use crate::classify::{ErrorClassification, ErrorKind, FailureContext, QuotaEcho};
use crate::rate_limit::store::WindowStore;
use crate::rate_limit::{Decision, RateLimitPolicy, MAX_WINDOW};
use crate::time::{Clock, SystemClock};

/// Policies gating requests: an optional global policy plus per-route policies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    global: Option<RateLimitPolicy>,
    routes: HashMap<String, RateLimitPolicy>,
}

impl PolicySet {
    /// No policies; every request is unlimited.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy applied to every request.
    pub fn with_global(mut self, policy: RateLimitPolicy) -> Self {
        self.global = Some(policy);
        self
    }

    /// Policy applied to requests whose path equals `route`.
    pub fn with_route(mut self, route: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.routes.insert(route.into(), policy);
        self
    }

    /// Policies that gate a request to `route`.
    pub fn applicable<'a>(&'a self, route: Option<&str>) -> impl Iterator<Item = &'a RateLimitPolicy> {
        let routed = route.and_then(|r| self.routes.get(r));
        self.global.iter().chain(routed)
    }

    /// Whether no policy is configured.
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.routes.is_empty()
    }
}

/// Structured denial handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// Denying policy.
    pub policy: String,
    /// Configured `max_units`.
    pub limit: u64,
    /// Always 0 for a denial.
    pub remaining: u64,
    /// Epoch milliseconds at which capacity returns.
    pub reset_at: u64,
    /// `ceil((reset_at - now) / 1000)`.
    pub retry_after_secs: u64,
}

impl RateLimitRejection {
    fn from_decision(decision: &Decision, now: u64) -> Self {
        Self {
            policy: decision.policy.to_string(),
            limit: decision.limit,
            remaining: 0,
            reset_at: decision.reset_at,
            retry_after_secs: decision.retry_after_secs(now),
        }
    }

    /// The denial as a `RateLimited` classification.
    pub fn to_classification(&self) -> ErrorClassification {
        let context = FailureContext {
            quota: Some(QuotaEcho {
                limit: Some(self.limit),
                remaining: Some(0),
                reset: Some(self.reset_at.div_ceil(1000)),
            }),
            ..FailureContext::default()
        };
        ErrorClassification::new(
            ErrorKind::RateLimited,
            429,
            true,
            format!("Too many requests; retry in {} seconds", self.retry_after_secs),
            context,
        )
        .with_retry_after(self.retry_after_secs)
    }
}

/// Outcome of admitting one request against every applicable policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Caller is on the allow-list; nothing was counted.
    Exempt,
    /// No policy applies to the request.
    Unlimited,
    /// Every policy admitted; carries the most restrictive decision for quota headers.
    Allowed(Decision),
    /// At least one policy denied.
    Denied {
        /// Denial to surface.
        rejection: RateLimitRejection,
        /// Binding decision for quota headers.
        decision: Decision,
    },
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Denied { .. })
    }
}

/// Admission controller. Clones share the same store, policies and allow-list.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    store: Arc<WindowStore>,
    policies: DynamicConfig<PolicySet>,
    allow_list: DynamicConfig<HashSet<String>>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// Controller over `policies`, using the system clock.
    pub fn new(policies: PolicySet) -> Self {
        Self {
            store: Arc::new(WindowStore::new()),
            policies: DynamicConfig::new(policies),
            allow_list: DynamicConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Identities that bypass admission entirely.
    pub fn with_allow_list<I, S>(self, identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_allow_list(identities);
        self
    }

    /// Replace the allow-list.
    pub fn set_allow_list<I, S>(&self, identities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow_list.set(identities.into_iter().map(Into::into).collect());
    }

    /// Swap the policy set. Existing windows keep counting under their policy names.
    pub fn set_policies(&self, policies: PolicySet) {
        self.policies.set(policies);
    }

    /// Current policy set.
    pub fn policies(&self) -> Arc<PolicySet> {
        self.policies.get()
    }

    /// Allow-list bypass, evaluated before any consumption.
    pub fn skip(&self, client: &str) -> bool {
        self.allow_list.get().contains(client)
    }

    /// Consume one unit from `client`'s window under `policy`.
    pub fn check_and_consume(&self, client: &str, policy: &RateLimitPolicy) -> Decision {
        self.check_and_consume_weighted(client, policy, 1)
    }

    /// Consume `weight` units from `client`'s window under `policy`.
    pub fn check_and_consume_weighted(&self, client: &str, policy: &RateLimitPolicy, weight: u64) -> Decision {
        self.consume_at(client, policy, self.clock.now_millis(), weight)
    }

    /// Evaluate every policy applicable to `route`; reject if any denies.
    pub fn admit(&self, client: &str, route: Option<&str>) -> Admission {
        self.admit_weighted(client, route, 1)
    }

    /// Weighted variant of [`admit`](Self::admit).
    pub fn admit_weighted(&self, client: &str, route: Option<&str>, weight: u64) -> Admission {
        if self.skip(client) {
            return Admission::Exempt;
        }

        let policies = self.policies.get();
        let now = self.clock.now_millis();
        let mut binding: Option<Decision> = None;
        for policy in policies.applicable(route) {
            let decision = self.consume_at(client, policy, now, weight);
            binding = match binding {
                Some(current) if !decision.is_more_restrictive_than(&current) => Some(current),
                _ => Some(decision),
            };
        }

        match binding {
            None => Admission::Unlimited,
            Some(decision) if decision.allowed => Admission::Allowed(decision),
            Some(decision) => {
                let rejection = RateLimitRejection::from_decision(&decision, now);
                tracing::warn!(
                    client = %client,
                    policy = %rejection.policy,
                    limit = rejection.limit,
                    retry_after_secs = rejection.retry_after_secs,
                    "Rate limit exceeded"
                );
                Admission::Denied { rejection, decision }
            }
        }
    }

    fn consume_at(&self, client: &str, policy: &RateLimitPolicy, now: u64, weight: u64) -> Decision {
        let consumed = self.store.consume(client, policy, now, weight);
        Decision {
            allowed: consumed.allowed,
            policy: policy.shared_name(),
            limit: policy.max_units(),
            remaining: consumed.remaining,
            reset_at: consumed.reset_at,
        }
    }

    /// Remove windows idle for longer than [`MAX_WINDOW`]. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_millis(), max_idle_millis())
    }

    /// Run [`sweep`](Self::sweep) every `every` on the tokio runtime until the controller is
    /// dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(&self.store);
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep(clock.now_millis(), max_idle_millis());
                if removed > 0 {
                    tracing::debug!(removed, tracked = store.len(), "Swept idle rate limit windows");
                }
            }
        })
    }

    /// Number of tracked windows.
    pub fn store_size(&self) -> usize {
        self.store.len()
    }

    /// Current time according to the controller's clock.
    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

fn max_idle_millis() -> u64 {
    u64::try_from(MAX_WINDOW.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn controller(policies: PolicySet) -> (AdmissionController, ManualClock) {
        let clock = ManualClock::new(T0);
        (AdmissionController::new(policies).with_clock(clock.clone()), clock)
    }

    fn per_minute(name: &str, max: u64) -> RateLimitPolicy {
        RateLimitPolicy::fixed(name, max, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn eleventh_request_is_denied_with_retry_after() {
        let policy = per_minute("global", 10);
        let (controller, clock) = controller(PolicySet::new().with_global(policy.clone()));

        let remaining: Vec<u64> = (0..10)
            .map(|_| {
                clock.advance(Duration::from_millis(100));
                let d = controller.check_and_consume("A", &policy);
                assert!(d.allowed);
                d.remaining
            })
            .collect();
        assert_eq!(remaining, (0..10).rev().collect::<Vec<u64>>());

        match controller.admit("A", None) {
            Admission::Denied { rejection, decision } => {
                assert!(!decision.allowed);
                assert_eq!(rejection.remaining, 0);
                assert_eq!(rejection.limit, 10);
                assert!(rejection.retry_after_secs > 0);
                assert_eq!(rejection.retry_after_secs, 60);
                let classification = rejection.to_classification();
                assert_eq!(classification.kind(), &ErrorKind::RateLimited);
                assert_eq!(classification.retry_after_secs(), Some(60));
            }
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn quota_returns_after_the_window() {
        let policy = RateLimitPolicy::sliding("s", 2, Duration::from_secs(10)).unwrap();
        let (controller, clock) = controller(PolicySet::new());
        assert!(controller.check_and_consume("A", &policy).allowed);
        assert!(controller.check_and_consume("A", &policy).allowed);
        assert!(!controller.check_and_consume("A", &policy).allowed);

        clock.advance(Duration::from_secs(10));
        let fresh = controller.check_and_consume("A", &policy);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[test]
    fn clients_do_not_interfere() {
        let policy = per_minute("global", 3);
        let (controller, _) = controller(PolicySet::new().with_global(policy));
        for _ in 0..3 {
            assert!(controller.admit("A", None).is_admitted());
        }
        assert!(!controller.admit("A", None).is_admitted());
        match controller.admit("B", None) {
            Admission::Allowed(decision) => assert_eq!(decision.remaining, 2),
            other => panic!("expected B to be admitted, got {other:?}"),
        }
    }

    #[test]
    fn stricter_route_policy_binds() {
        let policies = PolicySet::new()
            .with_global(per_minute("global", 100))
            .with_route("/articles", per_minute("articles", 2));
        let (controller, _) = controller(policies);

        match controller.admit("A", Some("/articles")) {
            Admission::Allowed(decision) => {
                assert_eq!(&*decision.policy, "articles");
                assert_eq!(decision.remaining, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        controller.admit("A", Some("/articles"));
        match controller.admit("A", Some("/articles")) {
            Admission::Denied { rejection, .. } => assert_eq!(rejection.policy, "articles"),
            other => panic!("unexpected {other:?}"),
        }
        match controller.admit("A", Some("/health")) {
            Admission::Allowed(decision) => {
                assert_eq!(&*decision.policy, "global");
                assert_eq!(decision.remaining, 96, "every evaluated policy consumed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn allow_listed_clients_are_never_counted() {
        let (controller, _) = controller(PolicySet::new().with_global(per_minute("global", 1)));
        let controller = controller.with_allow_list(["10.0.0.1"]);
        for _ in 0..5 {
            assert_eq!(controller.admit("10.0.0.1", None), Admission::Exempt);
        }
        assert_eq!(controller.store_size(), 0);
        assert!(controller.skip("10.0.0.1"));
        assert!(!controller.skip("10.0.0.2"));
    }

    #[test]
    fn no_policies_means_unlimited() {
        let (controller, _) = controller(PolicySet::new());
        assert_eq!(controller.admit("A", Some("/articles")), Admission::Unlimited);
        assert!(controller.policies().is_empty());
    }

    #[test]
    fn policies_can_be_swapped_at_runtime() {
        let (controller, _) = controller(PolicySet::new().with_global(per_minute("loose", 100)));
        assert!(controller.admit("A", None).is_admitted());
        controller.set_policies(PolicySet::new().with_global(per_minute("tight", 1)));
        assert!(controller.admit("A", None).is_admitted());
        assert!(!controller.admit("A", None).is_admitted());
    }

    #[test]
    fn sweep_drops_windows_idle_past_the_largest_window() {
        let (controller, clock) = controller(PolicySet::new().with_global(per_minute("global", 5)));
        controller.admit("A", None);
        controller.admit("B", None);
        clock.advance(Duration::from_secs(30 * 60));
        controller.admit("B", None);

        clock.advance(Duration::from_secs(30 * 60));
        assert_eq!(controller.sweep(), 1);
        assert_eq!(controller.store_size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_runs_on_its_interval() {
        let (controller, clock) = controller(PolicySet::new().with_global(per_minute("global", 5)));
        controller.admit("A", None);
        let handle = controller.spawn_sweeper(Duration::from_secs(1));

        clock.advance(MAX_WINDOW);
        for _ in 0..10 {
            if controller.store_size() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(controller.store_size(), 0);

        drop(controller);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
