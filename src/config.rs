//! Relay configuration.
//!
//! Loaded from TOML, every field defaulted, then validated by building the runtime types from it:
//! a config that loads is a config that runs. All durations are milliseconds.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//! upstream_base_url = "https://api.webflow.com/v2"
//! collection = "posts"
//!
//! [rate_limit.global]
//! max_units = 100
//! window_ms = 60000
//!
//! [rate_limit.routes."/articles"]
//! max_units = 10
//! window_ms = 60000
//! algorithm = "sliding"
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_ms = 30000
//!
//! [retry.server_error]
//! max_attempts = 3
//! base_delay_ms = 5000
//! multiplier = 2.0
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classify::{Classifier, DEFAULT_RETRY_AFTER_SECS};
use crate::rate_limit::{AdmissionController, Algorithm, PolicySet, RateLimitPolicy};
use crate::retry::RetryPolicy;
use crate::{Backoff, Jitter};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Values parsed but are semantically invalid.
    #[error("validation failed: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Listener and upstream endpoint.
    pub server: ServerConfig,
    /// Admission control.
    pub rate_limit: RateLimitConfig,
    /// Breaker for the CMS dependency.
    pub breaker: BreakerConfig,
    /// Retry budgets.
    pub retry: RetryConfig,
    /// Classifier tuning.
    pub classifier: ClassifierConfig,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// CMS API root.
    pub upstream_base_url: String,
    /// Environment variable holding the CMS bearer token.
    pub token_env: String,
    /// Collection articles are published into.
    pub collection: String,
    /// Name of the CMS dependency (breaker and telemetry key).
    pub dependency: String,
    /// Per-attempt upstream timeout.
    pub attempt_timeout_ms: u64,
    /// Deadline for one publish request, retries and waits included.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            upstream_base_url: "https://api.webflow.com/v2".to_string(),
            token_env: "CMS_API_TOKEN".to_string(),
            collection: "articles".to_string(),
            dependency: "cms".to_string(),
            attempt_timeout_ms: 30_000,
            request_timeout_ms: 180_000,
        }
    }
}

/// One rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Policy name; defaults to `global` or the route path.
    #[serde(default)]
    pub name: Option<String>,
    /// Units admitted per window.
    pub max_units: u64,
    /// Window length.
    pub window_ms: u64,
    /// Counting algorithm.
    #[serde(default)]
    pub algorithm: Algorithm,
}

impl PolicyConfig {
    fn build(&self, default_name: &str) -> Result<RateLimitPolicy, String> {
        let name = self.name.as_deref().unwrap_or(default_name);
        RateLimitPolicy::new(name, self.max_units, Duration::from_millis(self.window_ms), self.algorithm)
            .map_err(|e| format!("rate_limit: {e}"))
    }
}

/// `[rate_limit]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Policy applied to every request.
    pub global: Option<PolicyConfig>,
    /// Policies keyed by route path.
    pub routes: HashMap<String, PolicyConfig>,
    /// Identities that are never counted.
    pub allow_list: Vec<String>,
    /// Interval of the idle-window sweep.
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: Some(PolicyConfig {
                name: None,
                max_units: 100,
                window_ms: 60_000,
                algorithm: Algorithm::Fixed,
            }),
            routes: HashMap::new(),
            allow_list: Vec::new(),
            sweep_interval_ms: 60_000,
        }
    }
}

/// `[breaker]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Trial successes that close it again.
    pub success_threshold: u32,
    /// Time spent Open before trials.
    pub cooldown_ms: u64,
    /// Concurrent trials while Half-Open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold(),
            success_threshold: defaults.success_threshold(),
            cooldown_ms: u64::try_from(defaults.cooldown().as_millis()).unwrap_or(u64::MAX),
            half_open_max_calls: defaults.half_open_max_calls(),
        }
    }
}

/// Budget and schedule for one retryable kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    /// Total attempts.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// Growth per attempt.
    pub multiplier: f64,
    /// Cap on a single delay.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl BackoffConfig {
    fn build(&self, section: &str) -> Result<Backoff, String> {
        let backoff = Backoff::exponential(Duration::from_millis(self.base_delay_ms), self.multiplier)
            .map_err(|e| format!("retry.{section}: {e}"))?;
        match self.max_delay_ms {
            Some(max) => backoff.with_max(Duration::from_millis(max)).map_err(|e| format!("retry.{section}: {e}")),
            None => Ok(backoff),
        }
    }
}

/// `[retry]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts for upstream throttling.
    pub rate_limited_attempts: u32,
    /// Longest upstream `Retry-After` worth waiting for.
    pub max_retry_after_ms: u64,
    /// Jitter for computed delays.
    pub jitter: Jitter,
    /// Upstream 5xx.
    pub server_error: BackoffConfig,
    /// Transport failures.
    pub network_error: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limited_attempts: 3,
            max_retry_after_ms: 60_000,
            jitter: Jitter::None,
            server_error: BackoffConfig {
                max_attempts: 3,
                base_delay_ms: 5_000,
                multiplier: 2.0,
                max_delay_ms: None,
            },
            network_error: BackoffConfig {
                max_attempts: 2,
                base_delay_ms: 2_000,
                multiplier: 1.5,
                max_delay_ms: None,
            },
        }
    }
}

/// `[classifier]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Wait used for a `429` without `Retry-After`.
    pub default_retry_after_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self { default_retry_after_secs: DEFAULT_RETRY_AFTER_SECS }
    }
}

impl RelayConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if let Err(mut e) = self.policy_set() {
            problems.append(&mut e);
        }
        if let Err(e) = self.breaker_config() {
            problems.push(e);
        }
        if let Err(e) = self.retry_policy() {
            problems.push(e);
        }
        if self.rate_limit.sweep_interval_ms == 0 {
            problems.push("rate_limit: sweep_interval_ms must be > 0".to_string());
        }
        if self.server.attempt_timeout_ms == 0 {
            problems.push("server: attempt_timeout_ms must be > 0".to_string());
        }
        if self.server.request_timeout_ms < self.server.attempt_timeout_ms {
            problems.push("server: request_timeout_ms must be >= attempt_timeout_ms".to_string());
        }
        if self.server.upstream_base_url.trim().is_empty() {
            problems.push("server: upstream_base_url must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Global and per-route policies.
    pub fn policy_set(&self) -> Result<PolicySet, Vec<String>> {
        let mut problems = Vec::new();
        let mut set = PolicySet::new();
        if let Some(global) = &self.rate_limit.global {
            match global.build("global") {
                Ok(policy) => set = set.with_global(policy),
                Err(e) => problems.push(e),
            }
        }
        for (route, policy) in &self.rate_limit.routes {
            match policy.build(route) {
                Ok(policy) => set = set.with_route(route.clone(), policy),
                Err(e) => problems.push(e),
            }
        }
        if problems.is_empty() {
            Ok(set)
        } else {
            problems.sort();
            Err(problems)
        }
    }

    /// Admission controller with the configured policies and allow-list.
    pub fn admission_controller(&self) -> Result<AdmissionController, ConfigError> {
        let policies = self.policy_set().map_err(ConfigError::Invalid)?;
        Ok(AdmissionController::new(policies).with_allow_list(self.rate_limit.allow_list.iter().cloned()))
    }

    /// Breaker settings for the CMS dependency.
    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, String> {
        let b = &self.breaker;
        CircuitBreakerConfig::new(
            b.failure_threshold,
            b.success_threshold,
            Duration::from_millis(b.cooldown_ms),
            b.half_open_max_calls,
        )
        .map_err(|e| format!("breaker: {e}"))
    }

    /// Per-kind retry policy.
    pub fn retry_policy(&self) -> Result<RetryPolicy, String> {
        let r = &self.retry;
        RetryPolicy::builder()
            .rate_limited_attempts(r.rate_limited_attempts)
            .server_error(r.server_error.max_attempts, r.server_error.build("server_error")?)
            .network_error(r.network_error.max_attempts, r.network_error.build("network_error")?)
            .max_retry_after(Duration::from_millis(r.max_retry_after_ms))
            .with_jitter(r.jitter)
            .build()
            .map_err(|e| format!("retry: {e}"))
    }

    /// Classifier with the configured `Retry-After` fallback.
    pub fn classifier(&self) -> Classifier {
        Classifier::new(self.classifier.default_retry_after_secs)
    }

    /// Idle-window sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit.sweep_interval_ms)
    }

    /// Per-attempt upstream timeout.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.server.attempt_timeout_ms)
    }

    /// Whole-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_working_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::default());
        assert_eq!(config.breaker_config().unwrap(), CircuitBreakerConfig::default());
        assert_eq!(config.policy_set().unwrap().applicable(None).count(), 1);
    }

    #[test]
    fn every_problem_is_reported() {
        let toml = r#"
            [rate_limit.global]
            max_units = 0
            window_ms = 60000

            [breaker]
            failure_threshold = 0

            [retry]
            rate_limited_attempts = 0
        "#;
        match RelayConfig::from_toml_str(toml) {
            Err(ConfigError::Invalid(problems)) => {
                assert_eq!(problems.len(), 3, "{problems:?}");
                assert!(problems[0].contains("max_units"));
                assert!(problems[1].starts_with("breaker:"));
                assert!(problems[2].starts_with("retry:"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        assert!(matches!(RelayConfig::from_toml_str("[breaker]\ncooldown = 5"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn route_policies_default_their_name_to_the_path() {
        let toml = r#"
            [rate_limit.routes."/articles"]
            max_units = 10
            window_ms = 60000
            algorithm = "sliding"
        "#;
        let config = RelayConfig::from_toml_str(toml).unwrap();
        let set = config.policy_set().unwrap();
        let names: Vec<&str> = set.applicable(Some("/articles")).map(RateLimitPolicy::name).collect();
        assert_eq!(names, vec!["global", "/articles"]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = RelayConfig::load(Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/relay.toml"));
    }
}
