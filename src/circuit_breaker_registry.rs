//! Registry of the breakers guarding each upstream dependency.
//!
//! Gives the health surface one place to inspect and reset breakers by dependency name.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};

/// Errors from the breaker registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No breaker is registered under that dependency name.
    #[error("circuit breaker '{dependency}' not found")]
    NotFound {
        /// Name that could not be located.
        dependency: String,
    },
}

/// Breakers by dependency name. Clones share the same map.
#[derive(Default, Clone, Debug)]
pub struct BreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `breaker` under its own name. The last registration for a name wins.
    pub fn register(&self, breaker: CircuitBreaker) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let name = breaker.name().to_string();
        if map.contains_key(&name) {
            warn!(dependency = %name, "circuit breaker replaced; last registration wins");
        }
        map.insert(name, breaker);
    }

    /// Breaker for `dependency`.
    pub fn get(&self, dependency: &str) -> Option<CircuitBreaker> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).get(dependency).cloned()
    }

    /// Reset one breaker to Closed.
    pub fn reset(&self, dependency: &str) -> Result<(), RegistryError> {
        match self.get(dependency) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { dependency: dependency.to_string() }),
        }
    }

    /// Reset every breaker. Returns how many were reset.
    pub fn reset_all(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.values().for_each(CircuitBreaker::reset);
        map.len()
    }

    /// Snapshots sorted by dependency name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<BreakerSnapshot> = map.values().map(CircuitBreaker::snapshot).collect();
        entries.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        entries
    }

    /// Whether every registered breaker is Closed.
    pub fn all_healthy(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).values().all(CircuitBreaker::is_healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn tripped(name: &str) -> CircuitBreaker {
        let config = CircuitBreakerConfig::new(1, 1, std::time::Duration::from_secs(30), 1).unwrap();
        let breaker = CircuitBreaker::new(name, config);
        let _ = breaker.try_acquire().unwrap().record_failure();
        breaker
    }

    #[test]
    fn register_warns_and_replaces_duplicates() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = BreakerRegistry::new();
        registry.register(tripped("cms"));
        registry.register(CircuitBreaker::new("cms", CircuitBreakerConfig::default()));

        assert!(registry.get("cms").unwrap().is_healthy(), "last registration should win");
        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("circuit breaker replaced"));
    }

    #[test]
    fn reset_by_name_and_snapshot_in_order() {
        let registry = BreakerRegistry::new();
        registry.register(tripped("webflow"));
        registry.register(tripped("assets"));
        assert!(!registry.all_healthy());

        registry.reset("webflow").unwrap();
        let states: Vec<(String, CircuitState)> =
            registry.snapshots().into_iter().map(|s| (s.dependency, s.state)).collect();
        assert_eq!(
            states,
            vec![("assets".to_string(), CircuitState::Open), ("webflow".to_string(), CircuitState::Closed)]
        );

        assert_eq!(
            registry.reset("missing"),
            Err(RegistryError::NotFound { dependency: "missing".into() })
        );
        assert_eq!(registry.reset_all(), 2);
        assert!(registry.all_healthy());
    }
}
