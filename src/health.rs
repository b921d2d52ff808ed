//! Health introspection.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::Serialize;

use crate::circuit_breaker::{BreakerSnapshot, CircuitState};
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::rate_limit::AdmissionController;

/// Health of the relay: healthy iff every breaker is Closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Every breaker is Closed.
    pub healthy: bool,
    /// Breaker of the primary dependency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker: Option<BreakerSnapshot>,
    /// Every registered breaker, by name.
    pub dependencies: Vec<BreakerSnapshot>,
    /// Rate-limit windows currently tracked.
    pub admission_store_size: usize,
}

impl HealthReport {
    /// Collect from the registry; `primary` names the dependency reported as `breaker`.
    pub fn collect(registry: &BreakerRegistry, primary: &str, admission: &AdmissionController) -> Self {
        let dependencies = registry.snapshots();
        let healthy = dependencies.iter().all(|s| s.state == CircuitState::Closed);
        let breaker = dependencies.iter().find(|s| s.dependency == primary).cloned();
        Self { healthy, breaker, dependencies, admission_store_size: admission.store_size() }
    }

    /// `200` when healthy, `503` otherwise.
    pub fn status_code(&self) -> StatusCode {
        if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}
