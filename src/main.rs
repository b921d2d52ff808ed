//! Article relay server.
//!
//! ```text
//!   POST /articles ──▶ RateLimitLayer ──▶ publish_article ──▶ UpstreamController ──▶ CMS
//!                      (429 + quota)                          (breaker, retry, classify)
//!   GET  /health                 ──▶ HealthReport (200 / 503)
//!   POST /health/breaker/reset   ──▶ breaker reset, then HealthReport
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use article_relay::telemetry::LogSink;
use article_relay::{
    AdmissionController, BreakerRegistry, CircuitBreaker, CmsClient, HealthReport, RateLimitLayer,
    RelayConfig, RelayError, UpstreamController,
};

#[derive(Debug, Parser)]
#[command(name = "article-relay", version, about = "Rate-limited, circuit-broken relay to a CMS")]
struct Cli {
    /// Path to the TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    cms: CmsClient,
    upstream: UpstreamController<LogSink>,
    registry: BreakerRegistry,
    admission: AdmissionController,
    collection: Arc<str>,
    dependency: Arc<str>,
    request_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "article_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };

    tracing::info!(
        bind = %config.server.bind,
        upstream = %config.server.upstream_base_url,
        dependency = %config.server.dependency,
        "Configuration loaded"
    );

    let admission = config.admission_controller()?;
    let sweeper = admission.spawn_sweeper(config.sweep_interval());

    let breaker = CircuitBreaker::new(config.server.dependency.as_str(), config.breaker_config()?);
    let registry = BreakerRegistry::new();
    registry.register(breaker.clone());

    let upstream = UpstreamController::new(breaker, config.retry_policy()?)
        .with_classifier(config.classifier())
        .with_attempt_timeout(config.attempt_timeout())
        .with_sink(LogSink);

    let token = std::env::var(&config.server.token_env).ok();
    if token.is_none() {
        tracing::warn!(env = %config.server.token_env, "No CMS token set; requests are unauthenticated");
    }

    let state = AppState {
        cms: CmsClient::new(config.server.upstream_base_url.as_str(), token),
        upstream,
        registry,
        admission: admission.clone(),
        collection: config.server.collection.as_str().into(),
        dependency: config.server.dependency.as_str().into(),
        request_timeout: config.request_timeout(),
    };

    let app = Router::new()
        .route("/articles", post(publish_article))
        .route_layer(RateLimitLayer::new(admission).with_sink(LogSink))
        .route("/health", get(health))
        .route("/health/breaker/reset", post(reset_breaker))
        .with_state(state);

    let listener = TcpListener::bind(config.server.bind).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn publish_article(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), RelayError> {
    let created = state
        .upstream
        .call_within(state.request_timeout, |attempt| {
            let cms = state.cms.clone();
            let collection = state.collection.clone();
            let payload = payload.clone();
            async move {
                tracing::debug!(attempt, collection = %collection, "Publishing article");
                cms.publish(&collection, &payload).await
            }
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn health(State(state): State<AppState>) -> HealthReport {
    HealthReport::collect(&state.registry, &state.dependency, &state.admission)
}

async fn reset_breaker(State(state): State<AppState>) -> Response {
    match state.registry.reset(&state.dependency) {
        Ok(()) => {
            tracing::info!(dependency = %state.dependency, "Circuit breaker reset by operator");
            HealthReport::collect(&state.registry, &state.dependency, &state.admission).into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "message": e.to_string() }))).into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
