use article_relay::{
    CircuitBreaker, CircuitBreakerConfig, CmsClient, ErrorKind, InstantSleeper, RetryPolicy, UpstreamController,
};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
struct FakeCms {
    calls: Arc<AtomicU32>,
}

async fn create_item(
    State(cms): State<FakeCms>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let call = cms.calls.fetch_add(1, Ordering::SeqCst) + 1;
    let authorized = headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer test-token");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"message": "bad token"})));
    }
    if collection == "drafts" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Validation Error", "details": [{"param": "slug", "description": "taken"}]})),
        );
    }
    if call < 3 {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"message": "try later"})));
    }
    (StatusCode::CREATED, Json(json!({"id": "item-1", "collection": collection, "fieldData": payload})))
}

async fn spawn_cms() -> (String, FakeCms) {
    let cms = FakeCms::default();
    let app = Router::new()
        .route("/v2/collections/{collection}/items", post(create_item))
        .with_state(cms.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v2/"), cms)
}

fn relay() -> UpstreamController {
    let breaker = CircuitBreaker::new("cms", CircuitBreakerConfig::default());
    UpstreamController::new(breaker, RetryPolicy::default()).with_sleeper(InstantSleeper)
}

#[tokio::test]
async fn publish_retries_through_transient_outages() {
    let (base_url, cms) = spawn_cms().await;
    let client = CmsClient::new(base_url, Some("test-token".into()));
    let payload = json!({"name": "Hello", "slug": "hello"});

    let created = relay().call(|_| client.publish("posts", &payload)).await.unwrap();

    assert_eq!(cms.calls.load(Ordering::SeqCst), 3);
    assert_eq!(created["id"], "item-1");
    assert_eq!(created["fieldData"]["slug"], "hello");
}

#[tokio::test]
async fn bad_credentials_are_not_retried() {
    let (base_url, cms) = spawn_cms().await;
    let client = CmsClient::new(base_url, Some("wrong".into()));
    let payload = json!({"name": "Hello"});

    let err = relay().call(|_| client.publish("posts", &payload)).await.unwrap_err();

    assert_eq!(cms.calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(!err.user_message().contains("wrong"));
}

#[tokio::test]
async fn validation_errors_come_back_with_fields() {
    let (base_url, _cms) = spawn_cms().await;
    let client = CmsClient::new(base_url, Some("test-token".into()));
    let payload = json!({"slug": "dup"});

    let err = relay().call(|_| client.publish("drafts", &payload)).await.unwrap_err();

    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(err.field_errors()[0].field, "slug");
}
