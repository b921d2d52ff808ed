use std::task::{Context, Poll};

use axum::extract::MatchedPath;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::Request;
use tower_layer::Layer;
use tower_service::Service;

use crate::error::RelayError;
use crate::identity::ClientIdentity;
use crate::rate_limit::{Admission, AdmissionController};
use crate::response::apply_quota_headers;
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, PolicyEvent};

/// A layer that gates requests through an [`AdmissionController`].
///
/// The route policy is looked up by the matched route when the layer is installed with
/// `route_layer`, otherwise by the URI path.
#[derive(Clone, Debug)]
pub struct RateLimitLayer<K = NullSink> {
    controller: AdmissionController,
    sink: K,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(controller: AdmissionController) -> Self {
        Self { controller, sink: NullSink }
    }
}

impl<K> RateLimitLayer<K> {
    /// Emit admission events into `sink`.
    pub fn with_sink<K2>(self, sink: K2) -> RateLimitLayer<K2> {
        RateLimitLayer { controller: self.controller, sink }
    }
}

impl<S, K: Clone> Layer<S> for RateLimitLayer<K> {
    type Service = RateLimitService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, controller: self.controller.clone(), sink: self.sink.clone() }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone, Debug)]
pub struct RateLimitService<S, K = NullSink> {
    inner: S,
    controller: AdmissionController,
    sink: K,
}

impl<S, K, B> Service<Request<B>> for RateLimitService<S, K>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    K: Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    K::Error: std::error::Error + Send + 'static,
    K::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let client = ClientIdentity::from_request(&req);
        let route = match req.extensions().get::<MatchedPath>() {
            Some(matched) => matched.as_str().to_owned(),
            None => req.uri().path().to_owned(),
        };
        let admission = self.controller.admit(client.as_str(), Some(&route));

        // Keep the service that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let sink = self.sink.clone();

        Box::pin(async move {
            match admission {
                Admission::Exempt | Admission::Unlimited => inner.call(req).await,
                Admission::Allowed(decision) => {
                    let event = AdmissionEvent::Allowed {
                        policy: decision.policy.to_string(),
                        remaining: decision.remaining,
                    };
                    emit_best_effort(sink, PolicyEvent::Admission(event)).await;
                    let mut response = inner.call(req).await?;
                    apply_quota_headers(response.headers_mut(), &decision);
                    Ok(response)
                }
                Admission::Denied { rejection, .. } => {
                    let event = AdmissionEvent::Denied {
                        policy: rejection.policy.clone(),
                        retry_after_secs: rejection.retry_after_secs,
                    };
                    emit_best_effort(sink, PolicyEvent::Admission(event)).await;
                    Ok(RelayError::RateLimited(rejection).into_response())
                }
            }
        })
    }
}
