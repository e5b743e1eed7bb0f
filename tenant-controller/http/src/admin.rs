use crate::Body;
use futures::future;
use http::{header, Method, Request, Response, StatusCode};
use prometheus_client::registry::Registry;
use std::{convert::Infallible, sync::Arc};
use tenant_controller_store::State;
use tokio::sync::watch;

/// Serves liveness, readiness and metrics.
#[derive(Clone)]
pub struct Admin {
    ready: Readiness,
    registry: Arc<Registry>,
}

/// The process is ready once every supervised consumer is running and every store has caught up
/// with its topic.
#[derive(Clone, Debug, Default)]
pub struct Readiness(Vec<Materialized>);

#[derive(Clone, Debug)]
struct Materialized {
    consumer: watch::Receiver<State>,
    synced: watch::Receiver<bool>,
}

// === impl Admin ===

impl Admin {
    pub fn new(ready: Readiness, registry: Registry) -> Self {
        Self {
            ready,
            registry: Arc::new(registry),
        }
    }

    fn handle(&self, method: &Method, path: &str) -> Response<Body> {
        if !matches!(*method, Method::GET | Method::HEAD) {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Body::default())
                .expect("method not allowed response must be valid");
        }

        match path {
            "/live" => text(StatusCode::OK, "live\n"),
            "/ready" if self.ready.is_ready() => text(StatusCode::OK, "ready\n"),
            "/ready" => text(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n"),
            "/metrics" => self.metrics(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("not found response must be valid"),
        }
    }

    fn metrics(&self) -> Response<Body> {
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.registry) {
            tracing::error!(%error, "Failed to encode metrics");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n");
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Body::from(buf))
            .expect("metrics response must be valid")
    }
}

impl<B> tower::Service<Request<B>> for Admin {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::Ready<Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Infallible>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        future::ok(self.handle(req.method(), req.uri().path()))
    }
}

// === impl Readiness ===

impl Readiness {
    /// Gates readiness on a store, given its consumer's state and its synced flag.
    pub fn with_store(
        mut self,
        consumer: watch::Receiver<State>,
        synced: watch::Receiver<bool>,
    ) -> Self {
        self.0.push(Materialized { consumer, synced });
        self
    }

    pub fn is_ready(&self) -> bool {
        self.0
            .iter()
            .all(|m| m.consumer.borrow().is_running() && *m.synced.borrow())
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(body))
        .expect("text response must be valid")
}
