use crate::{
    auth::{Auth, AuthError},
    metrics::HttpMetrics,
    Body,
};
use bytes::Bytes;
use futures::future;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde::Serialize;
use std::{convert::Infallible, sync::Arc};
use tenant_controller_core::{function::function_key, FunctionMeta, TenantPlan};
use tenant_controller_log::Producer;
use tenant_controller_store::{SharedStore, WriteError, Writer};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

/// The tenant management API.
///
/// Tenant plans are served from, and written through, the tenant store. Function metadata is
/// served from the function store, which is read-only here.
pub struct Api<P> {
    tenants: Arc<Writer<P, TenantPlan>>,
    functions: SharedStore<FunctionMeta>,
    auth: Auth,
    in_flight: Arc<Semaphore>,
    metrics: HttpMetrics,
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Tenants,
    Tenant(&'a str),
    Functions(&'a str),
    Function {
        tenant: &'a str,
        namespace: &'a str,
        name: &'a str,
    },
}

/// Request bodies are buffered in full before they are decoded.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// === impl Api ===

impl<P: Producer> Api<P> {
    pub fn new(
        tenants: Writer<P, TenantPlan>,
        functions: SharedStore<FunctionMeta>,
        auth: Auth,
        max_concurrent_requests: usize,
        metrics: HttpMetrics,
    ) -> Self {
        Self {
            tenants: Arc::new(tenants),
            functions,
            auth,
            in_flight: Arc::new(Semaphore::new(max_concurrent_requests)),
            metrics,
        }
    }

    /// Serves a request whose body has been read in full.
    pub async fn handle(&self, req: Request<Bytes>) -> Response<Body> {
        let Some(_permit) = self.admit(&req) else {
            return error_response(StatusCode::TOO_MANY_REQUESTS, "too many requests");
        };
        self.serve(req).await
    }

    /// Takes an in-flight slot for `req`, if one is free.
    fn admit<B>(&self, req: &Request<B>) -> Option<OwnedSemaphorePermit> {
        let permit = self.in_flight.clone().try_acquire_owned().ok();
        if permit.is_none() {
            warn!(method = %req.method(), path = %req.uri().path(), "Too many requests in flight");
        }
        permit
    }

    async fn serve(&self, req: Request<Bytes>) -> Response<Body> {
        trace!(?req);
        let Some(route) = Route::parse(req.uri().path()) else {
            return error_response(StatusCode::NOT_FOUND, "not found");
        };

        let observer = self.metrics.start(route.name(), req.method());
        let rsp = self.route(route, &req).await;
        debug!(status = %rsp.status());
        observer.end(rsp.status());
        rsp
    }

    async fn route(&self, route: Route<'_>, req: &Request<Bytes>) -> Response<Body> {
        if !route.allows(req.method()) {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let principal = match self.auth.authenticate(req.headers()) {
            Ok(principal) => principal,
            Err(error) => return auth_error(error),
        };
        let authorized = match (&route, req.method()) {
            (Route::Tenants, _) => principal.require_super(),
            (Route::Tenant(_), m) if *m != Method::GET => principal.require_super(),
            (Route::Tenant(tenant), _)
            | (Route::Functions(tenant), _)
            | (Route::Function { tenant, .. }, _) => principal.require_tenant(tenant),
        };
        if let Err(error) = authorized {
            return auth_error(error);
        }

        match route {
            Route::Tenants => {
                let mut plans = self.tenants.store().list();
                plans.sort_by(|a, b| a.name.cmp(&b.name));
                json_response(StatusCode::OK, &plans)
            }

            Route::Tenant(tenant) => match *req.method() {
                Method::GET => match self.tenants.store().get(tenant) {
                    Some(plan) => json_response(StatusCode::OK, &plan),
                    None => error_response(StatusCode::NOT_FOUND, &format!("{tenant} not found")),
                },
                Method::DELETE => write_response(self.tenants.delete(tenant).await),
                _ => {
                    let requested = match serde_json::from_slice::<TenantPlan>(req.body()) {
                        Ok(plan) => plan,
                        Err(error) => {
                            warn!(%tenant, %error, "Failed to parse tenant plan");
                            return error_response(StatusCode::BAD_REQUEST, &error.to_string());
                        }
                    };
                    write_response(self.tenants.write(tenant, requested).await)
                }
            },

            Route::Functions(tenant) => {
                let mut functions = self
                    .functions
                    .list()
                    .into_iter()
                    .filter(|f| f.tenant == tenant)
                    .collect::<Vec<_>>();
                functions.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
                json_response(StatusCode::OK, &functions)
            }

            Route::Function {
                tenant,
                namespace,
                name,
            } => {
                let key = function_key(tenant, namespace, name);
                match self.functions.get(&key) {
                    Some(function) => json_response(StatusCode::OK, &function),
                    None => error_response(StatusCode::NOT_FOUND, &format!("{key} not found")),
                }
            }
        }
    }
}

impl<P> Clone for Api<P> {
    fn clone(&self) -> Self {
        Self {
            tenants: self.tenants.clone(),
            functions: self.functions.clone(),
            auth: self.auth.clone(),
            in_flight: self.in_flight.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<P, B> tower::Service<Request<B>> for Api<P>
where
    P: Producer,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Infallible>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let api = self.clone();
        Box::pin(async move {
            // The slot is taken before the body is read so that the limit bounds buffered bodies.
            let Some(_permit) = api.admit(&req) else {
                return Ok(error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "too many requests",
                ));
            };

            let (parts, body) = req.into_parts();
            let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
                Ok(body) => body.to_bytes(),
                Err(error) if error.is::<LengthLimitError>() => {
                    warn!(limit = MAX_BODY_BYTES, "Request body is too large");
                    return Ok(error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "request body is too large",
                    ));
                }
                Err(error) => {
                    warn!(%error, "Failed to read request body");
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        "failed to read request body",
                    ));
                }
            };
            Ok(api.serve(Request::from_parts(parts, body)).await)
        })
    }
}

// === impl Route ===

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Option<Self> {
        let segments = path.strip_prefix("/k/")?.split('/').collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        match segments[..] {
            ["tenants"] => Some(Self::Tenants),
            ["tenant", tenant] => Some(Self::Tenant(tenant)),
            ["functions", tenant] => Some(Self::Functions(tenant)),
            ["function", tenant, namespace, name] => Some(Self::Function {
                tenant,
                namespace,
                name,
            }),
            _ => None,
        }
    }

    fn allows(&self, method: &Method) -> bool {
        match self {
            Self::Tenant(_) => matches!(
                *method,
                Method::GET | Method::POST | Method::PUT | Method::DELETE
            ),
            _ => *method == Method::GET,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Tenants => "tenants",
            Self::Tenant(_) => "tenant",
            Self::Functions(_) => "functions",
            Self::Function { .. } => "function",
        }
    }
}

fn write_response(res: Result<TenantPlan, WriteError>) -> Response<Body> {
    let error = match res {
        Ok(plan) => return json_response(StatusCode::OK, &plan),
        Err(error) => error,
    };
    let status = match error {
        WriteError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WriteError::NotFound(_) => StatusCode::NOT_FOUND,
        WriteError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        WriteError::Transport(_) | WriteError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &error.to_string())
}

fn auth_error(error: AuthError) -> Response<Body> {
    debug!(%error, "Unauthorized");
    error_response(StatusCode::UNAUTHORIZED, &error.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("json response must be valid"),
        Err(error) => {
            warn!(%error, "Failed to encode response");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::default())
                .expect("error response must be valid")
        }
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response<Body> {
    json_response(
        status,
        &ErrorBody {
            error: msg.to_string(),
        },
    )
}
