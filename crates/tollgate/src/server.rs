//! ProxyServer: the accept loop and per-request dispatch pipeline, tying
//! together the Tenant Matcher, Router Core, scripting engine, and reverse
//! proxy (spec.md §2 "Data flow (request)").

use crate::backend::{BackendPool, HttpClient};
use crate::error::GatewayError;
use crate::proxy::{self, BoxBody};
use crate::router::{self, Dispatch, MountedRoute};
use crate::scripting::{new_request_snapshot, ScriptEngine};
use crate::tenant::TenantMatcher;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Everything the per-request dispatch pipeline needs, built once at
/// startup and shared read-only across requests (spec.md §5: "the Router
/// tree is read-only after startup").
pub struct GatewayState {
    pub tenant_matcher: TenantMatcher,
    pub tenant_routers: HashMap<String, crate::router::RouterCore>,
    pub backend_pools: HashMap<String, Arc<BackendPool>>,
    pub script_engine: Arc<ScriptEngine>,
    pub http_client: HttpClient,
    pub request_timeout: Duration,
    pub started_at: Instant,
}

pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<GatewayState>,
}

impl ProxyServer {
    /// Binds a `SO_REUSEADDR` listener immediately, so a bind failure (e.g.
    /// port already in use) surfaces to the caller before any other startup
    /// work happens, and so tests can bind an ephemeral port (`:0`) and read
    /// back the address that was actually assigned.
    pub fn bind(addr: SocketAddr, state: Arc<GatewayState>) -> anyhow::Result<Self> {
        let listener = bind_reusable(addr)?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` signals true, draining in-flight
    /// connections (spec.md §5 "Shutdown cancels all health loops and
    /// drains in-flight requests").
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self.listener;
        info!(addr = ?listener.local_addr(), "tollgate listening");

        let state = self.state;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = accepted?;
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { handle_request(state, req).await }
                        });
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            error!(%remote, error = %err, "connection error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signal received, no longer accepting connections");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn bind_reusable(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn handle_request(
    state: Arc<GatewayState>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    Ok(dispatch(state, req).await.unwrap_or_else(error_response))
}

async fn dispatch(
    state: Arc<GatewayState>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, GatewayError> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = req.uri().path().to_string();

    let tenant = state
        .tenant_matcher
        .resolve(&host, &path)
        .ok_or(GatewayError::NoTenantMatch)?
        .clone();

    let router = state
        .tenant_routers
        .get(&tenant.name)
        .ok_or(GatewayError::NoTenantMatch)?;

    // Scripted routes are registered relative to the tenant subtree, so the
    // tenant's path prefix must be stripped before matching against them
    // (spec.md §4.4), the same way the fallback proxy strips it before
    // forwarding (`proxy::rewrite_request`).
    let routed_path = router::strip_tenant_prefix(&path, tenant.path_prefix.as_deref());

    match router.dispatch(req.method(), &routed_path) {
        Dispatch::Matched { route, params } => {
            crate::metrics::DISPATCH_TOTAL
                .with_label_values(&[&tenant.name, "matched"])
                .inc();
            run_scripted_route(state, req, route, params).await
        }
        Dispatch::MethodNotAllowed => {
            crate::metrics::DISPATCH_TOTAL
                .with_label_values(&[&tenant.name, "method_not_allowed"])
                .inc();
            Ok(plain_status_response(StatusCode::METHOD_NOT_ALLOWED))
        }
        Dispatch::NotFound => {
            crate::metrics::DISPATCH_TOTAL
                .with_label_values(&[&tenant.name, "fallback"])
                .inc();
            fallback(state, req, &tenant.name, tenant.path_prefix.as_deref()).await
        }
    }
}

fn plain_status_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("status-only response is always valid")
}

fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// Parses a raw query string into a flat map, last-value-wins on repeated
/// keys (the Bridge's `req.query[k]` accessor, spec.md §4.3, is a plain
/// table and has no multi-value representation).
fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((
                urlencoding::decode(key).ok()?.into_owned(),
                urlencoding::decode(value).ok()?.into_owned(),
            ))
        })
        .collect()
}

/// Executes the scripted handler (with its resolved middleware chain) for a
/// matched route.
async fn run_scripted_route(
    state: Arc<GatewayState>,
    req: Request<Incoming>,
    route: Arc<MountedRoute>,
    params: HashMap<String, String>,
) -> Result<Response<BoxBody>, GatewayError> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let url = req.uri().to_string();
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut headers = HashMap::new();
    for (k, v) in req.headers() {
        if let Ok(v) = v.to_str() {
            headers.insert(k.as_str().to_string(), v.to_string());
        }
    }

    let query: HashMap<String, String> = req.uri().query().map(parse_query).unwrap_or_default();

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| GatewayError::UpstreamError(e.to_string()))?
        .to_bytes()
        .to_vec();

    let snapshot = new_request_snapshot(
        method,
        path,
        url,
        host,
        headers,
        query,
        params,
        body,
        MAX_REQUEST_BODY_BYTES,
    );

    let middlewares: Vec<(String, String)> = route
        .middlewares
        .iter()
        .map(|m| (m.script_id.clone(), m.function.clone()))
        .collect();

    let result = state
        .script_engine
        .invoke(
            &route.script_id,
            &route.function,
            &middlewares,
            state.request_timeout,
            snapshot,
        )
        .await?;

    let mut builder = Response::builder().status(
        StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (k, v) in result.headers {
        builder = builder.header(k, v);
    }
    let body = Full::new(Bytes::from(result.body))
        .map_err(|never| match never {})
        .boxed();
    builder
        .body(body)
        .map_err(|e| GatewayError::UpstreamError(e.to_string()))
}

/// Fallback Handler (spec.md §4.9): select a backend, proxy the request.
async fn fallback(
    state: Arc<GatewayState>,
    req: Request<Incoming>,
    tenant: &str,
    tenant_prefix: Option<&str>,
) -> Result<Response<BoxBody>, GatewayError> {
    let pool = state
        .backend_pools
        .get(tenant)
        .ok_or_else(|| GatewayError::NoBackendAvailable {
            tenant: tenant.to_string(),
        })?;

    let backend = pool.select().ok_or_else(|| GatewayError::NoBackendAvailable {
        tenant: tenant.to_string(),
    })?;

    proxy::forward(&state.http_client, req, &backend, tenant_prefix, state.request_timeout).await
}

fn error_response(err: GatewayError) -> Response<BoxBody> {
    let status = if proxy::is_timeout(&err) {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        err.status_code()
    };
    error!(error = %err, status = %status, "request failed");
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(status.to_string())).map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| {
            Response::new(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        })
}
