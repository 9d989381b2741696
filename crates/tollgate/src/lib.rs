//! Tollgate: a multi-tenant reverse-proxy gateway whose routing and
//! middleware are defined by embedded Lua scripts. The binary in
//! `src/main.rs` is a thin CLI wrapper around this library; integration
//! tests drive the same `bootstrap`/`ProxyServer` path the binary uses.

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod scripting;
pub mod server;
pub mod shutdown;
pub mod tenant;

use config::Config;
use scripting::ScriptEngine;
use server::{GatewayState, ProxyServer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Distinguishes the two startup failure modes the binary maps to exit
/// codes 1 and 2 (spec.md §6): everything up to and including script
/// discovery/route mounting is a `Config` failure, the final listener
/// bind is a `Bind` failure.
pub enum BootstrapError {
    Config(anyhow::Error),
    Bind(anyhow::Error),
}

/// A gateway bootstrapped from config but not yet accepting connections:
/// the script discovery, tenant mounting, and health-loop spawning from
/// spec.md §2 "Data flow (startup)", separated out from `ProxyServer::run`
/// so tests can bind an ephemeral port before serving.
pub struct Bootstrapped {
    pub server: ProxyServer,
    pub state: Arc<GatewayState>,
    pub shutdown_rx: watch::Receiver<bool>,
    health_handles: Vec<JoinHandle<()>>,
}

impl Bootstrapped {
    /// Runs the accept loop until a shutdown signal arrives, waits out
    /// `drain_grace` so requests already dispatched to the script engine or
    /// backend pool can finish, then tears down the health loops and
    /// interpreter pool (spec.md §5 "shutdown cancels all health loops and
    /// drains in-flight requests").
    pub async fn run(self, drain_grace: Duration) -> anyhow::Result<()> {
        let result = self.server.run(self.shutdown_rx).await;
        shutdown::drain(drain_grace).await;
        for handle in self.health_handles {
            handle.abort();
        }
        self.state.script_engine.close_pool();
        result
    }
}

/// Discovers scripts, mounts every tenant's router, spawns health loops,
/// and binds the listener — everything in spec.md §2 up to (but not
/// including) serving connections. Returns `Err` for either a bad
/// config/script/route ("startup failure", exit code 1 in the binary) or
/// a bind failure (exit code 2), distinguished by the `BootstrapError`
/// variant.
pub async fn bootstrap(config: Config, shutdown_rx: watch::Receiver<bool>) -> Result<Bootstrapped, BootstrapError> {
    let script_engine = Arc::new(ScriptEngine::new(
        config.scripts_dir.clone(),
        config.script_pool.size,
        config.script_pool.max_burst,
        Duration::from_millis(config.script_pool.acquire_timeout_ms),
    ));
    script_engine.discover().map_err(|e| BootstrapError::Config(e.into()))?;

    let http_client = backend::shared_http_client();

    let mut tenant_routers = HashMap::new();
    let mut backend_pools = HashMap::new();
    let mut health_handles = Vec::new();

    for tenant in &config.tenants {
        let (routes, middlewares) = match &tenant.script {
            Some(script_id) => match script_engine.load_tenant_script(&tenant.name, script_id).await {
                Ok(definitions) => definitions,
                // spec.md §7: a script that fails to compile (or raises
                // while its top-level body is registering routes) is
                // non-fatal — it is omitted and the tenant falls through to
                // reverse-proxy-only behavior, rather than aborting startup.
                Err(error::GatewayError::ScriptParseError { id, source }) => {
                    warn!(tenant = %tenant.name, script = %id, error = %source, "script failed to parse, tenant falls back to reverse-proxy only");
                    (Vec::new(), Vec::new())
                }
                Err(error::GatewayError::ScriptRuntimeError { id, source }) => {
                    warn!(tenant = %tenant.name, script = %id, error = %source, "script raised while registering routes, tenant falls back to reverse-proxy only");
                    (Vec::new(), Vec::new())
                }
                Err(e) => return Err(BootstrapError::Config(e.into())),
            },
            // A tenant with no script has no scripted routes at all; every
            // request falls through to the reverse proxy (spec.md §1).
            None => (Vec::new(), Vec::new()),
        };

        let router = registry::mount_tenant(routes, middlewares).map_err(|e| BootstrapError::Config(e.into()))?;
        let route_count = router.route_count();
        tenant_routers.insert(tenant.name.clone(), router);

        let pool = Arc::new(backend::BackendPool::new(&tenant.name, &tenant.services));
        health_handles.extend(backend::spawn_health_loops(
            Arc::clone(&pool),
            Duration::from_secs(tenant.health_interval),
            http_client.clone(),
            shutdown_rx.clone(),
        ));
        backend_pools.insert(tenant.name.clone(), pool);

        info!(tenant = %tenant.name, routes = route_count, backends = tenant.services.len(), "tenant mounted");
    }

    let tenant_matcher = tenant::TenantMatcher::new(config.tenants.clone());

    let state = Arc::new(GatewayState {
        tenant_matcher,
        tenant_routers,
        backend_pools,
        script_engine: Arc::clone(&script_engine),
        http_client,
        request_timeout: Duration::from_secs(config.request_timeout_secs),
        started_at: Instant::now(),
    });

    let addr: SocketAddr = format!("{}:{}", config.listen.address, config.listen.port)
        .parse()
        .map_err(|e| BootstrapError::Config(anyhow::anyhow!("invalid listen address: {e}")))?;

    let server = ProxyServer::bind(addr, Arc::clone(&state)).map_err(BootstrapError::Bind)?;

    Ok(Bootstrapped {
        server,
        state,
        shutdown_rx,
        health_handles,
    })
}
