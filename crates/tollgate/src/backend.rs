//! Backend Pool & Health Loop: per-tenant set of upstream backends with a
//! liveness flag, periodic health probing, and thread-safe round-robin
//! selection (spec.md §4.7, §4.8).

use crate::config::ServiceConfig;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A boxed, erased body type so the proxy client can carry either an empty
/// health-probe body or a streamed client request body through the same
/// `hyper_util` client.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub type HttpClient = Client<HttpConnector, BoxBody>;

/// A single upstream backend. Created at startup, destroyed at shutdown.
/// `alive` is the only piece of state a health loop writes and selectors
/// read; both are lock-free (spec.md §5).
pub struct Backend {
    pub name: String,
    pub url: String,
    pub health_path: String,
    tenant: String,
    alive: AtomicBool,
}

impl Backend {
    pub fn new(tenant: &str, service: &ServiceConfig) -> Self {
        Self {
            name: service.name.clone(),
            url: service.url.clone(),
            health_path: service.health.clone(),
            tenant: tenant.to_string(),
            // Unknown state is modeled as `alive = false` until the first probe.
            alive: AtomicBool::new(false),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn set_alive(&self, alive: bool) {
        let was_alive = self.alive.swap(alive, Ordering::AcqRel);
        crate::metrics::BACKEND_ALIVE
            .with_label_values(&[&self.tenant, &self.name])
            .set(alive as i64);
        if was_alive != alive {
            info!(backend = %self.name, alive, "backend liveness changed");
        }
    }

    fn health_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.health_path)
    }
}

/// An ordered, round-robin pool of backends for one tenant.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl BackendPool {
    pub fn new(tenant: &str, services: &[ServiceConfig]) -> Self {
        Self {
            backends: services
                .iter()
                .map(|s| Arc::new(Backend::new(tenant, s)))
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Selects the next alive backend via a lock-free round-robin counter.
    /// Returns `None` only if the pool is empty or every backend is dead
    /// (spec.md §4.7; the fallback handler turns that into a 502).
    pub fn select(&self) -> Option<Arc<Backend>> {
        if self.backends.is_empty() {
            return None;
        }
        let len = self.backends.len();
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = &self.backends[idx];
            if candidate.is_alive() {
                return Some(Arc::clone(candidate));
            }
        }
        None
    }

    /// `K/N healthy` summary for the admin `/health` endpoint (spec.md §6).
    pub fn health_summary(&self) -> (usize, usize) {
        let alive = self.backends.iter().filter(|b| b.is_alive()).count();
        (alive, self.backends.len())
    }
}

/// Spawns one health-probing loop per backend. Each loop sleeps against a
/// monotonic clock (`tokio::time::interval`) so it tolerates wall-clock
/// skew (spec.md §4.8), probes with a short timeout, and flips `alive`
/// based on whether the response was 2xx.
pub fn spawn_health_loops(
    pool: Arc<BackendPool>,
    interval: Duration,
    client: HttpClient,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for backend in pool.backends().iter().cloned() {
        let client = client.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe_once(&backend, &client).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }
    handles
}

async fn probe_once(backend: &Arc<Backend>, client: &HttpClient) {
    let url = backend.health_url();
    let req = match hyper::Request::builder()
        .method(hyper::Method::GET)
        .uri(&url)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
    {
        Ok(req) => req,
        Err(e) => {
            warn!(backend = %backend.name, error = %e, "failed to build health probe request");
            backend.set_alive(false);
            return;
        }
    };

    match tokio::time::timeout(Duration::from_secs(3), client.request(req)).await {
        Ok(Ok(resp)) => {
            // Drain the body so the connection can be reused by the pool.
            let alive = resp.status().is_success();
            let _ = resp.into_body().collect().await;
            backend.set_alive(alive);
        }
        Ok(Err(e)) => {
            warn!(backend = %backend.name, error = %e, "health probe failed");
            backend.set_alive(false);
        }
        Err(_) => {
            warn!(backend = %backend.name, "health probe timed out");
            backend.set_alive(false);
        }
    }
}

pub fn shared_http_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            url: format!("http://{name}"),
            health: "/health".to_string(),
        }
    }

    #[test]
    fn empty_pool_selects_none() {
        let pool = BackendPool::new("t", &[]);
        assert!(pool.select().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn all_dead_selects_none() {
        let pool = BackendPool::new("t", &[svc("a"), svc("b")]);
        assert!(pool.select().is_none());
    }

    #[test]
    fn round_robin_skips_dead_backends() {
        let pool = BackendPool::new("t", &[svc("a"), svc("b"), svc("c")]);
        pool.backends()[1].set_alive(true);
        for _ in 0..5 {
            assert_eq!(pool.select().unwrap().name, "b");
        }
    }

    #[test]
    fn round_robin_cycles_over_alive_backends() {
        let pool = BackendPool::new("t", &[svc("a"), svc("b")]);
        pool.backends()[0].set_alive(true);
        pool.backends()[1].set_alive(true);
        let first = pool.select().unwrap().name.clone();
        let second = pool.select().unwrap().name.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn health_summary_counts_alive() {
        let pool = BackendPool::new("t", &[svc("a"), svc("b"), svc("c")]);
        pool.backends()[0].set_alive(true);
        pool.backends()[1].set_alive(true);
        assert_eq!(pool.health_summary(), (2, 3));
    }
}
