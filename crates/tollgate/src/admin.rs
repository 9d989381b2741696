//! Admin hooks (spec.md §6): assembles the JSON payloads an external HTTP
//! framework mounts at `/health` and `/tenants`. Serving them over HTTP,
//! authenticating the admin surface, and choosing the mount path are all
//! out of scope here — this module only computes the bodies.

use crate::server::GatewayState;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub tenants: HashMap<String, String>,
    pub uptime_seconds: u64,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TenantsBody {
    pub tenants: Vec<TenantSummary>,
}

#[derive(Debug, Serialize)]
pub struct TenantSummary {
    pub name: String,
    pub domains: Vec<String>,
    pub path_prefix: Option<String>,
    pub route_count: usize,
    pub backend_health: String,
}

/// Assembles the admin JSON bodies from live gateway state. Named after the
/// teacher's read-only status-reporting helpers; holds no state of its own.
pub struct AdminSnapshot;

impl AdminSnapshot {
    pub fn health(state: &GatewayState) -> HealthBody {
        let mut tenants = HashMap::new();
        for tenant in state.tenant_matcher.tenants() {
            let summary = match state.backend_pools.get(&tenant.name) {
                Some(pool) => {
                    let (alive, total) = pool.health_summary();
                    format!("{alive}/{total}")
                }
                None => "0/0".to_string(),
            };
            tenants.insert(tenant.name.clone(), summary);
        }

        HealthBody {
            status: if tenants.values().all(|s| !s.starts_with('0') || s == "0/0") {
                "ok"
            } else {
                "degraded"
            },
            tenants,
            uptime_seconds: state.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn tenants(state: &GatewayState) -> TenantsBody {
        let tenants = state
            .tenant_matcher
            .tenants()
            .iter()
            .map(|tenant| {
                let route_count = state
                    .tenant_routers
                    .get(&tenant.name)
                    .map(|r| r.route_count())
                    .unwrap_or(0);
                let backend_health = match state.backend_pools.get(&tenant.name) {
                    Some(pool) => {
                        let (alive, total) = pool.health_summary();
                        format!("{alive}/{total}")
                    }
                    None => "0/0".to_string(),
                };
                TenantSummary {
                    name: tenant.name.clone(),
                    domains: tenant.domains.clone(),
                    path_prefix: tenant.path_prefix.clone(),
                    route_count,
                    backend_health,
                }
            })
            .collect();

        TenantsBody { tenants }
    }
}
