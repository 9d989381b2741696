//! Route Registry (spec.md §4.4): accumulates scripted route and
//! middleware definitions for a tenant, then mounts them onto a
//! `RouterCore` subtree once the tenant's script has finished executing.

use crate::error::GatewayError;
use crate::router::{middleware_matches, MountedMiddleware, MountedRoute, RouterCore};
use crate::scripting::types::{MiddlewareDefinition, RouteDefinition};
use std::sync::Arc;

/// Mounts one tenant's accumulated definitions onto a fresh `RouterCore`
/// subtree.
///
/// Mounting rules (spec.md §4.4):
/// 1. Middlewares are conceptually bound before routes, so every route sees
///    the full middleware set regardless of registration interleaving.
/// 2. Each route's applicable middlewares are resolved once here (not per
///    request) by `middleware_matches`, preserving registration order.
/// 3. Group prefixes are already folded into `pattern` by the bridge at
///    registration time.
/// 4. Duplicate (method, pattern) registrations are rejected, not silently
///    ignored.
pub fn mount_tenant(
    routes: Vec<RouteDefinition>,
    middlewares: Vec<MiddlewareDefinition>,
) -> Result<RouterCore, GatewayError> {
    let mounted_middlewares: Vec<Arc<MountedMiddleware>> = middlewares
        .into_iter()
        .map(|m| {
            Arc::new(MountedMiddleware {
                pattern: m.pattern,
                script_id: m.script_id,
                function: m.function,
            })
        })
        .collect();

    let mut core = RouterCore::new();

    for route in routes {
        let applicable: Vec<Arc<MountedMiddleware>> = mounted_middlewares
            .iter()
            .filter(|m| middleware_matches(&m.pattern, &route.pattern))
            .cloned()
            .collect();

        core.insert(MountedRoute {
            tenant: route.tenant,
            method: route.method,
            pattern: route.pattern,
            script_id: route.script_id,
            function: route.function,
            middlewares: applicable,
        })?;
    }

    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Dispatch;
    use hyper::Method;

    fn route_def(tenant: &str, method: Method, pattern: &str, script: &str, func: &str) -> RouteDefinition {
        RouteDefinition {
            tenant: tenant.to_string(),
            method,
            pattern: pattern.to_string(),
            script_id: script.to_string(),
            function: func.to_string(),
        }
    }

    fn mw_def(tenant: &str, pattern: &str, script: &str, func: &str) -> MiddlewareDefinition {
        MiddlewareDefinition {
            tenant: tenant.to_string(),
            pattern: pattern.to_string(),
            script_id: script.to_string(),
            function: func.to_string(),
        }
    }

    #[test]
    fn middleware_applies_to_matching_route_only() {
        let routes = vec![
            route_def("a", Method::GET, "/api/users", "s", "users"),
            route_def("a", Method::GET, "/public", "s", "public"),
        ];
        let middlewares = vec![mw_def("a", "/api/*", "s", "auth")];
        let core = mount_tenant(routes, middlewares).unwrap();

        match core.dispatch(&Method::GET, "/api/users") {
            Dispatch::Matched { route, .. } => assert_eq!(route.middlewares.len(), 1),
            _ => panic!("expected match"),
        }
        match core.dispatch(&Method::GET, "/public") {
            Dispatch::Matched { route, .. } => assert!(route.middlewares.is_empty()),
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn duplicate_route_rejected_at_mount() {
        let routes = vec![
            route_def("a", Method::GET, "/x", "s", "f1"),
            route_def("a", Method::GET, "/x", "s", "f2"),
        ];
        assert!(mount_tenant(routes, vec![]).is_err());
    }

    #[test]
    fn middlewares_preserve_registration_order() {
        let routes = vec![route_def("a", Method::GET, "/x", "s", "h")];
        let middlewares = vec![
            mw_def("a", "/*", "s", "first"),
            mw_def("a", "/*", "s", "second"),
        ];
        let core = mount_tenant(routes, middlewares).unwrap();
        match core.dispatch(&Method::GET, "/x") {
            Dispatch::Matched { route, .. } => {
                assert_eq!(route.middlewares[0].function, "first");
                assert_eq!(route.middlewares[1].function, "second");
            }
            _ => panic!("expected match"),
        }
    }
}
