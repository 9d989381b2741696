//! Router Core: HTTP method + path-pattern matching with named URL
//! parameters and a trailing wildcard, built on `matchit`'s radix trie
//! (spec.md §4.5). One `RouterCore` is mounted per tenant subtree.

use crate::error::GatewayError;
use hyper::Method;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A scripted handler bound to the router, carrying the middlewares that
/// apply to it in registration order (resolved once, at mount time, per
/// spec.md §4.4 rule 2 — not recomputed per request).
#[derive(Debug, Clone)]
pub struct MountedRoute {
    pub tenant: String,
    pub method: Method,
    pub pattern: String,
    pub script_id: String,
    pub function: String,
    pub middlewares: Vec<Arc<MountedMiddleware>>,
}

#[derive(Debug, Clone)]
pub struct MountedMiddleware {
    pub pattern: String,
    pub script_id: String,
    pub function: String,
}

pub enum Dispatch {
    Matched {
        route: Arc<MountedRoute>,
        params: HashMap<String, String>,
    },
    MethodNotAllowed,
    NotFound,
}

const WILDCARD_PARAM: &str = "__tollgate_wildcard";

/// Translates a spec.md route pattern (`{name}` segment captures, optional
/// trailing `*`) into matchit's own (coincidentally identical) `{name}`
/// syntax, naming the trailing wildcard capture internally.
pub fn to_matchit_pattern(pattern: &str) -> String {
    match pattern.strip_suffix('*') {
        Some(stripped) => format!("{stripped}{{*{WILDCARD_PARAM}}}"),
        None => pattern.to_string(),
    }
}

/// Strips a tenant's path prefix from an incoming path before it is matched
/// against that tenant's mounted routes: scripted routes are registered
/// relative to the tenant subtree (spec.md §4.4, "mounts them onto the
/// Router Core under a tenant subtree at the tenant's path prefix"), so the
/// prefix itself must not be part of what the router sees. Falls back to
/// `/` if stripping would empty the path, mirroring the fallback proxy's own
/// prefix-stripping (`proxy::rewrite_request`).
pub fn strip_tenant_prefix(path: &str, prefix: Option<&str>) -> String {
    match prefix {
        Some(prefix) if path.starts_with(prefix) => {
            let rest = &path[prefix.len()..];
            if rest.is_empty() {
                "/".to_string()
            } else if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            }
        }
        _ => path.to_string(),
    }
}

/// Per-tenant-subtree router: one `matchit::Router` per HTTP method, plus a
/// shadow router over the union of all methods' patterns used only to
/// distinguish 404 (no path matches) from 405 (path matches, method
/// doesn't).
pub struct RouterCore {
    by_method: HashMap<Method, matchit::Router<Arc<MountedRoute>>>,
    known_paths: matchit::Router<()>,
    registered: HashSet<(Method, String)>,
}

impl Default for RouterCore {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterCore {
    pub fn new() -> Self {
        Self {
            by_method: HashMap::new(),
            known_paths: matchit::Router::new(),
            registered: HashSet::new(),
        }
    }

    /// Inserts a route. Fails with `RouteConflict` if `(method, pattern)`
    /// was already registered for this subtree (spec.md §3 invariant).
    pub fn insert(&mut self, route: MountedRoute) -> Result<(), GatewayError> {
        let key = (route.method.clone(), route.pattern.clone());
        if self.registered.contains(&key) {
            return Err(GatewayError::RouteConflict {
                tenant: route.tenant.clone(),
                method: route.method.to_string(),
                pattern: route.pattern.clone(),
            });
        }

        let matchit_pattern = to_matchit_pattern(&route.pattern);
        let router = self.by_method.entry(route.method.clone()).or_default();
        router
            .insert(matchit_pattern.clone(), Arc::new(route.clone()))
            .map_err(|e| GatewayError::ConfigInvalid(format!("bad route pattern: {e}")))?;

        // Best-effort: only used for 404-vs-405 disambiguation, so ignore a
        // conflict here (a different method may share the exact pattern).
        let _ = self.known_paths.insert(matchit_pattern, ());

        self.registered.insert(key);
        Ok(())
    }

    /// Number of distinct (method, pattern) routes mounted, for the admin
    /// `/tenants` summary (spec.md §6).
    pub fn route_count(&self) -> usize {
        self.registered.len()
    }

    pub fn dispatch(&self, method: &Method, path: &str) -> Dispatch {
        let effective_method = if method == Method::HEAD {
            &Method::GET
        } else {
            method
        };

        match self.by_method.get(effective_method) {
            Some(router) => match router.at(path) {
                Ok(matched) => {
                    let mut params = HashMap::new();
                    for (k, v) in matched.params.iter() {
                        if k != WILDCARD_PARAM {
                            params.insert(k.to_string(), v.to_string());
                        }
                    }
                    Dispatch::Matched {
                        route: Arc::clone(matched.value),
                        params,
                    }
                }
                Err(_) => {
                    if self.known_paths.at(path).is_ok() {
                        Dispatch::MethodNotAllowed
                    } else {
                        Dispatch::NotFound
                    }
                }
            },
            None => {
                if self.known_paths.at(path).is_ok() {
                    Dispatch::MethodNotAllowed
                } else {
                    Dispatch::NotFound
                }
            }
        }
    }
}

/// Middleware pattern match per spec.md §4.4 rule 2: exact match, suffix-`*`
/// wildcard, or strict segment-boundary prefix.
pub fn middleware_matches(middleware_pattern: &str, route_pattern: &str) -> bool {
    if middleware_pattern == route_pattern {
        return true;
    }

    if let Some(prefix) = middleware_pattern.strip_suffix('*') {
        return route_pattern.starts_with(prefix);
    }

    is_segment_prefix(middleware_pattern, route_pattern)
}

fn is_segment_prefix(prefix: &str, full: &str) -> bool {
    if !full.starts_with(prefix) {
        return false;
    }
    if prefix.len() == full.len() {
        return true;
    }
    // Must land exactly on a segment boundary: prefix must end in '/' or
    // the next char in `full` must be '/'.
    prefix.ends_with('/') || full.as_bytes()[prefix.len()] == b'/'
}
