//! Tenant Matcher: maps an incoming (host, path) to a tenant scope with the
//! priority rules from spec.md §4.6.
//!
//! Priority, highest first:
//!   1. Hybrid (host match AND path-prefix match): longest prefix wins,
//!      ties broken by registration order.
//!   2. Host-only (host match, tenant has no prefix).
//!   3. Path-only (tenant has no hosts, path-prefix match): longest prefix
//!      wins.
//!   4. No match.

use crate::config::Tenant;

/// Resolves (host, path) pairs to a tenant index, deterministically and
/// totally (spec.md §3 invariant: unique tenant or none).
pub struct TenantMatcher {
    tenants: Vec<Tenant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Hybrid,
    HostOnly,
    PathOnly,
}

impl TenantMatcher {
    pub fn new(tenants: Vec<Tenant>) -> Self {
        Self { tenants }
    }

    pub fn tenants(&self) -> &[Tenant] {
        &self.tenants
    }

    pub fn get(&self, name: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.name == name)
    }

    /// Resolves the tenant for a request, or `None` for a 404 (spec.md §4.6).
    pub fn resolve(&self, host: &str, path: &str) -> Option<&Tenant> {
        let host = strip_port(host).to_ascii_lowercase();

        let mut best: Option<(Kind, usize, &Tenant)> = None;

        for tenant in &self.tenants {
            let host_matches = !tenant.domains.is_empty()
                && tenant
                    .domains
                    .iter()
                    .any(|d| d.to_ascii_lowercase() == host);

            let (kind, prefix_len) = match (&tenant.path_prefix, host_matches) {
                (Some(prefix), true) => {
                    if !path_starts_with_prefix(path, prefix) {
                        continue;
                    }
                    (Kind::Hybrid, prefix.len())
                }
                (None, true) => (Kind::HostOnly, 0),
                (Some(prefix), false) => {
                    if !tenant.domains.is_empty() {
                        // Tenant has hosts but none matched: disqualified,
                        // even though it has a prefix (hosts are a hard filter).
                        continue;
                    }
                    if !path_starts_with_prefix(path, prefix) {
                        continue;
                    }
                    (Kind::PathOnly, prefix.len())
                }
                (None, false) => continue,
            };

            let better = match &best {
                None => true,
                Some((best_kind, best_len, _)) => {
                    rank(kind) > rank(*best_kind)
                        || (rank(kind) == rank(*best_kind) && prefix_len > *best_len)
                }
            };

            if better {
                best = Some((kind, prefix_len, tenant));
            }
        }

        best.map(|(_, _, t)| t)
    }
}

fn rank(kind: Kind) -> u8 {
    match kind {
        Kind::Hybrid => 2,
        Kind::HostOnly => 1,
        Kind::PathOnly => 0,
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

/// Path comparison is exact-byte up to segment boundaries: `/api` must not
/// match a tenant prefix of `/apiextra/`.
fn path_starts_with_prefix(path: &str, prefix: &str) -> bool {
    path.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str, domains: &[&str], prefix: Option<&str>) -> Tenant {
        Tenant {
            name: name.to_string(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            path_prefix: prefix.map(|s| s.to_string()),
            health_interval: 10,
            script: None,
            services: vec![],
        }
    }

    #[test]
    fn host_only_match() {
        let matcher = TenantMatcher::new(vec![tenant("a", &["a.example"], None)]);
        assert_eq!(matcher.resolve("a.example", "/hello").unwrap().name, "a");
        assert_eq!(matcher.resolve("a.example:8080", "/hello").unwrap().name, "a");
        assert!(matcher.resolve("b.example", "/hello").is_none());
    }

    #[test]
    fn host_comparison_is_case_insensitive() {
        let matcher = TenantMatcher::new(vec![tenant("a", &["A.Example"], None)]);
        assert_eq!(matcher.resolve("a.example", "/x").unwrap().name, "a");
    }

    #[test]
    fn path_only_longest_prefix_wins() {
        let matcher = TenantMatcher::new(vec![
            tenant("short", &[], Some("/api/")),
            tenant("long", &[], Some("/api/v2/")),
        ]);
        assert_eq!(matcher.resolve("x", "/api/v2/foo").unwrap().name, "long");
        assert_eq!(matcher.resolve("x", "/api/foo").unwrap().name, "short");
    }

    #[test]
    fn hybrid_outranks_host_only_and_path_only() {
        let matcher = TenantMatcher::new(vec![
            tenant("host-only", &["c.example"], None),
            tenant("hybrid", &["c.example"], Some("/v2/")),
        ]);
        assert_eq!(
            matcher.resolve("c.example", "/v2/ping").unwrap().name,
            "hybrid"
        );
        assert_eq!(
            matcher.resolve("c.example", "/other").unwrap().name,
            "host-only"
        );
    }

    #[test]
    fn no_match_returns_none() {
        let matcher = TenantMatcher::new(vec![tenant("a", &["a.example"], None)]);
        assert!(matcher.resolve("z.example", "/x").is_none());
    }

    #[test]
    fn ties_broken_by_registration_order() {
        let matcher = TenantMatcher::new(vec![
            tenant("first", &[], Some("/api/")),
            tenant("second", &[], Some("/api/")),
        ]);
        assert_eq!(matcher.resolve("x", "/api/y").unwrap().name, "first");
    }
}
