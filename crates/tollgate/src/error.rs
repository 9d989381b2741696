//! Error taxonomy for the gateway, per the propagation policy: errors that
//! prevent a valid request outcome translate to an HTTP status at the
//! request boundary; errors during startup abort startup; health-probe
//! errors stay local to the probing loop.

use thiserror::Error;

/// Top-level gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed tenant or listener configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A script failed to compile. Non-fatal: the script is omitted and its
    /// tenant falls through to reverse-proxy-only behavior.
    #[error("script '{id}' failed to parse: {source}")]
    ScriptParseError { id: String, source: mlua::Error },

    /// A handler or middleware raised during execution. Recovered to a 500.
    #[error("script '{id}' raised during execution: {source}")]
    ScriptRuntimeError { id: String, source: mlua::Error },

    /// A handler exceeded its deadline.
    #[error("script '{id}' exceeded its execution deadline")]
    ScriptTimeout { id: String },

    /// Duplicate (tenant, method, pattern) registration. Fatal at mount.
    #[error("route conflict for tenant '{tenant}': {method} {pattern} already registered")]
    RouteConflict {
        tenant: String,
        method: String,
        pattern: String,
    },

    /// No tenant matched the incoming (host, path).
    #[error("no tenant matched the request")]
    NoTenantMatch,

    /// Every backend in the selected tenant's pool is dead.
    #[error("no backend available for tenant '{tenant}'")]
    NoBackendAvailable { tenant: String },

    /// The proxied upstream request failed (connect error or timeout).
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// The interpreter pool has been closed (shutdown in progress).
    #[error("interpreter pool is closed")]
    PoolClosed,

    /// No slot became free before `acquire_timeout_ms` elapsed.
    #[error("timed out waiting for an interpreter slot")]
    PoolExhausted,
}

impl GatewayError {
    /// Maps this error to the HTTP status code it should surface as,
    /// per spec.md §7's propagation policy.
    pub fn status_code(&self) -> hyper::StatusCode {
        use hyper::StatusCode;
        match self {
            GatewayError::ScriptRuntimeError { .. }
            | GatewayError::ScriptTimeout { .. }
            | GatewayError::PoolClosed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ScriptParseError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NoTenantMatch => StatusCode::NOT_FOUND,
            GatewayError::NoBackendAvailable { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ConfigInvalid(_) | GatewayError::RouteConflict { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_tenant_match_is_404() {
        assert_eq!(
            GatewayError::NoTenantMatch.status_code(),
            hyper::StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn no_backend_available_is_502() {
        let err = GatewayError::NoBackendAvailable {
            tenant: "a".into(),
        };
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn script_timeout_is_500() {
        let err = GatewayError::ScriptTimeout { id: "s".into() };
        assert_eq!(err.status_code(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
