//! Reverse Proxy & Fallback Handler (spec.md §4.9): forwards a request to a
//! tenant's selected backend, rewriting scheme/host/path/query, and maps
//! connection failures and timeouts to 502/504.

use crate::backend::{Backend, BoxBody, HttpClient};
use crate::error::GatewayError;
use crate::router;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use std::time::Duration;
use tracing::warn;

/// Builds the upstream request: scheme/host replaced with the backend's,
/// the tenant's path prefix stripped (falling back to `/` if that empties
/// the path), and the query strings merged backend-then-incoming with `&`
/// (spec.md §4.9).
pub fn rewrite_request(
    req: &Request<Incoming>,
    backend: &Backend,
    tenant_prefix: Option<&str>,
) -> Result<Uri, GatewayError> {
    let backend_uri: Uri = backend
        .url
        .parse()
        .map_err(|e| GatewayError::UpstreamError(format!("invalid backend url: {e}")))?;

    let stripped = router::strip_tenant_prefix(req.uri().path(), tenant_prefix);

    let merged_query = merge_queries(backend_uri.query(), req.uri().query());

    let path_and_query = match merged_query {
        Some(q) if !q.is_empty() => format!("{stripped}?{q}"),
        _ => stripped,
    };

    let mut parts = backend_uri.into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| GatewayError::UpstreamError(format!("invalid rewritten path: {e}")))?,
    );

    Uri::from_parts(parts).map_err(|e| GatewayError::UpstreamError(format!("invalid rewritten uri: {e}")))
}

/// Concatenates backend-then-incoming query strings with `&`, with no
/// deduplication (spec.md §4.9).
fn merge_queries(backend_query: Option<&str>, incoming_query: Option<&str>) -> Option<String> {
    match (backend_query, incoming_query) {
        (Some(b), Some(i)) if !b.is_empty() && !i.is_empty() => Some(format!("{b}&{i}")),
        (Some(b), _) if !b.is_empty() => Some(b.to_string()),
        (_, Some(i)) if !i.is_empty() => Some(i.to_string()),
        _ => None,
    }
}

/// Forwards `req` to `backend`, streaming the response back. Connect
/// failures surface as 502, timeouts as 504 (spec.md §4.9).
pub async fn forward(
    client: &HttpClient,
    req: Request<Incoming>,
    backend: &Backend,
    tenant_prefix: Option<&str>,
    timeout: Duration,
) -> Result<Response<BoxBody>, GatewayError> {
    let uri = rewrite_request(&req, backend, tenant_prefix)?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    let collected = body
        .collect()
        .await
        .map_err(|e| GatewayError::UpstreamError(e.to_string()))?
        .to_bytes();
    let upstream_req = Request::from_parts(parts, http_body_util::Full::new(collected));

    match tokio::time::timeout(timeout, client.request(upstream_req.map(|b: Full<Bytes>| {
        b.map_err(|never| match never {}).boxed()
    })))
    .await
    {
        Ok(Ok(resp)) => {
            let (parts, body) = resp.into_parts();
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Ok(Err(e)) => {
            warn!(backend = %backend.name, error = %e, "upstream request failed");
            Err(GatewayError::UpstreamError(e.to_string()))
        }
        Err(_) => {
            warn!(backend = %backend.name, "upstream request timed out");
            Err(GatewayError::UpstreamError("upstream request timed out".to_string()))
        }
    }
}

/// Whether an error represents a timeout (504) vs. any other upstream
/// failure (502), per spec.md §4.9 and §7.
pub fn is_timeout(err: &GatewayError) -> bool {
    matches!(err, GatewayError::UpstreamError(msg) if msg.contains("timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_queries_concatenates_with_ampersand() {
        assert_eq!(
            merge_queries(Some("a=1"), Some("b=2")),
            Some("a=1&b=2".to_string())
        );
    }

    #[test]
    fn merge_queries_handles_missing_sides() {
        assert_eq!(merge_queries(None, Some("b=2")), Some("b=2".to_string()));
        assert_eq!(merge_queries(Some("a=1"), None), Some("a=1".to_string()));
        assert_eq!(merge_queries(None, None), None);
    }

    #[test]
    fn is_timeout_detects_timeout_message() {
        let err = GatewayError::UpstreamError("upstream request timed out".to_string());
        assert!(is_timeout(&err));
        let err2 = GatewayError::UpstreamError("connection refused".to_string());
        assert!(!is_timeout(&err2));
    }
}
