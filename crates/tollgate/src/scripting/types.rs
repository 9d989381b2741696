//! Shared data types for the scripting substrate (spec.md §3): script
//! artifacts as discovered by the loader, and the route/middleware
//! definitions a script's top-level execution accumulates via the bridge.

use hyper::Method;
use std::path::PathBuf;
use std::time::SystemTime;

/// One compiled script on disk. `id` is the file stem with any `global-`
/// prefix trimmed; `is_global` records whether the prefix was present.
#[derive(Debug, Clone)]
pub struct ScriptArtifact {
    pub id: String,
    pub source: String,
    pub bytecode: Vec<u8>,
    pub path: PathBuf,
    pub compiled_at: SystemTime,
    /// First 8 bytes of the SHA-256 of `source`, used to detect changed
    /// files across a `Reload()` without recompiling unchanged ones.
    pub content_hash: [u8; 8],
    pub is_global: bool,
}

/// A `route(method, pattern, handler_fn)` call recorded during a script's
/// top-level execution, with any enclosing `group()` prefixes already
/// resolved into `pattern`.
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub tenant: String,
    pub method: Method,
    pub pattern: String,
    pub script_id: String,
    pub function: String,
}

/// A `middleware(pattern, mw_fn)` call, same prefix-resolution rule as
/// `RouteDefinition`.
#[derive(Debug, Clone)]
pub struct MiddlewareDefinition {
    pub tenant: String,
    pub pattern: String,
    pub script_id: String,
    pub function: String,
}
