//! The scripting substrate: Interpreter Pool (§4.1), Script Loader (§4.2),
//! and Bridge (§4.3), composed into one `ScriptEngine` that the registry
//! and proxy layers drive.

pub mod bridge;
pub mod loader;
pub mod pool;
pub mod types;

use crate::error::GatewayError;
use crate::scripting::bridge::{
    build_req_res, call_handler, call_middleware, install_registration_api, RegistrationContext,
    RequestSnapshot,
};
use crate::scripting::loader::ScriptLoader;
use crate::scripting::pool::InterpreterPool;
use crate::scripting::types::{MiddlewareDefinition, RouteDefinition};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEADLINE_EXCEEDED: &str = "tollgate: script exceeded its execution deadline";

/// Owns the interpreter pool and the compiled-script cache, and is the only
/// thing that knows how to turn `(script_id, function_name)` plus a request
/// into a response (spec.md §4.3's native→scripted contract).
pub struct ScriptEngine {
    pool: InterpreterPool,
    loader: Mutex<ScriptLoader>,
    acquire_timeout: Duration,
}

impl ScriptEngine {
    pub fn new(scripts_dir: impl Into<std::path::PathBuf>, pool_size: usize, max_burst: usize, acquire_timeout: Duration) -> Self {
        Self {
            pool: InterpreterPool::new(pool_size, max_burst),
            loader: Mutex::new(ScriptLoader::new(scripts_dir)),
            acquire_timeout,
        }
    }

    pub fn discover(&self) -> Result<(), GatewayError> {
        self.loader.lock().unwrap().discover()
    }

    pub fn reload(&self) -> Result<(), GatewayError> {
        self.loader.lock().unwrap().reload()
    }

    pub fn global_script_ids(&self) -> Vec<String> {
        self.loader.lock().unwrap().global_ids()
    }

    /// Executes a tenant's top-level script body in a fresh checkout,
    /// running every global script first (spec.md §3's "global scripts run
    /// once per startup against every interpreter"), and returns the
    /// accumulated route/middleware definitions.
    pub async fn load_tenant_script(
        &self,
        tenant: &str,
        script_id: &str,
    ) -> Result<(Vec<RouteDefinition>, Vec<MiddlewareDefinition>), GatewayError> {
        let mut slot = self.pool.get(self.acquire_timeout).await?;

        let mut all_routes = Vec::new();
        let mut all_middlewares = Vec::new();

        let global_ids = self.global_script_ids();
        for global_id in &global_ids {
            let (routes, middlewares) = self.exec_script(&mut slot, tenant, global_id)?;
            all_routes.extend(routes);
            all_middlewares.extend(middlewares);
        }

        let (routes, middlewares) = self.exec_script(&mut slot, tenant, script_id)?;
        all_routes.extend(routes);
        all_middlewares.extend(middlewares);

        Ok((all_routes, all_middlewares))
    }

    fn exec_script(
        &self,
        slot: &mut pool::InterpreterSlot,
        tenant: &str,
        script_id: &str,
    ) -> Result<(Vec<RouteDefinition>, Vec<MiddlewareDefinition>), GatewayError> {
        let artifact = self
            .loader
            .lock()
            .unwrap()
            .get(script_id)
            .cloned()
            .ok_or_else(|| GatewayError::ScriptParseError {
                id: script_id.to_string(),
                source: mlua::Error::RuntimeError(format!("unknown script id '{script_id}'")),
            })?;

        let ctx = RegistrationContext::new(tenant, script_id);
        install_registration_api(&slot.lua, Arc::clone(&ctx)).map_err(|e| GatewayError::ScriptRuntimeError {
            id: script_id.to_string(),
            source: e,
        })?;

        // Unlike `ensure_loaded` (used at request-dispatch time), this always
        // re-executes the script body rather than skipping on an already-
        // loaded slot: a global script may be loading for a *different*
        // tenant than the one that first populated this slot's globals, and
        // its `route`/`middleware` calls must be re-recorded under the
        // current tenant. Script bodies are pure-registration plus function
        // definitions, so re-running has no side effects beyond repopulating
        // globals (spec.md §9).
        slot.lua
            .load(&artifact.bytecode)
            .set_name(&artifact.id)
            .exec()
            .map_err(|e| GatewayError::ScriptRuntimeError {
                id: script_id.to_string(),
                source: e,
            })?;
        slot.loaded.insert(artifact.id.clone());

        Ok(ctx.into_definitions())
    }

    /// Invokes a scripted handler `(script_id, function)` with the given
    /// request, running the middleware chain that applies to it first.
    /// Returns the finalized response. A script-level error or timeout is
    /// turned into a recovered error, never propagated as a panic
    /// (spec.md §4.3, §5).
    pub async fn invoke(
        &self,
        script_id: &str,
        function: &str,
        middlewares: &[(String, String)],
        request_deadline: Duration,
        snapshot: RequestSnapshot,
    ) -> Result<FinalResponse, GatewayError> {
        let mut slot = self.pool.get(self.acquire_timeout).await?;
        self.ensure_loaded(&mut slot, script_id)?;
        for (mw_script, _) in middlewares {
            self.ensure_loaded(&mut slot, mw_script)?;
        }

        // Belt-and-suspenders against a script that never reaches an
        // await point (e.g. a tight Lua loop): an interrupt hook that
        // aborts execution once the deadline passes, in addition to the
        // outer `tokio::time::timeout` below (spec.md §9 "Script
        // timeout" note).
        let deadline = std::time::Instant::now() + request_deadline;
        slot.lua.set_interrupt(move |_| {
            if std::time::Instant::now() >= deadline {
                Err(mlua::Error::RuntimeError(DEADLINE_EXCEEDED.to_string()))
            } else {
                Ok(mlua::VmState::Continue)
            }
        });

        let run = async {
            let (req_table, res_table, builder) = build_req_res(&slot.lua, &snapshot)
                .map_err(|e| GatewayError::ScriptRuntimeError {
                    id: script_id.to_string(),
                    source: e,
                })?;

            for (mw_script, mw_function) in middlewares {
                let func: mlua::Function = slot
                    .lua
                    .globals()
                    .get(mw_function.as_str())
                    .map_err(|e| GatewayError::ScriptRuntimeError {
                        id: mw_script.clone(),
                        source: e,
                    })?;
                let called_next = call_middleware(&slot.lua, func, req_table.clone(), res_table.clone())
                    .map_err(|e| GatewayError::ScriptRuntimeError {
                        id: mw_script.clone(),
                        source: e,
                    })?;
                if !called_next {
                    let b = builder.lock().unwrap();
                    return Ok(FinalResponse {
                        status: b.status.unwrap_or(200),
                        headers: b.headers.clone(),
                        body: b.body.clone(),
                    });
                }
            }

            let handler: mlua::Function =
                slot.lua
                    .globals()
                    .get(function)
                    .map_err(|e| GatewayError::ScriptRuntimeError {
                        id: script_id.to_string(),
                        source: e,
                    })?;
            call_handler(handler, req_table, res_table).map_err(|e| GatewayError::ScriptRuntimeError {
                id: script_id.to_string(),
                source: e,
            })?;

            let b = builder.lock().unwrap();
            Ok(FinalResponse {
                status: b.status.unwrap_or(200),
                headers: b.headers.clone(),
                body: b.body.clone(),
            })
        };

        let outcome = match tokio::time::timeout(request_deadline, run).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ScriptTimeout {
                id: script_id.to_string(),
            }),
        };
        slot.lua.remove_interrupt();

        match outcome {
            Err(GatewayError::ScriptRuntimeError { id, source })
                if source.to_string().contains(DEADLINE_EXCEEDED) =>
            {
                Err(GatewayError::ScriptTimeout { id })
            }
            other => other,
        }
    }

    fn ensure_loaded(&self, slot: &mut pool::InterpreterSlot, script_id: &str) -> Result<(), GatewayError> {
        if slot.loaded.contains(script_id) {
            return Ok(());
        }
        let artifact = self
            .loader
            .lock()
            .unwrap()
            .get(script_id)
            .cloned()
            .ok_or_else(|| GatewayError::ScriptParseError {
                id: script_id.to_string(),
                source: mlua::Error::RuntimeError(format!("unknown script id '{script_id}'")),
            })?;
        slot.lua
            .load(&artifact.bytecode)
            .set_name(&artifact.id)
            .exec()
            .map_err(|e| GatewayError::ScriptRuntimeError {
                id: script_id.to_string(),
                source: e,
            })?;
        slot.loaded.insert(artifact.id.clone());
        Ok(())
    }

    pub fn pool_hits(&self) -> u64 {
        self.pool.hits()
    }

    pub fn pool_misses(&self) -> u64 {
        self.pool.misses()
    }

    pub fn pool_active(&self) -> u64 {
        self.pool.active()
    }

    pub fn close_pool(&self) {
        self.pool.close();
    }
}

/// A fully-assembled scripted response, ready to convert into an
/// `http::Response`.
pub struct FinalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn new_request_snapshot(
    method: String,
    path: String,
    url: String,
    host: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    params: HashMap<String, String>,
    body: Vec<u8>,
    body_cap: usize,
) -> RequestSnapshot {
    // Truncate up front rather than in the bridge: `req:body()` may be
    // called more than once, and every call must see the same (already
    // capped) bytes plus the same truncation verdict (spec.md §8 boundary
    // behavior: "the read is truncated and an error is reported to the
    // script").
    let truncated = body.len() > body_cap;
    let mut body = body;
    if truncated {
        body.truncate(body_cap);
    }
    RequestSnapshot {
        method,
        path,
        url,
        host,
        headers,
        query,
        params,
        body: Arc::new(Mutex::new(Some(body))),
        body_cap,
        truncated,
    }
}
