//! End-to-end tests: boot a real `ProxyServer` on an ephemeral port with a
//! temp `scripts_dir`, drive it over HTTP with `reqwest`, and shut it down
//! over a manual `watch` channel (spec.md seed scenarios in §8).

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tollgate::config::{Config, ConnectionPoolConfig, ListenConfig, ScriptPoolConfig, ServiceConfig, Tenant};

fn write_script(dir: &std::path::Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn base_config(scripts_dir: &std::path::Path, tenants: Vec<Tenant>) -> Config {
    Config {
        listen: ListenConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
        },
        admin_base_path: "/".to_string(),
        scripts_dir: scripts_dir.display().to_string(),
        request_timeout_secs: 5,
        script_pool: ScriptPoolConfig::default(),
        connection_pool: ConnectionPoolConfig::default(),
        tenants,
    }
}

fn tenant(name: &str, domains: &[&str], path_prefix: Option<&str>, script: Option<&str>, services: Vec<ServiceConfig>) -> Tenant {
    Tenant {
        name: name.to_string(),
        domains: domains.iter().map(|s| s.to_string()).collect(),
        path_prefix: path_prefix.map(|s| s.to_string()),
        health_interval: 1,
        script: script.map(|s| s.to_string()),
        services,
    }
}

/// Spawns a tiny upstream that answers every request (including the
/// health probe) with a 200 and a fixed body, returning its address.
async fn spawn_upstream(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, std::convert::Infallible>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });
    addr
}

/// Boots the gateway, returning its bound address, a shutdown sender, and
/// the server's `JoinHandle` so callers can trigger and await shutdown.
async fn boot(config: Config) -> (SocketAddr, tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let gateway = tollgate::bootstrap(config, rx)
        .await
        .unwrap_or_else(|e| panic!("bootstrap failed: {e}"));
    let addr = gateway.server.local_addr().unwrap();
    let handle = tokio::spawn(gateway.run(Duration::from_millis(20)));
    (addr, tx, handle)
}

async fn shutdown(tx: tokio::sync::watch::Sender<bool>, handle: tokio::task::JoinHandle<anyhow::Result<()>>) {
    let _ = tx.send(true);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn scripted_route_responds_without_any_backend() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "acme.lua",
        r#"
        function hello(req, res)
            res:write("hi")
        end
        route("GET", "/hello", hello)
        "#,
    );

    let config = base_config(
        scripts.path(),
        vec![tenant("acme", &["acme.test"], None, Some("acme"), vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/hello"))
        .header(reqwest::header::HOST, "acme.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hi");

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn named_param_is_visible_to_the_handler() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "acme.lua",
        r#"
        function echo_id(req, res)
            res:json('{"id":"' .. param(req, "id") .. '"}')
        end
        route("GET", "/items/{id}", echo_id)
        "#,
    );

    let config = base_config(
        scripts.path(),
        vec![tenant("acme", &["acme.test"], None, Some("acme"), vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/items/42"))
        .header(reqwest::header::HOST, "acme.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"{"id":"42"}"#);

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn hybrid_tenant_strips_its_path_prefix_before_matching_scripted_routes() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "c.lua",
        r#"
        function ping(req, res)
            res:write("pong")
        end
        route("GET", "/ping", ping)
        "#,
    );

    let config = base_config(
        scripts.path(),
        vec![tenant("c", &["c.example"], Some("/v2/"), Some("c"), vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/v2/ping"))
        .header(reqwest::header::HOST, "c.example")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "pong");

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn unscripted_path_tenant_falls_back_to_reverse_proxy() {
    let upstream = spawn_upstream("upstream-ok").await;
    let scripts = tempfile::tempdir().unwrap();

    let config = base_config(
        scripts.path(),
        vec![tenant(
            "api",
            &[],
            Some("/api/"),
            None,
            vec![ServiceConfig {
                name: "primary".to_string(),
                url: format!("http://{upstream}"),
                health: "/".to_string(),
            }],
        )],
    );
    let (addr, tx, handle) = boot(config).await;

    // The health loop's first tick fires immediately on spawn, but give it
    // a moment to land before asserting on liveness-dependent routing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = reqwest::Client::new();
    let resp = client.get(format!("http://{addr}/api/anything")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "upstream-ok");

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn middleware_injects_header_before_handler_runs() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "global-tag.lua",
        r#"
        function tag_response(req, res, next)
            res:header("X-Gateway", "tollgate")
            next()
        end
        middleware("/*", tag_response)
        "#,
    );
    write_script(
        scripts.path(),
        "shop.lua",
        r#"
        function hello(req, res)
            res:write("hi")
        end
        route("GET", "/hello", hello)
        "#,
    );

    let config = base_config(
        scripts.path(),
        vec![tenant("shop", &["shop.test"], None, Some("shop"), vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/hello"))
        .header(reqwest::header::HOST, "shop.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-gateway").unwrap(), "tollgate");
    assert_eq!(resp.text().await.unwrap(), "hi");

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn middleware_short_circuit_skips_the_handler() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "global-block.lua",
        r#"
        function deny(req, res, next)
            res:status(403)
            res:write("blocked")
        end
        middleware("/*", deny)
        "#,
    );
    write_script(
        scripts.path(),
        "shop.lua",
        r#"
        function hello(req, res)
            res:write("should not run")
        end
        route("GET", "/hello", hello)
        "#,
    );

    let config = base_config(
        scripts.path(),
        vec![tenant("shop", &["shop.test"], None, Some("shop"), vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/hello"))
        .header(reqwest::header::HOST, "shop.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(resp.text().await.unwrap(), "blocked");

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn unmatched_host_and_path_is_404() {
    let scripts = tempfile::tempdir().unwrap();
    let config = base_config(
        scripts.path(),
        vec![tenant("acme", &["acme.test"], None, None, vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/anything"))
        .header(reqwest::header::HOST, "nobody.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn wrong_method_on_a_known_path_is_405() {
    let scripts = tempfile::tempdir().unwrap();
    write_script(
        scripts.path(),
        "acme.lua",
        r#"
        function hello(req, res) res:write("hi") end
        route("GET", "/hello", hello)
        "#,
    );
    let config = base_config(
        scripts.path(),
        vec![tenant("acme", &["acme.test"], None, Some("acme"), vec![])],
    );
    let (addr, tx, handle) = boot(config).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/hello"))
        .header(reqwest::header::HOST, "acme.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 405);

    shutdown(tx, handle).await;
}

#[tokio::test]
async fn unparseable_script_is_non_fatal_and_tenant_falls_back_to_proxy() {
    let upstream = spawn_upstream("upstream-ok").await;
    let scripts = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "acme.lua", "this is not valid lua (((");

    let config = base_config(
        scripts.path(),
        vec![tenant(
            "acme",
            &["acme.test"],
            None,
            Some("acme"),
            vec![ServiceConfig {
                name: "primary".to_string(),
                url: format!("http://{upstream}"),
                health: "/".to_string(),
            }],
        )],
    );
    let (addr, tx, handle) = boot(config).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/whatever"))
        .header(reqwest::header::HOST, "acme.test")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "upstream-ok");

    shutdown(tx, handle).await;
}
