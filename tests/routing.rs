//! Integration tests for routing, actions and upgrade dispatch
//!
//! Each test builds a real server on an ephemeral port from a TOML rule
//! list and talks to it over plain sockets with hand-rolled HTTP.

use frontdoor::actions::build_rules;
use frontdoor::config::Config;
use frontdoor::router::Router;
use frontdoor::server::Server;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Bind a server from a TOML config and serve it in the background
async fn start_server(
    config_toml: &str,
) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let config: Config = toml::from_str(config_toml).expect("valid test config");
    config.validate().expect("valid test config");

    let rules = build_rules(&config.rules).expect("buildable rules");
    let router = Arc::new(Router::new(rules));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = Server::bind(&config, router, shutdown_rx).await;
    let addr = server.local_addrs()[0];
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    (addr, shutdown_tx, handle)
}

/// Send a raw HTTP request and collect the whole response
async fn http_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    response
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: test.local\r\nConnection: close\r\n\r\n",
        path
    );
    http_request(addr, &request).await
}

/// Plain HTTP upstream that reports the proxy headers it saw
async fn spawn_http_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                    let mut builder = Response::builder().header("content-type", "text/plain");
                    if let Some(proto) = req.headers().get("x-forwarded-proto") {
                        builder = builder.header("x-upstream-saw-proto", proto.clone());
                    }
                    if let Some(xff) = req.headers().get("x-forwarded-for") {
                        builder = builder.header("x-upstream-saw-for", xff.clone());
                    }
                    if req.headers().contains_key("x-request-id") {
                        builder = builder.header("x-upstream-saw-id", "yes");
                    }
                    let body = format!("upstream:{}", req.uri().path());
                    Ok::<_, std::convert::Infallible>(
                        builder.body(Full::new(Bytes::from(body))).unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    addr
}

/// Raw TCP upstream that accepts any upgrade and then echoes bytes
async fn spawn_upgrade_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }

                if stream
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
                    )
                    .await
                    .is_err()
                {
                    return;
                }

                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_first_matching_rule_wins_in_array_order() {
    let config = r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "redirect"
        url = "http://a.marker/"
        when = { path = "/a" }

        [[rules]]
        action = "redirect"
        url = "http://b.marker/"
    "#;
    let (addr, _shutdown, _handle) = start_server(config).await;

    let response = http_get(addr, "/a").await;
    assert!(response.starts_with("HTTP/1.1 302"));
    assert!(response.contains("location: http://a.marker/"));

    let response = http_get(addr, "/b").await;
    assert!(response.contains("location: http://b.marker/"));
}

#[tokio::test]
async fn test_no_matching_rule_falls_back_to_not_found() {
    let config = r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "redirect"
        url = "http://only.marker/"
        when = { path = "/only" }
    "#;
    let (addr, _shutdown, _handle) = start_server(config).await;

    let response = http_get(addr, "/other").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("x-frontdoor-error: NO_ROUTE_MATCHED"));
}

#[tokio::test]
async fn test_static_serves_files_and_falls_through_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
    std::fs::write(dir.path().join("hello.txt"), "hello from disk").unwrap();

    let config = format!(
        r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "static"
        root = "{}"

        [[rules]]
        action = "redirect"
        url = "http://fallback.marker/"
    "#,
        dir.path().display()
    );
    let (addr, _shutdown, _handle) = start_server(&config).await;

    let response = http_get(addr, "/hello.txt").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("content-type: text/plain"));
    assert!(response.ends_with("hello from disk"));

    // Directories default to index.html
    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("<h1>home</h1>"));

    // A missing file is not terminal: the action falls through to the
    // next rule
    let response = http_get(addr, "/missing").await;
    assert!(response.starts_with("HTTP/1.1 302"));
    assert!(response.contains("location: http://fallback.marker/"));

    // Non-GET methods fall through as well
    let request = "POST /hello.txt HTTP/1.1\r\nHost: test.local\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    let response = http_request(addr, request).await;
    assert!(response.contains("location: http://fallback.marker/"));

    // Traversal attempts are terminal, not a fallthrough
    let response = http_get(addr, "/%2e%2e/secret").await;
    assert!(response.starts_with("HTTP/1.1 403"));
}

#[tokio::test]
async fn test_index_action_lists_directories() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let config = format!(
        r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "index"
        root = "{}"
    "#,
        dir.path().display()
    );
    let (addr, _shutdown, _handle) = start_server(&config).await;

    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("content-type: text/html"));
    assert!(response.contains("a.txt"));
    assert!(response.contains("sub/"));
}

#[tokio::test]
async fn test_info_action_reports_process_facts() {
    let config = r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "info"
        when = { path = "/__info" }
    "#;
    let (addr, _shutdown, _handle) = start_server(config).await;

    let response = http_get(addr, "/__info").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"name\":\"frontdoor\""));
    assert!(response.contains("\"pid\":"));
}

#[tokio::test]
async fn test_redirect_rewrites_request_url_components() {
    let config = r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "redirect"
        code = 301
        scheme = "https"
    "#;
    let (addr, _shutdown, _handle) = start_server(config).await;

    let response = http_get(addr, "/path?q=1").await;
    assert!(response.starts_with("HTTP/1.1 301"));
    assert!(response.contains("location: https://test.local/path?q=1"));
}

#[tokio::test]
async fn test_proxy_forwards_and_rewrites_proxy_headers() {
    let upstream = spawn_http_upstream().await;

    let config = format!(
        r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "proxy"
        target = "http://{}"
    "#,
        upstream
    );
    let (addr, _shutdown, _handle) = start_server(&config).await;

    let response = http_get(addr, "/api/items").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("upstream:/api/items"));
    assert!(response.contains("x-upstream-saw-proto: http"));
    assert!(response.contains("x-upstream-saw-for: 127.0.0.1"));
    assert!(response.contains("x-upstream-saw-id: yes"));
}

#[tokio::test]
async fn test_proxy_reports_unreachable_upstream_as_bad_gateway() {
    // Nothing listens on this port
    let config = r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "proxy"
        target = "http://127.0.0.1:1"
    "#;
    let (addr, _shutdown, _handle) = start_server(config).await;

    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 502"));
    assert!(response.contains("x-frontdoor-error: UPSTREAM_CONNECT_FAILED"));
}

#[tokio::test]
async fn test_upgrade_dispatch_skips_rules_without_upgrade_support() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "static wins").unwrap();
    let upstream = spawn_upgrade_echo_upstream().await;

    // The static rule matches everything but cannot handle upgrades;
    // upgrade requests must scan past it to the proxy rule
    let config = format!(
        r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "static"
        root = "{}"

        [[rules]]
        action = "proxy"
        target = "http://{}"
    "#,
        dir.path().display(),
        upstream
    );
    let (addr, _shutdown, _handle) = start_server(&config).await;

    // Ordinary requests still hit the static rule
    let response = http_get(addr, "/").await;
    assert!(response.contains("static wins"));

    // Upgrade request tunnels through the proxy rule
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: test.local\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .await
        .unwrap();

    // Read the response head
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before upgrade response");
        head.extend_from_slice(&chunk[..n]);
    }
    let head_str = String::from_utf8_lossy(&head);
    assert!(head_str.starts_with("HTTP/1.1 101"), "got: {}", head_str);

    // Bytes now tunnel through to the echo upstream and back
    stream.write_all(b"ping-42").await.unwrap();
    let mut echoed = [0u8; 7];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping-42");
}

#[tokio::test]
async fn test_upgrade_with_no_eligible_rule_gets_not_found() {
    let dir = tempfile::tempdir().unwrap();

    let config = format!(
        r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "static"
        root = "{}"
    "#,
        dir.path().display()
    );
    let (addr, _shutdown, _handle) = start_server(&config).await;

    let request = "GET /socket HTTP/1.1\r\nHost: test.local\r\nConnection: Upgrade, close\r\nUpgrade: websocket\r\n\r\n";
    let response = http_request(addr, request).await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_server_run_returns_after_shutdown() {
    let config = r#"
        [[listen]]
        address = "127.0.0.1"
        port = 0

        [[rules]]
        action = "info"
    "#;
    let (addr, shutdown_tx, handle) = start_server(config).await;

    // Serve at least one request first
    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("server did not close after shutdown")
        .unwrap();
}
