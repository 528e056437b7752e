//! Listener binding and connection serving
//!
//! A [`Server`] binds every configured listener (plain, static TLS, or
//! per-SNI TLS through the resolver), accepts connections until shutdown
//! is signaled, and returns from [`Server::run`] only once accepting has
//! stopped and every in-flight connection has been released. Listeners
//! bind with SO_REUSEPORT so sibling worker processes share the same
//! ports.

use crate::actions::RequestCtx;
use crate::config::{Config, ListenSpec, TlsSpec};
use crate::router::Router;
use crate::tls::{build_server_config, load_certs, load_private_key, SniResolver};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// TLS behavior of one listener
#[derive(Clone)]
enum ListenerTls {
    Plain,
    /// Pre-loaded certificate material
    Static(TlsAcceptor),
    /// Per-SNI resolution; static material (if any) covers clients that
    /// send no SNI and hostnames the resolver cannot serve
    Sni {
        resolver: Arc<SniResolver>,
        default_config: Option<Arc<ServerConfig>>,
    },
}

struct BoundListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: ListenerTls,
}

/// One worker's serving half: all bound listeners plus the router
pub struct Server {
    listeners: Vec<BoundListener>,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Bind every configured listener. A listener that fails to bind is
    /// logged and skipped; the others are unaffected.
    pub async fn bind(
        config: &Config,
        router: Arc<Router>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut listeners = Vec::new();

        for spec in &config.listen {
            match bind_listener(spec).await {
                Ok(bound) => {
                    let protocol = match &bound.tls {
                        ListenerTls::Plain => "HTTP",
                        _ => "HTTPS",
                    };
                    info!(addr = %bound.local_addr, protocol, "Listening");
                    listeners.push(bound);
                }
                Err(e) => {
                    error!(
                        address = %spec.address,
                        port = spec.port,
                        error = %e,
                        "Failed to bind listener"
                    );
                }
            }
        }

        if listeners.is_empty() {
            warn!("No listeners bound; serving nothing");
        }

        Self {
            listeners,
            router,
            shutdown_rx,
        }
    }

    /// Addresses actually bound (reflects OS-assigned ports)
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.local_addr).collect()
    }

    /// Serve until shutdown is signaled; returns once all listeners have
    /// stopped accepting and their connections have drained.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut loops = JoinSet::new();
        for bound in self.listeners {
            let router = Arc::clone(&self.router);
            let shutdown_rx = self.shutdown_rx.clone();
            loops.spawn(listener_loop(bound, router, shutdown_rx));
        }

        while loops.join_next().await.is_some() {}
        info!("Server closed");
        Ok(())
    }
}

/// Bind one listener with SO_REUSEADDR and (on Unix) SO_REUSEPORT so the
/// whole worker pool can share the address
async fn bind_listener(spec: &ListenSpec) -> anyhow::Result<BoundListener> {
    let addr: SocketAddr = format!("{}:{}", spec.address, spec.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;

    let listener = socket.listen(1024)?;
    let local_addr = listener.local_addr()?;

    let tls = match &spec.tls {
        None => ListenerTls::Plain,
        Some(tls_spec) => build_listener_tls(tls_spec)?,
    };

    Ok(BoundListener {
        listener,
        local_addr,
        tls,
    })
}

fn build_listener_tls(spec: &TlsSpec) -> anyhow::Result<ListenerTls> {
    let static_config = match (&spec.cert, &spec.key) {
        (Some(cert), Some(key)) => Some(build_server_config(
            load_certs(cert)?,
            load_private_key(key)?,
        )?),
        _ => None,
    };

    match (&spec.cert_template, &spec.key_template) {
        (Some(cert_template), Some(key_template)) => Ok(ListenerTls::Sni {
            resolver: Arc::new(SniResolver::new(cert_template, key_template)),
            default_config: static_config,
        }),
        _ => {
            let config = static_config
                .ok_or_else(|| anyhow::anyhow!("tls listener has no usable material"))?;
            Ok(ListenerTls::Static(TlsAcceptor::from(config)))
        }
    }
}

/// Accept loop for one listener; returns once shutdown was signaled and
/// all of its connections have finished
async fn listener_loop(
    bound: BoundListener,
    router: Arc<Router>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = bound.listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let router = Arc::clone(&router);
                        let tls = bound.tls.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        connections.spawn(async move {
                            handle_accepted(stream, addr, tls, router, shutdown_rx).await;
                        });
                    }
                    Err(e) => {
                        error!(addr = %bound.local_addr, error = %e, "Failed to accept connection");
                    }
                }
            }
            // Reap finished connection tasks as we go
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown_rx.changed() => {
                match changed {
                    Ok(()) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    // Sender gone: treat as shutdown
                    Err(_) => break,
                }
            }
        }
    }

    debug!(addr = %bound.local_addr, pending = connections.len(), "Listener draining");
    while connections.join_next().await.is_some() {}
    info!(addr = %bound.local_addr, "Listener closed");
}

/// Complete the TLS handshake (if any) and serve the connection
async fn handle_accepted(
    stream: TcpStream,
    addr: SocketAddr,
    tls: ListenerTls,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
) {
    match tls {
        ListenerTls::Plain => {
            serve_connection(stream, addr, false, router, shutdown_rx).await;
        }
        ListenerTls::Static(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                serve_connection(tls_stream, addr, true, router, shutdown_rx).await;
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "TLS handshake failed");
            }
        },
        ListenerTls::Sni {
            resolver,
            default_config,
        } => {
            // Read the ClientHello first, then pick the certificate for
            // the requested hostname
            let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
            let start = match acceptor.await {
                Ok(start) => start,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "TLS handshake failed before ClientHello");
                    return;
                }
            };

            let sni = start.client_hello().server_name().map(str::to_string);
            let config = match &sni {
                Some(hostname) => resolver
                    .resolve(hostname)
                    .await
                    .or_else(|| default_config.clone()),
                None => default_config.clone(),
            };

            let Some(config) = config else {
                // No material for this hostname: abort the handshake,
                // the client sees a connection reset
                debug!(addr = %addr, sni = sni.as_deref().unwrap_or(""), "No certificate for hostname, dropping connection");
                return;
            };

            match start.into_stream(config).await {
                Ok(tls_stream) => {
                    serve_connection(tls_stream, addr, true, router, shutdown_rx).await;
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "TLS handshake failed");
                }
            }
        }
    }
}

/// Serve one connection with HTTP/1.1 + HTTP/2 and upgrade support
async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    is_tls: bool,
    router: Arc<Router>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(handle_request(req, addr, is_tls, &router).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_signaled(&mut shutdown_rx) => {
            // Stop taking new requests on this connection, finish the
            // in-flight ones
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!(addr = %addr, error = %e, "Connection error");
    }
}

async fn handle_request(
    req: Request<Incoming>,
    addr: SocketAddr,
    is_tls: bool,
    router: &Router,
) -> hyper::Response<crate::router::HttpBody> {
    // Propagate the client's request ID or mint one
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = RequestCtx {
        remote_addr: addr,
        tls: is_tls,
        request_id,
    };

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = if is_upgrade_request(&req) {
        router.dispatch_upgrade(req, &ctx).await
    } else {
        router.dispatch(req, &ctx).await
    };

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        request_id = %ctx.request_id,
        remote = %addr,
        "Request"
    );

    response
}

/// Check if a request is a protocol upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Resolve once the shutdown flag flips to true
async fn shutdown_signaled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender gone: treat as shutdown
            return;
        }
    }
}
