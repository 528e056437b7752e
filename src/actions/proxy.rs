//! Single-target reverse proxy action with upgrade relay

use crate::actions::{empty_body, Action, RequestCtx, UpgradeAction};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::pool::{PoolConfig, UpstreamPool};
use crate::router::{HttpBody, Next};
use async_trait::async_trait;
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forwards requests to a single upstream target through a pooled client;
/// upgrade requests are relayed over a raw TCP connection.
pub struct ProxyAction {
    target: Uri,
    /// host:port used for raw upgrade connections
    connect_addr: String,
    /// authority presented to the upstream in the Host header
    authority: String,
    pool: UpstreamPool,
}

impl ProxyAction {
    pub fn new(target: Uri) -> anyhow::Result<Self> {
        let authority = target
            .authority()
            .ok_or_else(|| anyhow::anyhow!("proxy target '{}' has no host", target))?
            .clone();
        let port = authority.port_u16().unwrap_or(80);
        let connect_addr = format!("{}:{}", authority.host(), port);

        Ok(Self {
            target,
            connect_addr,
            authority: authority.to_string(),
            pool: UpstreamPool::new(PoolConfig::default()),
        })
    }
}

#[async_trait]
impl Action for ProxyAction {
    async fn handle(
        &self,
        mut req: Request<hyper::body::Incoming>,
        ctx: &RequestCtx,
        _next: Next<'_>,
    ) -> Response<HttpBody> {
        apply_forwarding_headers(&mut req, ctx);

        debug!(
            target = %self.target,
            method = %req.method(),
            uri = %req.uri(),
            request_id = %ctx.request_id,
            "Forwarding request"
        );

        match self.pool.send_request(req, &self.target).await {
            Ok(response) => response,
            Err(e) => {
                error!(target = %self.target, error = %e, "Upstream request failed");
                let code = match &e {
                    crate::pool::PoolError::Client(client) if client.is_connect() => {
                        GatewayErrorCode::UpstreamConnectFailed
                    }
                    _ => GatewayErrorCode::UpstreamError,
                };
                json_error_response(code, "failed to reach upstream")
            }
        }
    }

    fn upgrade_handler(&self) -> Option<&dyn UpgradeAction> {
        Some(self)
    }
}

#[async_trait]
impl UpgradeAction for ProxyAction {
    async fn handle_upgrade(
        &self,
        mut req: Request<hyper::body::Incoming>,
        ctx: &RequestCtx,
    ) -> Response<HttpBody> {
        apply_forwarding_headers(&mut req, ctx);

        let upgrade_type = req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_ascii_lowercase();
        debug!(
            target = %self.target,
            request_id = %ctx.request_id,
            upgrade_type,
            "Handling upgrade request"
        );

        // The upgrade request is replayed verbatim over a raw connection;
        // hyper's pooled client cannot carry a hijacked connection
        let raw_request = build_upgrade_request(&req, &self.authority);

        let mut upstream = match TcpStream::connect(&self.connect_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(addr = %self.connect_addr, error = %e, "Failed to connect to upstream for upgrade");
                return json_error_response(
                    GatewayErrorCode::UpstreamConnectFailed,
                    "failed to reach upstream",
                );
            }
        };

        if let Err(e) = upstream.write_all(&raw_request).await {
            error!(addr = %self.connect_addr, error = %e, "Failed to send upgrade request upstream");
            return json_error_response(GatewayErrorCode::UpstreamError, "upstream write failed");
        }

        let mut response_buf = vec![0u8; 4096];
        let n = match upstream.read(&mut response_buf).await {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                error!(addr = %self.connect_addr, "Upstream closed connection before answering upgrade");
                return json_error_response(
                    GatewayErrorCode::UpstreamError,
                    "upstream closed connection",
                );
            }
            Err(e) => {
                error!(addr = %self.connect_addr, error = %e, "Failed to read upgrade response");
                return json_error_response(GatewayErrorCode::UpstreamError, "upstream read failed");
            }
        };

        let (status, response_headers) = match parse_upgrade_response(&response_buf[..n]) {
            Some(parsed) => parsed,
            None => {
                error!(addr = %self.connect_addr, "Failed to parse upstream upgrade response");
                return json_error_response(
                    GatewayErrorCode::UpstreamError,
                    "invalid upgrade response from upstream",
                );
            }
        };

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(addr = %self.connect_addr, status = %status, "Upstream rejected upgrade request");
            // Relay the upstream's refusal as-is
            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(empty_body())
                .expect("valid response builder");
        }

        info!(
            target = %self.target,
            request_id = %ctx.request_id,
            upgrade_type,
            "Upgrade established"
        );

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            // Skip framing headers hyper manages itself
            let name_lower = name.to_ascii_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(empty_body())
            .expect("valid response builder");

        let request_id = ctx.request_id.clone();
        let connect_addr = self.connect_addr.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    forward_bidirectional(upgraded, upstream, &connect_addr, &request_id).await;
                }
                Err(e) => {
                    error!(request_id, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }
}

/// Overwrite forwarding headers rather than appending: this front door is
/// assumed to be the first trusted hop, so client-supplied values are
/// never propagated.
fn apply_forwarding_headers(req: &mut Request<hyper::body::Incoming>, ctx: &RequestCtx) {
    let host_header = req.headers().get(hyper::header::HOST).cloned();
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.remote_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = host_header {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if ctx.tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Build the raw HTTP request replayed to the upstream for an upgrade
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == &hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", authority));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the upstream's HTTP response head, looking for 101 Switching
/// Protocols
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between the upgraded client connection
/// and the upstream socket
async fn forward_bidirectional(
    client: Upgraded,
    upstream: TcpStream,
    addr: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                addr,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(addr, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = Request::builder()
            .method("GET")
            .uri("/socket?room=1")
            .header("Host", "front.example.net")
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .body(())
            .unwrap();

        let raw = build_upgrade_request(&req, "127.0.0.1:9000");
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with("GET /socket?room=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: 127.0.0.1:9000\r\n"));
        assert!(!text.contains("front.example.net"));
        assert!(text.contains("upgrade: websocket\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response_accepts_101() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Upgrade" && value == "websocket"));
    }

    #[test]
    fn test_parse_upgrade_response_other_status() {
        let raw = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
        let (status, _) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_upgrade_response_garbage() {
        assert!(parse_upgrade_response(b"\xff\xfe").is_none());
        assert!(parse_upgrade_response(b"nonsense").is_none());
    }

    #[test]
    fn test_new_requires_authority() {
        let target: Uri = "/relative".parse().unwrap();
        assert!(ProxyAction::new(target).is_err());

        let target: Uri = "http://127.0.0.1:9000".parse().unwrap();
        let action = ProxyAction::new(target).unwrap();
        assert_eq!(action.connect_addr, "127.0.0.1:9000");

        let target: Uri = "http://upstream.internal".parse().unwrap();
        let action = ProxyAction::new(target).unwrap();
        assert_eq!(action.connect_addr, "upstream.internal:80");
    }
}
