//! Connection pool for upstream HTTP connections
//!
//! The proxy action forwards every request through a pooled hyper client
//! so repeated requests to the same upstream reuse connections instead of
//! re-dialing per request.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Error type for pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building the upstream request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pooled HTTP client for one-hop forwarding to upstream targets
pub struct UpstreamPool {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamPool {
    /// Create a new pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        Self { client }
    }

    /// Forward a request to the upstream target, rebasing the request URI
    /// onto the target's scheme, authority and base path
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        target: &Uri,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = rebase_uri(req.uri(), target)
            .map_err(PoolError::RequestBuild)?;

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Join the target base with the request path and query
fn rebase_uri(request_uri: &Uri, target: &Uri) -> Result<String, String> {
    let authority = target
        .authority()
        .ok_or_else(|| format!("target '{}' has no authority", target))?;
    let scheme = target.scheme_str().unwrap_or("http");
    let base = target.path().trim_end_matches('/');
    let path_and_query = request_uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(format!("{}://{}{}{}", scheme, authority, base, path_and_query))
}
