//! Redirect responses, fixed or derived from the request URL

use crate::actions::{full_body, Action, RequestCtx};
use crate::router::{host_of, HttpBody, Next};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

/// Where the client is sent
enum RedirectTarget {
    /// A fixed absolute URL
    Fixed(String),
    /// The request URL with individual components overridden
    Rewrite {
        scheme: Option<String>,
        host: Option<String>,
        port: Option<u16>,
        path: Option<String>,
    },
}

/// Answers every matched request with a redirect
pub struct RedirectAction {
    code: StatusCode,
    target: RedirectTarget,
}

impl RedirectAction {
    pub fn new(
        code: Option<u16>,
        url: Option<String>,
        scheme: Option<String>,
        host: Option<String>,
        port: Option<u16>,
        path: Option<String>,
    ) -> anyhow::Result<Self> {
        let code = match code {
            Some(raw) => {
                let status = StatusCode::from_u16(raw)
                    .map_err(|_| anyhow::anyhow!("invalid redirect code {}", raw))?;
                if !status.is_redirection() {
                    anyhow::bail!("redirect code {} is not a 3xx status", raw);
                }
                status
            }
            None => StatusCode::FOUND,
        };

        let target = match url {
            Some(url) => RedirectTarget::Fixed(url),
            None => RedirectTarget::Rewrite {
                scheme,
                host,
                port,
                path,
            },
        };

        Ok(Self { code, target })
    }

    fn location_for(&self, req: &Request<Incoming>, ctx: &RequestCtx) -> String {
        match &self.target {
            RedirectTarget::Fixed(url) => url.clone(),
            RedirectTarget::Rewrite {
                scheme,
                host,
                port,
                path,
            } => {
                let scheme = scheme
                    .as_deref()
                    .unwrap_or(if ctx.tls { "https" } else { "http" });
                let host = host
                    .clone()
                    .or_else(|| host_of(req))
                    .unwrap_or_else(|| "localhost".to_string());
                let path = path.as_deref().unwrap_or(req.uri().path());
                let query = req
                    .uri()
                    .query()
                    .map(|q| format!("?{}", q))
                    .unwrap_or_default();

                // Omit default ports for the chosen scheme
                match port {
                    Some(port)
                        if !(*port == 80 && scheme == "http")
                            && !(*port == 443 && scheme == "https") =>
                    {
                        format!("{}://{}:{}{}{}", scheme, host, port, path, query)
                    }
                    _ => format!("{}://{}{}{}", scheme, host, path, query),
                }
            }
        }
    }
}

#[async_trait]
impl Action for RedirectAction {
    async fn handle(
        &self,
        req: Request<Incoming>,
        ctx: &RequestCtx,
        _next: Next<'_>,
    ) -> Response<HttpBody> {
        let location = self.location_for(&req, ctx);

        Response::builder()
            .status(self.code)
            .header(hyper::header::LOCATION, &location)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(full_body(format!("Redirecting to {}", location)))
            .expect("valid response builder")
    }
}
