//! Diagnostics action

use crate::actions::{full_body, Action, RequestCtx};
use crate::router::{HttpBody, Next};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};

/// Answers with process and build information as JSON.
///
/// SHOULD NOT be exposed in production configurations.
pub struct InfoAction;

#[async_trait]
impl Action for InfoAction {
    async fn handle(
        &self,
        _req: Request<Incoming>,
        ctx: &RequestCtx,
        _next: Next<'_>,
    ) -> Response<HttpBody> {
        let body = serde_json::json!({
            "name": crate::PKG_NAME,
            "version": crate::VERSION,
            "pid": std::process::id(),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "tls": ctx.tls,
            "request_id": ctx.request_id,
        });

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full_body(body.to_string()))
            .expect("valid response builder")
    }
}
