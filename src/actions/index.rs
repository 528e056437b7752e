//! HTML directory listings under a document root

use crate::actions::files::sanitize_path;
use crate::actions::{full_body, Action, RequestCtx};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::router::{HttpBody, Next};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::path::PathBuf;
use tracing::warn;

/// Serves an HTML listing for directories below a configured root.
/// Anything that is not a GET for an existing directory falls through.
pub struct IndexAction {
    root: PathBuf,
}

impl IndexAction {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    async fn listing(&self, request_path: &str) -> Option<String> {
        let relative = sanitize_path(request_path)?;
        let dir = self.root.join(&relative);

        let metadata = tokio::fs::metadata(&dir).await.ok()?;
        if !metadata.is_dir() {
            return None;
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await.ok()?;
        while let Ok(Some(entry)) = reader.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        Some(render_listing(request_path, &entries))
    }
}

#[async_trait]
impl Action for IndexAction {
    async fn handle(
        &self,
        req: Request<Incoming>,
        _ctx: &RequestCtx,
        next: Next<'_>,
    ) -> Response<HttpBody> {
        if req.method() != Method::GET {
            return next.run(req).await;
        }

        if sanitize_path(req.uri().path()).is_none() {
            warn!(path = req.uri().path(), "Rejecting path outside document root");
            return json_error_response(GatewayErrorCode::PathForbidden, "path not allowed");
        }

        match self.listing(req.uri().path()).await {
            Some(html) => Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(full_body(html))
                .expect("valid response builder"),
            None => next.run(req).await,
        }
    }
}

fn render_listing(request_path: &str, entries: &[String]) -> String {
    let display_path = escape_html(request_path);
    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{}/", request_path)
    };

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head><title>Index of ");
    html.push_str(&display_path);
    html.push_str("</title></head>\n<body>\n<h1>Index of ");
    html.push_str(&display_path);
    html.push_str("</h1>\n<ul>\n");
    if request_path != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for entry in entries {
        let escaped = escape_html(entry);
        html.push_str(&format!(
            "<li><a href=\"{}{}\">{}</a></li>\n",
            escape_html(&base),
            escaped,
            escaped
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    html
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
