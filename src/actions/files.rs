//! Static file serving under a document root

use crate::actions::{empty_body, full_body, Action, RequestCtx};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::router::{HttpBody, Next};
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Serves files below a configured root. Requests it cannot answer
/// (non-GET methods, missing files) fall through to later rules so a
/// static rule can sit in front of a catch-all.
pub struct StaticAction {
    root: PathBuf,
}

impl StaticAction {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    async fn serve(&self, req: &Request<Incoming>) -> Result<Response<HttpBody>, ServeError> {
        let relative = sanitize_path(req.uri().path()).ok_or(ServeError::Forbidden)?;
        let mut path = self.root.join(relative);

        let mut metadata = tokio::fs::metadata(&path)
            .await
            .map_err(ServeError::from_io)?;
        if metadata.is_dir() {
            // Directories default to their index.html
            path = path.join("index.html");
            metadata = tokio::fs::metadata(&path)
                .await
                .map_err(ServeError::from_io)?;
        }
        if !metadata.is_file() {
            return Err(ServeError::NotFound);
        }

        let contents = tokio::fs::read(&path).await.map_err(ServeError::from_io)?;
        debug!(path = %path.display(), bytes = contents.len(), "Serving file");

        let content_type = content_type_for(&path);
        let body = if req.method() == Method::HEAD {
            empty_body()
        } else {
            full_body(contents)
        };

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type)
            .header(hyper::header::CONTENT_LENGTH, metadata.len())
            .body(body)
            .expect("valid response builder"))
    }
}

enum ServeError {
    NotFound,
    Forbidden,
    Io(std::io::Error),
}

impl ServeError {
    fn from_io(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            ServeError::NotFound
        } else {
            ServeError::Io(e)
        }
    }
}

#[async_trait]
impl Action for StaticAction {
    async fn handle(
        &self,
        req: Request<Incoming>,
        _ctx: &RequestCtx,
        next: Next<'_>,
    ) -> Response<HttpBody> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return next.run(req).await;
        }

        match self.serve(&req).await {
            Ok(response) => response,
            // Missing files are not an error: later rules get a chance
            Err(ServeError::NotFound) => next.run(req).await,
            Err(ServeError::Forbidden) => {
                warn!(path = req.uri().path(), "Rejecting path outside document root");
                json_error_response(GatewayErrorCode::PathForbidden, "path not allowed")
            }
            Err(ServeError::Io(e)) => {
                warn!(path = req.uri().path(), error = %e, "Failed to read file");
                json_error_response(GatewayErrorCode::InternalError, "failed to read file")
            }
        }
    }
}

/// Decode and normalize a request path into a root-relative path,
/// rejecting traversal attempts.
pub(crate) fn sanitize_path(raw: &str) -> Option<PathBuf> {
    let decoded = percent_decode(raw)?;
    let mut clean = PathBuf::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains('\0') || s.contains('\\') => return None,
            s => clean.push(s),
        }
    }
    Some(clean)
}

/// Minimal percent-decoding; rejects malformed escapes
fn percent_decode(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Content type from the file extension; octet-stream for the rest
fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "text/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
