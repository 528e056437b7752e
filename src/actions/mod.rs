//! Pluggable request/upgrade handlers selected by rule matching
//!
//! An [`Action`] is invoked with the request and a [`Next`] continuation;
//! it either produces the response itself or calls `next.run(req)` to
//! fall through to later rules. Actions that can take over a connection
//! (WebSocket and other upgrades) additionally expose an
//! [`UpgradeAction`] handler.

mod files;
mod index;
mod info;
mod proxy;
mod redirect;

pub use files::StaticAction;
pub use index::IndexAction;
pub use info::InfoAction;
pub use proxy::ProxyAction;
pub use redirect::RedirectAction;

use crate::config::{ActionSpec, RuleSpec};
use crate::router::{HttpBody, Next, Rule};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// Per-request context passed alongside the request itself
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// Peer address of the client connection
    pub remote_addr: SocketAddr,
    /// Whether the request arrived over a TLS listener
    pub tls: bool,
    /// Request ID, propagated from the client or generated
    pub request_id: String,
}

/// A pluggable request handler
#[async_trait]
pub trait Action: Send + Sync {
    /// Handle a request, or call `next.run(req)` to fall through to the
    /// rules after the one that dispatched here
    async fn handle(
        &self,
        req: Request<Incoming>,
        ctx: &RequestCtx,
        next: Next<'_>,
    ) -> Response<HttpBody>;

    /// Upgrade capability probe; actions that can service protocol
    /// upgrades return their handler here
    fn upgrade_handler(&self) -> Option<&dyn UpgradeAction> {
        None
    }
}

/// Handler for protocol upgrade requests (one-shot, no fallthrough)
#[async_trait]
pub trait UpgradeAction: Send + Sync {
    async fn handle_upgrade(&self, req: Request<Incoming>, ctx: &RequestCtx)
        -> Response<HttpBody>;
}

/// Instantiate the action configured by a rule
pub fn build_action(spec: &ActionSpec) -> anyhow::Result<Arc<dyn Action>> {
    match spec {
        ActionSpec::Static { root } => Ok(Arc::new(StaticAction::new(root.clone()))),
        ActionSpec::Index { root } => Ok(Arc::new(IndexAction::new(root.clone()))),
        ActionSpec::Proxy { target } => {
            let target: hyper::Uri = target.parse()?;
            Ok(Arc::new(ProxyAction::new(target)?))
        }
        ActionSpec::Redirect {
            code,
            url,
            scheme,
            host,
            port,
            path,
        } => Ok(Arc::new(RedirectAction::new(
            *code,
            url.clone(),
            scheme.clone(),
            host.clone(),
            *port,
            path.clone(),
        )?)),
        ActionSpec::Info => Ok(Arc::new(InfoAction)),
    }
}

/// Build the ordered rule list from configuration, preserving array order
pub fn build_rules(specs: &[RuleSpec]) -> anyhow::Result<Vec<Rule>> {
    specs
        .iter()
        .map(|spec| Ok(Rule::new(spec.when.clone(), build_action(&spec.action)?)))
        .collect()
}

/// Box a byte payload into the shared response body type
pub(crate) fn full_body(bytes: impl Into<Bytes>) -> HttpBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// An empty response body
pub(crate) fn empty_body() -> HttpBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
