//! Ordered rule matching and dispatch
//!
//! A [`Router`] holds the configured rules in array order. Each request
//! is dispatched to the first rule whose matcher accepts it; the action
//! receives a [`Next`] continuation bound to the following index and may
//! invoke it to explicitly fall through to later rules. Upgrade requests
//! are dispatched over the same ordered list, restricted to rules whose
//! action can handle upgrades, with no fallthrough.

use crate::actions::{Action, RequestCtx};
use crate::config::MatchSpec;
use crate::error::{json_error_response, GatewayErrorCode};
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use std::sync::Arc;

/// Response body type used throughout the front door
pub type HttpBody = BoxBody<Bytes, hyper::Error>;

/// Not-found behavior invoked when no rule matches
pub type Fallback = Box<dyn Fn(&Request<Incoming>) -> Response<HttpBody> + Send + Sync>;

/// One (matcher, action) pair; order among rules is significant
pub struct Rule {
    matcher: Option<MatchSpec>,
    action: Arc<dyn Action>,
}

impl Rule {
    pub fn new(matcher: Option<MatchSpec>, action: Arc<dyn Action>) -> Self {
        Self { matcher, action }
    }

    /// Predicate evaluation; side-effect-free by construction
    fn matches(&self, req: &Request<Incoming>) -> bool {
        match &self.matcher {
            // A rule without a predicate matches unconditionally
            None => true,
            Some(matcher) => matcher.matches_parts(
                req.method(),
                host_of(req).as_deref(),
                req.uri().path(),
            ),
        }
    }
}

/// Continuation handed to an action: resumes matching at the next rule
/// index instead of terminating dispatch.
pub struct Next<'a> {
    router: &'a Router,
    ctx: &'a RequestCtx,
    index: usize,
}

impl<'a> Next<'a> {
    /// Resume matching from the rule after the one that dispatched
    pub async fn run(self, req: Request<Incoming>) -> Response<HttpBody> {
        self.router.dispatch_from(self.index, req, self.ctx).await
    }
}

/// Ordered rule dispatcher
pub struct Router {
    rules: Vec<Rule>,
    fallback: Fallback,
}

impl Router {
    /// Build a router with the default not-found fallback
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            fallback: Box::new(|_req| {
                json_error_response(GatewayErrorCode::NoRouteMatched, "no rule matched the request")
            }),
        }
    }

    /// Replace the not-found behavior invoked when no rule matches
    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Dispatch a request to the first matching rule
    pub async fn dispatch(&self, req: Request<Incoming>, ctx: &RequestCtx) -> Response<HttpBody> {
        self.dispatch_from(0, req, ctx).await
    }

    /// Dispatch starting at `index`; boxed because actions may recurse
    /// into the chain through [`Next`]
    fn dispatch_from<'a>(
        &'a self,
        index: usize,
        req: Request<Incoming>,
        ctx: &'a RequestCtx,
    ) -> BoxFuture<'a, Response<HttpBody>> {
        Box::pin(async move {
            let mut i = index;
            while i < self.rules.len() {
                let rule = &self.rules[i];
                i += 1;
                if rule.matches(&req) {
                    let next = Next {
                        router: self,
                        ctx,
                        index: i,
                    };
                    return rule.action.handle(req, ctx, next).await;
                }
            }
            (self.fallback)(&req)
        })
    }

    /// Dispatch an upgrade request: same rule order, but only rules whose
    /// action exposes an upgrade handler are eligible, and the first
    /// match is terminal (no fallthrough).
    pub async fn dispatch_upgrade(
        &self,
        req: Request<Incoming>,
        ctx: &RequestCtx,
    ) -> Response<HttpBody> {
        for rule in &self.rules {
            if let Some(upgrade) = rule.action.upgrade_handler() {
                if rule.matches(&req) {
                    return upgrade.handle_upgrade(req, ctx).await;
                }
            }
        }
        (self.fallback)(&req)
    }
}

/// Extract the hostname from the Host header, stripped of any port and
/// lowercased
pub fn host_of<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(':').next())
        .map(|h| h.to_ascii_lowercase())
}

impl MatchSpec {
    /// Evaluate the predicate against the request components; every
    /// present field must match
    pub fn matches_parts(&self, method: &Method, host: Option<&str>, path: &str) -> bool {
        if let Some(want) = &self.method {
            if !want.eq_ignore_ascii_case(method.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.host {
            match host {
                Some(host) => {
                    if !want.eq_ignore_ascii_case(host) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(want) = &self.path {
            if want != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !path_has_prefix(path, prefix) {
                return false;
            }
        }
        true
    }
}

/// Segment-aligned prefix match: "/api" matches "/api" and "/api/x" but
/// not "/apix"
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(
        host: Option<&str>,
        path: Option<&str>,
        path_prefix: Option<&str>,
        method: Option<&str>,
    ) -> MatchSpec {
        MatchSpec {
            host: host.map(String::from),
            path: path.map(String::from),
            path_prefix: path_prefix.map(String::from),
            method: method.map(String::from),
        }
    }

    #[test]
    fn test_empty_matcher_matches_everything() {
        let m = MatchSpec::default();
        assert!(m.matches_parts(&Method::GET, Some("a.test"), "/anything"));
        assert!(m.matches_parts(&Method::DELETE, None, "/"));
    }

    #[test]
    fn test_host_match_case_insensitive() {
        let m = spec(Some("App.Example.NET"), None, None, None);
        assert!(m.matches_parts(&Method::GET, Some("app.example.net"), "/"));
        assert!(!m.matches_parts(&Method::GET, Some("other.example.net"), "/"));
        assert!(!m.matches_parts(&Method::GET, None, "/"));
    }

    #[test]
    fn test_exact_path_match() {
        let m = spec(None, Some("/a"), None, None);
        assert!(m.matches_parts(&Method::GET, None, "/a"));
        assert!(!m.matches_parts(&Method::GET, None, "/a/b"));
        assert!(!m.matches_parts(&Method::GET, None, "/b"));
    }

    #[test]
    fn test_path_prefix_is_segment_aligned() {
        let m = spec(None, None, Some("/api"), None);
        assert!(m.matches_parts(&Method::GET, None, "/api"));
        assert!(m.matches_parts(&Method::GET, None, "/api/items"));
        assert!(!m.matches_parts(&Method::GET, None, "/apix"));

        let root = spec(None, None, Some("/"), None);
        assert!(root.matches_parts(&Method::GET, None, "/whatever"));
    }

    #[test]
    fn test_method_match() {
        let m = spec(None, None, None, Some("get"));
        assert!(m.matches_parts(&Method::GET, None, "/"));
        assert!(!m.matches_parts(&Method::POST, None, "/"));
    }

    #[test]
    fn test_all_fields_must_match() {
        let m = spec(Some("a.test"), None, Some("/api"), Some("POST"));
        assert!(m.matches_parts(&Method::POST, Some("a.test"), "/api/x"));
        assert!(!m.matches_parts(&Method::POST, Some("a.test"), "/other"));
        assert!(!m.matches_parts(&Method::GET, Some("a.test"), "/api/x"));
        assert!(!m.matches_parts(&Method::POST, Some("b.test"), "/api/x"));
    }
}
