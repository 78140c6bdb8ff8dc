//! Regex route table.
//!
//! Routes are tried in registration order and the first pattern with a
//! handler for the request method wins, so specific routes are registered
//! before general ones. A pattern written with an escaped `\?` is matched
//! against `path?query` instead of the path alone, which lets a route key
//! off query parameters such as `?service=git-upload-pack`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use regex::Regex;

use crate::canned;
use crate::resolve;

/// Per-request context handed to route handlers.
pub struct Request {
    pub method: Method,
    /// Normalized, percent-decoded URL path.
    pub path: String,
    /// Raw query string, without the `?`.
    pub query: String,
    pub headers: HeaderMap,
    pub body: Body,
    /// Authenticated principal established by the front-end, if any.
    pub principal: Option<String>,
    /// Named captures of the matched route pattern.
    pub captures: HashMap<String, String>,
}

impl Request {
    /// A named capture, or the empty string when the pattern has no such
    /// group.
    pub fn capture(&self, name: &str) -> &str {
        self.captures.get(name).map(String::as_str).unwrap_or("")
    }
}

#[async_trait]
pub trait Handle: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// One entry of the route table: a pattern, per-method handlers and an
/// optional fallback consulted when no method-specific handler exists.
pub struct Route {
    pattern: Regex,
    match_query: bool,
    methods: HashMap<Method, Arc<dyn Handle>>,
    fallback: Option<Arc<dyn Handle>>,
}

impl Route {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            match_query: pattern.contains("\\?"),
            methods: HashMap::new(),
            fallback: None,
        })
    }

    pub fn on(mut self, method: Method, handler: Arc<dyn Handle>) -> Self {
        self.methods.insert(method, handler);
        self
    }

    pub fn fallback(mut self, handler: Arc<dyn Handle>) -> Self {
        self.fallback = Some(handler);
        self
    }

    fn handler(&self, method: &Method) -> Option<&Arc<dyn Handle>> {
        self.methods.get(method).or(self.fallback.as_ref())
    }
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Match the request against the table and run the winning handler.
    ///
    /// A path that still points above the root after normalization is not
    /// matched at all. When patterns match but none accepts the method,
    /// the union of the methods they do accept is advertised in an `Allow`
    /// header on a 405.
    pub async fn dispatch(&self, mut request: Request) -> Response {
        let path = resolve::clean(&request.path);
        if resolve::is_trash(&path) {
            return canned::response(StatusCode::NOT_FOUND, HeaderMap::new());
        }

        let mut allowed = BTreeSet::new();
        for route in &self.routes {
            let target = if route.match_query {
                format!("{}?{}", path, request.query)
            } else {
                path.clone()
            };
            let Some(captures) = route.pattern.captures(&target) else {
                continue;
            };
            let Some(handler) = route.handler(&request.method) else {
                allowed.extend(route.methods.keys().map(|m| m.as_str().to_owned()));
                continue;
            };
            for name in route.pattern.capture_names().flatten() {
                if let Some(capture) = captures.name(name) {
                    request
                        .captures
                        .insert(name.to_owned(), capture.as_str().to_owned());
                }
            }
            request.path = path;
            return handler.handle(request).await;
        }

        if allowed.is_empty() {
            canned::response(StatusCode::NOT_FOUND, HeaderMap::new())
        } else {
            canned::method_not_allowed(allowed.iter().map(String::as_str))
        }
    }
}
