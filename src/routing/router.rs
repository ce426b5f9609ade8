//! Service route lookup.
//!
//! # Responsibilities
//! - Store static resources and handler routes
//! - Answer matching requests before they reach the pipeline
//! - Hand unmatched requests back to the caller untouched
//!
//! # Design Decisions
//! - Exact routes live in a `HashMap` keyed by method and path
//! - Parametrized routes are scanned in registration order, first match wins
//! - Static resources carry a content hash ETag and honor `If-None-Match`

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use md5::{Digest, Md5};

use crate::routing::matcher::{RouteParams, RoutePattern};

/// A handler for a registered route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, req: Request<Body>, params: RouteParams) -> Response<Body>;
}

/// A fixed resource served with validation headers.
#[derive(Debug, Clone)]
pub struct StaticResource {
    content: Bytes,
    content_type: HeaderValue,
    etag: HeaderValue,
}

impl StaticResource {
    pub fn new(content: impl Into<Bytes>, content_type: &'static str) -> Self {
        let content = content.into();
        let digest = Md5::digest(&content);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let etag = HeaderValue::from_str(&format!("\"{hex}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("\"\""));

        Self {
            content,
            content_type: HeaderValue::from_static(content_type),
            etag,
        }
    }

    pub fn etag(&self) -> &HeaderValue {
        &self.etag
    }

    fn is_not_modified(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let etag = self.etag.to_str().unwrap_or_default();
        value.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag == etag || tag.strip_prefix("W/") == Some(etag)
        })
    }

    fn respond(&self, headers: &HeaderMap) -> Response<Body> {
        let mut response = if self.is_not_modified(headers) {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            response
        } else {
            let mut response = Response::new(Body::from(self.content.clone()));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, self.content_type.clone());
            response
        };

        let headers = response.headers_mut();
        headers.insert(header::ETAG, self.etag.clone());
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=30, must-revalidate"),
        );
        response
    }
}

#[derive(Clone)]
enum RouteTarget {
    Static(StaticResource),
    Handler(Arc<dyn RouteHandler>),
}

struct ParamRoute {
    method: Method,
    pattern: RoutePattern,
    handler: Arc<dyn RouteHandler>,
}

/// Routes served by the proxy itself rather than a destination.
#[derive(Default)]
pub struct ServiceRouter {
    exact: HashMap<(Method, String), RouteTarget>,
    parametrized: Vec<ParamRoute>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a static resource under `GET path`.
    pub fn add_static(&mut self, path: &str, resource: StaticResource) {
        self.exact
            .insert((Method::GET, path.to_string()), RouteTarget::Static(resource));
    }

    /// Register a handler. `pattern` may contain `{param}` segments.
    pub fn add(&mut self, method: Method, pattern: &str, handler: Arc<dyn RouteHandler>) {
        let compiled = RoutePattern::parse(pattern);
        if compiled.is_static() {
            self.exact
                .insert((method, pattern.to_string()), RouteTarget::Handler(handler));
        } else {
            self.parametrized.push(ParamRoute {
                method,
                pattern: compiled,
                handler,
            });
        }
    }

    /// Unregister every route registered for `method` and `pattern`.
    pub fn remove(&mut self, method: &Method, pattern: &str) {
        self.exact.remove(&(method.clone(), pattern.to_string()));
        let compiled = RoutePattern::parse(pattern);
        self.parametrized
            .retain(|route| route.method != *method || route.pattern != compiled);
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.parametrized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer `req` if a route matches, otherwise give it back.
    pub async fn route(&self, req: Request<Body>) -> Result<Response<Body>, Request<Body>> {
        let path = req.uri().path().to_string();

        if let Some(target) = self.exact.get(&(req.method().clone(), path.clone())) {
            tracing::debug!(path = %path, "Service route matched");
            return Ok(match target {
                RouteTarget::Static(resource) => resource.respond(req.headers()),
                RouteTarget::Handler(handler) => handler.handle(req, RouteParams::new()).await,
            });
        }

        let matched = self
            .parametrized
            .iter()
            .filter(|route| route.method == req.method())
            .find_map(|route| route.pattern.matches(&path).map(|params| (route, params)));

        match matched {
            Some((route, params)) => {
                tracing::debug!(path = %path, "Parametrized service route matched");
                Ok(route.handler.handle(req, params).await)
            }
            None => Err(req),
        }
    }
}
