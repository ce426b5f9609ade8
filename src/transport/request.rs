//! Outbound request description.

use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use url::Url;

use crate::cache::CacheRequest;
use crate::config::TransportConfig;
use crate::transport::auth::Credentials;
use crate::transport::connect::ExternalProxy;

/// Request class; selects the time-to-first-byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Navigation,
    Ajax,
    EventSource,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestClass::Navigation => "navigation",
            RequestClass::Ajax => "ajax",
            RequestClass::EventSource => "event_source",
        }
    }

    /// Configured limit for this class.
    pub fn timeout(&self, config: &TransportConfig) -> Duration {
        let secs = match self {
            RequestClass::Navigation => config.page_request_secs,
            RequestClass::Ajax => config.ajax_request_secs,
            RequestClass::EventSource => config.event_source_request_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Everything needed to fetch one destination resource.
#[derive(Debug, Clone)]
pub struct DestinationRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub credentials: Option<Credentials>,
    pub external_proxy: Option<ExternalProxy>,
    pub timeout: Duration,
    pub class: RequestClass,
    pub is_websocket: bool,
    pub disable_http2: bool,
}

impl DestinationRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            credentials: None,
            external_proxy: None,
            timeout: Duration::from_secs(120),
            class: RequestClass::Navigation,
            is_websocket: false,
            disable_http2: false,
        }
    }

    pub fn cache_request(&self) -> CacheRequest<'_> {
        CacheRequest {
            method: &self.method,
            url: self.url.as_str(),
            headers: &self.headers,
        }
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https" || self.url.scheme() == "wss"
    }

    /// `host:port` with the scheme default port filled in.
    pub fn host_port(&self) -> Option<(String, u16)> {
        let host = self.url.host_str()?.trim_start_matches('[').trim_end_matches(']');
        let port = self.url.port_or_known_default()?;
        Some((host.to_string(), port))
    }

    /// `Host` header value: port omitted when it is the default.
    pub fn authority(&self) -> Option<String> {
        let host = self.url.host_str()?;
        Some(match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Origin key used by the HTTP/2 pool.
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}
