//! Per-request pipeline state and request dispatch.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, request, HeaderMap, Request, Response};
use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use serde_json::Value;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::pipeline::content_info::ContentInfo;
use crate::pipeline::headers::{AJAX_MARKER, CREDENTIALS_MARKER};
use crate::pipeline::stages::Stage;
use crate::pipeline::websocket::SocketErrorPolicy;
use crate::proxy_url::domain::{origin_of, registrable_domain};
use crate::proxy_url::{self, ProxyLocation, ProxyUrlDescriptor, ResourceType};
use crate::session::hooks::{ConfigureResponseOptions, RequestFilterRule, ResponseMock};
use crate::session::{parse_client_sync_cookies, Session, SessionRegistry};
use crate::transport::{DestinationRequest, DestinationResponse, RequestClass};

/// Why a request could not be routed into the pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("not a proxy URL: {0}")]
    UnrecognizedUrl(String),

    #[error("no open session {0:?}")]
    UnknownSession(String),
}

/// Fetch credentials mode reported by the client sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

impl CredentialsMode {
    fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("include") => CredentialsMode::Include,
            Some(v) if v.eq_ignore_ascii_case("omit") => CredentialsMode::Omit,
            _ => CredentialsMode::SameOrigin,
        }
    }
}

/// Destination facts decoded from the proxy URL and the referrer.
#[derive(Debug, Clone)]
pub struct DestInfo {
    pub url: Url,
    pub session_id: String,
    pub window_id: Option<String>,
    pub resource_type: ResourceType,
    pub charset: Option<String>,
    pub req_origin: Option<String>,
    pub origin: String,
    pub domain: String,
    /// Destination URL of the referring page, when it was proxied.
    pub referer: Option<Url>,
    pub referer_origin: Option<String>,
    /// Listener the request arrived on.
    pub proxy: ProxyLocation,
}

impl DestInfo {
    pub fn from_descriptor(descriptor: ProxyUrlDescriptor, referer: Option<&ProxyUrlDescriptor>) -> Self {
        let url = descriptor.destination;
        Self {
            origin: origin_of(&url),
            domain: registrable_domain(url.host_str().unwrap_or_default()),
            session_id: descriptor.session_id,
            window_id: descriptor.window_id,
            resource_type: descriptor.resource_type,
            charset: descriptor.charset,
            req_origin: descriptor.req_origin,
            referer: referer.map(|r| r.destination.clone()),
            referer_origin: referer.map(|r| origin_of(&r.destination)),
            proxy: descriptor.proxy,
            url,
        }
    }

    pub fn is_file(&self) -> bool {
        self.url.scheme() == "file"
    }

    /// Whether the referring page lives on another origin.
    pub fn is_cross_origin(&self) -> bool {
        self.referer_origin.as_ref().is_some_and(|r| *r != self.origin)
    }

    /// Origin of the page that issued the request, if known.
    pub fn initiator_origin(&self) -> Option<&str> {
        self.req_origin.as_deref().or(self.referer_origin.as_deref())
    }
}

/// How the request is classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub is_ajax: bool,
    pub is_page: bool,
    pub is_iframe: bool,
    pub is_websocket: bool,
    pub is_special_page: bool,
    pub is_html_import: bool,
    pub is_event_source: bool,
    pub credentials: CredentialsMode,
}

impl RequestFlags {
    fn classify(headers: &HeaderMap, resource_type: ResourceType, is_special_page: bool) -> Self {
        let is_ajax = headers.contains_key(AJAX_MARKER) || resource_type.is_ajax();
        let accepts_html = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"));
        let is_html_import = resource_type.is_html_import();

        Self {
            is_ajax,
            is_page: (!is_ajax && accepts_html) || is_html_import,
            is_iframe: resource_type.is_iframe(),
            is_websocket: resource_type.is_web_socket(),
            is_special_page,
            is_html_import,
            is_event_source: resource_type.is_event_source(),
            credentials: CredentialsMode::from_header(headers.get(CREDENTIALS_MARKER).and_then(|v| v.to_str().ok())),
        }
    }

    pub fn request_class(&self) -> RequestClass {
        if self.is_event_source {
            RequestClass::EventSource
        } else if self.is_ajax {
            RequestClass::Ajax
        } else {
            RequestClass::Navigation
        }
    }
}

/// Mutable state threaded through the stage sequence for one request.
pub struct PipelineContext {
    pub request_id: Uuid,
    pub req: request::Parts,
    pub req_body: Bytes,
    pub(crate) client_body: Option<Body>,
    pub client_upgrade: Option<OnUpgrade>,
    pub socket_policy: SocketErrorPolicy,
    /// Browser cookies that were not sync records.
    pub client_cookies: Vec<String>,
    pub session: Arc<Session>,
    pub dest: DestInfo,
    pub flags: RequestFlags,

    pub outbound: Option<DestinationRequest>,
    pub dest_res: Option<DestinationResponse>,
    pub content_info: Option<ContentInfo>,
    pub dest_res_body: Option<Bytes>,
    pub dest_res_trailers: Option<HeaderMap>,
    pub non_processed_dest_res_body: Option<Bytes>,
    pub processed_body: Option<Bytes>,
    pub temporary_cache_entry: Option<CacheEntry>,

    pub mock: Option<ResponseMock>,
    pub request_filter_rules: Vec<RequestFilterRule>,
    pub on_response_event_data: Vec<(RequestFilterRule, ConfigureResponseOptions)>,
    /// Storage snapshot restored into the page being served.
    pub restored_storages: Option<Value>,

    pub go_to_next_stage: bool,
    pub is_same_origin_policy_failed: bool,
    pub restart_used: bool,
    pub(crate) restart_at: Option<Stage>,

    pub response: Option<Response<Body>>,
    pub aborted: bool,
    pub started: Instant,
}

impl PipelineContext {
    /// Decode the proxy URL of `req` and bind it to its session.
    ///
    /// A path that is not a proxy URL is resolved against the proxied
    /// referrer, which covers pages that bypass the client-side rewriting.
    pub fn dispatch(
        req: Request<Body>,
        sessions: &SessionRegistry,
        proxy: ProxyLocation,
    ) -> Result<Self, DispatchError> {
        let (req, body) = req.into_parts();
        let path = req.uri.path_and_query().map_or("/", |pq| pq.as_str());

        let referer = req
            .headers
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .and_then(proxy_url::decode);

        let descriptor = match proxy_url::decode_path(path, proxy.clone()) {
            Some(descriptor) => descriptor,
            None => {
                let referer = referer
                    .as_ref()
                    .ok_or_else(|| DispatchError::UnrecognizedUrl(path.to_string()))?;
                let destination = proxy_url::resolve_destination(&referer.destination, path)
                    .ok_or_else(|| DispatchError::UnrecognizedUrl(path.to_string()))?;
                ProxyUrlDescriptor {
                    dest_url: destination.to_string(),
                    destination,
                    session_id: referer.session_id.clone(),
                    window_id: referer.window_id.clone(),
                    resource_type: ResourceType::empty(),
                    charset: None,
                    req_origin: None,
                    proxy,
                }
            }
        };

        let session = sessions
            .get(&descriptor.session_id)
            .ok_or_else(|| DispatchError::UnknownSession(descriptor.session_id.clone()))?;

        let flags = RequestFlags::classify(&req.headers, descriptor.resource_type, descriptor.special_page().is_some());
        let dest = DestInfo::from_descriptor(descriptor, referer.as_ref());

        let client_cookies = match req.headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
            Some(cookie) => {
                let (records, rest) = parse_client_sync_cookies(cookie, session.id());
                if !records.is_empty() {
                    session.cookies().set_by_client(&records);
                }
                rest
            }
            None => Vec::new(),
        };

        Ok(Self {
            request_id: Uuid::new_v4(),
            req,
            req_body: Bytes::new(),
            client_body: Some(body),
            client_upgrade: None,
            socket_policy: SocketErrorPolicy::default(),
            client_cookies,
            session,
            dest,
            flags,
            outbound: None,
            dest_res: None,
            content_info: None,
            dest_res_body: None,
            dest_res_trailers: None,
            non_processed_dest_res_body: None,
            processed_body: None,
            temporary_cache_entry: None,
            mock: None,
            request_filter_rules: Vec::new(),
            on_response_event_data: Vec::new(),
            restored_storages: None,
            go_to_next_stage: true,
            is_same_origin_policy_failed: false,
            restart_used: false,
            restart_at: None,
            response: None,
            aborted: false,
            started: Instant::now(),
        })
    }

    /// Finish the sequence with `response`.
    pub fn respond(&mut self, response: Response<Body>) {
        self.response = Some(response);
        self.go_to_next_stage = false;
    }

    /// Finish the sequence by dropping the client connection.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.go_to_next_stage = false;
    }

    pub(crate) fn take_client_body(&mut self) -> Option<Body> {
        self.client_body.take()
    }

    pub fn has_hook_rules(&self) -> bool {
        !self.request_filter_rules.is_empty()
    }
}
