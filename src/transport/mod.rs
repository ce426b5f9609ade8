//! Destination transport subsystem.
//!
//! # Data Flow
//! ```text
//! DestinationRequest
//!     → file: / about: URLs answered locally (file.rs, special page)
//!     → ResponseCache hit? answer from cache
//!     → attempt loop (RetryPlan decides every resend):
//!         pooled HTTP/2 session (http2.rs)
//!         or fresh connection: DNS → TCP → [proxy / CONNECT tunnel]
//!            → [TLS: modern | legacy] → HTTP/2 or HTTP/1 (+ auth legs)
//!     → DestinationResponse (head only; body streams lazily)
//! ```
//!
//! # Design Decisions
//! - Each attempt races the class-specific timeout; a response that is
//!   ready in the same poll as the timer wins
//! - HTTP/1 connections are not reused across requests; HTTP/2 sessions are
//! - Failures are classified at the point they occur, never by message text

pub mod auth;
pub mod connect;
pub mod error;
pub mod file;
pub mod http2;
pub mod request;
pub mod response;
pub mod retry;
pub mod tls;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use bytes::Bytes;
use dashmap::DashSet;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::cache::ResponseCache;
use crate::config::TransportConfig;
use crate::observability::metrics;

pub use auth::{AuthScheme, Credentials};
pub use connect::ExternalProxy;
pub use error::{HeaderParseError, TransportError};
pub use http2::Http2SessionPool;
pub use request::{DestinationRequest, RequestClass};
pub use response::{DestinationResponse, ResponseBody, ResponseSource};
pub use retry::{AttemptOutcome, NextStep, RetryPlan, RetryReason};

use connect::BoxedIo;
use http2::Http2Sender;
use tls::{TlsConnectors, TlsFailure, TlsMode};

/// Headers HTTP/2 forbids on requests.
const CONNECTION_SPECIFIC: [&str; 5] = ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

#[derive(Debug, Clone, Copy, Default)]
struct AttemptOptions {
    auth: Option<AuthScheme>,
    legacy_tls: bool,
    force_http1: bool,
}

enum AttemptError {
    TlsNegotiation(TransportError),
    Http2Stream(TransportError),
    Failed(TransportError),
}

impl AttemptError {
    fn into_inner(self) -> TransportError {
        match self {
            AttemptError::TlsNegotiation(err) | AttemptError::Http2Stream(err) | AttemptError::Failed(err) => err,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestForm {
    /// `/path?query`
    Origin,
    /// `http://host/path?query`, for plain HTTP through a proxy and HTTP/2.
    Absolute,
}

/// Fetches destination resources for the pipeline.
pub struct DestinationTransport {
    config: TransportConfig,
    tls: TlsConnectors,
    legacy_tls_hosts: DashSet<String>,
    http2: Http2SessionPool,
    cache: Arc<ResponseCache>,
    max_body_size: usize,
}

impl DestinationTransport {
    pub fn new(config: TransportConfig, cache: Arc<ResponseCache>, max_body_size: usize) -> Result<Self, rustls::Error> {
        Ok(Self {
            tls: TlsConnectors::new(config.ignore_certificate_errors)?,
            legacy_tls_hosts: DashSet::new(),
            http2: Http2SessionPool::new(config.http2_max_sessions, config.http2_idle_timeout()),
            cache,
            config,
            max_body_size,
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn http2_pool(&self) -> &Http2SessionPool {
        &self.http2
    }

    /// Whether `host:port` is known to need the legacy TLS connector.
    pub fn is_legacy_tls_host(&self, host_port: &str) -> bool {
        self.legacy_tls_hosts.contains(host_port)
    }

    /// Fetch `req`, running the bounded retry loop.
    pub async fn send(&self, req: &DestinationRequest) -> Result<DestinationResponse, TransportError> {
        match req.url.scheme() {
            "file" => return file::fetch(&req.url, self.max_body_size).await,
            "about" => return Ok(DestinationResponse::special_page()),
            _ => {}
        }

        if let Some(hit) = self.cache.get_response(req.cache_request()) {
            tracing::debug!(url = %req.url, hits = hit.hits, "Destination response served from cache");
            return Ok(DestinationResponse::from_cache(hit));
        }

        let tls_key = req
            .host_port()
            .map(|(host, port)| format!("{host}:{port}"))
            .unwrap_or_default();
        let mut options = AttemptOptions {
            legacy_tls: self.legacy_tls_hosts.contains(&tls_key),
            ..AttemptOptions::default()
        };
        let mut plan = RetryPlan::new(req.credentials.is_some(), options.legacy_tls);

        loop {
            let outcome = self.attempt(req, options).await;
            let step = match &outcome {
                Ok(res) => plan.next_step(AttemptOutcome::Response {
                    status: res.status,
                    headers: &res.headers,
                }),
                Err(AttemptError::TlsNegotiation(_)) => plan.next_step(AttemptOutcome::TlsNegotiationFailed),
                Err(AttemptError::Http2Stream(_)) => plan.next_step(AttemptOutcome::Http2StreamFailed),
                Err(AttemptError::Failed(_)) => NextStep::Finish,
            };

            match step {
                NextStep::Finish => return outcome.map_err(AttemptError::into_inner),
                NextStep::Resend(reason) => {
                    tracing::debug!(url = %req.url, reason = reason.label(), "Resending destination request");
                    metrics::record_destination_retry(reason.label());
                    match reason {
                        RetryReason::Credentials(scheme) => options.auth = Some(scheme),
                        RetryReason::TlsDowngrade => {
                            tracing::warn!(host = %tls_key, "TLS negotiation failed, switching host to legacy TLS");
                            self.legacy_tls_hosts.insert(tls_key.clone());
                            options.legacy_tls = true;
                        }
                        RetryReason::Http1Fallback => {
                            self.http2.remove(&req.origin());
                            options.force_http1 = true;
                        }
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        req: &DestinationRequest,
        options: AttemptOptions,
    ) -> Result<DestinationResponse, AttemptError> {
        match race_timeout(self.exchange(req, options), req.timeout).await {
            Some(result) => result,
            None => Err(AttemptError::Failed(TransportError::Timeout {
                url: req.url.to_string(),
                timeout: req.timeout,
            })),
        }
    }

    async fn exchange(
        &self,
        req: &DestinationRequest,
        options: AttemptOptions,
    ) -> Result<DestinationResponse, AttemptError> {
        let (host, port) = req
            .host_port()
            .ok_or_else(|| AttemptError::Failed(TransportError::Request(format!("{} has no host", req.url))))?;
        let https = req.is_https();
        let origin = req.origin();
        let proxy = req.external_proxy.as_ref().filter(|p| !p.should_bypass(&host));

        let try_http2 = https
            && self.config.http2_enabled
            && !req.disable_http2
            && !req.is_websocket
            && !options.force_http1
            && !options.legacy_tls
            && options.auth != Some(AuthScheme::Ntlm)
            && !self.http2.is_unsupported(&origin);

        if try_http2 {
            if let Some(sender) = self.http2.get(&origin) {
                return send_http2(sender, req, options).await;
            }
        }

        let connect_timeout = self.config.connect_timeout();
        let stream = match proxy {
            Some(proxy) => {
                let stream = connect::connect(&proxy.host, proxy.port, connect_timeout)
                    .await
                    .map_err(AttemptError::Failed)?;
                if https {
                    let target = if host.contains(':') {
                        format!("[{host}]:{port}")
                    } else {
                        format!("{host}:{port}")
                    };
                    connect::establish_tunnel(stream, proxy, &target)
                        .await
                        .map_err(AttemptError::Failed)?
                } else {
                    stream
                }
            }
            None => connect::connect(&host, port, connect_timeout)
                .await
                .map_err(AttemptError::Failed)?,
        };

        let io: BoxedIo = if https {
            let mode = if options.legacy_tls {
                TlsMode::Legacy
            } else if try_http2 {
                TlsMode::ModernH2
            } else {
                TlsMode::ModernHttp1
            };
            let (tls, negotiated_h2) = self.tls.connect(mode, &host, stream).await.map_err(|failure| match failure {
                TlsFailure::Negotiation(err) => AttemptError::TlsNegotiation(err),
                TlsFailure::Other(err) => AttemptError::Failed(err),
            })?;

            if try_http2 {
                if negotiated_h2 {
                    let sender = open_http2(tls).await.map_err(AttemptError::Failed)?;
                    self.http2.insert(&origin, sender.clone());
                    return send_http2(sender, req, options).await;
                }
                self.http2.mark_unsupported(&origin);
            }
            Box::new(tls)
        } else {
            Box::new(stream)
        };

        let via_plain_proxy = proxy.filter(|_| !https);
        send_http1(io, req, options, via_plain_proxy).await.map_err(AttemptError::Failed)
    }
}

/// Run `future` against a deadline. `None` when the deadline passes first;
/// an output that is ready in the same poll as the deadline wins.
async fn race_timeout<F: Future>(future: F, timeout: Duration) -> Option<F::Output> {
    tokio::select! {
        biased;
        output = future => Some(output),
        _ = tokio::time::sleep(timeout) => None,
    }
}

async fn open_http2(io: TlsStream<TcpStream>) -> Result<Http2Sender, TransportError> {
    let (sender, connection) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .handshake(TokioIo::new(io))
        .await
        .map_err(TransportError::from_hyper)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "HTTP/2 destination connection closed with error");
        }
    });
    Ok(sender)
}

async fn send_http2(
    mut sender: Http2Sender,
    req: &DestinationRequest,
    options: AttemptOptions,
) -> Result<DestinationResponse, AttemptError> {
    let authorization = authorization(req, options.auth);
    let request = build_request(req, RequestForm::Absolute, authorization, None, req.body.clone(), true)
        .map_err(AttemptError::Failed)?;

    let stream_failed = |err| AttemptError::Http2Stream(TransportError::from_hyper(err));
    sender.ready().await.map_err(stream_failed)?;
    let response = sender.send_request(request).await.map_err(stream_failed)?;
    Ok(into_destination_response(response, ResponseSource::Http2))
}

async fn send_http1(
    io: BoxedIo,
    req: &DestinationRequest,
    options: AttemptOptions,
    via_plain_proxy: Option<&ExternalProxy>,
) -> Result<DestinationResponse, TransportError> {
    let (mut sender, connection) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(TransportError::from_hyper)?;
    tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            tracing::debug!(error = %err, "HTTP/1 destination connection closed with error");
        }
    });

    let (form, proxy_authorization) = match via_plain_proxy {
        Some(proxy) => (RequestForm::Absolute, proxy.authorization()),
        None => (RequestForm::Origin, None),
    };

    let response = match (options.auth, req.credentials.as_ref()) {
        (Some(AuthScheme::Ntlm), Some(credentials)) => {
            ntlm_exchange(&mut sender, req, form, proxy_authorization, credentials).await?
        }
        (auth, _) => {
            let request = build_request(req, form, authorization(req, auth), proxy_authorization, req.body.clone(), false)?;
            send_on(&mut sender, request).await?
        }
    };

    if via_plain_proxy.is_some() && response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return Err(TransportError::ProxyAuth);
    }
    Ok(into_destination_response(response, ResponseSource::Http1))
}

/// Negotiate and authenticate legs on one connection.
async fn ntlm_exchange(
    sender: &mut http1::SendRequest<Full<Bytes>>,
    req: &DestinationRequest,
    form: RequestForm,
    proxy_authorization: Option<HeaderValue>,
    credentials: &Credentials,
) -> Result<Response<Incoming>, TransportError> {
    let negotiate = build_request(
        req,
        form,
        Some(auth::ntlm_negotiate_header()),
        proxy_authorization.clone(),
        Bytes::new(),
        false,
    )?;
    let response = send_on(sender, negotiate).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }
    let Some(challenge) = auth::parse_ntlm_challenge(response.headers()) else {
        return Ok(response);
    };

    // The connection only carries the next leg once this body is consumed.
    response
        .into_body()
        .collect()
        .await
        .map_err(TransportError::from_hyper)?;

    let authenticate = build_request(
        req,
        form,
        Some(auth::ntlm_authenticate_header(credentials, &challenge)),
        proxy_authorization,
        req.body.clone(),
        false,
    )?;
    send_on(sender, authenticate).await
}

async fn send_on(
    sender: &mut http1::SendRequest<Full<Bytes>>,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, TransportError> {
    sender.ready().await.map_err(TransportError::from_hyper)?;
    sender.send_request(request).await.map_err(TransportError::from_hyper)
}

fn authorization(req: &DestinationRequest, auth: Option<AuthScheme>) -> Option<HeaderValue> {
    match (auth, req.credentials.as_ref()) {
        (Some(AuthScheme::Basic), Some(credentials)) => Some(auth::basic_authorization(credentials)),
        _ => None,
    }
}

fn build_request(
    req: &DestinationRequest,
    form: RequestForm,
    authorization: Option<HeaderValue>,
    proxy_authorization: Option<HeaderValue>,
    body: Bytes,
    http2: bool,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let uri = match form {
        RequestForm::Absolute => req.url.as_str().to_string(),
        RequestForm::Origin => match req.url.query() {
            Some(query) => format!("{}?{}", req.url.path(), query),
            None => req.url.path().to_string(),
        },
    };

    let mut builder = Request::builder().method(req.method.clone()).uri(uri);
    if http2 {
        builder = builder.version(Version::HTTP_2);
    }
    let mut request = builder
        .body(Full::new(body))
        .map_err(|err| TransportError::Request(err.to_string()))?;

    let headers = request.headers_mut();
    *headers = req.headers.clone();
    // Bodies are buffered; hyper frames them from their exact length.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);

    if http2 {
        headers.remove(header::HOST);
        for name in CONNECTION_SPECIFIC {
            headers.remove(HeaderName::from_static(name));
        }
    } else if !headers.contains_key(header::HOST) {
        if let Some(authority) = req.authority() {
            let value = HeaderValue::from_str(&authority).map_err(|err| TransportError::Request(err.to_string()))?;
            headers.insert(header::HOST, value);
        }
    }

    if let Some(value) = authorization {
        headers.insert(header::AUTHORIZATION, value);
    }
    if let Some(value) = proxy_authorization {
        headers.insert(header::PROXY_AUTHORIZATION, value);
    }
    Ok(request)
}

fn into_destination_response(mut response: Response<Incoming>, source: ResponseSource) -> DestinationResponse {
    let upgrade = (response.status() == StatusCode::SWITCHING_PROTOCOLS).then(|| hyper::upgrade::on(&mut response));
    let (parts, body) = response.into_parts();
    DestinationResponse {
        source,
        status: parts.status,
        headers: parts.headers,
        trailers: None,
        body: ResponseBody::Incoming(body),
        upgrade,
    }
}
