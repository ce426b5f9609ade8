//! The fixed stage sequence every proxied request runs through.
//!
//! # Data Flow
//! ```text
//! 1 guard websocket ─ 2 collect request body ─ 3 send destination request
//!   ─ 4 same-origin check ─ 5 decide processing ─┬─ websocket: 101 + relay
//!                                                ├─ pass-through: stream body (tee)
//!                                                └─ 6 fetch body ─ 7 process ─ 8 send
//!                          ▲                                         │
//!                          └──────── charset restart (once) ─────────┘
//! ```
//!
//! # Design Decisions
//! - A stage that produces the response clears `go_to_next_stage`
//! - Stage 6 is a no-op when the body is already buffered, so a restart
//!   never refetches
//! - Hook failures are isolated per rule and never reach the error policy

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use hyper::upgrade::OnUpgrade;
use thiserror::Error;

use crate::cache::{CacheEntry, ResponseCache};
use crate::observability::metrics;
use crate::pipeline::content_info::ContentInfo;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::error::{self, PipelineError};
use crate::pipeline::rewrite::{ProcessingInput, ProcessingOutcome, ResourceKind, UrlReplacer};
use crate::pipeline::websocket::{spawn_relay, SocketErrorPolicy};
use crate::pipeline::{encoding, headers, same_origin, PipelineServices};
use crate::proxy_url;
use crate::session::hooks::{
    call_for_rule, ConfigureResponseOptions, OnConfigureResponseEvent, OnRequestEvent, OnResponseEvent,
    RequestEvent, RequestFilterRule, RequestInfo, ResponseMock,
};
use crate::session::upload::is_multipart;
use crate::session::Session;
use crate::transport::{DestinationRequest, DestinationResponse, RequestClass, ResponseBody, ResponseSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    GuardWebSocket,
    CollectRequestBody,
    SendDestinationRequest,
    CheckSameOriginPolicy,
    DecideProcessing,
    FetchContent,
    ProcessContent,
    SendProcessedResponse,
}

impl Stage {
    pub const FIRST: Stage = Stage::GuardWebSocket;

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::GuardWebSocket => Some(Stage::CollectRequestBody),
            Stage::CollectRequestBody => Some(Stage::SendDestinationRequest),
            Stage::SendDestinationRequest => Some(Stage::CheckSameOriginPolicy),
            Stage::CheckSameOriginPolicy => Some(Stage::DecideProcessing),
            Stage::DecideProcessing => Some(Stage::FetchContent),
            Stage::FetchContent => Some(Stage::ProcessContent),
            Stage::ProcessContent => Some(Stage::SendProcessedResponse),
            Stage::SendProcessedResponse => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GuardWebSocket => "guard_websocket",
            Stage::CollectRequestBody => "collect_request_body",
            Stage::SendDestinationRequest => "send_destination_request",
            Stage::CheckSameOriginPolicy => "check_same_origin_policy",
            Stage::DecideProcessing => "decide_processing",
            Stage::FetchContent => "fetch_content",
            Stage::ProcessContent => "process_content",
            Stage::SendProcessedResponse => "send_processed_response",
        }
    }
}

/// The client connection must be dropped instead of answered.
#[derive(Debug, Error)]
#[error("request aborted")]
pub struct PipelineAborted;

/// Run every stage for `ctx` and return the browser-facing response.
pub async fn run(mut ctx: PipelineContext, services: &PipelineServices) -> Result<Response<Body>, PipelineAborted> {
    let mut next = Some(Stage::FIRST);

    while let Some(stage) = next {
        tracing::trace!(request_id = %ctx.request_id, stage = stage.as_str(), "Entering stage");

        let result = match stage {
            Stage::GuardWebSocket => {
                guard_websocket(&mut ctx);
                Ok(())
            }
            Stage::CollectRequestBody => collect_request_body(&mut ctx, services).await,
            Stage::SendDestinationRequest => send_destination_request(&mut ctx, services).await,
            Stage::CheckSameOriginPolicy => {
                check_same_origin_policy(&mut ctx);
                Ok(())
            }
            Stage::DecideProcessing => decide_processing(&mut ctx, services).await,
            Stage::FetchContent => fetch_content(&mut ctx, services).await,
            Stage::ProcessContent => process_content(&mut ctx, services).await,
            Stage::SendProcessedResponse => send_processed_response(&mut ctx).await,
        };

        if let Err(err) = result {
            error::handle(&mut ctx, err);
        }
        if !ctx.go_to_next_stage {
            break;
        }
        next = ctx.restart_at.take().or_else(|| stage.next());
    }

    let kind = ctx.flags.request_class().as_str();
    if ctx.aborted {
        metrics::record_request(kind, 0, ctx.started);
        return Err(PipelineAborted);
    }

    let response = ctx.response.take().unwrap_or_else(|| {
        error::text_response(StatusCode::INTERNAL_SERVER_ERROR, "no response was produced".to_string())
    });
    metrics::record_request(kind, response.status().as_u16(), ctx.started);
    Ok(response)
}

fn guard_websocket(ctx: &mut PipelineContext) {
    if ctx.flags.is_websocket {
        ctx.client_upgrade = ctx.req.extensions.remove::<OnUpgrade>();
        ctx.socket_policy = SocketErrorPolicy::IgnoreResets;
    }
}

async fn collect_request_body(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PipelineError> {
    if let Some(body) = ctx.take_client_body() {
        let limit = services.max_body_size;
        let collected = Limited::new(body, limit).collect().await.map_err(|err| {
            if err.is::<LengthLimitError>() {
                PipelineError::RequestBodyTooLarge { limit }
            } else {
                PipelineError::RequestBody(err.to_string())
            }
        })?;
        ctx.req_body = collected.to_bytes();
    }

    if ctx.flags.is_page && !ctx.flags.is_iframe && !ctx.flags.is_ajax {
        if let Some(snapshot) = ctx.session.take_pending_state_snapshot() {
            tracing::debug!(request_id = %ctx.request_id, session_id = %ctx.session.id(), "Restoring state snapshot");
            if let Some(cookies) = &snapshot.cookies {
                ctx.session.cookies().restore(cookies);
            }
            ctx.restored_storages = Some(snapshot.storages);
        }
    }

    Ok(())
}

async fn send_destination_request(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PipelineError> {
    let session = Arc::clone(&ctx.session);
    let options = session.options();

    let mut body = ctx.req_body.clone();
    if let Some(uploads) = session.uploads() {
        let content_type = ctx
            .req
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if is_multipart(content_type) {
            body = uploads.rewrite(content_type, body);
        }
    }

    let class = ctx.flags.request_class();
    let timeout = match class {
        RequestClass::Navigation => options.page_request_timeout,
        RequestClass::Ajax => options.ajax_request_timeout,
        RequestClass::EventSource => None,
    }
    .unwrap_or_else(|| class.timeout(&services.transport_config));

    let mut outbound = DestinationRequest::new(ctx.req.method.clone(), ctx.dest.url.clone());
    outbound.headers = headers::request_headers(ctx)?;
    outbound.body = body;
    outbound.credentials = options.credentials.clone();
    outbound.external_proxy = options.external_proxy.clone();
    outbound.timeout = timeout;
    outbound.class = class;
    outbound.is_websocket = ctx.flags.is_websocket;
    outbound.disable_http2 = options.disable_http2;

    run_request_hooks(ctx, &session, &mut outbound).await;

    let response = match ctx.mock.clone() {
        Some(mock) => mock_response(mock),
        None => services.transport.send(&outbound).await?,
    };
    tracing::debug!(
        request_id = %ctx.request_id,
        url = %outbound.url,
        status = response.status.as_u16(),
        source = response.source.as_str(),
        "Destination responded"
    );

    ctx.content_info = Some(ContentInfo::compute(
        &ctx.req.method,
        &ctx.flags,
        &ctx.dest,
        response.status,
        &response.headers,
    ));
    let from_network = matches!(response.source, ResponseSource::Http1 | ResponseSource::Http2);
    if from_network && services.cache.should_cache(ctx) {
        ctx.temporary_cache_entry = services
            .cache
            .create(outbound.cache_request(), response.status, &response.headers);
    }

    ctx.dest_res = Some(response);
    ctx.outbound = Some(outbound);
    Ok(())
}

async fn run_request_hooks(ctx: &mut PipelineContext, session: &Session, outbound: &mut DestinationRequest) {
    let hooks = session.hooks();
    if !hooks.has_request_event_listeners() {
        return;
    }

    let mut info = RequestInfo {
        request_id: ctx.request_id.to_string(),
        session_id: session.id().to_string(),
        url: outbound.url.to_string(),
        method: outbound.method.to_string(),
        headers: outbound.headers.clone(),
        body: outbound.body.clone(),
        is_ajax: ctx.flags.is_ajax,
    };

    let rules = hooks.get_request_filter_rules(&info).await;
    for rule in &rules {
        let mut event = RequestEvent::Request(OnRequestEvent {
            request: info.clone(),
            mock: None,
        });
        if call_for_rule(hooks, rule, &mut event).await {
            if let RequestEvent::Request(event) = event {
                info = event.request;
                if event.mock.is_some() {
                    ctx.mock = event.mock;
                }
            }
        }
        if let Some(mock) = hooks.get_mock(rule).await {
            ctx.mock = Some(mock);
        }
    }
    ctx.request_filter_rules = rules;

    outbound.headers = info.headers;
    outbound.body = info.body;
    if let Ok(method) = Method::from_bytes(info.method.as_bytes()) {
        outbound.method = method;
    }
    if info.url != outbound.url.as_str() {
        match proxy_url::normalize_destination(&info.url) {
            Some(url) => outbound.url = url,
            None => tracing::warn!(url = %info.url, "Ignoring unsupported URL set by a request hook"),
        }
    }
}

fn mock_response(mock: ResponseMock) -> DestinationResponse {
    let mut headers = mock.headers;
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(mock.body.len()));
    DestinationResponse::buffered(ResponseSource::Mock, mock.status, headers, mock.body)
}

fn check_same_origin_policy(ctx: &mut PipelineContext) {
    let failed = match &ctx.dest_res {
        Some(res) if ctx.flags.is_ajax && res.status != StatusCode::NOT_MODIFIED => {
            !same_origin::check(ctx, &res.headers)
        }
        _ => false,
    };
    if failed {
        tracing::debug!(request_id = %ctx.request_id, url = %ctx.dest.url, "Same-origin policy check failed");
    }
    ctx.is_same_origin_policy_failed = failed;
}

async fn decide_processing(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PipelineError> {
    let is_upgrade = ctx.dest_res.as_ref().is_some_and(DestinationResponse::is_upgrade);
    if ctx.flags.is_websocket && is_upgrade {
        relay_websocket(ctx);
        return Ok(());
    }

    let requires_processing = ctx.content_info.as_ref().is_some_and(|info| info.requires_processing);
    if requires_processing {
        return Ok(());
    }

    pass_through(ctx, services).await;
    Ok(())
}

fn relay_websocket(ctx: &mut PipelineContext) {
    let Some(mut res) = ctx.dest_res.take() else {
        return;
    };
    let headers = headers::response_headers(ctx, res.status, &res.headers, false);

    match (ctx.client_upgrade.take(), res.upgrade.take()) {
        (Some(client), Some(destination)) => {
            spawn_relay(client, destination, ctx.socket_policy, ctx.dest.url.to_string());
            let mut response = Response::new(Body::empty());
            *response.status_mut() = res.status;
            *response.headers_mut() = headers;
            ctx.respond(response);
        }
        _ => {
            tracing::warn!(request_id = %ctx.request_id, url = %ctx.dest.url, "Client connection cannot be upgraded");
            ctx.abort();
        }
    }
}

async fn pass_through(ctx: &mut PipelineContext, services: &PipelineServices) {
    let Some(res) = ctx.dest_res.take() else {
        return;
    };
    let status = res.status;
    let mut headers = headers::response_headers(ctx, status, &res.headers, false);
    configure_response(ctx, &mut headers).await;

    let events = ResponseEvents {
        session: Arc::clone(&ctx.session),
        request_id: ctx.request_id.to_string(),
        rules: ctx.on_response_event_data.clone(),
        status,
        headers: headers.clone(),
    };

    if ctx.is_same_origin_policy_failed {
        events.fire(None, true).await;
        ctx.respond(error::same_origin_failure());
        return;
    }

    let wants_body = events.rules.iter().any(|(_, options)| options.include_body);
    let cache_entry = ctx.temporary_cache_entry.take();
    let body = if wants_body || cache_entry.is_some() {
        let completion = Completion {
            events,
            cache_entry,
            cache: Arc::clone(&services.cache),
        };
        Body::new(TeeBody::new(res.body.into_body(), services.max_body_size, completion))
    } else {
        events.fire(None, false).await;
        res.body.into_body()
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    ctx.respond(response);
}

async fn fetch_content(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PipelineError> {
    if ctx.dest_res_body.is_some() {
        return Ok(());
    }
    let Some(res) = ctx.dest_res.as_mut() else {
        return Ok(());
    };

    let body = std::mem::replace(&mut res.body, ResponseBody::Buffered(Bytes::new()));
    let (bytes, trailers) = body.collect(services.max_body_size).await?;
    let trailers = trailers.or_else(|| res.trailers.clone());

    if let Some(mut entry) = ctx.temporary_cache_entry.take() {
        entry.complete(bytes.clone(), trailers.clone());
        services.cache.add(entry);
    }
    if !ctx.request_filter_rules.is_empty() {
        ctx.non_processed_dest_res_body = Some(bytes.clone());
    }
    ctx.dest_res_trailers = trailers;
    ctx.dest_res_body = Some(bytes);
    Ok(())
}

async fn process_content(ctx: &mut PipelineContext, services: &PipelineServices) -> Result<(), PipelineError> {
    let Some(raw) = ctx.dest_res_body.clone() else {
        return Ok(());
    };
    let Some(info) = ctx.content_info.as_mut() else {
        return Ok(());
    };

    let decoded = encoding::decode(raw, &info.encoding, services.max_body_size).map_err(PipelineError::Decode)?;
    info.charset.from_bom(&decoded);
    let charset = info.charset;
    let kind = ResourceKind::of(info);
    let is_iframe = info.is_iframe;

    let text = charset.decode(&decoded);
    let urls = UrlReplacer::new(
        &ctx.dest,
        &charset,
        services.same_origin.clone(),
        services.cross_origin.clone(),
    );
    let input = ProcessingInput {
        body: &text,
        kind,
        url: &ctx.dest.url,
        charset: &charset,
        urls: &urls,
        session_id: &ctx.dest.session_id,
        window_id: ctx.dest.window_id.as_deref(),
        is_iframe,
        allow_restart: !ctx.restart_used,
        restored_storages: ctx.restored_storages.as_ref(),
    };

    match services.processor.process(input).await? {
        ProcessingOutcome::Rewritten(text) => {
            ctx.processed_body = Some(Bytes::from(charset.encode(&text)));
        }
        ProcessingOutcome::RestartWithCharset(label) => {
            if ctx.restart_used {
                return Err(PipelineError::RepeatedRestart);
            }
            tracing::debug!(request_id = %ctx.request_id, charset = %label, "Restarting processing with a new charset");
            ctx.restart_used = true;
            if let Some(info) = ctx.content_info.as_mut() {
                info.charset.from_meta(&label);
            }
            ctx.restart_at = Some(Stage::CheckSameOriginPolicy);
        }
    }
    Ok(())
}

async fn send_processed_response(ctx: &mut PipelineContext) -> Result<(), PipelineError> {
    let Some(res) = ctx.dest_res.take() else {
        return Ok(());
    };
    let body = ctx.processed_body.take().unwrap_or_default();

    let mut headers = headers::response_headers(ctx, res.status, &res.headers, true);
    configure_response(ctx, &mut headers).await;
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    let failed = ctx.is_same_origin_policy_failed;
    let events = ResponseEvents {
        session: Arc::clone(&ctx.session),
        request_id: ctx.request_id.to_string(),
        rules: ctx.on_response_event_data.clone(),
        status: res.status,
        headers: headers.clone(),
    };
    events.fire(ctx.non_processed_dest_res_body.clone(), failed).await;

    if failed {
        ctx.respond(error::same_origin_failure());
        return Ok(());
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = res.status;
    *response.headers_mut() = headers;
    ctx.respond(response);
    Ok(())
}

/// Run `onConfigureResponse` for every matched rule, letting hooks edit
/// `headers` and record what their `onResponse` event should carry.
async fn configure_response(ctx: &mut PipelineContext, headers: &mut HeaderMap) {
    if ctx.request_filter_rules.is_empty() {
        return;
    }

    let session = Arc::clone(&ctx.session);
    let hooks = session.hooks();
    let mut data = Vec::with_capacity(ctx.request_filter_rules.len());

    for rule in &ctx.request_filter_rules {
        let mut event = RequestEvent::ConfigureResponse(OnConfigureResponseEvent {
            request_id: ctx.request_id.to_string(),
            options: ConfigureResponseOptions::default(),
            headers: headers.clone(),
        });
        let mut options = ConfigureResponseOptions::default();
        if call_for_rule(hooks, rule, &mut event).await {
            if let RequestEvent::ConfigureResponse(event) = event {
                *headers = event.headers;
                options = event.options;
            }
        }
        data.push((rule.clone(), options));
    }

    ctx.on_response_event_data = data;
}

/// Pending `onResponse` events for one request.
struct ResponseEvents {
    session: Arc<Session>,
    request_id: String,
    rules: Vec<(RequestFilterRule, ConfigureResponseOptions)>,
    status: StatusCode,
    headers: HeaderMap,
}

impl ResponseEvents {
    async fn fire(&self, body: Option<Bytes>, same_origin_failed: bool) {
        let hooks = self.session.hooks();
        for (rule, options) in &self.rules {
            let mut event = RequestEvent::Response(OnResponseEvent {
                request_id: self.request_id.clone(),
                status: self.status,
                headers: options.include_headers.then(|| self.headers.clone()),
                body: if options.include_body { body.clone() } else { None },
                is_same_origin_policy_failed: same_origin_failed,
            });
            call_for_rule(hooks, rule, &mut event).await;
        }
    }
}

/// Work left once a streamed body has been fully relayed.
struct Completion {
    events: ResponseEvents,
    cache_entry: Option<CacheEntry>,
    cache: Arc<ResponseCache>,
}

impl Completion {
    fn finish(self, body: Option<Bytes>, trailers: Option<HeaderMap>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let (Some(mut entry), Some(body)) = (self.cache_entry, body.clone()) {
                entry.complete(body, trailers);
                self.cache.add(entry);
            }
            self.events.fire(body, false).await;
        });
    }
}

/// Relays a body to the browser while keeping a copy for hooks and the
/// cache. A body that errors, overflows the limit or is dropped early
/// never reaches the cache.
struct TeeBody {
    inner: Body,
    captured: BytesMut,
    limit: usize,
    overflowed: bool,
    trailers: Option<HeaderMap>,
    completion: Option<Completion>,
}

impl TeeBody {
    fn new(inner: Body, limit: usize, completion: Completion) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            limit,
            overflowed: false,
            trailers: None,
            completion: Some(completion),
        }
    }

    fn complete(&mut self) {
        if let Some(completion) = self.completion.take() {
            let body = (!self.overflowed).then(|| self.captured.split().freeze());
            completion.finish(body, self.trailers.take());
        }
    }
}

impl HttpBody for TeeBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if this.captured.len() + data.len() > this.limit {
                        this.overflowed = true;
                        this.captured.clear();
                    } else if !this.overflowed {
                        this.captured.extend_from_slice(data);
                    }
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.trailers = Some(trailers.clone());
                }
                if this.inner.is_end_stream() {
                    this.complete();
                }
            }
            Poll::Ready(None) => this.complete(),
            Poll::Ready(Some(Err(_))) => {
                if let Some(mut completion) = this.completion.take() {
                    completion.cache_entry = None;
                    completion.finish(None, None);
                }
            }
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        // The browser went away mid-body; hooks still hear about the response.
        if let Some(mut completion) = self.completion.take() {
            completion.cache_entry = None;
            completion.finish(None, None);
        }
    }
}
