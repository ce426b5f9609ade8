//! Pipeline failures and how they reach the browser.
//!
//! # Design Decisions
//! - Fatal failures on a full-page navigation render the built-in error
//!   page and are reported to the session driver
//! - Fatal failures on ajax/fetch drop the client connection, which is what
//!   the page would have seen from the real server
//! - Everything else is a plain `500` carrying the error text
//! - A destination that hung up gets the same treatment from the proxy

use std::io;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use thiserror::Error;

use crate::observability::metrics;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::rewrite::ProcessingError;
use crate::transport::{HeaderParseError, TransportError};

/// Status sent instead of a response the same-origin policy rejected.
pub const SAME_ORIGIN_CHECK_FAILED_STATUS: u16 = 222;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    HeaderParse(#[from] HeaderParseError),

    #[error("failed to read the request body: {0}")]
    RequestBody(String),

    #[error("request body exceeds {limit} bytes")]
    RequestBodyTooLarge { limit: usize },

    #[error("failed to decode the response body: {0}")]
    Decode(#[source] io::Error),

    #[error("charset restart requested twice")]
    RepeatedRestart,
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Transport(err) => err.is_fatal(),
            PipelineError::RequestBody(_) | PipelineError::RequestBodyTooLarge { .. } => false,
            PipelineError::Processing(_)
            | PipelineError::HeaderParse(_)
            | PipelineError::Decode(_)
            | PipelineError::RepeatedRestart => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Transport(err) => err.kind(),
            PipelineError::Processing(_) => "processing",
            PipelineError::HeaderParse(_) => "header_parse",
            PipelineError::RequestBody(_) => "request_body",
            PipelineError::RequestBodyTooLarge { .. } => "request_body_too_large",
            PipelineError::Decode(_) => "decode",
            PipelineError::RepeatedRestart => "repeated_restart",
        }
    }
}

/// Turn `err` into the context's final outcome.
pub fn handle(ctx: &mut PipelineContext, err: PipelineError) {
    metrics::record_pipeline_error(err.kind());
    let message = err.to_string();
    let url = ctx.dest.url.to_string();

    if matches!(err, PipelineError::Transport(TransportError::SocketHangUp)) {
        tracing::debug!(request_id = %ctx.request_id, url = %url, "Destination hung up");
        ctx.abort();
        return;
    }

    if let PipelineError::RequestBodyTooLarge { .. } = err {
        ctx.respond(text_response(StatusCode::PAYLOAD_TOO_LARGE, message));
        return;
    }

    if !err.is_fatal() {
        tracing::warn!(request_id = %ctx.request_id, url = %url, error = %message, "Request failed");
        ctx.respond(text_response(StatusCode::INTERNAL_SERVER_ERROR, message));
        return;
    }

    tracing::error!(
        request_id = %ctx.request_id,
        session_id = %ctx.session.id(),
        url = %url,
        error = %message,
        "Request failed"
    );

    if ctx.flags.is_page && !ctx.flags.is_ajax {
        ctx.session.driver().on_page_error(&url, &message);
        ctx.respond(error_page(&url, &message));
    } else if ctx.flags.is_ajax {
        ctx.abort();
    } else {
        ctx.respond(text_response(StatusCode::INTERNAL_SERVER_ERROR, message));
    }
}

pub fn text_response(status: StatusCode, text: String) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

pub fn not_found() -> Response<Body> {
    text_response(StatusCode::NOT_FOUND, "Not Found".to_string())
}

/// Empty response with the same-origin failure status.
pub fn same_origin_failure() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() =
        StatusCode::from_u16(SAME_ORIGIN_CHECK_FAILED_STATUS).unwrap_or(StatusCode::FORBIDDEN);
    response
}

/// The page shown when a navigation fails.
pub fn error_page(url: &str, message: &str) -> Response<Body> {
    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Failed to load the page</title></head>\n\
         <body>\n<h1>Failed to load the page</h1>\n<p class=\"url\">{}</p>\n<pre class=\"error\">{}</pre>\n</body>\n</html>\n",
        escape_html(url),
        escape_html(message)
    );
    let mut response = Response::new(Body::from(html));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
