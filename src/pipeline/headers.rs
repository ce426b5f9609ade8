//! Header transforms between the browser and the destination.
//!
//! # Responsibilities
//! - Strip hop-by-hop and internal marker headers in both directions
//! - Restore `Host`, `Referer` and `Origin` to their destination values
//! - Route cookies through the session jar
//! - Point `Location` and `Access-Control-Allow-Origin` back at the proxy
//! - Drop policies that would stop rewritten pages from working (CSP, HSTS)

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use url::Url;

use crate::pipeline::context::{CredentialsMode, PipelineContext};
use crate::proxy_url::{self, ProxyUrlOptions, ResourceType};
use crate::transport::HeaderParseError;

/// Set by the client sandbox on XHR and fetch requests.
pub const AJAX_MARKER: &str = "x-rewrite-proxy-ajax";

/// Fetch credentials mode of the request (`omit`, `same-origin`, `include`).
pub const CREDENTIALS_MARKER: &str = "x-rewrite-proxy-credentials";

const INTERNAL_PREFIX: &str = "x-rewrite-proxy-";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const ACCEPTED_ENCODINGS: &str = "gzip, deflate, br";

fn is_hop_by_hop(name: &str, keep_upgrade: bool) -> bool {
    if keep_upgrade && (name == "connection" || name == "upgrade") {
        return false;
    }
    HOP_BY_HOP.contains(&name)
}

/// Build a header value from text, reporting the first invalid character.
pub fn header_value(name: &str, value: &str) -> Result<HeaderValue, HeaderParseError> {
    HeaderParseError::check(name, value)?;
    HeaderValue::from_str(value).map_err(|_| HeaderParseError {
        name: name.to_string(),
        position: 0,
        char_code: 0,
    })
}

/// `host[:port]` as a browser would send it (default ports omitted).
fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Headers for the outbound destination request.
pub fn request_headers(ctx: &PipelineContext) -> Result<HeaderMap, HeaderParseError> {
    let keep_upgrade = ctx.flags.is_websocket;
    let mut headers = HeaderMap::with_capacity(ctx.req.headers.len());

    for (name, value) in &ctx.req.headers {
        let lower = name.as_str();
        if lower.starts_with(INTERNAL_PREFIX) || is_hop_by_hop(lower, keep_upgrade) {
            continue;
        }
        if [header::HOST, header::REFERER, header::ORIGIN, header::COOKIE, header::CONTENT_LENGTH].contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(host) = host_header(&ctx.dest.url) {
        headers.insert(header::HOST, header_value("host", &host)?);
    }

    if let Some(referer) = &ctx.dest.referer {
        headers.insert(header::REFERER, header_value("referer", referer.as_str())?);
    }

    if ctx.req.headers.contains_key(header::ORIGIN) || ctx.flags.is_websocket {
        if let Some(origin) = ctx.dest.initiator_origin() {
            headers.insert(header::ORIGIN, header_value("origin", origin)?);
        }
    }

    if ctx.flags.credentials == CredentialsMode::Omit {
        headers.remove(header::AUTHORIZATION);
    } else {
        let cookie = if ctx.session.cookies().keeps_cookies() {
            ctx.session.cookies().get_header(&ctx.dest.url)
        } else if ctx.client_cookies.is_empty() {
            None
        } else {
            Some(ctx.client_cookies.join("; "))
        };
        if let Some(cookie) = cookie {
            headers.insert(header::COOKIE, header_value("cookie", &cookie)?);
        }
    }

    if headers.contains_key(header::ACCEPT_ENCODING) {
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
    }

    Ok(headers)
}

/// Headers for the browser-facing response.
///
/// `processed` responses lose their `Content-Encoding` and `Content-Length`;
/// the caller sets the length of the rewritten body.
pub fn response_headers(ctx: &PipelineContext, status: StatusCode, source: &HeaderMap, processed: bool) -> HeaderMap {
    let keep_upgrade = status == StatusCode::SWITCHING_PROTOCOLS;
    let jar = ctx.session.cookies();
    let mut headers = HeaderMap::with_capacity(source.len());

    for (name, value) in source {
        let lower = name.as_str();
        if lower.starts_with(INTERNAL_PREFIX) || is_hop_by_hop(lower, keep_upgrade) {
            continue;
        }

        if *name == header::STRICT_TRANSPORT_SECURITY {
            continue;
        }
        if processed
            && (*name == header::CONTENT_SECURITY_POLICY
                || *name == header::CONTENT_SECURITY_POLICY_REPORT_ONLY
                || *name == header::CONTENT_ENCODING
                || *name == header::CONTENT_LENGTH)
        {
            continue;
        }

        if *name == header::SET_COOKIE && jar.keeps_cookies() {
            if let Ok(set_cookie) = value.to_str() {
                jar.set_by_server(&ctx.dest.url, set_cookie);
            }
            continue;
        }

        if *name == header::LOCATION {
            headers.append(name.clone(), rewrite_location(ctx, value));
            continue;
        }

        if *name == header::ACCESS_CONTROL_ALLOW_ORIGIN {
            if let Some(value) = allow_origin(ctx, value) {
                headers.append(name.clone(), value);
            }
            continue;
        }

        headers.append(name.clone(), value.clone());
    }

    headers
}

fn rewrite_location(ctx: &PipelineContext, value: &HeaderValue) -> HeaderValue {
    let Ok(location) = value.to_str() else {
        return value.clone();
    };

    let resource_type = ctx.dest.resource_type - ResourceType::WEB_SOCKET;
    let mut options = ProxyUrlOptions::new(ctx.dest.session_id.clone(), ctx.dest.proxy.clone()).resource_type(resource_type);
    if let Some(window) = &ctx.dest.window_id {
        options = options.window(window.clone());
    }
    if let Some(charset) = ctx.dest.charset.as_ref().filter(|_| resource_type.is_script_like()) {
        options = options.charset(charset.clone());
    }

    proxy_url::resolve_and_encode(&ctx.dest.url, location, &options)
        .ok()
        .and_then(|url| HeaderValue::from_str(&url).ok())
        .unwrap_or_else(|| value.clone())
}

/// The browser talks to the proxy origin, so a specific allowed origin is
/// replaced by the origin the request actually came from.
fn allow_origin(ctx: &PipelineContext, value: &HeaderValue) -> Option<HeaderValue> {
    if ctx.is_same_origin_policy_failed {
        return None;
    }
    if value.as_bytes() == b"*" {
        return Some(value.clone());
    }
    ctx.req.headers.get(header::ORIGIN).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_url::ProxyLocation;
    use crate::session::test_support::EchoDriver;
    use crate::session::{MemoryCookieJar, Session, SessionRegistry};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;

    fn registry(with_jar: bool) -> SessionRegistry {
        let sessions = SessionRegistry::new();
        let mut builder = Session::builder("abc123", Arc::new(EchoDriver));
        if with_jar {
            builder = builder.cookies(Arc::new(MemoryCookieJar::new()));
        }
        sessions.open(builder.build());
        sessions
    }

    fn context(sessions: &SessionRegistry, req: Request<Body>) -> PipelineContext {
        PipelineContext::dispatch(req, sessions, ProxyLocation::new("http:", "localhost", 1337)).unwrap()
    }

    #[test]
    fn restores_destination_host_referer_and_origin() {
        let sessions = registry(false);
        let req = Request::builder()
            .uri("/abc123/https://api.e.com:8443/data")
            .header(header::HOST, "localhost:1337")
            .header(header::REFERER, "http://localhost:1337/abc123/https://www.e.com/page")
            .header(header::ORIGIN, "http://localhost:1337")
            .header(header::CONNECTION, "keep-alive")
            .header(AJAX_MARKER, "true")
            .header("x-custom", "1")
            .body(Body::empty())
            .unwrap();
        let ctx = context(&sessions, req);
        let headers = request_headers(&ctx).unwrap();

        assert_eq!(headers[header::HOST], "api.e.com:8443");
        assert_eq!(headers[header::REFERER], "https://www.e.com/page");
        assert_eq!(headers[header::ORIGIN], "https://www.e.com");
        assert_eq!(headers["x-custom"], "1");
        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key(AJAX_MARKER));
    }

    #[test]
    fn websocket_keeps_upgrade_headers() {
        let sessions = registry(false);
        let req = Request::builder()
            .uri("/abc123/w!http%3A%2F%2Fe.com/http://e.com/socket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(Body::empty())
            .unwrap();
        let ctx = context(&sessions, req);
        let headers = request_headers(&ctx).unwrap();
        assert_eq!(headers[header::UPGRADE], "websocket");
        assert_eq!(headers[header::ORIGIN], "http://e.com");
    }

    #[test]
    fn cookies_come_from_the_jar() {
        let sessions = registry(true);
        let req = Request::builder()
            .uri("/abc123/http://e.com/")
            .header(header::COOKIE, "s|abc123|token|e.com|/||=xyz; other=1")
            .body(Body::empty())
            .unwrap();
        let ctx = context(&sessions, req);
        let headers = request_headers(&ctx).unwrap();
        assert_eq!(headers[header::COOKIE], "token=xyz");
    }

    #[test]
    fn cookies_pass_through_without_a_jar() {
        let sessions = registry(false);
        let req = Request::builder()
            .uri("/abc123/http://e.com/")
            .header(header::COOKIE, "a=1; b=2")
            .body(Body::empty())
            .unwrap();
        let ctx = context(&sessions, req);
        assert_eq!(request_headers(&ctx).unwrap()[header::COOKIE], "a=1; b=2");
    }

    #[test]
    fn omitted_credentials_drop_cookies_and_authorization() {
        let sessions = registry(false);
        let req = Request::builder()
            .uri("/abc123/http://e.com/")
            .header(header::COOKIE, "a=1")
            .header(header::AUTHORIZATION, "Basic eDp5")
            .header(CREDENTIALS_MARKER, "omit")
            .body(Body::empty())
            .unwrap();
        let ctx = context(&sessions, req);
        let headers = request_headers(&ctx).unwrap();
        assert!(!headers.contains_key(header::COOKIE));
        assert!(!headers.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn response_headers_are_rewritten() {
        let sessions = registry(true);
        let req = Request::builder()
            .uri("/abc123*w1/http://e.com/dir/page")
            .header(header::ORIGIN, "http://localhost:1337")
            .body(Body::empty())
            .unwrap();
        let ctx = context(&sessions, req);

        let mut source = HeaderMap::new();
        source.insert(header::LOCATION, HeaderValue::from_static("next"));
        source.insert(header::SET_COOKIE, HeaderValue::from_static("sid=42; Path=/"));
        source.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
        source.insert(header::STRICT_TRANSPORT_SECURITY, HeaderValue::from_static("max-age=1"));
        source.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("http://e.com"));
        source.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        source.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let headers = response_headers(&ctx, StatusCode::FOUND, &source, true);
        assert_eq!(headers[header::LOCATION], "http://localhost:1337/abc123*w1/http://e.com/dir/next");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:1337");
        assert!(!headers.contains_key(header::SET_COOKIE));
        assert!(!headers.contains_key(header::CONTENT_SECURITY_POLICY));
        assert!(!headers.contains_key(header::STRICT_TRANSPORT_SECURITY));
        assert!(!headers.contains_key(header::CONTENT_ENCODING));
        assert!(!headers.contains_key(header::TRANSFER_ENCODING));

        let url = Url::parse("http://e.com/").unwrap();
        assert_eq!(ctx.session.cookies().get_header(&url).as_deref(), Some("sid=42"));
    }

    #[test]
    fn unprocessed_responses_keep_encoding_and_policy() {
        let sessions = registry(false);
        let req = Request::builder().uri("/abc123/http://e.com/a.png").body(Body::empty()).unwrap();
        let ctx = context(&sessions, req);

        let mut source = HeaderMap::new();
        source.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        source.insert(header::CONTENT_LENGTH, HeaderValue::from_static("10"));
        source.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
        source.insert(header::SET_COOKIE, HeaderValue::from_static("a=1"));

        let headers = response_headers(&ctx, StatusCode::OK, &source, false);
        assert_eq!(headers[header::CONTENT_ENCODING], "gzip");
        assert_eq!(headers[header::CONTENT_LENGTH], "10");
        assert!(headers.contains_key(header::CONTENT_SECURITY_POLICY));
        assert_eq!(headers[header::SET_COOKIE], "a=1");
    }

    #[test]
    fn header_value_reports_position() {
        let err = header_value("x-test", "ab\ncd").unwrap_err();
        assert_eq!(err.position, 2);
        assert_eq!(err.char_code, 10);
    }
}
