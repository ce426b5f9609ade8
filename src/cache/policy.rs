//! RFC 7234 freshness and storability rules for a shared cache.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};

/// Statuses whose caching semantics are understood at all.
const UNDERSTOOD_STATUSES: [u16; 14] = [200, 203, 204, 300, 301, 302, 303, 307, 308, 404, 405, 410, 414, 501];

/// Statuses that may be stored without explicit freshness information.
const CACHEABLE_BY_DEFAULT: [u16; 12] = [200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 501];

/// Minimum lifetime granted to `immutable` responses with heuristic freshness.
const IMMUTABLE_MIN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Largest delta-seconds value honored; larger values are clamped to it.
const MAX_DELTA_SECONDS: u64 = 2_147_483_648;

/// Parsed `Cache-Control` directives (lower-cased names).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl(HashMap<String, Option<String>>);

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut directives = HashMap::new();
        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (name, arg) = match part.split_once('=') {
                    Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"').to_string())),
                    None => (part, None),
                };
                directives.insert(name.to_ascii_lowercase(), arg);
            }
        }
        Self(directives)
    }

    pub fn has(&self, directive: &str) -> bool {
        self.0.contains_key(directive)
    }

    /// Numeric argument of a directive, if present and valid. Values past
    /// 2^31, including ones that overflow `u64`, are clamped to 2^31.
    pub fn seconds(&self, directive: &str) -> Option<u64> {
        let arg = self.0.get(directive)?.as_deref()?;
        if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(arg.parse::<u64>().map_or(MAX_DELTA_SECONDS, |secs| secs.min(MAX_DELTA_SECONDS)))
    }
}

/// Cache policy computed for one response.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    method: Method,
    url: String,
    status: u16,
    request_cc: CacheControl,
    response_cc: CacheControl,
    response_headers: HeaderMap,
    vary: Vec<(HeaderName, Option<String>)>,
    vary_any: bool,
    has_authorization: bool,
    response_time: SystemTime,
}

impl CachePolicy {
    pub fn new(
        method: &Method,
        url: &str,
        request_headers: &HeaderMap,
        status: StatusCode,
        response_headers: &HeaderMap,
        response_time: SystemTime,
    ) -> Self {
        let mut vary = Vec::new();
        let mut vary_any = false;
        for value in response_headers.get_all(header::VARY) {
            let Ok(value) = value.to_str() else { continue };
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if name == "*" {
                    vary_any = true;
                } else if let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) {
                    let current = header_string(request_headers, &name);
                    vary.push((name, current));
                }
            }
        }

        Self {
            method: method.clone(),
            url: url.to_string(),
            status: status.as_u16(),
            request_cc: CacheControl::parse(request_headers),
            response_cc: CacheControl::parse(response_headers),
            response_headers: response_headers.clone(),
            vary,
            vary_any,
            has_authorization: request_headers.contains_key(header::AUTHORIZATION),
            response_time,
        }
    }

    /// Whether a shared cache may store this response.
    pub fn storable(&self) -> bool {
        if self.request_cc.has("no-store") || self.response_cc.has("no-store") {
            return false;
        }
        if self.method != Method::GET || !UNDERSTOOD_STATUSES.contains(&self.status) {
            return false;
        }
        if self.response_cc.has("private") {
            return false;
        }
        if self.has_authorization
            && !(self.response_cc.has("public")
                || self.response_cc.has("must-revalidate")
                || self.response_cc.has("s-maxage"))
        {
            return false;
        }

        self.response_headers.contains_key(header::EXPIRES)
            || self.response_cc.has("max-age")
            || self.response_cc.has("s-maxage")
            || self.response_cc.has("public")
            || CACHEABLE_BY_DEFAULT.contains(&self.status)
    }

    /// Freshness lifetime of the response.
    pub fn max_age(&self) -> Duration {
        if self.response_cc.has("no-cache") || self.vary_any {
            return Duration::ZERO;
        }
        if let Some(secs) = self.response_cc.seconds("s-maxage") {
            return Duration::from_secs(secs);
        }
        if let Some(secs) = self.response_cc.seconds("max-age") {
            return Duration::from_secs(secs);
        }

        let date = self.date();
        if let Some(expires) = self.response_headers.get(header::EXPIRES) {
            return match expires.to_str().ok().and_then(|v| httpdate::parse_http_date(v).ok()) {
                Some(expires) => expires.duration_since(date).unwrap_or(Duration::ZERO),
                None => Duration::ZERO,
            };
        }

        let heuristic = self
            .response_headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .and_then(|modified| date.duration_since(modified).ok())
            .map(|since| since / 10)
            .unwrap_or(Duration::ZERO);

        if self.response_cc.has("immutable") {
            heuristic.max(IMMUTABLE_MIN_TTL)
        } else {
            heuristic
        }
    }

    /// Current age of the response.
    pub fn age(&self, now: SystemTime) -> Duration {
        let header_age = self
            .response_headers
            .get(header::AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        let resident = now.duration_since(self.response_time).unwrap_or(Duration::ZERO);
        header_age + resident
    }

    pub fn time_to_live(&self, now: SystemTime) -> Duration {
        self.max_age().saturating_sub(self.age(now))
    }

    pub fn is_stale(&self, now: SystemTime) -> bool {
        self.max_age() <= self.age(now)
    }

    /// Whether a new request can be answered from this response as-is.
    pub fn satisfies_without_revalidation(
        &self,
        method: &Method,
        url: &str,
        request_headers: &HeaderMap,
        now: SystemTime,
    ) -> bool {
        let request_cc = CacheControl::parse(request_headers);
        let pragma_no_cache = request_headers
            .get(header::PRAGMA)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("no-cache"))
            .unwrap_or(false);
        if request_cc.has("no-cache") || pragma_no_cache {
            return false;
        }

        let age = self.age(now);
        if let Some(max_age) = request_cc.seconds("max-age") {
            if age > Duration::from_secs(max_age) {
                return false;
            }
        }
        if let Some(min_fresh) = request_cc.seconds("min-fresh") {
            if self.time_to_live(now) < Duration::from_secs(min_fresh) {
                return false;
            }
        }

        if self.is_stale(now) {
            let allows_stale = request_cc.has("max-stale")
                && !self.response_cc.has("must-revalidate")
                && request_cc
                    .seconds("max-stale")
                    .map_or(true, |limit| Duration::from_secs(limit) > age.saturating_sub(self.max_age()));
            if !allows_stale {
                return false;
            }
        }

        self.request_matches(method, url, request_headers)
    }

    fn request_matches(&self, method: &Method, url: &str, request_headers: &HeaderMap) -> bool {
        if self.vary_any || *method != self.method || url != self.url {
            return false;
        }
        self.vary
            .iter()
            .all(|(name, stored)| header_string(request_headers, name) == *stored)
    }

    fn date(&self) -> SystemTime {
        self.response_headers
            .get(header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .unwrap_or(self.response_time)
    }
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn response(cache_control: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_str(cache_control).unwrap());
        headers
    }

    fn policy(res: &HeaderMap) -> CachePolicy {
        CachePolicy::new(
            &Method::GET,
            "http://e.com/a.js",
            &HeaderMap::new(),
            StatusCode::OK,
            res,
            SystemTime::now(),
        )
    }

    #[test]
    fn no_store_is_never_storable() {
        assert!(!policy(&response("no-store")).storable());
        assert!(!policy(&response("max-age=60, no-store")).storable());
    }

    #[test]
    fn max_age_drives_ttl() {
        let p = policy(&response("public, max-age=60"));
        assert!(p.storable());
        assert_eq!(p.max_age(), Duration::from_secs(60));
        assert!(p.time_to_live(SystemTime::now()) <= Duration::from_secs(60));
        assert!(!p.is_stale(SystemTime::now()));
    }

    #[test]
    fn private_responses_are_not_shared() {
        assert!(!policy(&response("private, max-age=60")).storable());
    }

    #[test]
    fn expired_responses_need_revalidation() {
        let p = policy(&response("max-age=10"));
        let later = SystemTime::now() + Duration::from_secs(30);
        assert!(!p.satisfies_without_revalidation(&Method::GET, "http://e.com/a.js", &HeaderMap::new(), later));
        assert!(p.satisfies_without_revalidation(&Method::GET, "http://e.com/a.js", &HeaderMap::new(), SystemTime::now()));
    }

    #[test]
    fn request_no_cache_forces_revalidation() {
        let p = policy(&response("max-age=600"));
        let mut req = HeaderMap::new();
        req.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert!(!p.satisfies_without_revalidation(&Method::GET, "http://e.com/a.js", &req, SystemTime::now()));
    }

    #[test]
    fn vary_headers_must_match() {
        let mut res = response("max-age=600");
        res.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        let mut req = HeaderMap::new();
        req.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let p = CachePolicy::new(&Method::GET, "http://e.com/a.js", &req, StatusCode::OK, &res, SystemTime::now());

        assert!(p.satisfies_without_revalidation(&Method::GET, "http://e.com/a.js", &req, SystemTime::now()));
        let mut other = HeaderMap::new();
        other.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br"));
        assert!(!p.satisfies_without_revalidation(&Method::GET, "http://e.com/a.js", &other, SystemTime::now()));
    }

    #[test]
    fn last_modified_gives_heuristic_freshness() {
        let now = SystemTime::now();
        let mut res = HeaderMap::new();
        res.insert(header::DATE, HeaderValue::from_str(&httpdate::fmt_http_date(now)).unwrap());
        res.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&httpdate::fmt_http_date(now - Duration::from_secs(1000))).unwrap(),
        );
        let p = CachePolicy::new(&Method::GET, "http://e.com/a.css", &HeaderMap::new(), StatusCode::OK, &res, now);
        assert!(p.storable());
        let max_age = p.max_age().as_secs();
        assert!((99..=100).contains(&max_age));
    }
}
