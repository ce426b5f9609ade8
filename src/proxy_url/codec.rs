//! Proxy URL encoding and decoding.
//!
//! # Wire Format
//! ```text
//! <scheme>//<proxyHost>:<proxyPort>/<sid>[*<winId>]/[<flags>][!<charsetOrOrigin>]/<destinationUrl>
//! ```
//! The flags segment is omitted entirely when no flag is set. The optional
//! charset/origin field is percent-encoded so it never contains `/`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use thiserror::Error;
use url::Url;

use super::resource_type::ResourceType;

/// Separates the session id from the window id.
pub const SESSION_WINDOW_SEPARATOR: char = '*';

/// Separates the flags from the charset / request-origin field.
pub const FIELD_SEPARATOR: char = '!';

const FIELD_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Synthetic destinations that never reach a real server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialPage {
    Blank,
    Error,
}

impl SpecialPage {
    pub fn as_str(self) -> &'static str {
        match self {
            SpecialPage::Blank => "about:blank",
            SpecialPage::Error => "about:error",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("about:blank") {
            Some(SpecialPage::Blank)
        } else if token.eq_ignore_ascii_case("about:error") {
            Some(SpecialPage::Error)
        } else {
            None
        }
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        if url.scheme() == "about" {
            Self::from_token(url.as_str())
        } else {
            None
        }
    }
}

/// Where the proxy itself is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLocation {
    /// Protocol including the trailing colon (`http:` or `https:`).
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
}

impl ProxyLocation {
    pub fn new(protocol: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            hostname: hostname.into(),
            port,
        }
    }

    /// Parse `host[:port]` as found in a `Host` header or URL authority.
    pub fn from_authority(protocol: &str, authority: &str) -> Option<Self> {
        let default_port = if protocol == "https:" { 443 } else { 80 };
        let (hostname, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            (format!("[{}]", host), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().ok()?),
                None => (authority.to_string(), default_port),
            }
        };

        if hostname.is_empty() {
            return None;
        }

        Some(Self::new(protocol, hostname.to_ascii_lowercase(), port))
    }

    /// `protocol//hostname:port` with no trailing slash.
    pub fn origin(&self) -> String {
        format!("{}//{}:{}", self.protocol, self.hostname, self.port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

/// Options for [`encode`].
#[derive(Debug, Clone)]
pub struct ProxyUrlOptions {
    pub session_id: String,
    pub window_id: Option<String>,
    pub resource_type: ResourceType,
    pub charset: Option<String>,
    pub req_origin: Option<String>,
    pub proxy: ProxyLocation,
}

impl ProxyUrlOptions {
    pub fn new(session_id: impl Into<String>, proxy: ProxyLocation) -> Self {
        Self {
            session_id: session_id.into(),
            window_id: None,
            resource_type: ResourceType::empty(),
            charset: None,
            req_origin: None,
            proxy,
        }
    }

    pub fn window(mut self, window_id: impl Into<String>) -> Self {
        self.window_id = Some(window_id.into());
        self
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn req_origin(mut self, origin: impl Into<String>) -> Self {
        self.req_origin = Some(origin.into());
        self
    }
}

/// Metadata recovered from a proxy URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyUrlDescriptor {
    /// Normalized destination URL string.
    pub dest_url: String,
    pub destination: Url,
    pub session_id: String,
    pub window_id: Option<String>,
    pub resource_type: ResourceType,
    pub charset: Option<String>,
    pub req_origin: Option<String>,
    pub proxy: ProxyLocation,
}

impl ProxyUrlDescriptor {
    pub fn special_page(&self) -> Option<SpecialPage> {
        SpecialPage::from_url(&self.destination)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("session and window ids must not contain reserved characters: {0}")]
    ReservedCharacter(String),

    #[error("unsupported destination URL: {0}")]
    UnsupportedDestination(String),
}

/// Build a proxy URL for `destination`.
pub fn encode(destination: &str, options: &ProxyUrlOptions) -> Result<String, CodecError> {
    if options.session_id.is_empty() {
        return Err(CodecError::EmptySessionId);
    }

    let reserved = |s: &str| s.contains(['/', SESSION_WINDOW_SEPARATOR, FIELD_SEPARATOR]);
    if reserved(&options.session_id) {
        return Err(CodecError::ReservedCharacter(options.session_id.clone()));
    }
    if let Some(window_id) = options.window_id.as_deref() {
        if window_id.is_empty() || reserved(window_id) {
            return Err(CodecError::ReservedCharacter(window_id.to_string()));
        }
    }

    let dest = normalize_destination(destination)
        .ok_or_else(|| CodecError::UnsupportedDestination(destination.to_string()))?;

    let mut descriptor = options.session_id.clone();
    if let Some(window_id) = &options.window_id {
        descriptor.push(SESSION_WINDOW_SEPARATOR);
        descriptor.push_str(window_id);
    }

    let flags = options.resource_type.to_letters();
    let extra = if options.resource_type.is_script_like() {
        options.charset.as_deref()
    } else if options.resource_type.is_web_socket() {
        options.req_origin.as_deref()
    } else {
        None
    };

    if !flags.is_empty() {
        descriptor.push('/');
        descriptor.push_str(&flags);
        if let Some(extra) = extra.filter(|e| !e.is_empty()) {
            descriptor.push(FIELD_SEPARATOR);
            descriptor.extend(utf8_percent_encode(extra, FIELD_ENCODE_SET));
        }
    }

    Ok(format!("{}/{}/{}", options.proxy.origin(), descriptor, dest.as_str()))
}

/// Parse a full proxy URL. Returns `None` for anything that isn't one.
pub fn decode(proxy_url: &str) -> Option<ProxyUrlDescriptor> {
    let (protocol, rest) = proxy_url.split_once("//")?;
    if !protocol.ends_with(':') || protocol.len() < 2 {
        return None;
    }

    let slash = rest.find('/')?;
    let proxy = ProxyLocation::from_authority(&protocol.to_ascii_lowercase(), &rest[..slash])?;

    decode_path(&rest[slash..], proxy)
}

/// Parse the path (plus query) of a request received by the proxy.
pub fn decode_path(path: &str, proxy: ProxyLocation) -> Option<ProxyUrlDescriptor> {
    let path = path.strip_prefix('/')?;
    let (session_part, rest) = path.split_once('/')?;
    let (session_id, window_id) = parse_session_part(session_part)?;

    let (flags_part, dest_raw) = if looks_like_destination(rest) {
        (None, rest)
    } else {
        let (flags, dest) = rest.split_once('/')?;
        (Some(flags), dest)
    };

    let (resource_type, extra) = match flags_part {
        Some(flags) => parse_flags(flags)?,
        None => (ResourceType::empty(), None),
    };

    let destination = normalize_destination(dest_raw)?;

    let (charset, req_origin) = if resource_type.is_script_like() {
        (extra, None)
    } else if resource_type.is_web_socket() {
        (None, extra)
    } else {
        (None, None)
    };

    Some(ProxyUrlDescriptor {
        dest_url: destination.as_str().to_string(),
        destination,
        session_id,
        window_id,
        resource_type,
        charset,
        req_origin,
        proxy,
    })
}

/// Normalize a raw destination: collapse redundant slashes after the scheme,
/// map Windows drive-letter paths to `file:` URLs, lower-case the host and
/// drop default ports. Unsupported schemes yield `None`.
pub fn normalize_destination(raw: &str) -> Option<Url> {
    let raw = raw.trim();

    if let Some(page) = SpecialPage::from_token(raw) {
        return Url::parse(page.as_str()).ok();
    }

    if is_drive_letter_path(raw) {
        return Url::parse(&format!("file:///{}", raw.replace('\\', "/"))).ok();
    }

    let (scheme, rest) = split_scheme(raw)?;
    let scheme = scheme.to_ascii_lowercase();
    let rest = rest.trim_start_matches(|c| c == '/' || c == '\\');

    let candidate = match scheme.as_str() {
        "http" | "https" => format!("{}://{}", scheme, rest),
        "file" => format!("file:///{}", rest.replace('\\', "/")),
        _ => return None,
    };

    let url = Url::parse(&candidate).ok()?;
    if url.scheme() != "file" && url.host_str().map_or(true, str::is_empty) {
        return None;
    }

    Some(url)
}

/// Resolve `relative` against `base` and normalize the result.
pub fn resolve_destination(base: &Url, relative: &str) -> Option<Url> {
    if SpecialPage::from_token(relative.trim()).is_some() {
        return normalize_destination(relative);
    }
    let joined = base.join(relative.trim()).ok()?;
    normalize_destination(joined.as_str())
}

/// Resolve `relative` against the destination `base` and encode the result,
/// as the URL replacer handed to content rewriters does.
pub fn resolve_and_encode(base: &Url, relative: &str, options: &ProxyUrlOptions) -> Result<String, CodecError> {
    let resolved =
        resolve_destination(base, relative).ok_or_else(|| CodecError::UnsupportedDestination(relative.to_string()))?;
    encode(resolved.as_str(), options)
}

fn parse_session_part(part: &str) -> Option<(String, Option<String>)> {
    let mut fields = part.split(SESSION_WINDOW_SEPARATOR);
    let session_id = fields.next().filter(|s| !s.is_empty())?;
    let window_id = match fields.next() {
        Some(w) if w.is_empty() => return None,
        Some(w) => Some(w.to_string()),
        None => None,
    };
    if fields.next().is_some() || session_id.contains(FIELD_SEPARATOR) {
        return None;
    }
    Some((session_id.to_string(), window_id))
}

fn parse_flags(part: &str) -> Option<(ResourceType, Option<String>)> {
    let mut fields = part.split(FIELD_SEPARATOR);
    let resource_type = ResourceType::from_letters(fields.next().unwrap_or_default())?;
    let extra = match fields.next() {
        Some(raw) => {
            let decoded = percent_decode_str(raw).decode_utf8().ok()?;
            if decoded.is_empty() {
                return None;
            }
            Some(decoded.into_owned())
        }
        None => None,
    };
    if fields.next().is_some() {
        return None;
    }
    Some((resource_type, extra))
}

fn looks_like_destination(rest: &str) -> bool {
    if is_drive_letter_path(rest) {
        return true;
    }
    let head = rest.split('/').next().unwrap_or_default();
    if SpecialPage::from_token(head).is_some() {
        return true;
    }
    split_scheme(head)
        .map(|(scheme, _)| {
            let scheme = scheme.to_ascii_lowercase();
            scheme == "http" || scheme == "https" || scheme == "file"
        })
        .unwrap_or(false)
}

fn split_scheme(raw: &str) -> Option<(&str, &str)> {
    let colon = raw.find(':')?;
    let scheme = &raw[..colon];
    let valid = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
    if valid {
        Some((scheme, &raw[colon + 1..]))
    } else {
        None
    }
}

fn is_drive_letter_path(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> ProxyLocation {
        ProxyLocation::new("http:", "localhost", 1337)
    }

    #[test]
    fn round_trips_destination_and_metadata() {
        let options = ProxyUrlOptions::new("sid", proxy())
            .window("w1")
            .resource_type(ResourceType::SCRIPT | ResourceType::IFRAME)
            .charset("windows-1251");

        let encoded = encode("https://example.com/path/a.js?x=1", &options).unwrap();
        assert_eq!(
            encoded,
            "http://localhost:1337/sid*w1/is!windows-1251/https://example.com/path/a.js?x=1"
        );

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.dest_url, "https://example.com/path/a.js?x=1");
        assert_eq!(decoded.session_id, "sid");
        assert_eq!(decoded.window_id.as_deref(), Some("w1"));
        assert_eq!(decoded.resource_type, ResourceType::SCRIPT | ResourceType::IFRAME);
        assert_eq!(decoded.charset.as_deref(), Some("windows-1251"));
        assert_eq!(decoded.proxy, proxy());
    }

    #[test]
    fn websocket_origin_is_percent_encoded() {
        let options = ProxyUrlOptions::new("sid", proxy())
            .resource_type(ResourceType::WEB_SOCKET)
            .req_origin("http://example.com");

        let encoded = encode("http://example.com/socket", &options).unwrap();
        assert!(encoded.contains("/w!http%3A%2F%2Fexample.com/"));

        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.req_origin.as_deref(), Some("http://example.com"));
        assert_eq!(decoded.charset, None);
    }

    #[test]
    fn charset_dropped_for_non_script_resources() {
        let options = ProxyUrlOptions::new("sid", proxy())
            .resource_type(ResourceType::IFRAME)
            .charset("utf-8");

        let encoded = encode("http://example.com/", &options).unwrap();
        assert_eq!(encoded, "http://localhost:1337/sid/i/http://example.com/");
        assert_eq!(decode(&encoded).unwrap().charset, None);
    }

    #[test]
    fn normalizes_host_case_and_default_ports() {
        let options = ProxyUrlOptions::new("sid", proxy());
        let encoded = encode("HTTP://Example.COM:80/Index.html", &options).unwrap();
        assert_eq!(encoded, "http://localhost:1337/sid/http://example.com/Index.html");

        let encoded = encode("https://example.com:443", &options).unwrap();
        assert!(encoded.ends_with("/sid/https://example.com/"));
    }

    #[test]
    fn decodes_script_scenario() {
        let decoded = decode("http://proxy:80/abc123/s/http://e.com/a.js").unwrap();
        assert!(decoded.resource_type.is_script());
        assert!(!decoded.resource_type.is_iframe());
        assert_eq!(decoded.session_id, "abc123");
        assert_eq!(decoded.dest_url, "http://e.com/a.js");
        assert_eq!(decoded.proxy.port, 80);
    }

    #[test]
    fn decode_rejects_malformed_urls() {
        assert!(decode("http://proxy:80/").is_none());
        assert!(decode("http://proxy:80/sid").is_none());
        assert!(decode("http://proxy:80/sid/ftp://e.com/").is_none());
        assert!(decode("http://proxy:80/sid/x/http://e.com/").is_none());
        assert!(decode("http://proxy:80/a*b*c/http://e.com/").is_none());
        assert!(decode("http://proxy:80/sid/s!a!b/http://e.com/").is_none());
        assert!(decode("http://proxy:80/*w/http://e.com/").is_none());
        assert!(decode("not a url").is_none());
        assert!(decode("").is_none());
    }

    #[test]
    fn decodes_exactly_one_level() {
        let inner = "http://localhost:1337/other/http://e.com/";
        let outer = format!("http://localhost:1337/sid/{}", inner);
        let decoded = decode(&outer).unwrap();
        assert_eq!(decoded.session_id, "sid");
        assert_eq!(decoded.dest_url, inner);
    }

    #[test]
    fn collapses_redundant_slashes() {
        let decoded = decode("http://proxy:80/sid/http:///e.com/a").unwrap();
        assert_eq!(decoded.dest_url, "http://e.com/a");

        let decoded = decode("http://proxy:80/sid/http:/e.com/a").unwrap();
        assert_eq!(decoded.dest_url, "http://e.com/a");
    }

    #[test]
    fn maps_drive_letter_paths_to_file_urls() {
        let decoded = decode("http://proxy:80/sid/C:\\dir\\page.html").unwrap();
        assert_eq!(decoded.dest_url, "file:///C:/dir/page.html");

        let decoded = decode("http://proxy:80/sid/file:///home/user/page.html").unwrap();
        assert_eq!(decoded.dest_url, "file:///home/user/page.html");
    }

    #[test]
    fn recognizes_special_pages() {
        let decoded = decode("http://proxy:80/sid*1/about:blank").unwrap();
        assert_eq!(decoded.special_page(), Some(SpecialPage::Blank));
        assert_eq!(decoded.window_id.as_deref(), Some("1"));

        let decoded = decode("http://proxy:80/sid/i/about:error").unwrap();
        assert_eq!(decoded.special_page(), Some(SpecialPage::Error));
    }

    #[test]
    fn encode_validates_inputs() {
        let options = ProxyUrlOptions::new("", proxy());
        assert_eq!(encode("http://e.com", &options), Err(CodecError::EmptySessionId));

        let options = ProxyUrlOptions::new("a/b", proxy());
        assert!(matches!(
            encode("http://e.com", &options),
            Err(CodecError::ReservedCharacter(_))
        ));

        let options = ProxyUrlOptions::new("sid", proxy());
        assert!(matches!(
            encode("javascript:alert(1)", &options),
            Err(CodecError::UnsupportedDestination(_))
        ));
    }

    #[test]
    fn resolve_and_encode_produces_proxy_urls() {
        let base = Url::parse("http://e.com/dir/page.html").unwrap();
        let options = ProxyUrlOptions::new("sid", proxy()).resource_type(ResourceType::SCRIPT);
        assert_eq!(
            resolve_and_encode(&base, "app.js", &options).unwrap(),
            "http://localhost:1337/sid/s/http://e.com/dir/app.js"
        );
        assert!(matches!(
            resolve_and_encode(&base, "javascript:void(0)", &options),
            Err(CodecError::UnsupportedDestination(_))
        ));
    }

    #[test]
    fn resolves_relative_destinations() {
        let base = Url::parse("http://e.com/dir/page.html").unwrap();
        assert_eq!(
            resolve_destination(&base, "../a.css").unwrap().as_str(),
            "http://e.com/a.css"
        );
        assert_eq!(
            resolve_destination(&base, "//cdn.e.com/x.js").unwrap().as_str(),
            "http://cdn.e.com/x.js"
        );
        assert!(resolve_destination(&base, "mailto:a@e.com").is_none());
    }

    #[test]
    fn parses_proxy_authority() {
        let loc = ProxyLocation::from_authority("http:", "LocalHost:8080").unwrap();
        assert_eq!(loc.hostname, "localhost");
        assert_eq!(loc.port, 8080);

        let loc = ProxyLocation::from_authority("https:", "[::1]").unwrap();
        assert_eq!(loc.hostname, "[::1]");
        assert_eq!(loc.port, 443);

        assert!(ProxyLocation::from_authority("http:", "host:notaport").is_none());
    }
}
