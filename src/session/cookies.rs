//! Cookie jar interface and client cookie-sync records.
//!
//! Injected client code mirrors `document.cookie` writes to the proxy by
//! setting specially named cookies. Their name encodes
//! `<flags>|<sessionId>|<key>|<domain>|<path>|<expires>|<lastAccessed>` and
//! their value is the cookie value. Dispatch pulls those records out of the
//! `Cookie` header and hands them to the session's jar.

use parking_lot::Mutex;
use url::Url;

/// One client-originated cookie write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCookieRecord {
    pub key: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// `None` for session cookies (`Infinity` on the wire).
    pub expires: Option<String>,
    /// Milliseconds since the epoch.
    pub last_accessed: Option<u64>,
    pub is_server_sync: bool,
    pub is_client_sync: bool,
    pub is_window_sync: bool,
}

/// Split a `Cookie` header into sync records for `session_id` and the
/// remaining ordinary cookies.
pub fn parse_client_sync_cookies(cookie_header: &str, session_id: &str) -> (Vec<ClientCookieRecord>, Vec<String>) {
    let mut records = Vec::new();
    let mut rest = Vec::new();

    for pair in cookie_header.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        match parse_sync_name(name, value, session_id) {
            SyncName::Record(record) => records.push(record),
            // Records for other sessions are dropped rather than leaked upstream.
            SyncName::OtherSession => {}
            SyncName::NotSync => rest.push(pair.to_string()),
        }
    }

    (records, rest)
}

enum SyncName {
    Record(ClientCookieRecord),
    OtherSession,
    NotSync,
}

fn parse_sync_name(name: &str, value: &str, session_id: &str) -> SyncName {
    let fields: Vec<&str> = name.split('|').collect();
    if fields.len() != 7 {
        return SyncName::NotSync;
    }
    let flags = fields[0];
    if flags.is_empty() || !flags.chars().all(|c| matches!(c, 's' | 'c' | 'w')) {
        return SyncName::NotSync;
    }
    if fields[1] != session_id {
        return SyncName::OtherSession;
    }

    SyncName::Record(ClientCookieRecord {
        key: fields[2].to_string(),
        value: value.to_string(),
        domain: fields[3].to_string(),
        path: fields[4].to_string(),
        expires: match fields[5] {
            "Infinity" | "" => None,
            other => Some(other.to_string()),
        },
        last_accessed: fields[6].parse().ok(),
        is_server_sync: flags.contains('s'),
        is_client_sync: flags.contains('c'),
        is_window_sync: flags.contains('w'),
    })
}

/// Persistent cookie store of a session.
pub trait CookieJar: Send + Sync {
    /// Apply cookie writes performed by page scripts.
    fn set_by_client(&self, records: &[ClientCookieRecord]);

    /// `Cookie` header value to send to `url`, if any.
    fn get_header(&self, url: &Url) -> Option<String>;

    /// Store one `Set-Cookie` value received from `url`.
    fn set_by_server(&self, url: &Url, set_cookie: &str);

    /// Replace the jar contents with a serialized snapshot.
    fn restore(&self, _serialized: &str) {}

    /// Whether the jar owns cookie state. When it does not, `Cookie` and
    /// `Set-Cookie` headers are relayed unchanged.
    fn keeps_cookies(&self) -> bool {
        true
    }
}

/// Jar that keeps nothing; the browser's own cookies pass through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCookieJar;

impl CookieJar for NoCookieJar {
    fn set_by_client(&self, _records: &[ClientCookieRecord]) {}

    fn get_header(&self, _url: &Url) -> Option<String> {
        None
    }

    fn set_by_server(&self, _url: &Url, _set_cookie: &str) {}

    fn keeps_cookies(&self) -> bool {
        false
    }
}

/// Minimal in-memory jar keyed by host, without path or expiry matching.
///
/// Suitable for tests and for harnesses that only need cookies replayed to
/// the host that set them.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<Vec<(String, String, String)>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, host: &str, key: &str, value: &str) {
        let mut cookies = self.cookies.lock();
        cookies.retain(|(h, k, _)| !(h == host && k == key));
        cookies.push((host.to_string(), key.to_string(), value.to_string()));
    }
}

impl CookieJar for MemoryCookieJar {
    fn set_by_client(&self, records: &[ClientCookieRecord]) {
        for record in records.iter().filter(|r| r.is_server_sync) {
            let host = record.domain.trim_start_matches('.').to_ascii_lowercase();
            self.store(&host, &record.key, &record.value);
        }
    }

    fn get_header(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let cookies = self.cookies.lock();
        let pairs: Vec<String> = cookies
            .iter()
            .filter(|(h, _, _)| h == host)
            .map(|(_, k, v)| format!("{k}={v}"))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    fn set_by_server(&self, url: &Url, set_cookie: &str) {
        let Some(host) = url.host_str() else { return };
        let pair = set_cookie.split(';').next().unwrap_or_default().trim();
        if let Some((key, value)) = pair.split_once('=') {
            self.store(host, key.trim(), value.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_records_for_own_session() {
        let header = "a=1; sc|sid1|token|e.com|/|Infinity|1700000000000=xyz; c|other|k|e.com|/|Infinity|1=v; b=2";
        let (records, rest) = parse_client_sync_cookies(header, "sid1");

        assert_eq!(rest, vec!["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.key, "token");
        assert_eq!(record.value, "xyz");
        assert_eq!(record.domain, "e.com");
        assert_eq!(record.expires, None);
        assert_eq!(record.last_accessed, Some(1_700_000_000_000));
        assert!(record.is_server_sync && record.is_client_sync && !record.is_window_sync);
    }

    #[test]
    fn malformed_names_are_ordinary_cookies() {
        let (records, rest) = parse_client_sync_cookies("x|y=1; q|s|k|d|p|e|l=2", "s");
        assert!(records.is_empty());
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn memory_jar_replays_per_host() {
        let jar = MemoryCookieJar::new();
        let url = Url::parse("http://e.com/page").unwrap();
        jar.set_by_server(&url, "sid=abc; Path=/; HttpOnly");
        jar.set_by_server(&url, "sid=def");

        assert_eq!(jar.get_header(&url).as_deref(), Some("sid=def"));
        assert_eq!(jar.get_header(&Url::parse("http://other.com/").unwrap()), None);
    }
}
