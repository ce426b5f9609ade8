//! Origin and registrable-domain helpers for destination URLs.

use std::net::IpAddr;
use url::Url;

/// Second-level labels that act as public suffixes under a two-letter TLD
/// (`example.co.uk`, `example.com.au`).
const COMMON_SECOND_LEVEL: [&str; 7] = ["co", "com", "net", "org", "gov", "ac", "edu"];

/// Serialized origin used for same-origin comparisons.
///
/// File URLs have an opaque origin, so the full URL stands in for it.
pub fn origin_of(url: &Url) -> String {
    if url.scheme() == "file" {
        return url.as_str().to_string();
    }
    url.origin().ascii_serialization()
}

pub fn is_same_origin(a: &Url, b: &Url) -> bool {
    if a.scheme() == "file" || b.scheme() == "file" {
        return a.scheme() == b.scheme();
    }
    a.origin() == b.origin()
}

/// Approximate registrable domain (eTLD+1) of a host.
pub fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() || host.starts_with('[') {
        return host;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }

    let tld = labels[labels.len() - 1];
    let second = labels[labels.len() - 2];
    let take = if tld.len() == 2 && COMMON_SECOND_LEVEL.contains(&second) {
        3
    } else {
        2
    };

    labels[labels.len() - take.min(labels.len())..].join(".")
}
