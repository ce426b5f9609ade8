//! Destination transport failures.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// An invalid character found while building an outbound header.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid character in header {name:?} at position {position} (char code {char_code})")]
pub struct HeaderParseError {
    pub name: String,
    pub position: usize,
    pub char_code: u32,
}

impl HeaderParseError {
    /// Scan a header value the way HTTP/1 serializers do.
    pub fn check(name: &str, value: &str) -> Result<(), Self> {
        match value
            .chars()
            .enumerate()
            .find(|(_, c)| (*c < ' ' && *c != '\t') || *c == '\x7f')
        {
            Some((position, c)) => Err(Self {
                name: name.to_string(),
                position,
                char_code: c as u32,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to find a DNS record for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to establish a tunnel through the proxy {proxy}: {reason}")]
    Tunnel { proxy: String, reason: String },

    #[error("cannot authorize to proxy")]
    ProxyAuth,

    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("socket hang up")]
    SocketHangUp,

    #[error("TLS negotiation with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    HeaderParse(#[from] HeaderParseError),

    #[error("failed to read a file at {path}: {reason}")]
    File { path: String, reason: String },

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("request failed: {0}")]
    Request(String),
}

impl TransportError {
    /// Fatal failures produce an error page or a destroyed connection;
    /// the rest are answered with a plain 500.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::SocketHangUp | TransportError::BodyTooLarge { .. } | TransportError::Request(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Resolve { .. } => "resolve",
            TransportError::Connect { .. } => "connect",
            TransportError::Tunnel { .. } => "tunnel",
            TransportError::ProxyAuth => "proxy_auth",
            TransportError::Timeout { .. } => "timeout",
            TransportError::SocketHangUp => "socket_hang_up",
            TransportError::Tls { .. } => "tls",
            TransportError::HeaderParse(_) => "header_parse",
            TransportError::File { .. } => "file",
            TransportError::BodyTooLarge { .. } => "body_too_large",
            TransportError::Request(_) => "request",
        }
    }

    /// Map a hyper client error.
    pub(crate) fn from_hyper(err: hyper::Error) -> Self {
        if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
            TransportError::SocketHangUp
        } else {
            TransportError::Request(err.to_string())
        }
    }
}
