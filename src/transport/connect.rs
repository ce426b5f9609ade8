//! Connection establishment: DNS, TCP, external proxies and CONNECT tunnels.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::HeaderValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::transport::auth::basic_header_value;
use crate::transport::error::TransportError;

/// Longest CONNECT response head accepted from a proxy.
const MAX_TUNNEL_RESPONSE_HEAD: usize = 8 * 1024;

/// Any byte stream a destination connection can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Upstream proxy configured for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProxy {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
    /// Hosts reached directly. `*.e.com` matches subdomains, `.e.com` both.
    pub bypass_rules: Vec<String>,
}

impl ExternalProxy {
    /// Parse `[user:pass@]host[:port]`, defaulting to port 80.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_prefix("http://").unwrap_or(value);
        let (auth, host_port) = match value.rsplit_once('@') {
            Some((auth, rest)) => {
                let (user, pass) = auth.split_once(':').unwrap_or((auth, ""));
                (Some((user.to_string(), pass.to_string())), rest)
            }
            None => (None, value),
        };
        let host_port = host_port.trim_end_matches('/');
        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']')?;
            match rest.strip_prefix(':') {
                Some(port) => (host, port.parse().ok()?),
                None if rest.is_empty() => (host, 80),
                None => return None,
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().ok()?),
                None => (host_port, 80),
            }
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_ascii_lowercase(),
            port,
            auth,
            bypass_rules: Vec::new(),
        })
    }

    pub fn with_bypass_rules(mut self, rules: Vec<String>) -> Self {
        self.bypass_rules = rules;
        self
    }

    pub fn should_bypass(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.bypass_rules.iter().any(|rule| {
            let rule = rule.trim().to_ascii_lowercase();
            if let Some(suffix) = rule.strip_prefix("*.") {
                host.ends_with(&format!(".{suffix}"))
            } else if let Some(suffix) = rule.strip_prefix('.') {
                host == suffix || host.ends_with(&rule)
            } else {
                host == rule
            }
        })
    }

    pub fn authorization(&self) -> Option<HeaderValue> {
        self.auth.as_ref().map(|(user, pass)| basic_header_value(user, pass))
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Resolve `host:port`, classifying lookup failures as resolve errors.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let resolve_error = |source| TransportError::Resolve {
        host: host.to_string(),
        source,
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")))
}

/// Resolve and connect with a connect timeout.
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let addr = resolve(host, port).await?;
    let connect_error = |source| TransportError::Connect {
        addr: addr.to_string(),
        source,
    };
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| connect_error(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(connect_error)?;
    let _ = stream.set_nodelay(true);
    tracing::trace!(address = %addr, "Destination connection established");
    Ok(stream)
}

/// Open a CONNECT tunnel to `target` (`host:port`) through `proxy`.
pub async fn establish_tunnel<S>(mut stream: S, proxy: &ExternalProxy, target: &str) -> Result<S, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let tunnel_error = |reason: String| TransportError::Tunnel {
        proxy: proxy.address(),
        reason,
    };

    let mut head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = proxy.authorization().and_then(|v| v.to_str().ok().map(str::to_string)) {
        head.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    head.push_str("\r\n");
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|err| tunnel_error(err.to_string()))?;

    // Byte-at-a-time so nothing past the head is consumed.
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_TUNNEL_RESPONSE_HEAD {
            return Err(tunnel_error("response head too large".into()));
        }
        let read = stream.read(&mut byte).await.map_err(|err| tunnel_error(err.to_string()))?;
        if read == 0 {
            return Err(tunnel_error("connection closed".into()));
        }
        response.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&response);
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| tunnel_error("malformed response".into()))?;

    match status {
        200..=299 => Ok(stream),
        407 => Err(TransportError::ProxyAuth),
        other => Err(tunnel_error(format!("status {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn parses_proxy_addresses() {
        let proxy = ExternalProxy::parse("user:pw@Proxy.local:3128").unwrap();
        assert_eq!(proxy.host, "proxy.local");
        assert_eq!(proxy.port, 3128);
        assert_eq!(proxy.auth, Some(("user".into(), "pw".into())));

        let proxy = ExternalProxy::parse("proxy.local").unwrap();
        assert_eq!(proxy.port, 80);
        assert!(proxy.auth.is_none());

        let proxy = ExternalProxy::parse("[::1]:8888").unwrap();
        assert_eq!(proxy.host, "::1");
        assert_eq!(proxy.address(), "[::1]:8888");

        assert!(ExternalProxy::parse("").is_none());
        assert!(ExternalProxy::parse("host:notaport").is_none());
    }

    #[test]
    fn bypass_rules() {
        let proxy = ExternalProxy::parse("p:1")
            .unwrap()
            .with_bypass_rules(vec!["localhost".into(), "*.internal".into(), ".corp.com".into()]);
        assert!(proxy.should_bypass("LOCALHOST"));
        assert!(proxy.should_bypass("a.internal"));
        assert!(!proxy.should_bypass("internal"));
        assert!(proxy.should_bypass("corp.com"));
        assert!(proxy.should_bypass("x.corp.com"));
        assert!(!proxy.should_bypass("e.com"));
    }

    async fn tunnel_with_reply(reply: &'static [u8]) -> (Result<(), TransportError>, String) {
        let (client, mut server) = duplex(4096);
        let proxy = ExternalProxy::parse("u:p@proxy:8080").unwrap();

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(reply).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let result = establish_tunnel(client, &proxy, "e.com:443").await.map(|_| ());
        (result, server_task.await.unwrap())
    }

    #[tokio::test]
    async fn tunnel_sends_connect_with_credentials() {
        let (result, request) = tunnel_with_reply(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        assert!(result.is_ok());
        assert!(request.starts_with("CONNECT e.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[tokio::test]
    async fn tunnel_407_is_proxy_auth_failure() {
        let (result, _) = tunnel_with_reply(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        assert!(matches!(result, Err(TransportError::ProxyAuth)));
    }

    #[tokio::test]
    async fn tunnel_other_status_is_tunnel_failure() {
        let (result, _) = tunnel_with_reply(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        assert!(matches!(result, Err(TransportError::Tunnel { .. })));
    }
}
