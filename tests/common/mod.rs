//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rewrite_proxy::config::ProxyConfig;
use rewrite_proxy::session::{ServiceMessageError, SessionDriver, TaskScriptRequest};
use rewrite_proxy::{PassthroughProcessor, ProxyServer, ResourceProcessor, Session, SessionRegistry, Shutdown};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A request as received by a mock destination.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Requests seen by a mock destination, in arrival order.
pub type RequestLog = Arc<Mutex<Vec<RecordedRequest>>>;

/// Build a raw HTTP/1.1 response that closes the connection.
pub fn http_response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len()));
    out
}

/// Start a mock destination on a free port. `respond` sees every request
/// (and how many came before it) and returns the raw response text.
pub async fn start_backend<F>(respond: F) -> (SocketAddr, RequestLog)
where
    F: Fn(&RecordedRequest, usize) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let task_log = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let log = Arc::clone(&task_log);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let response = {
                    let mut log = log.lock();
                    let seen = log.len();
                    log.push(request.clone());
                    respond(&request, seen)
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
    });

    (addr, log)
}

/// Start a mock destination that always answers with `response`.
pub async fn start_mock_backend(response: String) -> (SocketAddr, RequestLog) {
    start_backend(move |_, _| response.clone()).await
}

async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Driver with no behavior beyond echoing messages.
pub struct TestDriver;

#[async_trait]
impl SessionDriver for TestDriver {
    async fn handle_service_message(&self, message: Value) -> Result<Value, ServiceMessageError> {
        Ok(message)
    }

    fn task_script(&self, request: &TaskScriptRequest) -> String {
        format!("window.__task = {:?};", request.session_id)
    }
}

/// A running proxy bound to free ports.
pub struct TestProxy {
    pub same_origin: SocketAddr,
    pub cross_origin: SocketAddr,
    pub sessions: Arc<SessionRegistry>,
    shutdown: Shutdown,
}

impl TestProxy {
    /// Proxy URL on the same-origin port for `dest`.
    pub fn url(&self, session_id: &str, flags: &str, dest: &str) -> String {
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!("{flags}/")
        };
        format!("http://127.0.0.1:{}/{session_id}/{flags}{dest}", self.same_origin.port())
    }

    /// Origin the proxy writes into rewritten URLs.
    pub fn origin(&self) -> String {
        format!("http://localhost:{}", self.same_origin.port())
    }

    pub fn open_session(&self, session: Session) {
        self.sessions.open(session);
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.same_origin_port = 0;
    config.listener.cross_origin_port = 0;
    config.lifecycle.shutdown_grace_secs = 1;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    start_proxy_with(config, Arc::new(PassthroughProcessor)).await
}

pub async fn start_proxy_with(config: ProxyConfig, processor: Arc<dyn ResourceProcessor>) -> TestProxy {
    let server = ProxyServer::bind(config, processor).await.unwrap();
    let proxy = TestProxy {
        same_origin: server.same_origin_addr().unwrap(),
        cross_origin: server.cross_origin_addr().unwrap(),
        sessions: server.sessions(),
        shutdown: Shutdown::new(),
    };

    let shutdown = proxy.shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(shutdown).await;
    });
    proxy
}

/// A session with default collaborators.
pub fn session(id: &str) -> Session {
    Session::builder(id, Arc::new(TestDriver)).build()
}

/// Client that neither follows redirects nor uses a system proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
