//! Pool of HTTP/2 sessions, one per origin.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashSet;
use http_body_util::Full;
use hyper::client::conn::http2::SendRequest;
use lru::LruCache;
use parking_lot::Mutex;

use crate::observability::metrics;

pub type Http2Sender = SendRequest<Full<Bytes>>;

struct PooledSession {
    sender: Http2Sender,
    last_used: Instant,
}

/// Bounded LRU of open HTTP/2 sessions.
///
/// Dropping the last sender of a session lets its connection task finish,
/// so eviction and idle sweeps close connections implicitly.
pub struct Http2SessionPool {
    sessions: Mutex<LruCache<String, PooledSession>>,
    /// Origins that did not negotiate h2.
    unsupported: DashSet<String>,
    idle_timeout: Duration,
}

impl Http2SessionPool {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_sessions).unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
            unsupported: DashSet::new(),
            idle_timeout,
        }
    }

    /// A live session for `origin`, sweeping idle ones first.
    pub fn get(&self, origin: &str) -> Option<Http2Sender> {
        let mut sessions = self.sessions.lock();
        self.sweep(&mut sessions);

        let session = sessions.get_mut(origin)?;
        session.last_used = Instant::now();
        Some(session.sender.clone())
    }

    pub fn insert(&self, origin: &str, sender: Http2Sender) {
        let mut sessions = self.sessions.lock();
        let pooled = PooledSession {
            sender,
            last_used: Instant::now(),
        };
        if let Some((evicted, _)) = sessions.push(origin.to_string(), pooled) {
            if evicted != origin {
                tracing::debug!(origin = %evicted, "HTTP/2 session evicted");
                metrics::record_http2_session("evicted");
            }
        }
        metrics::record_http2_session("opened");
    }

    pub fn remove(&self, origin: &str) {
        if self.sessions.lock().pop(origin).is_some() {
            metrics::record_http2_session("closed");
        }
    }

    pub fn mark_unsupported(&self, origin: &str) {
        if self.unsupported.insert(origin.to_string()) {
            tracing::debug!(origin = %origin, "Origin does not support HTTP/2");
        }
    }

    pub fn is_unsupported(&self, origin: &str) -> bool {
        self.unsupported.contains(origin)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, sessions: &mut LruCache<String, PooledSession>) {
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.sender.is_closed() || s.last_used.elapsed() >= self.idle_timeout)
            .map(|(origin, _)| origin.clone())
            .collect();
        for origin in stale {
            sessions.pop(&origin);
            tracing::debug!(origin = %origin, "HTTP/2 session closed");
            metrics::record_http2_session("closed_idle");
        }
    }
}
