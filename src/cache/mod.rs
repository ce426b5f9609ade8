//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! destination request (GET)
//!     → ResponseCache::get_response (fresh hit? serve it, bump hit count)
//!     → miss: fetch from destination
//!     → ResponseCache::create (policy says storable? temporary CacheEntry)
//!     → body fully read → CacheEntry::complete
//!     → ResponseCache::add (LRU insert with policy TTL)
//! ```
//!
//! # Design Decisions
//! - Only stylesheets and scripts are cached; pages are always rewritten fresh
//! - A partially streamed body can never be inserted (`add` requires completion)
//! - Best-effort residency: concurrent misses may both fetch and both insert

pub mod policy;

use std::num::NonZeroUsize;
use std::time::{Instant, SystemTime};

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::observability::metrics;
use crate::pipeline::PipelineContext;

pub use policy::{CacheControl, CachePolicy};

/// The request side of a cache lookup.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    pub method: &'a Method,
    pub url: &'a str,
    pub headers: &'a HeaderMap,
}

/// A response as served from the cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub trailers: Option<HeaderMap>,
    pub body: Bytes,
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: CachedResponse,
    /// Number of times this entry has been served, including this time.
    pub hits: u64,
}

/// A cacheable response whose body is still being read.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: String,
    policy: CachePolicy,
    status: StatusCode,
    headers: HeaderMap,
    trailers: Option<HeaderMap>,
    body: Option<Bytes>,
}

impl CacheEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Attach the fully read body.
    pub fn complete(&mut self, body: Bytes, trailers: Option<HeaderMap>) {
        self.body = Some(body);
        if trailers.is_some() {
            self.trailers = trailers;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.body.is_some()
    }
}

struct StoredResponse {
    policy: CachePolicy,
    response: CachedResponse,
    expires_at: Instant,
    hits: u64,
}

/// Bounded LRU of cacheable destination responses.
pub struct ResponseCache {
    enabled: bool,
    entries: Mutex<LruCache<String, StoredResponse>>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            enabled: config.enabled,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the response in `ctx` is a candidate for caching.
    pub fn should_cache(&self, ctx: &PipelineContext) -> bool {
        let is_style_or_script = ctx
            .content_info
            .as_ref()
            .map(|info| info.is_css || info.is_script)
            .unwrap_or(false);

        self.enabled && !ctx.dest.is_file() && ctx.req.method == Method::GET && is_style_or_script
    }

    /// Open a temporary entry if the response is storable.
    pub fn create(
        &self,
        request: CacheRequest<'_>,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Option<CacheEntry> {
        if *request.method != Method::GET {
            return None;
        }

        let policy = CachePolicy::new(
            request.method,
            request.url,
            request.headers,
            status,
            headers,
            SystemTime::now(),
        );
        if !policy.storable() {
            return None;
        }

        Some(CacheEntry {
            key: request.url.to_string(),
            policy,
            status,
            headers: headers.clone(),
            trailers: None,
            body: None,
        })
    }

    /// Promote a completed entry. Returns whether it was stored.
    pub fn add(&self, entry: CacheEntry) -> bool {
        let Some(body) = entry.body else {
            return false;
        };

        let ttl = entry.policy.time_to_live(SystemTime::now());
        if ttl.is_zero() {
            return false;
        }
        let Some(expires_at) = Instant::now().checked_add(ttl) else {
            return false;
        };

        let stored = StoredResponse {
            policy: entry.policy,
            response: CachedResponse {
                status: entry.status,
                headers: entry.headers,
                trailers: entry.trailers,
                body,
            },
            expires_at,
            hits: 0,
        };

        let mut entries = self.entries.lock();
        entries.put(entry.key, stored);
        metrics::record_cache_size(entries.len());
        true
    }

    /// Look up a fresh response for `request`.
    pub fn get_response(&self, request: CacheRequest<'_>) -> Option<CacheHit> {
        if !self.enabled || *request.method != Method::GET {
            return None;
        }

        let mut entries = self.entries.lock();

        let Some(expired) = entries
            .peek(request.url)
            .map(|stored| Instant::now() >= stored.expires_at)
        else {
            metrics::record_cache_lookup(false);
            return None;
        };
        if expired {
            entries.pop(request.url);
            metrics::record_cache_lookup(false);
            return None;
        }

        let Some(stored) = entries.get_mut(request.url) else {
            metrics::record_cache_lookup(false);
            return None;
        };
        let satisfiable = stored.policy.satisfies_without_revalidation(
            request.method,
            request.url,
            request.headers,
            SystemTime::now(),
        );
        if !satisfiable {
            metrics::record_cache_lookup(false);
            return None;
        }

        stored.hits += 1;
        metrics::record_cache_lookup(true);
        Some(CacheHit {
            response: stored.response.clone(),
            hits: stored.hits,
        })
    }
}
