//! Request pipeline subsystem.
//!
//! # Responsibilities
//! - Bind each incoming request to its session and destination
//!   (`PipelineContext::dispatch`)
//! - Run the fixed stage sequence that fetches, rewrites and relays the
//!   destination response (`stages::run`)
//! - Apply header transforms, same-origin checks and the error policy
//!
//! # Data Flow
//! ```text
//! hyper request → dispatch → stages 1..8 → Response<Body> | dropped connection
//!                                ↓
//!                      DestinationTransport, ResponseCache,
//!                      session collaborators, ResourceProcessor
//! ```

pub mod charset;
pub mod content_info;
pub mod context;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod rewrite;
pub mod same_origin;
pub mod stages;
pub mod websocket;

use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::config::{ProxyConfig, TransportConfig};
use crate::proxy_url::ProxyLocation;
use crate::transport::DestinationTransport;

pub use charset::Charset;
pub use content_info::ContentInfo;
pub use context::{CredentialsMode, DestInfo, DispatchError, PipelineContext, RequestFlags};
pub use error::PipelineError;
pub use rewrite::{PassthroughProcessor, ProcessingError, ProcessingInput, ProcessingOutcome, ResourceKind, ResourceProcessor, UrlReplacer};
pub use stages::{run, PipelineAborted, Stage};

/// Shared collaborators every pipeline run uses.
pub struct PipelineServices {
    pub transport: DestinationTransport,
    pub cache: Arc<ResponseCache>,
    pub processor: Arc<dyn ResourceProcessor>,
    pub transport_config: TransportConfig,
    pub max_body_size: usize,
    /// Listener for same-origin loads.
    pub same_origin: ProxyLocation,
    /// Listener for cross-origin iframes.
    pub cross_origin: ProxyLocation,
}

impl PipelineServices {
    pub fn new(
        config: &ProxyConfig,
        processor: Arc<dyn ResourceProcessor>,
        same_origin: ProxyLocation,
        cross_origin: ProxyLocation,
    ) -> Result<Self, rustls::Error> {
        let cache = Arc::new(ResponseCache::new(&config.cache));
        Ok(Self {
            transport: DestinationTransport::new(
                config.transport.clone(),
                Arc::clone(&cache),
                config.security.max_body_size,
            )?,
            cache,
            processor,
            transport_config: config.transport.clone(),
            max_body_size: config.security.max_body_size,
            same_origin,
            cross_origin,
        })
    }
}
