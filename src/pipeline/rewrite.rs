//! Content rewriting interface.
//!
//! The pipeline decodes a resource, hands the text to a
//! [`ResourceProcessor`] and re-encodes whatever comes back. Processors
//! either return rewritten text or ask for one restart with a different
//! charset when the content declares one the pipeline did not know about.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::pipeline::charset::{meta_charset, Charset};
use crate::pipeline::content_info::ContentInfo;
use crate::pipeline::context::DestInfo;
use crate::proxy_url::domain::origin_of;
use crate::proxy_url::{self, ProxyLocation, ProxyUrlOptions, ResourceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Page,
    Stylesheet,
    Script,
    Manifest,
}

impl ResourceKind {
    pub fn of(info: &ContentInfo) -> Self {
        if info.is_page || info.is_iframe {
            ResourceKind::Page
        } else if info.is_css {
            ResourceKind::Stylesheet
        } else if info.is_manifest {
            ResourceKind::Manifest
        } else {
            ResourceKind::Script
        }
    }
}

/// Result of processing one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Rewritten(String),
    /// Decode the body again with this charset and reprocess it.
    RestartWithCharset(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to process {url}: {message}")]
pub struct ProcessingError {
    pub url: String,
    pub message: String,
}

/// Everything a processor gets to see.
pub struct ProcessingInput<'a> {
    pub body: &'a str,
    pub kind: ResourceKind,
    pub url: &'a Url,
    pub charset: &'a Charset,
    pub urls: &'a UrlReplacer,
    pub session_id: &'a str,
    pub window_id: Option<&'a str>,
    pub is_iframe: bool,
    /// `false` once the pipeline has already restarted for this request.
    pub allow_restart: bool,
    pub restored_storages: Option<&'a Value>,
}

#[async_trait]
pub trait ResourceProcessor: Send + Sync {
    async fn process(&self, input: ProcessingInput<'_>) -> Result<ProcessingOutcome, ProcessingError>;
}

/// Leaves content untouched apart from honoring `<meta>` charsets.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProcessor;

#[async_trait]
impl ResourceProcessor for PassthroughProcessor {
    async fn process(&self, input: ProcessingInput<'_>) -> Result<ProcessingOutcome, ProcessingError> {
        if input.kind == ResourceKind::Page && input.allow_restart {
            if let Some(label) = meta_charset(input.body) {
                let mut declared = *input.charset;
                if declared.from_meta(&label) {
                    return Ok(ProcessingOutcome::RestartWithCharset(label));
                }
            }
        }
        Ok(ProcessingOutcome::Rewritten(input.body.to_string()))
    }
}

/// Turns URLs found in content into proxy URLs.
#[derive(Debug, Clone)]
pub struct UrlReplacer {
    base: Url,
    page_origin: String,
    session_id: String,
    window_id: Option<String>,
    charset: String,
    current: ProxyLocation,
    same_origin: ProxyLocation,
    cross_origin: ProxyLocation,
}

impl UrlReplacer {
    pub fn new(dest: &DestInfo, charset: &Charset, same_origin: ProxyLocation, cross_origin: ProxyLocation) -> Self {
        Self {
            base: dest.url.clone(),
            page_origin: dest.origin.clone(),
            session_id: dest.session_id.clone(),
            window_id: dest.window_id.clone(),
            charset: charset.label().to_string(),
            current: dest.proxy.clone(),
            same_origin,
            cross_origin,
        }
    }

    /// Proxy URL for `url` as referenced from the current resource. URLs
    /// that cannot be proxied are returned unchanged.
    pub fn replace(&self, url: &str, resource_type: ResourceType) -> String {
        let Some(resolved) = proxy_url::resolve_destination(&self.base, url) else {
            return url.to_string();
        };

        let proxy = if resource_type.is_iframe() {
            if origin_of(&resolved) == self.page_origin {
                self.same_origin.clone()
            } else {
                self.cross_origin.clone()
            }
        } else {
            self.current.clone()
        };

        let mut options = ProxyUrlOptions::new(self.session_id.clone(), proxy).resource_type(resource_type);
        if let Some(window) = &self.window_id {
            options = options.window(window.clone());
        }
        if resource_type.is_script_like() {
            options = options.charset(self.charset.clone());
        }

        proxy_url::encode(resolved.as_str(), &options).unwrap_or_else(|_| url.to_string())
    }
}
