//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, distinct ports)
//! - Check file references and addresses are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listener.hostname must not be empty")]
    EmptyHostname,

    #[error("listener ports must differ (both are {0})")]
    PortClash(u16),

    #[error("listener.max_connections must be greater than zero")]
    NoConnections,

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("cache.max_entries must be greater than zero when the cache is enabled")]
    EmptyCache,

    #[error("listener.tls.{0} must not be empty")]
    EmptyTlsPath(&'static str),

    #[error("invalid metrics address: {0}")]
    MetricsAddress(String),

    #[error("security.max_body_size must be greater than zero")]
    ZeroBodyLimit,
}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.hostname.trim().is_empty() {
        errors.push(ValidationError::EmptyHostname);
    }
    if listener.same_origin_port != 0 && listener.same_origin_port == listener.cross_origin_port {
        errors.push(ValidationError::PortClash(listener.same_origin_port));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::NoConnections);
    }
    if let Some(tls) = &listener.tls {
        if tls.cert_path.trim().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("cert_path"));
        }
        if tls.key_path.trim().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("key_path"));
        }
    }

    let transport = &config.transport;
    let timeouts = [
        ("transport.connect_secs", transport.connect_secs),
        ("transport.page_request_secs", transport.page_request_secs),
        ("transport.ajax_request_secs", transport.ajax_request_secs),
        ("transport.event_source_request_secs", transport.event_source_request_secs),
    ];
    for (name, value) in timeouts {
        if value == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if config.cache.enabled && config.cache.max_entries == 0 {
        errors.push(ValidationError::EmptyCache);
    }

    if config.security.max_body_size == 0 {
        errors.push(ValidationError::ZeroBodyLimit);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
