//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the rewriting proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (hostname, both ports, TLS).
    pub listener: ListenerConfig,

    /// Destination transport settings.
    pub transport: TransportConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Request limits.
    pub security: SecurityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Lifecycle settings.
    pub lifecycle: LifecycleConfig,
}

/// Listener configuration.
///
/// Every proxy instance listens on two ports: loads that are same-origin with
/// their referencing page go to `same_origin_port`, cross-origin ones to
/// `cross_origin_port`, so the browser partitions cookies correctly.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Hostname written into proxy URLs.
    pub hostname: String,

    /// Interface to bind (e.g., "127.0.0.1").
    pub bind_address: String,

    /// Port for same-origin loads (0 picks a free port).
    pub same_origin_port: u16,

    /// Port for cross-origin loads (0 picks a free port).
    pub cross_origin_port: u16,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Maximum concurrent connections per listener (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            bind_address: "127.0.0.1".to_string(),
            same_origin_port: 1337,
            cross_origin_port: 1338,
            tls: None,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Destination transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP connect timeout in seconds.
    pub connect_secs: u64,

    /// Time to first response byte for page navigations, in seconds.
    pub page_request_secs: u64,

    /// Time to first response byte for ajax/fetch requests, in seconds.
    pub ajax_request_secs: u64,

    /// Time to first response byte for event-source streams, in seconds.
    pub event_source_request_secs: u64,

    /// Try HTTP/2 (via ALPN) for https destinations.
    pub http2_enabled: bool,

    /// Maximum pooled HTTP/2 sessions (one per origin).
    pub http2_max_sessions: usize,

    /// Idle time after which a pooled HTTP/2 session is closed, in seconds.
    pub http2_idle_secs: u64,

    /// Accept any destination certificate.
    pub ignore_certificate_errors: bool,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn http2_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.http2_idle_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            page_request_secs: 120,
            ajax_request_secs: 60,
            event_source_request_secs: 3600,
            http2_enabled: true,
            http2_max_sessions: 100,
            http2_idle_secs: 300,
            ignore_certificate_errors: true,
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache stylesheets and scripts fetched from destinations.
    pub enabled: bool,

    /// Maximum number of cached responses.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: 500,
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum buffered request or response body in bytes.
    pub max_body_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_body_size: 64 * 1024 * 1024,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long open connections may drain after shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 10,
        }
    }
}
