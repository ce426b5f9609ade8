//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): proxied requests by kind and status
//! - `proxy_request_duration_seconds` (histogram): pipeline latency
//! - `proxy_cache_lookups_total` (counter): response cache hits/misses
//! - `proxy_cache_entries` (gauge): resident cache entries
//! - `proxy_destination_retries_total` (counter): transport resends by reason
//! - `proxy_http2_sessions_total` (counter): HTTP/2 pool events
//! - `proxy_pipeline_errors_total` (counter): fatal pipeline errors by kind
//! - `proxy_active_connections` (gauge): open inbound connections

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(kind: &'static str, status: u16, start: Instant) {
    counter!("proxy_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds", "kind" => kind).record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("proxy_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_size(entries: usize) {
    gauge!("proxy_cache_entries").set(entries as f64);
}

pub fn record_destination_retry(reason: &'static str) {
    counter!("proxy_destination_retries_total", "reason" => reason).increment(1);
}

pub fn record_http2_session(event: &'static str) {
    counter!("proxy_http2_sessions_total", "event" => event).increment(1);
}

pub fn record_pipeline_error(kind: &'static str) {
    counter!("proxy_pipeline_errors_total", "kind" => kind).increment(1);
}

pub fn record_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}
