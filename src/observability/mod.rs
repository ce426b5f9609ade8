//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every pipeline event carries `request_id` and `session_id` fields
//! - Metrics are cheap (atomic increments); recording is a no-op without an exporter
//! - Initialisation is left to the embedding harness

pub mod logging;
pub mod metrics;
