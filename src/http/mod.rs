//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (same-origin or cross-origin port)
//!     → server.rs (hyper auto builder, HTTP/1.1 + HTTP/2 + upgrades)
//!     → ServiceRouter (messaging, task scripts, static resources)
//!     → PipelineContext::dispatch (404 when not a proxy URL)
//!     → pipeline stages
//!     → Send to client, or drop the connection on abort
//! ```

pub mod server;

pub use server::{ProxyServer, ProxyState, ServerError};
