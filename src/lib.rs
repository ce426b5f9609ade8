//! Intercepting, rewriting HTTP proxy for browser test automation.
//!
//! Every resource a browser loads under test is fetched through a proxy URL
//! of the form `/<session>[*<window>]/[<flags>][!<charset>]/<destination>`.
//! The proxy fetches the destination, rewrites pages, stylesheets, scripts
//! and manifests so their URLs point back at the proxy, and relays everything
//! else unchanged.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;
pub mod proxy_url;
pub mod routing;

// Destination side
pub mod cache;
pub mod session;
pub mod transport;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ProxyConfig;
pub use http::{ProxyServer, ServerError};
pub use lifecycle::Shutdown;
pub use pipeline::{PassthroughProcessor, ResourceProcessor};
pub use session::{Session, SessionRegistry};
