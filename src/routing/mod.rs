//! Service routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, path)
//!     → router.rs (exact lookup, then parametrized scan)
//!     → matcher.rs (segment matching, `{param}` capture)
//!     → Matched: static resource or RouteHandler answers
//!     → No match: request handed to the pipeline
//!
//! Built-in routes (service.rs):
//!     POST /messaging       → SessionDriver::handle_service_message
//!     GET  /task.js         → SessionDriver::task_script
//!     GET  /iframe-task.js  → SessionDriver::task_script (iframe)
//! ```
//!
//! # Design Decisions
//! - Routes are registered before the server starts and read-only while serving
//! - No regex in hot path (segment matching only)
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod router;
pub mod service;

pub use matcher::{RouteParams, RoutePattern};
pub use router::{RouteHandler, ServiceRouter, StaticResource};
