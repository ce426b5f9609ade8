//! Proxy URL codec subsystem.
//!
//! # Data Flow
//! ```text
//! destination URL + session/window/resource metadata
//!     → codec::encode
//!     → http://proxy:port/<sid>*<win>/<flags>!<charset>/<destination>
//!
//! inbound request path (or its Referer)
//!     → codec::decode_path
//!     → ProxyUrlDescriptor (destination, session, window, flags)
//! ```
//!
//! # Design Decisions
//! - Decoding never panics; anything malformed is `None`
//! - Exactly one level is decoded; nested proxy URLs stay opaque
//! - Destinations are normalized by the `url` crate (host case, default ports)

pub mod codec;
pub mod domain;
pub mod resource_type;

pub use codec::{
    decode, decode_path, encode, normalize_destination, resolve_and_encode, resolve_destination, CodecError,
    ProxyLocation, ProxyUrlDescriptor, ProxyUrlOptions, SpecialPage,
};
pub use resource_type::ResourceType;
