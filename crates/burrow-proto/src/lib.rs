//! Forwarding rule definitions
//!
//! This crate defines the shorthand grammar used to describe forwarding rules
//! and the remote target that travels with every channel-open request.

pub mod endpoint;
pub mod error;
pub mod target;

pub use endpoint::RemoteEndpoint;
pub use error::EndpointError;
pub use target::RemoteTarget;

/// Channel type used when opening a forwarding channel over a session
pub const TUNNEL_CHANNEL_TYPE: &str = "burrow";

/// Default local port for SOCKS endpoints
pub const DEFAULT_SOCKS_PORT: &str = "1080";

/// Default bind host for SOCKS endpoints
pub const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";

/// Default host for everything else
pub const DEFAULT_HOST: &str = "0.0.0.0";
