//! Forwarding core
//!
//! Binds the local side of each forwarding rule, opens a channel on the
//! current transport session for every accepted connection and relays bytes
//! both ways.

pub mod config;
pub mod dialer;
pub mod inject;
mod listener;
pub mod pipe;
pub mod proxy;
mod reuse;

pub use config::{ConfigError, ForwardConfig};
pub use dialer::{DialError, TargetDialer};
pub use inject::ConnectionInjector;
pub use pipe::pipe;
pub use proxy::{ConnectionIds, ProxyContext, ProxyError, ProxyState, TunnelProxy};
