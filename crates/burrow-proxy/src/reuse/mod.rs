//! Listen-socket port reuse
//!
//! Reverse endpoints may be re-bound by a fresh proxy while the previous
//! one is still winding down, so their listen socket asks the OS to allow
//! rebinding. The option differs per platform; exactly one implementation is
//! compiled in.

use tokio::net::TcpSocket;
use tracing::{debug, trace};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

/// Sets the platform's rebind option on a socket that is about to bind
pub(crate) trait PortReuse {
    fn set_reuse(socket: &TcpSocket) -> std::io::Result<()>;
}

#[cfg(unix)]
type Platform = unix::UnixReuse;

#[cfg(windows)]
type Platform = windows::WindowsReuse;

#[cfg(not(any(unix, windows)))]
type Platform = NoReuse;

#[cfg(not(any(unix, windows)))]
pub(crate) struct NoReuse;

#[cfg(not(any(unix, windows)))]
impl PortReuse for NoReuse {
    fn set_reuse(_socket: &TcpSocket) -> std::io::Result<()> {
        Ok(())
    }
}

/// Best effort: a failure here is logged and otherwise ignored, the bind
/// that follows reports a genuinely taken address.
pub(crate) fn set_reuse(socket: &TcpSocket) {
    match Platform::set_reuse(socket) {
        Ok(()) => trace!("Port reuse enabled"),
        Err(e) => debug!(error = %e, "Port reuse unavailable"),
    }
}
