use socket2::SockRef;
use tokio::net::TcpSocket;

use super::PortReuse;

pub(crate) struct UnixReuse;

impl PortReuse for UnixReuse {
    #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
    fn set_reuse(socket: &TcpSocket) -> std::io::Result<()> {
        SockRef::from(socket).set_reuse_port(true)
    }

    // No SO_REUSEPORT here.
    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    fn set_reuse(socket: &TcpSocket) -> std::io::Result<()> {
        SockRef::from(socket).set_reuse_address(true)
    }
}
