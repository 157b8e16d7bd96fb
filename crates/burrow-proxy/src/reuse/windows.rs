use socket2::SockRef;
use tokio::net::TcpSocket;

use super::PortReuse;

pub(crate) struct WindowsReuse;

impl PortReuse for WindowsReuse {
    fn set_reuse(socket: &TcpSocket) -> std::io::Result<()> {
        SockRef::from(socket).set_reuse_address(true)
    }
}
