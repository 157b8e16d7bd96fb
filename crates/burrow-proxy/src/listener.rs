//! Listening resources owned by a proxy

use std::io;
use std::net::SocketAddr;

use burrow_proto::RemoteEndpoint;
use burrow_transport::BoxedStream;
use tokio::net::{TcpListener, TcpSocket};
use tracing::warn;

use crate::reuse;

const LISTEN_BACKLOG: u32 = 1024;

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixSocketListener),
}

impl Listener {
    /// Bind the endpoint's local side
    pub(crate) async fn bind(endpoint: &RemoteEndpoint) -> io::Result<Self> {
        if endpoint.listens_on_unix() {
            return Self::bind_unix(endpoint.local_port());
        }
        Self::bind_tcp(endpoint).await.map(Listener::Tcp)
    }

    async fn bind_tcp(endpoint: &RemoteEndpoint) -> io::Result<TcpListener> {
        let address = format!("{}:{}", endpoint.local_host(), endpoint.local_port());
        let addr = tokio::net::lookup_host(&address)
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no IPv4 address for {}", address),
                )
            })?;

        let socket = TcpSocket::new_v4()?;
        #[cfg(not(windows))]
        socket.set_reuseaddr(true)?;
        if endpoint.is_reverse() {
            reuse::set_reuse(&socket);
        }
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    #[cfg(unix)]
    fn bind_unix(path: &str) -> io::Result<Self> {
        let listener = tokio::net::UnixListener::bind(path)?;
        Ok(Listener::Unix(UnixSocketListener {
            listener,
            path: path.into(),
        }))
    }

    #[cfg(not(unix))]
    fn bind_unix(_path: &str) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix domain sockets are not supported on this platform",
        ))
    }

    pub(crate) async fn accept(&self) -> io::Result<BoxedStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _peer) = listener.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Listener::Unix(unix) => {
                let (stream, _peer) = unix.listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }
}

/// Unix listener that unlinks its socket file once closed
#[cfg(unix)]
pub(crate) struct UnixSocketListener {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
