//! Receiving side of forwarding channels
//!
//! Decodes the target carried in a channel-open payload, connects to it and
//! relays the channel's bytes.

use burrow_proto::{EndpointError, RemoteTarget, TUNNEL_CHANNEL_TYPE};
use burrow_transport::memory::{IncomingChannel, MemoryAcceptor};
use burrow_transport::{AsyncStream, BoxedStream};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

/// Errors that can occur while serving a single channel
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Unsupported channel type '{0}'")]
    UnsupportedChannel(String),

    #[error("Channel payload is not valid UTF-8")]
    InvalidPayload,

    #[error(transparent)]
    Target(#[from] EndpointError),

    #[error("SOCKS targets must be served by a SOCKS server")]
    SocksUnsupported,

    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Clone)]
pub struct TargetDialer {}

impl TargetDialer {
    pub fn new() -> Self {
        Self {}
    }

    /// Serve channels from an in-process session until cancelled
    pub async fn serve(&self, mut acceptor: MemoryAcceptor, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    acceptor.close();
                    break;
                }

                incoming = acceptor.accept() => match incoming {
                    Some(channel) => {
                        let dialer = self.clone();
                        let span = debug_span!("channel", id = channel.channel_id);
                        tokio::spawn(
                            async move { dialer.serve_channel(channel).await }.instrument(span),
                        );
                    }
                    None => break,
                }
            }
        }
        debug!("Dialer stopped");
    }

    async fn serve_channel(&self, channel: IncomingChannel) {
        let IncomingChannel {
            channel_type,
            payload,
            stream,
            requests,
            ..
        } = channel;
        // Nothing is sent back on the request stream.
        drop(requests);

        match self.handle(&channel_type, &payload, stream).await {
            Ok((sent, received)) => debug!(sent, received, "Channel closed"),
            Err(e) => info!("Channel refused: {}", e),
        }
    }

    /// Connect to the channel's target and relay until both ends are done
    ///
    /// Returns `(channel_to_target, target_to_channel)` byte counts.
    pub async fn handle<S>(
        &self,
        channel_type: &str,
        payload: &[u8],
        stream: S,
    ) -> Result<(u64, u64), DialError>
    where
        S: AsyncStream,
    {
        if channel_type != TUNNEL_CHANNEL_TYPE {
            return Err(DialError::UnsupportedChannel(channel_type.to_string()));
        }
        let payload = std::str::from_utf8(payload).map_err(|_| DialError::InvalidPayload)?;
        let target: RemoteTarget = payload.parse()?;

        let remote = Self::connect(&target).await?;
        debug!(target = %target, "Connected");

        Ok(crate::pipe::pipe(stream, remote).await)
    }

    pub async fn connect(target: &RemoteTarget) -> Result<BoxedStream, DialError> {
        match target {
            RemoteTarget::Tcp { host, port } => {
                let address = format!("{}:{}", host, port);
                let stream = TcpStream::connect(&address).await.map_err(|source| {
                    DialError::ConnectionFailed {
                        address: address.clone(),
                        source,
                    }
                })?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            RemoteTarget::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|source| {
                    DialError::ConnectionFailed {
                        address: target.to_string(),
                        source,
                    }
                })?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            RemoteTarget::Unix(_) => Err(DialError::ConnectionFailed {
                address: target.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix domain sockets are not supported on this platform",
                ),
            }),
            RemoteTarget::Socks => Err(DialError::SocksUnsupported),
        }
    }
}
