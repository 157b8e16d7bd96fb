//! Transport session interface for forwarding channels
//!
//! The forwarding core does not own the encrypted, multiplexed session it
//! runs over. It only needs to ask for the *current* session and open a
//! logical channel on it, so this crate defines that seam as a trait.
//!
//! ```text
//! ┌──────────────────────┐  open_channel(type, payload)  ┌─────────────────┐
//! │  TunnelProxy (local  │ ─────────────────────────────▶ │ TransportSession │
//! │  accepted connection)│ ◀──── duplex stream + reqs ─── │ (SSH, QUIC, ...) │
//! └──────────────────────┘                                └─────────────────┘
//! ```
//!
//! [`memory::MemorySession`] is an in-process implementation whose far end is
//! handed to a [`memory::MemoryAcceptor`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

pub mod memory;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel rejected: {0}")]
    ChannelRejected(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Any duplex byte stream that can be moved across tasks
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type-erased duplex stream (accepted socket or logical channel)
pub type BoxedStream = Box<dyn AsyncStream>;

/// Out-of-band requests delivered alongside a channel
pub type RequestStream = mpsc::Receiver<OutOfBandRequest>;

/// A request sent on a channel outside of its byte stream
#[derive(Debug)]
pub struct OutOfBandRequest {
    pub name: String,
    pub want_reply: bool,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl OutOfBandRequest {
    /// Create a fire-and-forget request
    pub fn new(name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            name: name.into(),
            want_reply: false,
            payload,
            reply: None,
        }
    }

    /// Create a request whose sender waits for an answer
    pub fn with_reply(
        name: impl Into<String>,
        payload: Bytes,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            name: name.into(),
            want_reply: true,
            payload,
            reply: Some(tx),
        };
        (request, rx)
    }

    /// Answer the request; a no-op when no reply was asked for
    pub fn reply(mut self, ok: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(ok);
        }
    }
}

/// A multiplexed session able to open logical channels on demand
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Open a new logical channel
    ///
    /// `payload` is opaque to the session and delivered to the far side with
    /// the open request. Returns the channel and the out-of-band requests the
    /// far side sends on it.
    async fn open_channel(
        &self,
        channel_type: &str,
        payload: &[u8],
    ) -> TransportResult<(BoxedStream, RequestStream)>;
}

/// Yields the live session, or `None` while there isn't one
pub type SessionAccessor = Arc<dyn Fn() -> Option<Arc<dyn TransportSession>> + Send + Sync>;

/// Build an accessor that always returns the same session
pub fn fixed_session<S>(session: Arc<S>) -> SessionAccessor
where
    S: TransportSession + 'static,
{
    let session: Arc<dyn TransportSession> = session;
    Arc::new(move || Some(session.clone()))
}

/// Drain a request stream, rejecting everything that wants a reply
pub async fn discard_requests(mut requests: RequestStream) {
    while let Some(request) = requests.recv().await {
        trace!(
            name = %request.name,
            want_reply = request.want_reply,
            "Discarding out-of-band request"
        );
        request.reply(false);
    }
}
