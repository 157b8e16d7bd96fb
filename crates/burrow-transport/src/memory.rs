//! In-process transport session
//!
//! Every channel opened on a [`MemorySession`] is backed by a
//! [`tokio::io::duplex`] pair; the far half is delivered to the paired
//! [`MemoryAcceptor`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    BoxedStream, OutOfBandRequest, RequestStream, TransportError, TransportResult,
    TransportSession,
};

/// Per-direction buffer of each in-memory channel
const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;

/// Pending channel opens the acceptor may fall behind by
const ACCEPT_BACKLOG: usize = 64;

/// A channel opened by the near side, as seen by the far side
#[derive(Debug)]
pub struct IncomingChannel {
    pub channel_id: u64,
    pub channel_type: String,
    pub payload: Bytes,
    pub stream: DuplexStream,
    /// Send out-of-band requests back to the opener
    pub requests: mpsc::Sender<OutOfBandRequest>,
}

/// Near side of an in-process session
#[derive(Debug)]
pub struct MemorySession {
    accept_tx: mpsc::Sender<IncomingChannel>,
    next_channel_id: AtomicU64,
    opened: AtomicU64,
}

/// Far side of an in-process session
#[derive(Debug)]
pub struct MemoryAcceptor {
    accept_rx: mpsc::Receiver<IncomingChannel>,
}

impl MemorySession {
    /// Create a connected session/acceptor pair
    pub fn pair() -> (Arc<MemorySession>, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let session = Arc::new(MemorySession {
            accept_tx,
            next_channel_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
        });
        (session, MemoryAcceptor { accept_rx })
    }

    /// Number of channels handed to the acceptor so far
    pub fn channels_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn open_channel(
        &self,
        channel_type: &str,
        payload: &[u8],
    ) -> TransportResult<(BoxedStream, RequestStream)> {
        if self.accept_tx.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let (near, far) = tokio::io::duplex(CHANNEL_BUFFER_SIZE);
        let (request_tx, request_rx) = mpsc::channel(16);
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::SeqCst);

        let incoming = IncomingChannel {
            channel_id,
            channel_type: channel_type.to_string(),
            payload: Bytes::copy_from_slice(payload),
            stream: far,
            requests: request_tx,
        };

        self.accept_tx
            .send(incoming)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        self.opened.fetch_add(1, Ordering::SeqCst);

        debug!(channel_id, channel_type, "Opened in-memory channel");

        Ok((Box::new(near), request_rx))
    }
}

impl MemoryAcceptor {
    /// Wait for the next channel; `None` once every session handle is gone
    pub async fn accept(&mut self) -> Option<IncomingChannel> {
        self.accept_rx.recv().await
    }

    /// Refuse further channel opens
    pub fn close(&mut self) {
        self.accept_rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_channel_reaches_acceptor() {
        let (session, mut acceptor) = MemorySession::pair();

        let (mut near, _requests) = session
            .open_channel("burrow", b"example.com:80")
            .await
            .unwrap();
        let mut incoming = acceptor.accept().await.unwrap();

        assert_eq!(incoming.channel_id, 1);
        assert_eq!(incoming.channel_type, "burrow");
        assert_eq!(&incoming.payload[..], b"example.com:80");

        near.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(session.channels_opened(), 1);
    }

    #[tokio::test]
    async fn test_closed_acceptor_refuses_channels() {
        let (session, mut acceptor) = MemorySession::pair();
        acceptor.close();

        let result = session.open_channel("burrow", b"socks").await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert_eq!(session.channels_opened(), 0);
    }

    #[tokio::test]
    async fn test_open_refused_when_acceptor_dropped_mid_send() {
        let (session, acceptor) = MemorySession::pair();

        let mut held = Vec::new();
        for _ in 0..ACCEPT_BACKLOG {
            held.push(session.open_channel("burrow", b"example.com:80").await.unwrap());
        }
        assert_eq!(session.channels_opened(), ACCEPT_BACKLOG as u64);

        // The backlog is full, so this open waits on the acceptor.
        let blocked = tokio::spawn({
            let session = session.clone();
            async move { session.open_channel("burrow", b"example.com:80").await }
        });
        tokio::task::yield_now().await;
        drop(acceptor);

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert_eq!(session.channels_opened(), ACCEPT_BACKLOG as u64);
    }
}
