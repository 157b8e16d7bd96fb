//! Connections handed to a proxy by an embedding process
//!
//! An embedder that accepts connections itself registers a source under the
//! endpoint's canonical remote (see [`RemoteEndpoint::remote`]) and pushes
//! streams into the returned sender. A proxy started with a context carrying
//! the injector then serves that source instead of binding a socket.
//!
//! [`RemoteEndpoint::remote`]: burrow_proto::RemoteEndpoint::remote

use std::sync::Arc;

use burrow_transport::BoxedStream;
use dashmap::DashMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct ConnectionInjector {
    sources: Arc<DashMap<String, mpsc::Receiver<BoxedStream>>>,
}

impl ConnectionInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source for `remote`, replacing any unclaimed one
    pub fn register(&self, remote: impl Into<String>, capacity: usize) -> mpsc::Sender<BoxedStream> {
        let (tx, rx) = mpsc::channel(capacity);
        self.sources.insert(remote.into(), rx);
        tx
    }

    /// Whether a source for `remote` is waiting to be claimed
    pub fn is_registered(&self, remote: &str) -> bool {
        self.sources.contains_key(remote)
    }

    /// Claim the source for `remote`; each source is served by one proxy
    pub(crate) fn take(&self, remote: &str) -> Option<mpsc::Receiver<BoxedStream>> {
        self.sources.remove(remote).map(|(_, rx)| rx)
    }
}
