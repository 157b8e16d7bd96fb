//! Tunnel proxy
//!
//! Binds the local side of one forwarding rule and, for every accepted
//! connection, opens a channel on the current transport session and relays
//! bytes until both ends are done.
//!
//! ```text
//! Created ──start()──▶ Starting ──bound──▶ Listening ──cancel / accept error──▶ Closed
//!    ▲                    │
//!    └──── bind error ────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use burrow_proto::{RemoteEndpoint, TUNNEL_CHANNEL_TYPE};
use burrow_transport::{discard_requests, BoxedStream, SessionAccessor};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, info_span, Instrument, Span};

use crate::inject::ConnectionInjector;
use crate::listener::Listener;
use crate::pipe::pipe;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{label}: {source}")]
    Bind {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}: already started")]
    AlreadyStarted(String),

    #[error("{0}: closed")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Starting,
    Listening,
    Closed,
}

/// Lifecycle of a started proxy
///
/// Cancelling the token closes the listener (or the injected source); relays
/// already in flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct ProxyContext {
    cancel: CancellationToken,
    injector: Option<ConnectionInjector>,
}

impl ProxyContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            injector: None,
        }
    }

    pub fn with_injector(mut self, injector: ConnectionInjector) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Per-proxy connection id generator
#[derive(Debug)]
pub struct ConnectionIds {
    next_id: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TunnelProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    id: usize,
    label: String,
    span: Span,
    session: SessionAccessor,
    endpoint: RemoteEndpoint,
    conn_ids: ConnectionIds,
    state: watch::Sender<ProxyState>,
}

impl TunnelProxy {
    /// `index` is zero-based; the proxy displays as `proxy#<index + 1>`
    pub fn new(
        logger: &Span,
        session: SessionAccessor,
        index: usize,
        endpoint: RemoteEndpoint,
    ) -> Self {
        let id = index + 1;
        let label = format!("proxy#{}:{}", id, endpoint);
        let span = info_span!(parent: logger, "proxy", %label);
        let (state, _) = watch::channel(ProxyState::Created);

        Self {
            inner: Arc::new(ProxyInner {
                id,
                label,
                span,
                session,
                endpoint,
                conn_ids: ConnectionIds::new(),
                state,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProxyState> {
        self.inner.state.subscribe()
    }

    /// Bind the local side and spawn the accept loop
    ///
    /// Returns as soon as the listener is bound. A bind failure, or dropping
    /// the returned future before it completes, leaves the proxy in
    /// [`ProxyState::Created`].
    pub async fn start(&self, ctx: &ProxyContext) -> Result<(), ProxyError> {
        let inner = &self.inner;

        let mut previous = ProxyState::Created;
        let claimed = inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == ProxyState::Created {
                *state = ProxyState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match previous {
                ProxyState::Closed => ProxyError::Closed(inner.label.clone()),
                _ => ProxyError::AlreadyStarted(inner.label.clone()),
            });
        }
        let starting = StartingGuard::new(&inner.state);

        let injected = ctx
            .injector
            .as_ref()
            .and_then(|injector| injector.take(&inner.endpoint.remote()));
        if let Some(source) = injected {
            starting.listening();
            tokio::spawn(
                inner
                    .clone()
                    .listen_injected(source, ctx.cancel.clone())
                    .instrument(inner.span.clone()),
            );
            return Ok(());
        }

        let listener = Listener::bind(&inner.endpoint)
            .await
            .map_err(|source| ProxyError::Bind {
                label: inner.label.clone(),
                source,
            })?;

        starting.listening();
        tokio::spawn(
            inner
                .clone()
                .listen(listener, ctx.cancel.clone())
                .instrument(inner.span.clone()),
        );
        Ok(())
    }
}

/// Holds a proxy in `Starting`; unless promoted to `Listening`, the state
/// goes back to `Created` on drop.
struct StartingGuard<'a> {
    state: &'a watch::Sender<ProxyState>,
    armed: bool,
}

impl<'a> StartingGuard<'a> {
    fn new(state: &'a watch::Sender<ProxyState>) -> Self {
        Self { state, armed: true }
    }

    fn listening(mut self) {
        self.armed = false;
        self.state.send_replace(ProxyState::Listening);
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(ProxyState::Created);
        }
    }
}

impl ProxyInner {
    async fn listen(self: Arc<Self>, listener: Listener, cancel: CancellationToken) {
        info!("Listening");
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Closed");
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok(src) => {
                        self.dispatch(src);
                    }
                    Err(e) => {
                        // An error caused by shutdown is not worth reporting.
                        if !cancel.is_cancelled() {
                            info!("Accept error: {}", e);
                        }
                        break;
                    }
                }
            }
        }
        drop(listener);
        self.state.send_replace(ProxyState::Closed);
    }

    async fn listen_injected(
        self: Arc<Self>,
        mut source: mpsc::Receiver<BoxedStream>,
        cancel: CancellationToken,
    ) {
        info!("Listening (injected)");
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    source.close();
                    info!("Closed");
                    break;
                }

                conn = source.recv() => match conn {
                    Some(src) => {
                        self.dispatch(src);
                    }
                    None => {
                        info!("Connection source closed");
                        break;
                    }
                }
            }
        }
        self.state.send_replace(ProxyState::Closed);
    }

    /// Hand a connection to its own relay task; returns the connection id
    fn dispatch(self: &Arc<Self>, src: BoxedStream) -> u64 {
        let cid = self.conn_ids.generate();
        let span = debug_span!(parent: &self.span, "conn", id = cid);
        tokio::spawn(self.clone().accept(src).instrument(span));
        cid
    }

    /// Relay one inbound connection; `src` is closed on every return path
    async fn accept(self: Arc<Self>, src: BoxedStream) {
        debug!("Open");

        let Some(session) = (self.session)() else {
            debug!("No remote connection");
            return;
        };

        let remote = self.endpoint.remote();
        let (dst, requests) = match session
            .open_channel(TUNNEL_CHANNEL_TYPE, remote.as_bytes())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                info!("Stream error: {}", e);
                return;
            }
        };
        tokio::spawn(discard_requests(requests).in_current_span());

        let (sent, received) = pipe(src, dst).await;
        debug!(sent, received, "Close");
    }
}
