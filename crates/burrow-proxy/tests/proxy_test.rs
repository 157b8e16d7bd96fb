//! End-to-end tests for the tunnel proxy over an in-process session

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_proto::{RemoteEndpoint, TUNNEL_CHANNEL_TYPE};
use burrow_proxy::{
    ConnectionInjector, ProxyContext, ProxyError, ProxyState, TargetDialer, TunnelProxy,
};
use burrow_transport::memory::MemorySession;
use burrow_transport::{fixed_session, OutOfBandRequest, SessionAccessor, TransportSession};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Span;

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Echo server that answers every connection until the test ends
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = conn.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

async fn roundtrip(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

async fn wait_closed(proxy: &TunnelProxy) {
    let mut state = proxy.subscribe_state();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ProxyState::Closed))
        .await
        .expect("proxy did not close")
        .unwrap();
}

async fn assert_dropped(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .expect("connection was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_forward_through_session() {
    init_tracing();
    let echo_port = echo_server().await;
    let (session, acceptor) = MemorySession::pair();
    let cancel = CancellationToken::new();
    let dialer = TargetDialer::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move { dialer.serve(acceptor, cancel).await }
    });

    let port = free_port();
    let endpoint: RemoteEndpoint = format!("127.0.0.1:{}:127.0.0.1:{}", port, echo_port)
        .parse()
        .unwrap();
    let proxy = TunnelProxy::new(&Span::current(), fixed_session(session.clone()), 0, endpoint);
    let ctx = ProxyContext::new(cancel.clone());
    proxy.start(&ctx).await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Listening);

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(roundtrip(&mut first, b"hello").await, b"hello");
    assert_eq!(roundtrip(&mut second, b"world!").await, b"world!");
    assert_eq!(session.channels_opened(), 2);

    cancel.cancel();
    wait_closed(&proxy).await;
}

#[tokio::test]
async fn test_absent_session_drops_connection_and_keeps_accepting() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let accessor: SessionAccessor = {
        let calls = calls.clone();
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        })
    };

    let port = free_port();
    let endpoint: RemoteEndpoint = format!("127.0.0.1:{}:example.com:80", port)
        .parse()
        .unwrap();
    let proxy = TunnelProxy::new(&Span::current(), accessor, 0, endpoint);
    let ctx = ProxyContext::default();
    proxy.start(&ctx).await.unwrap();

    for _ in 0..3 {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_dropped(&mut conn).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(proxy.state(), ProxyState::Listening);
    ctx.cancel();
}

#[tokio::test]
async fn test_session_returns_after_outage() {
    init_tracing();
    let echo_port = echo_server().await;
    let (session, acceptor) = MemorySession::pair();
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move { TargetDialer::new().serve(acceptor, cancel).await }
    });

    let current: Arc<Mutex<Option<Arc<dyn TransportSession>>>> = Arc::new(Mutex::new(None));
    let accessor: SessionAccessor = {
        let current = current.clone();
        Arc::new(move || current.lock().unwrap().clone())
    };

    let port = free_port();
    let endpoint: RemoteEndpoint = format!("127.0.0.1:{}:127.0.0.1:{}", port, echo_port)
        .parse()
        .unwrap();
    let proxy = TunnelProxy::new(&Span::current(), accessor, 0, endpoint);
    proxy.start(&ProxyContext::new(cancel.clone())).await.unwrap();

    let mut during_outage = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_dropped(&mut during_outage).await;

    *current.lock().unwrap() = Some(session.clone());
    let mut after = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_eq!(roundtrip(&mut after, b"back").await, b"back");

    cancel.cancel();
}

#[tokio::test]
async fn test_channel_open_failure_drops_connection() {
    init_tracing();
    let (session, mut acceptor) = MemorySession::pair();
    acceptor.close();

    let port = free_port();
    let endpoint: RemoteEndpoint = format!("127.0.0.1:{}:example.com:80", port)
        .parse()
        .unwrap();
    let proxy = TunnelProxy::new(&Span::current(), fixed_session(session), 0, endpoint);
    let ctx = ProxyContext::default();
    proxy.start(&ctx).await.unwrap();

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    assert_dropped(&mut conn).await;
    assert_eq!(proxy.state(), ProxyState::Listening);
    ctx.cancel();
}

#[tokio::test]
async fn test_channel_carries_remote_and_discards_requests() {
    init_tracing();
    let (session, mut acceptor) = MemorySession::pair();

    let port = free_port();
    let endpoint: RemoteEndpoint = format!("127.0.0.1:{}:db.internal:5432", port)
        .parse()
        .unwrap();
    let proxy = TunnelProxy::new(&Span::current(), fixed_session(session), 0, endpoint);
    let ctx = ProxyContext::default();
    proxy.start(&ctx).await.unwrap();

    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut channel = tokio::time::timeout(TIMEOUT, acceptor.accept())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(channel.channel_type, TUNNEL_CHANNEL_TYPE);
    assert_eq!(&channel.payload[..], b"db.internal:5432");

    let (request, answer) = OutOfBandRequest::with_reply("env", Bytes::from_static(b"x"));
    channel.requests.send(request).await.unwrap();
    assert!(!tokio::time::timeout(TIMEOUT, answer).await.unwrap().unwrap());

    // Relays in flight survive cancellation of the proxy.
    ctx.cancel();
    wait_closed(&proxy).await;

    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    channel.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    channel.stream.write_all(b"pong").await.unwrap();
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_restart_after_cancel_rebinds_same_address() {
    init_tracing();
    let port = free_port();
    let endpoint: RemoteEndpoint = format!("127.0.0.1:{}:example.com:80", port)
        .parse()
        .unwrap();

    let first = TunnelProxy::new(&Span::current(), Arc::new(|| None), 0, endpoint.clone());
    let ctx = ProxyContext::default();
    first.start(&ctx).await.unwrap();
    ctx.cancel();
    wait_closed(&first).await;

    let second = TunnelProxy::new(&Span::current(), Arc::new(|| None), 0, endpoint);
    let ctx = ProxyContext::default();
    second.start(&ctx).await.unwrap();
    assert_eq!(second.state(), ProxyState::Listening);
    ctx.cancel();
    wait_closed(&second).await;
}

#[tokio::test]
async fn test_forward_rules_do_not_share_a_port() {
    init_tracing();
    let port = free_port();
    let rule = format!("127.0.0.1:{}:example.com:80", port);

    let first = TunnelProxy::new(&Span::current(), Arc::new(|| None), 0, rule.parse().unwrap());
    let second = TunnelProxy::new(&Span::current(), Arc::new(|| None), 1, rule.parse().unwrap());
    let ctx = ProxyContext::default();

    first.start(&ctx).await.unwrap();
    let err = second.start(&ctx).await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }));
    assert_eq!(second.state(), ProxyState::Created);
    ctx.cancel();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[tokio::test]
async fn test_reverse_rules_share_a_port() {
    init_tracing();
    let port = free_port();
    let rule = format!("R:127.0.0.1:{}:example.com:80", port);

    let first = TunnelProxy::new(&Span::current(), Arc::new(|| None), 0, rule.parse().unwrap());
    let second = TunnelProxy::new(&Span::current(), Arc::new(|| None), 1, rule.parse().unwrap());
    let ctx = ProxyContext::default();

    first.start(&ctx).await.unwrap();
    second.start(&ctx).await.unwrap();
    assert_eq!(first.state(), ProxyState::Listening);
    assert_eq!(second.state(), ProxyState::Listening);

    ctx.cancel();
    wait_closed(&first).await;
    wait_closed(&second).await;
}

#[tokio::test]
async fn test_cancel_unblocks_idle_accept() {
    init_tracing();
    let endpoint: RemoteEndpoint = "127.0.0.1:0:example.com:80".parse().unwrap();
    let proxy = TunnelProxy::new(&Span::current(), Arc::new(|| None), 0, endpoint);
    let ctx = ProxyContext::default();
    proxy.start(&ctx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    ctx.cancel();
    wait_closed(&proxy).await;
}

#[tokio::test]
async fn test_injected_connections() {
    init_tracing();
    let echo_port = echo_server().await;
    let (session, acceptor) = MemorySession::pair();
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move { TargetDialer::new().serve(acceptor, cancel).await }
    });

    // The port is never bound in injected mode.
    let endpoint: RemoteEndpoint = format!("127.0.0.1:1:127.0.0.1:{}", echo_port)
        .parse()
        .unwrap();
    let injector = ConnectionInjector::new();
    let source = injector.register(endpoint.remote(), 4);

    let proxy = TunnelProxy::new(&Span::current(), fixed_session(session), 0, endpoint);
    let ctx = ProxyContext::new(cancel.clone()).with_injector(injector.clone());
    proxy.start(&ctx).await.unwrap();
    assert!(!injector.is_registered(&proxy.endpoint().remote()));

    let (mut client, embedded) = tokio::io::duplex(1024);
    source.send(Box::new(embedded)).await.ok().unwrap();

    client.write_all(b"injected").await.unwrap();
    let mut buf = [0u8; 8];
    tokio::time::timeout(TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"injected");

    cancel.cancel();
    wait_closed(&proxy).await;

    let (_client, late) = tokio::io::duplex(64);
    assert!(source.send(Box::new(late)).await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_listener() {
    init_tracing();
    let echo_port = echo_server().await;
    let (session, acceptor) = MemorySession::pair();
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move { TargetDialer::new().serve(acceptor, cancel).await }
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forward.sock");
    let endpoint: RemoteEndpoint = format!("unix://{}:127.0.0.1:{}", path.display(), echo_port)
        .parse()
        .unwrap();
    assert!(endpoint.listens_on_unix());

    let proxy = TunnelProxy::new(&Span::current(), fixed_session(session), 0, endpoint);
    proxy.start(&ProxyContext::new(cancel.clone())).await.unwrap();

    let mut conn = tokio::net::UnixStream::connect(&path).await.unwrap();
    conn.write_all(b"via unix").await.unwrap();
    let mut buf = [0u8; 8];
    tokio::time::timeout(TIMEOUT, conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"via unix");

    cancel.cancel();
    wait_closed(&proxy).await;
    assert!(!path.exists());
}
