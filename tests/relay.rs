use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BufMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_native_tls::native_tls;

use dawnrelay::handler::HandlerResult;
use dawnrelay::network::{ClientError, CloseReason, Connection};
use dawnrelay::protocol::{encode_frame, tags, DEFAULT_MAX_PAYLOAD_SIZE};
use dawnrelay::{
    Client, Frame, Handler, HandlerError, HandlerRegistry, NetworkConfig, Server, ServerEvent,
};

fn local_config() -> NetworkConfig {
    NetworkConfig::new(0).with_bind_address("127.0.0.1")
}

/// Client settings that give up quickly when nothing arrives
fn impatient_config() -> NetworkConfig {
    let mut config = local_config();
    config.connect_timeout_ms = 300;
    config
}

async fn start(config: NetworkConfig, registry: HandlerRegistry) -> (Server, SocketAddr) {
    let mut server = Server::new(config, registry);
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn next_close_reason(events: &mut mpsc::Receiver<ServerEvent>) -> CloseReason {
    loop {
        match events.recv().await.unwrap() {
            ServerEvent::SessionClosed { reason, .. } => return reason,
            _ => continue,
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Never finishes handling a frame
struct Stall;

#[async_trait]
impl Handler for Stall {
    async fn handle(&self, _frame: Frame) -> HandlerResult {
        std::future::pending().await
    }
}

#[tokio::test]
async fn greeting_precedes_echo() {
    let (mut server, addr) = start(local_config(), HandlerRegistry::new()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let sent = Frame::new(1, &b"hello"[..]);
    // Send before reading anything; the greeting must still come first
    stream.write_all(&encode_frame(&sent).unwrap()).await.unwrap();

    let greeting = encode_frame(&Frame::greeting(&b"cheese"[..])).unwrap();
    let echo = encode_frame(&sent).unwrap();
    let mut received = vec![0u8; greeting.len() + echo.len()];
    stream.read_exact(&mut received).await.unwrap();

    assert_eq!(&received[..greeting.len()], &greeting[..]);
    assert_eq!(&received[greeting.len()..], &echo[..]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn echo_returns_exactly_one_identical_frame() {
    let (mut server, addr) = start(local_config(), HandlerRegistry::new()).await;
    let mut client = Client::connect(addr, &impatient_config()).await.unwrap();

    for frame in [
        Frame::new(tags::HANDSHAKE, &b"h"[..]),
        Frame::new(tags::PROTOBUF, vec![0u8, 255, 1]),
        Frame::empty(200),
    ] {
        assert_eq!(client.request(&frame).await.unwrap(), frame);
    }

    // Nothing else is pending
    assert!(matches!(client.recv().await, Err(ClientError::Timeout)));

    client.disconnect().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn split_writes_yield_one_frame() {
    let (mut server, addr) = start(local_config(), HandlerRegistry::new()).await;
    let mut client = Client::connect(addr, &impatient_config()).await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.set_nodelay(true).unwrap();
    let frame = Frame::new(tags::FILE, &b"print('Hello World!')"[..]);
    let wire = encode_frame(&frame).unwrap();

    let mut greeting = vec![0u8; 4 + 1 + 6];
    raw.read_exact(&mut greeting).await.unwrap();

    for chunk in wire.chunks(3) {
        raw.write_all(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut echoed = vec![0u8; wire.len()];
    raw.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed[..], &wire[..]);

    // The other connection saw none of it
    let quiet = client.recv().await;
    assert!(matches!(quiet, Err(ClientError::Timeout)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_frame_closes_without_invoking_handler() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(1, |_frame| panic!("handler must not run"));

    let mut server = Server::new(local_config().with_max_payload_size(8), registry);
    let mut events = server.take_event_receiver().unwrap();
    let addr = server.start().await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut greeting = vec![0u8; 11];
    raw.read_exact(&mut greeting).await.unwrap();

    let mut header = bytes::BytesMut::new();
    header.put_u32(1 + 9);
    header.put_u8(1);
    raw.write_all(&header).await.unwrap();

    // Server closes the connection; nothing comes back
    let mut rest = Vec::new();
    raw.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let reason = next_close_reason(&mut events).await;
    assert_eq!(reason, CloseReason::FrameTooLarge { declared: 9, max: 8 });

    server.stop().await.unwrap();
}

#[tokio::test]
async fn peer_leaving_after_header_is_transport_error() {
    let mut server = Server::new(local_config(), HandlerRegistry::new());
    let mut events = server.take_event_receiver().unwrap();
    let addr = server.start().await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let mut greeting = vec![0u8; 11];
    raw.read_exact(&mut greeting).await.unwrap();

    let mut header = bytes::BytesMut::new();
    header.put_u32(6);
    raw.write_all(&header).await.unwrap();
    raw.shutdown().await.unwrap();

    let reason = next_close_reason(&mut events).await;
    assert!(matches!(reason, CloseReason::Transport(_)), "got {:?}", reason);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let (mut server, addr) = start(local_config(), HandlerRegistry::new()).await;

    let mut a = Client::connect(addr, &local_config()).await.unwrap();
    let mut b = Client::connect(addr, &local_config()).await.unwrap();

    let frame_a = Frame::new(1, &b"A"[..]);
    let frame_b = Frame::new(1, &b"B"[..]);
    let (sent_a, sent_b) = tokio::join!(a.send(&frame_a), b.send(&frame_b));
    sent_a.unwrap();
    sent_b.unwrap();

    let (got_a, got_b) = tokio::join!(a.recv(), b.recv());
    assert_eq!(got_a.unwrap(), Some(frame_a));
    assert_eq!(got_b.unwrap(), Some(frame_b));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn many_clients_in_parallel() {
    let (mut server, addr) = start(local_config(), HandlerRegistry::new()).await;

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr, &local_config()).await.unwrap();
            for n in 0..10u8 {
                let frame = Frame::new(i, vec![i, n]);
                assert_eq!(client.request(&frame).await.unwrap(), frame);
            }
            client.disconnect().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn registered_handler_replaces_echo_for_its_tag() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(tags::FILE, |frame| {
        let len = frame.payload().len() as u32;
        Ok(vec![Frame::new(tags::FILE, len.to_be_bytes().to_vec())])
    });

    let (mut server, addr) = start(local_config(), registry).await;
    let mut client = Client::connect(addr, &local_config()).await.unwrap();

    let reply = client.request(&Frame::new(tags::FILE, &b"12345"[..])).await.unwrap();
    assert_eq!(reply.payload().as_ref(), &5u32.to_be_bytes());

    // Other tags still echo
    let other = Frame::new(tags::PROTOBUF, &b"x"[..]);
    assert_eq!(client.request(&other).await.unwrap(), other);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn handler_failure_closes_only_that_session() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn(66, |_frame| Err(HandlerError::failed("boom")));

    let (mut server, addr) = start(local_config(), registry).await;
    let mut failing = Client::connect(addr, &local_config()).await.unwrap();
    let mut healthy = Client::connect(addr, &local_config()).await.unwrap();

    failing.send(&Frame::empty(66)).await.unwrap();
    assert!(failing.recv().await.unwrap().is_none());

    let frame = Frame::new(2, &b"still here"[..]);
    assert_eq!(healthy.request(&frame).await.unwrap(), frame);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_live_sessions() {
    let config = local_config().with_shutdown_timeout_ms(2000);
    let (mut server, addr) = start(config, HandlerRegistry::new()).await;

    let mut client = Client::connect(addr, &local_config()).await.unwrap();
    let frame = Frame::new(3, &b"before stop"[..]);
    assert_eq!(client.request(&frame).await.unwrap(), frame);
    assert_eq!(server.active_sessions(), 1);

    server.stop().await.unwrap();
    assert!(!server.is_running().await);
    assert_eq!(server.active_sessions(), 0);

    assert!(client.recv().await.unwrap().is_none());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn stop_aborts_sessions_stuck_in_a_handler() {
    let mut registry = HandlerRegistry::new();
    registry.register(tags::PROTOBUF, Stall);

    let config = local_config().with_shutdown_timeout_ms(200);
    let (mut server, addr) = start(config, registry).await;

    let mut client = Client::connect(addr, &local_config()).await.unwrap();
    client.send(&Frame::new(tags::PROTOBUF, &b"stuck"[..])).await.unwrap();
    // Let the session pick the frame up and block in the handler
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.active_sessions(), 1);

    let started = Instant::now();
    server.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(200), "stopped after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "stopped after {:?}", elapsed);
    assert_eq!(server.active_sessions(), 0);
    assert!(client.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn tls_session_greets_and_echoes() {
    let config = local_config().with_tls(fixture("cert.pem"), fixture("key.pem"));
    let (mut server, addr) = start(config, HandlerRegistry::new()).await;

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let tcp = TcpStream::connect(addr).await.unwrap();
    let stream = connector.connect("localhost", tcp).await.unwrap();
    let mut conn = Connection::new(stream, addr, DEFAULT_MAX_PAYLOAD_SIZE);

    let greeting = conn.recv().await.unwrap().unwrap();
    assert_eq!(greeting, Frame::greeting(&b"cheese"[..]));

    let frame = Frame::new(tags::FILE, &b"over tls"[..]);
    conn.send(&frame).await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), Some(frame));

    conn.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn plaintext_client_fails_tls_handshake() {
    let config = local_config().with_tls(fixture("cert.pem"), fixture("key.pem"));
    let mut server = Server::new(config, HandlerRegistry::new());
    let mut events = server.take_event_receiver().unwrap();
    let addr = server.start().await.unwrap();

    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(&encode_frame(&Frame::empty(1)).unwrap()).await.unwrap();

    let reason = next_close_reason(&mut events).await;
    assert!(matches!(reason, CloseReason::Transport(_)), "got {:?}", reason);

    server.stop().await.unwrap();
}
