#![allow(clippy::unwrap_used)]

//! End-to-end tests against real sockets: one proxy instance, one fake
//! authorization service and, where relevant, one fake upstream per test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rdproxy::ProxyState;
use rdproxy::config::{Conf, DEFAULT_MAX_CONNECTION_REQUEST_SIZE, VerbosityProfile};
use rdproxy::engine::{NoEngine, RdpEngine};
use rdproxy::listener::ProxyListener;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const NEGO: &[u8] = &[0x01, 0x00, 0x08, 0x00, 0x0B, 0x00, 0x00, 0x00];

fn cr_segment(variable_part: &[u8]) -> Vec<u8> {
    let tpkt_len = u16::try_from(x224_proto::FIXED_PART_LEN + variable_part.len()).unwrap();
    let mut buf = vec![
        0x03, 0x00, 0x00, 0x00, 0x00, 0xE0, 0x00, 0x00, 0x34, 0x12, 0x00,
    ];
    buf[2..4].copy_from_slice(&tpkt_len.to_be_bytes());
    buf[4] = u8::try_from(tpkt_len - 5).unwrap();
    buf.extend_from_slice(variable_part);
    buf
}

fn redirect_segment() -> Vec<u8> {
    let mut variable_part = b"Cookie: msts=ABCDEF1234\r\n".to_vec();
    variable_part.extend_from_slice(NEGO);
    cr_segment(&variable_part)
}

fn test_conf(authorization_addr: SocketAddr, strip_cookie_on_forward: bool) -> Arc<Conf> {
    Arc::new(Conf {
        listen: "127.0.0.1:0".parse().unwrap(),
        authorization_url: format!("http://{authorization_addr}/authorize").parse().unwrap(),
        max_connection_request_size: DEFAULT_MAX_CONNECTION_REQUEST_SIZE,
        strip_cookie_on_forward,
        worker_threads: None,
        log_file: None,
        verbosity_profile: VerbosityProfile::Default,
        log_directive: None,
    })
}

fn start_proxy(conf: Arc<Conf>, engine: Arc<dyn RdpEngine>) -> SocketAddr {
    let state = ProxyState::new(conf, engine);
    let listener = ProxyListener::init_and_bind(state).unwrap();
    let addr = listener.addr();
    tokio::spawn(async move {
        let _ = listener.run().await;
    });
    addr
}

/// Minimal HTTP/1.1 responder standing in for the authorization service:
/// reads one POST, answers with `body`, counts the hits.
async fn spawn_authorization_service(body: String) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            task_hits.fetch_add(1, Ordering::SeqCst);

            let body = body.clone();
            tokio::spawn(async move {
                read_http_request(&mut stream).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, hits)
}

async fn read_http_request(stream: &mut TcpStream) {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        data.extend_from_slice(&buf[..n]);

        let Some(head_end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };

        let head = String::from_utf8_lossy(&data[..head_end]);
        let content_length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);

        if data.len() >= head_end + 4 + content_length {
            return;
        }
    }
}

fn ok_body(port: u16) -> String {
    format!(r#"{{"status":"ok","ip":"127.0.0.1","port":{port},"username":"alice"}}"#)
}

/// Engine double capturing the handed-over socket.
struct ChannelEngine(mpsc::UnboundedSender<(TcpStream, SocketAddr)>);

#[async_trait::async_trait]
impl RdpEngine for ChannelEngine {
    async fn take_over(&self, stream: TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        self.0
            .send((stream, peer_addr))
            .map_err(|_| anyhow::anyhow!("engine receiver gone"))?;
        Ok(())
    }
}

async fn expect_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let read = client.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)), "connection should be closed, got {read:?}");
}

#[tokio::test]
async fn redirect_end_to_end() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let (authorization_addr, hits) = spawn_authorization_service(ok_body(upstream_port)).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let pdu = redirect_segment();
    client.write_all(&pdu).await.unwrap();

    let (mut upstream, _) = upstream_listener.accept().await.unwrap();

    // The originally-transmitted bytes, cookie included, reach the upstream.
    let mut got = vec![0u8; pdu.len()];
    upstream.read_exact(&mut got).await.unwrap();
    assert_eq!(got, pdu);

    client.write_all(b"from-client").await.unwrap();
    let mut got = [0u8; 11];
    upstream.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"from-client");

    upstream.write_all(b"from-upstream").await.unwrap();
    let mut got = [0u8; 13];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"from-upstream");

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_eof_tears_the_whole_session_down() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let (authorization_addr, _hits) = spawn_authorization_service(ok_body(upstream_port)).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let pdu = redirect_segment();
    client.write_all(&pdu).await.unwrap();

    let (mut upstream, _) = upstream_listener.accept().await.unwrap();
    let mut got = vec![0u8; pdu.len()];
    upstream.read_exact(&mut got).await.unwrap();

    // Upstream goes away; the client side must observe the closure.
    drop(upstream);
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn strip_cookie_forwards_the_rewritten_request() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let (authorization_addr, _hits) = spawn_authorization_service(ok_body(upstream_port)).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, true), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let pdu = redirect_segment();
    client.write_all(&pdu).await.unwrap();
    client.write_all(b"tail").await.unwrap();

    let (_, cookie_end) = x224_proto::find_cookie(&pdu).unwrap();
    let rewritten = x224_proto::strip_cookie(&pdu, cookie_end).unwrap();

    let (mut upstream, _) = upstream_listener.accept().await.unwrap();
    let mut got = vec![0u8; rewritten.len() + 4];
    upstream.read_exact(&mut got).await.unwrap();

    assert_eq!(&got[..rewritten.len()], rewritten.as_slice());
    assert_eq!(&got[rewritten.len()..], b"tail");
}

#[tokio::test]
async fn no_cookie_is_handed_to_the_engine_with_bytes_intact() {
    let (authorization_addr, hits) = spawn_authorization_service(ok_body(1)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(ChannelEngine(tx)));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    let pdu = cr_segment(NEGO);
    client.write_all(&pdu).await.unwrap();

    let (mut handed, _peer) = rx.recv().await.unwrap();

    let mut replay = vec![0u8; pdu.len()];
    handed.read_exact(&mut replay).await.unwrap();
    assert_eq!(replay, pdu);

    // No authorization round trip happened for a non-redirected connection.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_segments_fail_closed() {
    let (authorization_addr, hits) = spawn_authorization_service(ok_body(1)).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    // Version byte, TPDU code, destination reference, class/option bits.
    for (offset, value) in [(0usize, 0x13u8), (5, 0xD0), (6, 0x01), (10, 0x80)] {
        let mut pdu = redirect_segment();
        pdu[offset] = value;

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&pdu).await.unwrap();
        expect_closed(&mut client).await;
    }

    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn oversized_segment_fails_closed() {
    let (authorization_addr, hits) = spawn_authorization_service(ok_body(1)).await;

    let mut conf = (*test_conf(authorization_addr, false)).clone();
    conf.max_connection_request_size = 16;
    let proxy_addr = start_proxy(Arc::new(conf), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&redirect_segment()).await.unwrap();
    expect_closed(&mut client).await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn denied_token_fails_closed_without_upstream_connect() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();
    let upstream_contacted = Arc::new(AtomicBool::new(false));

    let contacted = Arc::clone(&upstream_contacted);
    tokio::spawn(async move {
        if upstream_listener.accept().await.is_ok() {
            contacted.store(true, Ordering::SeqCst);
        }
    });

    let body = format!(r#"{{"status":"denied","ip":"127.0.0.1","port":{upstream_port}}}"#);
    let (authorization_addr, hits) = spawn_authorization_service(body).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&redirect_segment()).await.unwrap();
    expect_closed(&mut client).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!upstream_contacted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn unparsable_authorization_response_fails_closed() {
    let (authorization_addr, hits) = spawn_authorization_service("not json at all".to_owned()).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&redirect_segment()).await.unwrap();
    expect_closed(&mut client).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn ok_response_missing_port_fails_closed() {
    let body = r#"{"status":"ok","ip":"127.0.0.1"}"#.to_owned();
    let (authorization_addr, _hits) = spawn_authorization_service(body).await;
    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&redirect_segment()).await.unwrap();
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn unreachable_authorization_service_fails_closed() {
    // Bind then drop, so the port is (almost surely) refusing connections.
    let throwaway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let authorization_addr = throwaway.local_addr().unwrap();
    drop(throwaway);

    let proxy_addr = start_proxy(test_conf(authorization_addr, false), Arc::new(NoEngine));

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(&redirect_segment()).await.unwrap();
    expect_closed(&mut client).await;
}
