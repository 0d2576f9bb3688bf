//! End-to-end checks against a running proxy on loopback.

use std::sync::Arc;
use std::time::Duration;

use resd_core::{
    HttpFetcher, InterceptSettings, NullSink, ProviderSet, Registry, ResdConfig, ResourceType,
};
use resd_proxy::{
    CaManager, Extractor, ExtractorSettings, InterceptPolicy, ProxyConfig, ProxyHandle,
    ProxyServer,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Harness {
    registry: Arc<Registry>,
    handle: ProxyHandle,
    _dir: TempDir,
}

async fn start_proxy(intercept: InterceptSettings) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = ResdConfig::default();
    let registry = Arc::new(Registry::new(
        Default::default(),
        Arc::new(ProviderSet::with_defaults()),
        Arc::new(HttpFetcher::from_config(&config).unwrap()),
        Arc::new(NullSink),
    ));
    let extractor = Arc::new(Extractor::new(
        Arc::clone(&registry),
        ExtractorSettings::from_config(&config),
    ));
    let server = ProxyServer::new(
        ProxyConfig::default().with_port(0),
        Arc::new(CaManager::ensure(dir.path().join("ca")).unwrap()),
        extractor,
        Arc::new(InterceptPolicy::new(&intercept)),
    );
    let handle = server.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    Harness {
        registry,
        handle,
        _dir: dir,
    }
}

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed before end of head");
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[tokio::test]
async fn denied_host_is_tunneled_byte_for_byte() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut buf = [0u8; 13];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(b"\x00\x01raw-reply\xff").await.unwrap();
        buf
    });

    let harness = start_proxy(InterceptSettings {
        allow: Vec::new(),
        deny: vec!["127.0.0.1".into()],
    })
    .await;

    let mut client = TcpStream::connect(harness.handle.addr()).await.unwrap();
    let connect = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
        upstream_addr
    );
    client.write_all(connect.as_bytes()).await.unwrap();
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    // Not TLS: an intercepted connection could not carry this.
    client.write_all(b"\x16\x03not-a-hello").await.unwrap();
    let mut reply = [0u8; 12];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"\x00\x01raw-reply\xff");

    assert_eq!(&server.await.unwrap(), b"\x16\x03not-a-hello");
    assert!(harness.registry.is_empty());
    harness.handle.stop().await;
}

#[tokio::test]
async fn plain_http_media_is_relayed_and_captured() {
    let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
    body.extend(std::iter::repeat(0x42).take(4096));
    let served = body.clone();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            served.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&served).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let harness = start_proxy(InterceptSettings::default()).await;

    let mut client = TcpStream::connect(harness.handle.addr()).await.unwrap();
    let request = format!(
        "GET http://{0}/photos/cat.jpg HTTP/1.1\r\nHost: {0}\r\nReferer: http://app.test/\r\nConnection: close\r\n\r\n",
        upstream_addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    let mut received = vec![0u8; body.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, body);

    for _ in 0..100 {
        if !harness.registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let list = harness.registry.list();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].resource_type, ResourceType::Image);
    assert_eq!(list[0].size, Some(body.len() as u64));
    assert_eq!(
        list[0].headers.get("referer").map(String::as_str),
        Some("http://app.test/")
    );
    harness.handle.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let harness = start_proxy(InterceptSettings::default()).await;
    let mut client = TcpStream::connect(harness.handle.addr()).await.unwrap();
    let request = format!(
        "GET http://{0}/a.mp4 HTTP/1.1\r\nHost: {0}\r\nConnection: close\r\n\r\n",
        addr
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502"), "unexpected head: {head}");
    assert!(harness.registry.is_empty());
    harness.handle.stop().await;
}
