//! Intercepted HTTPS against a local TLS upstream.

use std::sync::Arc;
use std::time::Duration;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::rustls::pki_types::ServerName;
use hudsucker::rustls::{ClientConfig, RootCertStore};
use resd_core::{
    HttpFetcher, InterceptSettings, NullSink, ProviderSet, Registry, ResdConfig, ResourceStatus,
    ResourceType, Timeouts,
};
use resd_proxy::{
    CaManager, Extractor, ExtractorSettings, HandshakeAuthority, InterceptPolicy, ProxyConfig,
    ProxyHandle, ProxyServer,
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct Harness {
    registry: Arc<Registry>,
    handle: ProxyHandle,
}

fn start_proxy(ca: CaManager, timeouts: Timeouts, upstream_roots: Option<RootCertStore>) -> Harness {
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
    let proxy_config = ProxyConfig {
        timeouts,
        ..ProxyConfig::default().with_port(0)
    };
    let mut server = ProxyServer::new(
        proxy_config,
        Arc::new(ca),
        extractor,
        Arc::new(InterceptPolicy::new(&InterceptSettings::default())),
    );
    if let Some(roots) = upstream_roots {
        server = server.with_upstream_roots(roots);
    }
    Harness {
        registry,
        handle: server.start().unwrap(),
    }
}

fn roots_of(ca: &CaManager) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(ca.root_cert_der().unwrap()).unwrap();
    roots
}

fn tls_client(roots: RootCertStore) -> TlsConnector {
    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert_ne!(n, 0, "connection closed before end of head");
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Opens a CONNECT tunnel through the proxy.
async fn connect_through(proxy: &ProxyHandle, target: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let connect = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
    stream.write_all(connect.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    stream
}

#[tokio::test]
async fn https_media_is_intercepted_and_captured() {
    let dir = TempDir::new().unwrap();
    let mut body = vec![0xFF, 0xD8, 0xFF, 0xE0];
    body.extend(std::iter::repeat(0x24).take(8192));
    let served = body.clone();

    // A TLS origin whose certificate only the proxy's upstream client trusts.
    let origin_ca = Arc::new(CaManager::ensure(dir.path().join("origin-ca")).unwrap());
    let origin_roots = roots_of(&origin_ca);
    let origin_tls = HandshakeAuthority::new(origin_ca)
        .unwrap()
        .server_config("127.0.0.1")
        .await;
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = origin.accept().await.unwrap();
        let mut tls = TlsAcceptor::from(origin_tls).accept(socket).await.unwrap();
        let request = read_head(&mut tls).await;
        assert!(request.starts_with("GET /photos/cat.jpg "), "{request}");
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            served.len()
        );
        tls.write_all(head.as_bytes()).await.unwrap();
        tls.write_all(&served).await.unwrap();
        tls.shutdown().await.unwrap();
    });

    let proxy_ca = CaManager::ensure(dir.path().join("ca")).unwrap();
    let client_roots = roots_of(&proxy_ca);
    let harness = start_proxy(proxy_ca, Timeouts::default(), Some(origin_roots));

    let tunnel = connect_through(&harness.handle, &origin_addr.to_string()).await;
    let name = ServerName::try_from("127.0.0.1").unwrap();
    let mut tls = tls_client(client_roots).connect(name, tunnel).await.unwrap();
    let request = format!(
        "GET /photos/cat.jpg HTTP/1.1\r\nHost: {}\r\nReferer: https://app.test/\r\nConnection: close\r\n\r\n",
        origin_addr
    );
    tls.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    let mut received = vec![0u8; body.len()];
    tls.read_exact(&mut received).await.unwrap();
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
    assert_eq!(list[0].status, ResourceStatus::Captured);
    assert!(list[0].url.starts_with("https://127.0.0.1"), "{}", list[0].url);
    assert_eq!(
        list[0].headers.get("referer").map(String::as_str),
        Some("https://app.test/")
    );
    harness.handle.stop().await;
}

#[tokio::test]
async fn missing_root_refuses_handshake_without_tunneling() {
    let dir = TempDir::new().unwrap();
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let unavailable = CaManager::load(dir.path().join("empty"));
    assert!(!unavailable.is_available());
    let harness = start_proxy(unavailable, Timeouts::default(), None);

    // Any root will do: the proxy has no certificate to offer.
    let other = CaManager::ensure(dir.path().join("other")).unwrap();
    let tunnel = connect_through(&harness.handle, &origin_addr.to_string()).await;
    let name = ServerName::try_from("127.0.0.1").unwrap();
    assert!(tls_client(roots_of(&other)).connect(name, tunnel).await.is_err());

    let reached = tokio::time::timeout(Duration::from_millis(500), origin.accept()).await;
    assert!(reached.is_err(), "origin was contacted");
    assert!(harness.registry.is_empty());
    harness.handle.stop().await;
}

#[tokio::test]
async fn stalled_handshake_is_closed_at_deadline() {
    let dir = TempDir::new().unwrap();
    let timeouts = Timeouts {
        connect: 1,
        ..Timeouts::default()
    };
    let harness = start_proxy(
        CaManager::ensure(dir.path().join("ca")).unwrap(),
        timeouts,
        None,
    );

    let mut tunnel = connect_through(&harness.handle, "media.example.com:443").await;
    // A TLS record header, then nothing.
    tunnel.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

    let mut buf = [0u8; 64];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match tunnel.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection outlived the handshake deadline");
    harness.handle.stop().await;
}
