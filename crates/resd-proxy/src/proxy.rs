//! Capture proxy server.
//!
//! Listens for explicit-proxy clients, tunnels or terminates CONNECT
//! requests per the intercept policy, and feeds qualifying responses to the
//! extractor.

use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::rustls::{ClientConfig, RootCertStore};
use hudsucker::{Body, Proxy};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use resd_core::{ResdConfig, Timeouts};
use tokio::sync::broadcast;

use crate::ca::{CaManager, HandshakeAuthority};
use crate::connect::server_builder;
use crate::error::{ProxyError, Result};
use crate::extractor::Extractor;
use crate::handler::CaptureHandler;
use crate::policy::InterceptPolicy;
use crate::DEFAULT_PROXY_PORT;

/// Client used to forward intercepted requests.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Builds the forwarding client with the configured connect deadline.
///
/// Upstream certificates are checked against `roots`, or the platform trust
/// store when none are given.
pub fn upstream_client(timeouts: &Timeouts, roots: Option<RootCertStore>) -> Result<UpstreamClient> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(timeouts.connect()));

    let builder = hyper_rustls::HttpsConnectorBuilder::new();
    let builder = match roots {
        Some(roots) => {
            let tls = ClientConfig::builder_with_provider(Arc::new(default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| ProxyError::Tls(e.to_string()))?
                .with_root_certificates(roots)
                .with_no_client_auth();
            builder.with_tls_config(tls)
        }
        None => builder
            .with_provider_and_native_roots(default_provider())
            .map_err(|e| ProxyError::Tls(e.to_string()))?,
    };
    let https = builder.https_or_http().enable_http1().wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// Proxy server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Network deadlines.
    pub timeouts: Timeouts,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            timeouts: Timeouts::default(),
        }
    }
}

impl ProxyConfig {
    /// Derives the listen address and deadlines from configuration.
    pub fn from_config(config: &ResdConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ProxyError::Proxy(format!("invalid listen address: {}", e)))?;
        Ok(Self {
            addr,
            timeouts: config.timeouts,
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }
}

/// The capture proxy.
#[derive(Debug)]
pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CaManager>,
    extractor: Arc<Extractor>,
    policy: Arc<InterceptPolicy>,
    upstream_roots: Option<RootCertStore>,
}

impl ProxyServer {
    /// Creates a proxy server.
    pub fn new(
        config: ProxyConfig,
        ca: Arc<CaManager>,
        extractor: Arc<Extractor>,
        policy: Arc<InterceptPolicy>,
    ) -> Self {
        if !ca.is_available() {
            tracing::warn!(
                "No usable root CA in {:?}; intercepted connections will be refused",
                ca.cert_path().parent()
            );
        }
        Self {
            config,
            ca,
            extractor,
            policy,
            upstream_roots: None,
        }
    }

    /// Trusts only `roots` for upstream TLS instead of the platform store.
    pub fn with_upstream_roots(mut self, roots: RootCertStore) -> Self {
        self.upstream_roots = Some(roots);
        self
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> std::path::PathBuf {
        self.ca.cert_path()
    }

    /// The intercept policy, for runtime updates.
    pub fn policy(&self) -> &Arc<InterceptPolicy> {
        &self.policy
    }

    fn parts(&self) -> Result<(HandshakeAuthority, CaptureHandler)> {
        let authority = HandshakeAuthority::new(Arc::clone(&self.ca))?;
        let handler = CaptureHandler::new(
            Arc::clone(&self.extractor),
            Arc::clone(&self.policy),
            authority.clone(),
            upstream_client(&self.config.timeouts, self.upstream_roots.clone())?,
            self.config.timeouts,
        );
        Ok((authority, handler))
    }

    /// Starts the proxy server.
    ///
    /// This will block until the server is shut down.
    pub async fn run(self) -> Result<()> {
        let (authority, handler) = self.parts()?;
        let proxy = Proxy::builder()
            .with_addr(self.config.addr)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .with_server(server_builder(&self.config.timeouts))
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Starting capture proxy on {}", self.config.addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        proxy
            .start()
            .await
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        tracing::info!("Proxy server stopped");
        Ok(())
    }

    /// Starts the proxy server in the background.
    ///
    /// The listener is bound before returning, so a port of 0 is resolved
    /// to a free one and an occupied port is reported here. Returns a
    /// handle that can be used to stop the server.
    pub fn start(self) -> Result<ProxyHandle> {
        let listener = std::net::TcpListener::bind(self.config.addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let (authority, handler) = self.parts()?;
        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .with_server(server_builder(&self.config.timeouts))
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tracing::info!("Starting capture proxy on {}", addr);
        tracing::info!("CA certificate: {:?}", self.ca_cert_path());

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
