//! Certificate Authority management for the capture proxy.
//!
//! Owns the root key pair and issues per-host leaf certificates on first use.
//! Leaves are cached for the life of the process; concurrent first requests
//! for one host share a single generation.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hudsucker::certificate_authority::CertificateAuthority;
use hudsucker::hyper::http::uri::Authority;
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use parking_lot::Mutex;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

pub use crate::error::CaError;
use crate::error::ProxyError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "resd-ca.crt";
const CA_KEY_FILENAME: &str = "resd-ca.key";

/// Root validity, in days.
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Leaf validity, in days. Stays under the 825-day ceiling some clients
/// enforce even for locally trusted roots.
const LEAF_VALIDITY_DAYS: i64 = 730;
/// Backdating applied to `not_before` for client clock skew.
const NOT_BEFORE_OFFSET_SECS: i64 = 60;

/// A host certificate issued by the root authority.
pub struct LeafCertificate {
    /// Host name the certificate was issued for (the cache key).
    pub host: String,
    /// Leaf certificate, DER.
    pub cert_der: CertificateDer<'static>,
    /// Leaf private key, PKCS#8 DER.
    pub key_der: PrivatePkcs8KeyDer<'static>,
    /// When the leaf was generated.
    pub issued_at: DateTime<Utc>,
    chain: Vec<CertificateDer<'static>>,
}

impl LeafCertificate {
    /// Certificate chain served to clients: `[leaf, root]`.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Private key in the form rustls takes it.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
}

type LeafSlot = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Manages the root CA and the per-host leaf cache.
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
    root: std::result::Result<RootAuthority, String>,
    leaves: Mutex<HashMap<String, LeafSlot>>,
    generated: AtomicUsize,
}

impl std::fmt::Debug for CaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaManager")
            .field("ca_dir", &self.ca_dir)
            .field("available", &self.is_available())
            .field("leaves", &self.leaves.lock().len())
            .finish()
    }
}

impl CaManager {
    /// Loads the root CA from `ca_dir`, generating and persisting one if
    /// none exists.
    ///
    /// A root that exists but cannot be read is an error; it is never
    /// replaced.
    pub fn ensure(ca_dir: impl AsRef<Path>) -> std::result::Result<Self, CaError> {
        let ca_dir = ca_dir.as_ref().to_path_buf();
        let cert_path = ca_dir.join(CA_CERT_FILENAME);
        let key_path = ca_dir.join(CA_KEY_FILENAME);

        if !cert_path.exists() && !key_path.exists() {
            generate_root(&ca_dir)?;
        }
        let root = load_root(&cert_path, &key_path)?;
        Ok(Self::with_root(ca_dir, Ok(root)))
    }

    /// Loads the root CA without ever generating one.
    ///
    /// A missing or corrupt root leaves the manager unavailable: every
    /// [`leaf_for`](Self::leaf_for) call fails with [`CaError::Unavailable`].
    pub fn load(ca_dir: impl AsRef<Path>) -> Self {
        let ca_dir = ca_dir.as_ref().to_path_buf();
        let root = load_root(&ca_dir.join(CA_CERT_FILENAME), &ca_dir.join(CA_KEY_FILENAME))
            .map_err(|e| e.to_string());
        if let Err(reason) = &root {
            tracing::warn!("Root CA unavailable in {:?}: {}", ca_dir, reason);
        }
        Self::with_root(ca_dir, root)
    }

    /// Default CA directory under the platform data dir.
    pub fn default_dir() -> std::result::Result<PathBuf, CaError> {
        let project_dirs = resd_core::config::project_dirs()
            .map_err(|e| CaError::Unavailable(e.to_string()))?;
        Ok(project_dirs.data_dir().join("ca"))
    }

    fn with_root(ca_dir: PathBuf, root: std::result::Result<RootAuthority, String>) -> Self {
        Self {
            ca_dir,
            root,
            leaves: Mutex::new(HashMap::new()),
            generated: AtomicUsize::new(0),
        }
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Returns true if leaves can be issued.
    pub fn is_available(&self) -> bool {
        self.root.is_ok()
    }

    fn root(&self) -> std::result::Result<&RootAuthority, CaError> {
        self.root
            .as_ref()
            .map_err(|reason| CaError::Unavailable(reason.clone()))
    }

    /// Root certificate, DER, for trust-store installation.
    pub fn root_cert_der(&self) -> std::result::Result<CertificateDer<'static>, CaError> {
        Ok(self.root()?.cert_der.clone())
    }

    /// Root certificate, PEM, for trust-store installation.
    pub fn root_cert_pem(&self) -> std::result::Result<String, CaError> {
        Ok(self.root()?.cert_pem.clone())
    }

    /// Writes the root certificate PEM to `path`.
    pub fn export_root(&self, path: &Path) -> std::result::Result<(), CaError> {
        let pem = self.root_cert_pem()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, pem)?;
        Ok(())
    }

    /// Number of leaves generated so far.
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    /// Returns the leaf for `host`, generating it on first use.
    ///
    /// Concurrent callers for the same host wait on one generation and all
    /// receive the same certificate. A failed generation is not cached.
    pub async fn leaf_for(&self, host: &str) -> std::result::Result<Arc<LeafCertificate>, CaError> {
        let root = self.root()?;
        let host = normalize_host(host)?;

        let slot = {
            let mut leaves = self.leaves.lock();
            leaves.entry(host.clone()).or_default().clone()
        };

        let leaf = slot
            .get_or_try_init(|| async {
                let leaf = issue_leaf(root, &host)?;
                self.generated.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Issued leaf certificate for {}", host);
                Ok::<_, CaError>(Arc::new(leaf))
            })
            .await?;
        Ok(Arc::clone(leaf))
    }
}

fn normalize_host(host: &str) -> std::result::Result<String, CaError> {
    let host = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if host.is_empty() {
        return Err(CaError::InvalidHost("empty host".into()));
    }
    Ok(host)
}

fn root_params() -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Resd Root CA");
    dn.push(DnType::OrganizationName, "Resd");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);
    params
}

fn generate_root(ca_dir: &Path) -> std::result::Result<(), CaError> {
    fs::create_dir_all(ca_dir)?;

    let key_pair = KeyPair::generate()?;
    let cert = root_params().self_signed(&key_pair)?;

    fs::write(ca_dir.join(CA_CERT_FILENAME), cert.pem())?;
    fs::write(ca_dir.join(CA_KEY_FILENAME), key_pair.serialize_pem())?;

    tracing::info!("Generated new root CA in {:?}", ca_dir);
    Ok(())
}

fn load_root(cert_path: &Path, key_path: &Path) -> std::result::Result<RootAuthority, CaError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;

    let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .ok_or_else(|| CaError::Parse("no certificate in PEM".into()))?
        .map_err(|e| CaError::Parse(e.to_string()))?;

    // The key must belong to the certificate, otherwise every leaf would
    // fail validation against the installed root.
    let public_key = key_pair.subject_public_key_info();
    if !cert_der
        .as_ref()
        .windows(public_key.len())
        .any(|w| w == public_key.as_slice())
    {
        return Err(CaError::Parse("CA key does not match certificate".into()));
    }

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
        .map_err(|e| CaError::Parse(e.to_string()))?;

    Ok(RootAuthority {
        issuer,
        cert_der,
        cert_pem,
    })
}

fn issue_leaf(root: &RootAuthority, host: &str) -> std::result::Result<LeafCertificate, CaError> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SanType::IpAddress(ip)],
        Err(_) => vec![SanType::DnsName(
            host.try_into()
                .map_err(|_| CaError::InvalidHost(host.to_string()))?,
        )],
    };
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, &root.issuer)?;
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok(LeafCertificate {
        host: host.to_string(),
        chain: vec![cert_der.clone(), root.cert_der.clone()],
        cert_der,
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        issued_at: Utc::now(),
    })
}

/// Serves no certificate, so the client handshake fails.
#[derive(Debug)]
struct RefuseHandshake;

impl ResolvesServerCert for RefuseHandshake {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// Bridges the [`CaManager`] into the TLS handshake of intercepted
/// connections.
///
/// When no leaf can be issued the connection gets a configuration that
/// aborts the handshake; it is never tunneled in the clear instead.
#[derive(Clone)]
pub struct HandshakeAuthority {
    ca: Arc<CaManager>,
    configs: Arc<Mutex<HashMap<String, Arc<ServerConfig>>>>,
    refuse: Arc<ServerConfig>,
}

impl std::fmt::Debug for HandshakeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeAuthority")
            .field("ca", &self.ca)
            .finish()
    }
}

impl HandshakeAuthority {
    /// Creates the authority.
    pub fn new(ca: Arc<CaManager>) -> std::result::Result<Self, CaError> {
        let refuse = server_config_builder()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(RefuseHandshake));
        Ok(Self {
            ca,
            configs: Arc::new(Mutex::new(HashMap::new())),
            refuse: Arc::new(refuse),
        })
    }

    /// The underlying CA manager.
    pub fn ca(&self) -> &Arc<CaManager> {
        &self.ca
    }

    /// Builds (or reuses) the server config for `host`.
    pub async fn server_config(&self, host: &str) -> Arc<ServerConfig> {
        if let Some(config) = self.configs.lock().get(host) {
            return Arc::clone(config);
        }

        match self.build_config(host).await {
            Ok(config) => {
                let config = Arc::new(config);
                self.configs
                    .lock()
                    .entry(host.to_string())
                    .or_insert(config)
                    .clone()
            }
            Err(e) => {
                let error = ProxyError::Handshake {
                    host: host.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!("Refusing connection: {}", error);
                Arc::clone(&self.refuse)
            }
        }
    }

    async fn build_config(&self, host: &str) -> std::result::Result<ServerConfig, CaError> {
        let leaf = self.ca.leaf_for(host).await?;
        let mut config = server_config_builder()?
            .with_no_client_auth()
            .with_single_cert(leaf.chain().to_vec(), leaf.private_key())
            .map_err(|e| CaError::Generation(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

fn server_config_builder(
) -> std::result::Result<rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier>, CaError> {
    ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| CaError::Generation(e.to_string()))
}

impl CertificateAuthority for HandshakeAuthority {
    fn gen_server_config(
        &self,
        authority: &Authority,
    ) -> impl Future<Output = Arc<ServerConfig>> + Send {
        let host = authority.host().to_string();
        let this = self.clone();
        async move { this.server_config(&host).await }
    }
}
