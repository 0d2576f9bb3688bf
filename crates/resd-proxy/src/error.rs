//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The client side of an intercepted connection failed its handshake.
    #[error("handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    /// The real host could not be reached or did not answer in time.
    #[error("upstream {host} unreachable: {reason}")]
    UpstreamUnreachable { host: String, reason: String },

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// Certificate authority error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// The root authority is missing or unreadable.
    #[error("root certificate authority unavailable: {0}")]
    Unavailable(String),

    /// Failed to generate a certificate or key.
    #[error("failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read or write CA files.
    #[error("CA file error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse stored CA material.
    #[error("failed to parse CA: {0}")]
    Parse(String),

    /// The host name cannot be put in a certificate.
    #[error("invalid host name: {0}")]
    InvalidHost(String),
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        CaError::Generation(e.to_string())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
