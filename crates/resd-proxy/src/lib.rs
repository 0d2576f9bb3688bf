//! Resd Proxy - TLS-intercepting capture proxy.
//!
//! This crate runs an explicit HTTP(S) proxy that terminates TLS for hosts the
//! intercept policy admits, relays every response unchanged, and hands
//! qualifying media responses to the resource registry.
//!
//! ## Features
//!
//! - Generates the root CA on first run and exports it for installation
//! - Issues per-host leaf certificates on demand, one issuance per host
//! - Tunnels hosts outside the intercept policy without terminating TLS
//! - Bounds the client handshake and upstream connect with the connect deadline
//! - Streams response bodies back without buffering them
//! - Captures media once the response body has ended cleanly
//!
//! ## Architecture
//!
//! ```text
//! Client → Proxy → CONNECT? ──────────────┐
//!            │                            │
//!            │ plain HTTP       Intercept policy
//!            │                  ┌─────────┴─────────┐
//!            │                  │ deny              │ allow
//!            │                  ▼                   ▼
//!            │             Raw tunnel        TLS with leaf cert
//!            │                                      │
//!            └──────────────────────┬───────────────┘
//!                                   ▼
//!                        Forward upstream (deadlines)
//!                                   │
//!                                   ▼
//!                     Relay body ──tap──→ Extractor → Registry
//! ```

mod ca;
mod connect;
mod error;
mod extractor;
mod handler;
mod policy;
mod proxy;
mod relay;

pub use ca::{CaManager, HandshakeAuthority, LeafCertificate};
pub use error::{CaError, ProxyError, Result};
pub use extractor::{Extractor, ExtractorSettings, PendingCapture};
pub use handler::CaptureHandler;
pub use policy::{HostPattern, InterceptPolicy};
pub use proxy::{upstream_client, ProxyConfig, ProxyHandle, ProxyServer, UpstreamClient};
pub use relay::RelayStream;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8899;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_matches_config_default() {
        assert_eq!(DEFAULT_PROXY_PORT, resd_core::ResdConfig::default().port);
    }
}
