//! Resd Core - media model, decode engine and resource registry.
//!
//! This crate holds everything behind the capture proxy that does not touch
//! the network stack directly:
//!
//! - [`media`]: captured resource records, types, status and fingerprints
//! - [`signature`]: magic-byte detection of standard media formats
//! - [`decode`]: streamable, provider-keyed byte transforms
//! - [`provider`]: pluggable rules deciding what qualifies and how to decode it
//! - [`registry`]: the concurrent store that dedups captures and runs downloads
//! - [`events`]: bounded publish/subscribe fan-out of registry changes
//! - [`fetch`]: the download seam (reqwest-backed by default)
//! - [`config`]: persisted user configuration
//!
//! ## Flow
//!
//! ```text
//! proxy exchange → ProviderSet::classify → Registry::capture → EventSink
//!                                               │
//!                              Registry::download (spawned)
//!                                               │
//!                        fetch / captured bytes → StreamDecoder → save dir
//! ```

pub mod config;
pub mod decode;
pub mod events;
pub mod fetch;
pub mod media;
pub mod provider;
pub mod registry;
pub mod signature;

pub use config::{ConfigError, InterceptSettings, MimeEntry, MimeMap, ResdConfig, Timeouts};
pub use decode::{decode, decode_local_file, DecodeError, StreamDecoder, Transform};
pub use events::{EventHub, EventSink, NullSink, ResourceEvent};
pub use fetch::{FetchBody, FetchError, FetchRequest, HttpFetcher, ResourceFetcher};
pub use media::{fingerprint, MediaInfo, NamingOptions, ResourceStatus, ResourceType};
pub use provider::{Candidate, Exchange, ProviderRule, ProviderSet};
pub use registry::{replay_headers, CaptureOutcome, Registry, RegistryError, RegistrySettings};
pub use signature::{detect_format, MediaFormat};
