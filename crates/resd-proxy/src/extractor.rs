//! Resource extraction from intercepted exchanges.
//!
//! Response headers decide whether an exchange is a candidate; the body is
//! then observed as it streams to the client, keeping only a capped prefix.
//! The capture is recorded once the body has ended cleanly.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use resd_core::{replay_headers, Candidate, Exchange, MimeMap, ProviderSet, Registry, ResdConfig};

/// Capture settings, replaceable at runtime.
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub mime_map: MimeMap,
    /// Request headers stored for download replay, lowercased.
    pub replay_headers: Vec<String>,
    /// Body bytes kept per candidate.
    pub prefix_cap: usize,
}

impl ExtractorSettings {
    /// Derives the settings from configuration.
    pub fn from_config(config: &ResdConfig) -> Self {
        Self {
            mime_map: config.mime_map.clone(),
            replay_headers: config.replay_headers(),
            prefix_cap: config.capture_prefix_bytes.max(resd_core::signature::SIGNATURE_LEN),
        }
    }
}

/// Classifies exchanges and records confirmed captures in the registry.
#[derive(Debug)]
pub struct Extractor {
    providers: Arc<ProviderSet>,
    registry: Arc<Registry>,
    settings: RwLock<ExtractorSettings>,
}

impl Extractor {
    /// Creates an extractor feeding `registry`, using its provider rules.
    pub fn new(registry: Arc<Registry>, settings: ExtractorSettings) -> Self {
        Self {
            providers: Arc::clone(registry.providers()),
            registry,
            settings: RwLock::new(settings),
        }
    }

    /// Replaces the capture settings.
    pub fn update(&self, settings: ExtractorSettings) {
        *self.settings.write() = settings;
    }

    /// The registry captures go to.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Decides from response metadata whether to watch the body.
    ///
    /// `request_headers` are the client's request headers; the configured
    /// ones are kept for replay.
    pub fn inspect<'h, I>(
        self: &Arc<Self>,
        exchange: &Exchange<'_>,
        request_headers: I,
    ) -> Option<PendingCapture>
    where
        I: IntoIterator<Item = (&'h str, &'h str)>,
    {
        let settings = self.settings.read();
        let candidate = self.providers.classify(exchange, &settings.mime_map)?;
        tracing::debug!(
            "Candidate {} from {} ({})",
            candidate.resource_type,
            exchange.host,
            candidate.provider
        );

        Some(PendingCapture {
            extractor: Arc::clone(self),
            candidate,
            headers: replay_headers(&settings.replay_headers, request_headers),
            cap: settings.prefix_cap,
            keep_body: exchange.status == 200,
            prefix: Vec::new(),
            seen: 0,
        })
    }

    fn record(&self, capture: PendingCapture) {
        let PendingCapture {
            candidate,
            headers,
            cap,
            keep_body,
            prefix,
            seen,
            ..
        } = capture;

        if !self.providers.confirm(&candidate, &prefix) {
            tracing::debug!("Body of {} did not confirm, skipping", candidate.url);
            return;
        }

        let complete = seen <= cap as u64;
        let mut info = candidate.into_media();
        info.headers = headers;
        if info.size.is_none() && keep_body {
            info.size = Some(seen);
        }
        let body = (keep_body && complete).then_some(prefix);
        self.registry.capture(info, body);
    }
}

/// A candidate exchange whose body is being relayed.
///
/// Dropping it without [`complete`](Self::complete) records nothing, which
/// is what happens when the relay fails or the client goes away.
pub struct PendingCapture {
    extractor: Arc<Extractor>,
    candidate: Candidate,
    headers: BTreeMap<String, String>,
    cap: usize,
    keep_body: bool,
    prefix: Vec<u8>,
    seen: u64,
}

impl std::fmt::Debug for PendingCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCapture")
            .field("url", &self.candidate.url)
            .field("seen", &self.seen)
            .finish()
    }
}

impl PendingCapture {
    /// The candidate being watched.
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    /// Observes a relayed chunk.
    pub fn observe(&mut self, chunk: &[u8]) {
        self.seen += chunk.len() as u64;
        let room = self.cap.saturating_sub(self.prefix.len());
        if room > 0 {
            let take = room.min(chunk.len());
            self.prefix.extend_from_slice(&chunk[..take]);
        }
    }

    /// The body ended cleanly; confirm and record off the relay path.
    pub fn complete(self) {
        let extractor = Arc::clone(&self.extractor);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { extractor.record(self) });
            }
            Err(_) => extractor.record(self),
        }
    }
}
