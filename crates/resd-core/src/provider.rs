//! Pluggable capture and decode rules.
//!
//! A [`ProviderRule`] answers two questions about an intercepted exchange:
//! does it carry a resource worth capturing, and how are that resource's bytes
//! decoded. Rules are registered in a [`ProviderSet`] and consulted in
//! registration order, so provider-specific rules go before the generic one.

use std::sync::Arc;

use crate::config::MimeMap;
use crate::decode::{DecodeError, Identity, Transform, XorByte, XorPrefix};
use crate::media::{fingerprint, MediaInfo, ResourceType};
use crate::signature::detect_format;

/// Generic content-type driven rule.
pub const GENERIC: &str = "generic";
/// Obfuscated channel video streams.
pub const CHANNELS: &str = "channels";
/// Cache images XOR-ed with a single key byte.
pub const XOR_BYTE: &str = "xorbyte";

/// Response metadata of one intercepted exchange.
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub status: u16,
    pub content_type: Option<&'a str>,
    pub content_length: Option<u64>,
    /// Total length from a `Content-Range` header.
    pub range_total: Option<u64>,
}

impl<'a> Exchange<'a> {
    /// Reassembles the request URL.
    pub fn url(&self) -> String {
        match self.query {
            Some(query) if !query.is_empty() => {
                format!("{}://{}{}?{}", self.scheme, self.host, self.path, query)
            }
            _ => format!("{}://{}{}", self.scheme, self.host, self.path),
        }
    }

    /// Returns the first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&'a str> {
        self.query?
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Returns the lowercased extension of the last path segment.
    pub fn extension(&self) -> Option<String> {
        let segment = self.path.rsplit('/').next()?;
        let (stem, ext) = segment.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_lowercase())
    }

    /// Total resource size, when the response tells.
    pub fn total_size(&self) -> Option<u64> {
        match self.status {
            206 => self.range_total,
            _ => self.content_length,
        }
    }

    fn file_stem(&self) -> String {
        let segment = self.path.rsplit('/').next().unwrap_or("");
        segment
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(segment)
            .to_string()
    }
}

/// A response a rule wants to capture, pending body confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Id of the rule that produced it.
    pub provider: &'static str,
    pub fingerprint: String,
    pub url: String,
    pub resource_type: ResourceType,
    pub content_type: Option<String>,
    pub suffix: String,
    pub title: String,
    pub size: Option<u64>,
    pub decode_param: Option<String>,
    /// Whether the body prefix must carry a recognized media signature.
    pub requires_signature: bool,
}

impl Candidate {
    /// Converts a confirmed candidate into a registry record.
    pub fn into_media(self) -> MediaInfo {
        let mut info = MediaInfo::new(self.fingerprint, self.url, self.resource_type, self.provider)
            .with_suffix(self.suffix)
            .with_title(self.title);
        info.content_type = self.content_type;
        info.size = self.size;
        info.decode_param = self.decode_param;
        info
    }
}

/// A provider's capture and decode behavior.
pub trait ProviderRule: Send + Sync {
    /// Stable id stored on captured records.
    fn id(&self) -> &'static str;

    /// Inspects response metadata. `None` means the exchange is not ours.
    fn qualifies(&self, exchange: &Exchange<'_>, mime: &MimeMap) -> Option<Candidate>;

    /// Checks the captured body prefix once the response has ended.
    fn confirm(&self, candidate: &Candidate, prefix: &[u8]) -> bool {
        if candidate.requires_signature {
            detect_format(prefix).is_some()
        } else {
            !prefix.is_empty()
        }
    }

    /// Builds the decode transform for a parameter.
    fn transform(&self, param: Option<&str>) -> Result<Box<dyn Transform>, DecodeError>;
}

/// Standard media recognized by content type or URL extension.
#[derive(Debug, Default)]
pub struct GenericMedia;

impl ProviderRule for GenericMedia {
    fn id(&self) -> &'static str {
        GENERIC
    }

    fn qualifies(&self, exchange: &Exchange<'_>, mime: &MimeMap) -> Option<Candidate> {
        if !matches!(exchange.status, 200 | 206) {
            return None;
        }

        let declared = exchange.content_type.and_then(|ct| mime.get(ct));
        let (entry, content_type, requires_signature) = match declared {
            Some(entry) => (entry, exchange.content_type.map(str::to_string), false),
            None => {
                // Untyped bodies only count when the URL names a media file
                // and the bytes agree.
                if !is_untyped(exchange.content_type) {
                    return None;
                }
                let ext = exchange.extension()?;
                let (mime_type, entry) = mime.by_suffix(&ext)?;
                (entry, Some(mime_type.to_string()), true)
            }
        };

        Some(Candidate {
            provider: GENERIC,
            fingerprint: fingerprint(&[GENERIC, exchange.host, exchange.path]),
            url: exchange.url(),
            resource_type: entry.resource_type,
            content_type,
            suffix: entry.suffix.clone(),
            title: exchange.file_stem(),
            size: exchange.total_size(),
            decode_param: None,
            requires_signature,
        })
    }

    fn transform(&self, _param: Option<&str>) -> Result<Box<dyn Transform>, DecodeError> {
        Ok(Box::new(Identity))
    }
}

fn is_untyped(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let essence = ct.split(';').next().unwrap_or("").trim().to_lowercase();
            essence.is_empty()
                || essence == "application/octet-stream"
                || essence == "binary/octet-stream"
        }
    }
}

/// Channel video streams served from `/stodownload` with an `encfilekey`.
///
/// The head of each file is XOR-ed with a per-video keystream that the
/// client page learns separately, so the decode parameter is supplied at
/// download time as base64.
#[derive(Debug, Default)]
pub struct Channels;

impl ProviderRule for Channels {
    fn id(&self) -> &'static str {
        CHANNELS
    }

    fn qualifies(&self, exchange: &Exchange<'_>, _mime: &MimeMap) -> Option<Candidate> {
        if !matches!(exchange.status, 200 | 206) || !exchange.path.contains("/stodownload") {
            return None;
        }
        let key = exchange.query_param("encfilekey").filter(|k| !k.is_empty())?;
        Some(Candidate {
            provider: CHANNELS,
            fingerprint: fingerprint(&[CHANNELS, key]),
            url: exchange.url(),
            resource_type: ResourceType::Video,
            content_type: Some("video/mp4".to_string()),
            suffix: "mp4".to_string(),
            title: String::new(),
            size: exchange.total_size(),
            decode_param: None,
            requires_signature: false,
        })
    }

    fn transform(&self, param: Option<&str>) -> Result<Box<dyn Transform>, DecodeError> {
        match param.map(str::trim).filter(|p| !p.is_empty()) {
            Some(param) => Ok(Box::new(XorPrefix::from_base64(param)?)),
            None => Ok(Box::new(Identity)),
        }
    }
}

/// Local cache images XOR-ed byte by byte. Never captured live.
#[derive(Debug, Default)]
pub struct XorByteCache;

impl ProviderRule for XorByteCache {
    fn id(&self) -> &'static str {
        XOR_BYTE
    }

    fn qualifies(&self, _exchange: &Exchange<'_>, _mime: &MimeMap) -> Option<Candidate> {
        None
    }

    fn transform(&self, param: Option<&str>) -> Result<Box<dyn Transform>, DecodeError> {
        let param = param.ok_or_else(|| {
            DecodeError::InvalidParameter("xorbyte requires a key byte".to_string())
        })?;
        Ok(Box::new(XorByte::from_hex(param)?))
    }
}

/// Ordered collection of provider rules.
#[derive(Clone, Default)]
pub struct ProviderSet {
    rules: Vec<Arc<dyn ProviderRule>>,
}

impl ProviderSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the set with the built-in rules.
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(Channels));
        set.register(Arc::new(XorByteCache));
        set.register(Arc::new(GenericMedia));
        set
    }

    /// Appends a rule. A rule with an existing id replaces it in place.
    pub fn register(&mut self, rule: Arc<dyn ProviderRule>) {
        match self.rules.iter().position(|r| r.id() == rule.id()) {
            Some(index) => self.rules[index] = rule,
            None => self.rules.push(rule),
        }
    }

    /// Looks up a rule by id.
    pub fn get(&self, id: &str) -> Option<&Arc<dyn ProviderRule>> {
        self.rules.iter().find(|r| r.id() == id)
    }

    /// Registered rule ids, in consultation order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Returns the first candidate any rule produces.
    pub fn classify(&self, exchange: &Exchange<'_>, mime: &MimeMap) -> Option<Candidate> {
        self.rules.iter().find_map(|r| r.qualifies(exchange, mime))
    }

    /// Confirms a candidate against its captured body prefix.
    pub fn confirm(&self, candidate: &Candidate, prefix: &[u8]) -> bool {
        self.get(candidate.provider)
            .map(|rule| rule.confirm(candidate, prefix))
            .unwrap_or(false)
    }

    /// Builds the decode transform of a provider.
    pub fn transform(&self, id: &str, param: Option<&str>) -> Result<Box<dyn Transform>, DecodeError> {
        self.get(id)
            .ok_or_else(|| DecodeError::UnknownProvider(id.to_string()))?
            .transform(param)
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet").field("rules", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    fn exchange<'a>(path: &'a str, query: Option<&'a str>, content_type: Option<&'a str>) -> Exchange<'a> {
        Exchange {
            scheme: "https",
            host: "cdn.example.com",
            path,
            query,
            status: 200,
            content_type,
            content_length: Some(4096),
            range_total: None,
        }
    }

    #[test]
    fn generic_captures_declared_media() {
        let set = ProviderSet::with_defaults();
        let mime = MimeMap::default();
        let ex = exchange("/img/cat.jpg", Some("v=2"), Some("image/jpeg"));

        let candidate = set.classify(&ex, &mime).unwrap();
        assert_eq!(candidate.provider, GENERIC);
        assert_eq!(candidate.resource_type, ResourceType::Image);
        assert_eq!(candidate.suffix, "jpg");
        assert_eq!(candidate.title, "cat");
        assert_eq!(candidate.url, "https://cdn.example.com/img/cat.jpg?v=2");
        assert_eq!(candidate.size, Some(4096));
        assert!(!candidate.requires_signature);
    }

    #[test]
    fn generic_fingerprint_ignores_query() {
        let set = ProviderSet::with_defaults();
        let mime = MimeMap::default();
        let a = set
            .classify(&exchange("/v/a.mp4", Some("t=1"), Some("video/mp4")), &mime)
            .unwrap();
        let b = set
            .classify(&exchange("/v/a.mp4", Some("t=2"), Some("video/mp4")), &mime)
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn generic_skips_unlisted_types_and_errors() {
        let set = ProviderSet::with_defaults();
        let mime = MimeMap::default();
        assert!(set
            .classify(&exchange("/index.html", None, Some("text/html")), &mime)
            .is_none());

        let mut not_found = exchange("/a.jpg", None, Some("image/jpeg"));
        not_found.status = 404;
        assert!(set.classify(&not_found, &mime).is_none());
    }

    #[test]
    fn octet_stream_needs_extension_and_signature() {
        let set = ProviderSet::with_defaults();
        let mime = MimeMap::default();
        let candidate = set
            .classify(
                &exchange("/dl/song.mp3", None, Some("application/octet-stream")),
                &mime,
            )
            .unwrap();
        assert_eq!(candidate.resource_type, ResourceType::Audio);
        assert_eq!(candidate.content_type.as_deref(), Some("audio/mpeg"));
        assert!(candidate.requires_signature);
        assert!(set.confirm(&candidate, b"ID3\x04\0\0\0\0"));
        assert!(!set.confirm(&candidate, b"<html><body>"));

        assert!(set
            .classify(&exchange("/dl/blob", None, Some("application/octet-stream")), &mime)
            .is_none());
    }

    #[test]
    fn partial_content_uses_range_total() {
        let set = ProviderSet::with_defaults();
        let mut ex = exchange("/v/a.mp4", None, Some("video/mp4"));
        ex.status = 206;
        ex.range_total = Some(1_000_000);
        let candidate = set.classify(&ex, &MimeMap::default()).unwrap();
        assert_eq!(candidate.size, Some(1_000_000));
    }

    #[test]
    fn channels_wins_over_generic() {
        let set = ProviderSet::with_defaults();
        let ex = Exchange {
            host: "finder.video.qq.com",
            ..exchange(
                "/251/20302/stodownload",
                Some("encfilekey=abc123&token=x&idx=1"),
                Some("video/mp4"),
            )
        };
        let candidate = set.classify(&ex, &MimeMap::default()).unwrap();
        assert_eq!(candidate.provider, CHANNELS);
        assert_eq!(candidate.resource_type, ResourceType::Video);
        assert_eq!(candidate.fingerprint, fingerprint(&[CHANNELS, "abc123"]));
        // Obfuscated heads carry no signature.
        assert!(set.confirm(&candidate, &[0x13, 0x37, 0x00, 0x42]));
    }

    #[test]
    fn channels_without_key_is_not_channels() {
        let set = ProviderSet::with_defaults();
        let ex = exchange("/251/stodownload", Some("token=x"), Some("video/mp4"));
        let candidate = set.classify(&ex, &MimeMap::default()).unwrap();
        assert_eq!(candidate.provider, GENERIC);
    }

    #[test]
    fn transforms_by_provider() {
        let set = ProviderSet::with_defaults();
        let plain = b"GIF89a\x01\0\x01\0\0\0".to_vec();
        let encoded: Vec<u8> = plain.iter().map(|b| b ^ 0x42).collect();

        let transform = set.transform(XOR_BYTE, Some("42")).unwrap();
        assert_eq!(decode(&encoded, transform.as_ref()).unwrap(), plain);

        assert!(set.transform(GENERIC, None).unwrap().is_identity());
        assert!(set.transform(CHANNELS, None).unwrap().is_identity());
        assert!(matches!(
            set.transform(XOR_BYTE, None),
            Err(DecodeError::InvalidParameter(_))
        ));
        assert!(matches!(
            set.transform("nope", None),
            Err(DecodeError::UnknownProvider(_))
        ));
    }

    #[test]
    fn register_replaces_by_id() {
        let mut set = ProviderSet::with_defaults();
        let before = set.ids().len();
        set.register(Arc::new(GenericMedia));
        assert_eq!(set.ids().len(), before);
        assert_eq!(set.ids().last(), Some(&GENERIC));
    }

    #[test]
    fn exchange_helpers() {
        let ex = exchange("/a/b/clip.MP4", Some("x=1&flag&y=2"), None);
        assert_eq!(ex.extension().as_deref(), Some("mp4"));
        assert_eq!(ex.query_param("y"), Some("2"));
        assert_eq!(ex.query_param("flag"), Some(""));
        assert_eq!(ex.query_param("z"), None);
        assert_eq!(exchange("/a/.hidden", None, None).extension(), None);
    }
}
