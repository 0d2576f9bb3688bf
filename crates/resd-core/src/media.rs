//! Captured resource records.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of media a captured resource holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Image,
    Video,
    Audio,
    Other,
}

impl ResourceType {
    /// Returns the type tag as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Image => "image",
            ResourceType::Video => "video",
            ResourceType::Audio => "audio",
            ResourceType::Other => "other",
        }
    }

    /// Parses a type tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "image" => Some(ResourceType::Image),
            "video" => Some(ResourceType::Video),
            "audio" => Some(ResourceType::Audio),
            "other" => Some(ResourceType::Other),
            _ => None,
        }
    }

    /// Classifies a content type by its top-level media type.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        match essence.split('/').next() {
            Some("image") => ResourceType::Image,
            Some("video") => ResourceType::Video,
            Some("audio") => ResourceType::Audio,
            _ => ResourceType::Other,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a captured resource.
///
/// `Captured → Downloading → {Ready, Failed}`; a new download re-enters
/// `Downloading` from any state except `Downloading` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Captured,
    Downloading,
    Ready,
    Failed,
}

impl ResourceStatus {
    /// Returns the status as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Captured => "captured",
            ResourceStatus::Downloading => "downloading",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Failed => "failed",
        }
    }

    /// Returns true once a download attempt has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceStatus::Ready | ResourceStatus::Failed)
    }
}

/// A captured media resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Content-derived identifier, unique within the registry.
    pub fingerprint: String,
    /// Source URL the resource was served from.
    pub url: String,
    /// Host that served the resource.
    pub domain: String,
    /// Media kind.
    pub resource_type: ResourceType,
    /// Response content type, when the upstream sent one.
    pub content_type: Option<String>,
    /// File suffix guessed at capture time (without the dot).
    pub suffix: String,
    /// Id of the provider rule that captured it; selects the decode transform.
    pub provider: String,
    /// Decode parameter found at capture time, if the provider exposes one.
    pub decode_param: Option<String>,
    /// Total size in bytes, when known.
    pub size: Option<u64>,
    /// Display title.
    pub title: String,
    /// Time of the most recent capture.
    pub captured_at: DateTime<Utc>,
    /// Current status.
    pub status: ResourceStatus,
    /// Location of the materialized file once ready.
    pub save_path: Option<PathBuf>,
    /// Failure detail of the last download attempt.
    pub error: Option<String>,
    /// Request headers replayed when fetching the resource again.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl MediaInfo {
    /// Creates a freshly captured record.
    pub fn new(
        fingerprint: impl Into<String>,
        url: impl Into<String>,
        resource_type: ResourceType,
        provider: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let domain = host_of(&url).to_string();
        Self {
            fingerprint: fingerprint.into(),
            url,
            domain,
            resource_type,
            content_type: None,
            suffix: String::new(),
            provider: provider.into(),
            decode_param: None,
            size: None,
            title: String::new(),
            captured_at: Utc::now(),
            status: ResourceStatus::Captured,
            save_path: None,
            error: None,
            headers: BTreeMap::new(),
        }
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the file suffix.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Sets the display title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Sets the decode parameter.
    pub fn with_decode_param(mut self, param: impl Into<String>) -> Self {
        self.decode_param = Some(param.into());
        self
    }

    /// Builds the file name (without directory) a download is saved under.
    ///
    /// `extension` comes from the decoded content when recognized, otherwise
    /// from the capture-time suffix.
    pub fn file_name(&self, options: &NamingOptions, extension: Option<&str>) -> String {
        let mut stem = sanitize(&self.title);
        if options.filename_len > 0 {
            stem = stem.chars().take(options.filename_len).collect();
        }
        let stem = stem.trim().to_string();
        let mut stem = if stem.is_empty() {
            short_fingerprint(&self.fingerprint).to_string()
        } else {
            stem
        };
        if options.filename_time {
            stem.push('_');
            stem.push_str(&self.captured_at.format("%Y%m%d%H%M%S").to_string());
        }

        let extension = extension
            .filter(|e| !e.is_empty())
            .unwrap_or(self.suffix.as_str());
        if extension.is_empty() {
            stem
        } else {
            format!("{}.{}", stem, extension.trim_start_matches('.'))
        }
    }
}

/// File naming options for saved resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingOptions {
    /// Maximum title characters kept in the name (0 = no limit).
    pub filename_len: usize,
    /// Append the capture timestamp to the name.
    pub filename_time: bool,
}

/// Derives a fingerprint from stable identifying parts.
///
/// Parts are hashed in order with a separator so `["ab", "c"]` and
/// `["a", "bc"]` differ.
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Returns the leading characters of a fingerprint used in file names.
pub fn short_fingerprint(fingerprint: &str) -> &str {
    let end = fingerprint
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(fingerprint.len());
    &fingerprint[..end]
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    authority.split(':').next().unwrap_or(authority)
}

fn sanitize(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn resource_type_parse_roundtrip() {
        for t in [
            ResourceType::Image,
            ResourceType::Video,
            ResourceType::Audio,
            ResourceType::Other,
        ] {
            assert_eq!(ResourceType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ResourceType::parse(" Video "), Some(ResourceType::Video));
        assert_eq!(ResourceType::parse("m3u8"), None);
    }

    #[test]
    fn resource_type_from_content_type() {
        assert_eq!(
            ResourceType::from_content_type("image/jpeg"),
            ResourceType::Image
        );
        assert_eq!(
            ResourceType::from_content_type("video/mp4; codecs=avc1"),
            ResourceType::Video
        );
        assert_eq!(
            ResourceType::from_content_type("application/octet-stream"),
            ResourceType::Other
        );
    }

    #[test]
    fn status_terminal() {
        assert!(!ResourceStatus::Captured.is_terminal());
        assert!(!ResourceStatus::Downloading.is_terminal());
        assert!(ResourceStatus::Ready.is_terminal());
        assert!(ResourceStatus::Failed.is_terminal());
    }

    #[test]
    fn fingerprint_is_stable_and_separated() {
        let a = fingerprint(&["generic", "cdn.example.com", "/a.jpg"]);
        let b = fingerprint(&["generic", "cdn.example.com", "/a.jpg"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }

    #[test]
    fn media_info_domain_from_url() {
        let info = MediaInfo::new(
            "fp",
            "https://user@cdn.example.com:8443/v/clip.mp4?x=1",
            ResourceType::Video,
            "generic",
        );
        assert_eq!(info.domain, "cdn.example.com");
        assert_eq!(info.status, ResourceStatus::Captured);
    }

    #[test]
    fn file_name_uses_sanitized_title() {
        let info = MediaInfo::new("0123456789abcdef", "https://a/b", ResourceType::Video, "generic")
            .with_title("My: clip / part?  1")
            .with_suffix("mp4");
        let name = info.file_name(&NamingOptions::default(), None);
        assert_eq!(name, "My_ clip _ part_ 1.mp4");
    }

    #[test]
    fn file_name_truncates_and_timestamps() {
        let mut info = MediaInfo::new("0123456789abcdef", "https://a/b", ResourceType::Image, "generic")
            .with_title("abcdefghij");
        info.captured_at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let options = NamingOptions {
            filename_len: 4,
            filename_time: true,
        };
        assert_eq!(info.file_name(&options, Some("png")), "abcd_20240506070809.png");
    }

    #[test]
    fn file_name_falls_back_to_fingerprint() {
        let info = MediaInfo::new("0123456789abcdef", "https://a/b", ResourceType::Audio, "generic");
        assert_eq!(info.file_name(&NamingOptions::default(), Some("mp3")), "0123456789ab.mp3");
        assert_eq!(info.file_name(&NamingOptions::default(), None), "0123456789ab");
    }

    #[test]
    fn media_info_serializes_snake_case() {
        let info = MediaInfo::new("fp", "https://a/b", ResourceType::Image, "generic");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["resource_type"], "image");
        assert_eq!(json["status"], "captured");
    }
}
