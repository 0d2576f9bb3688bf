//! Persisted user configuration.
//!
//! Stored as pretty JSON. Every field has a default so older or partial
//! files keep loading after new settings are added.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::{NamingOptions, ResourceType};

/// Configuration file name inside the config directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The file is not valid configuration JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No platform directory could be resolved.
    #[error("no project directory available")]
    NoProjectDir,
}

/// Resource type and file suffix for a content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimeEntry {
    /// Resource type captured responses of this content type get.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// File suffix, without the dot.
    pub suffix: String,
}

impl MimeEntry {
    fn new(resource_type: ResourceType, suffix: &str) -> Self {
        Self {
            resource_type,
            suffix: suffix.to_string(),
        }
    }
}

/// Content type → capture classification.
///
/// Only content types listed here are captured by the generic provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MimeMap(BTreeMap<String, MimeEntry>);

impl MimeMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds or replaces an entry.
    pub fn insert(&mut self, content_type: impl Into<String>, entry: MimeEntry) {
        self.0.insert(content_type.into().to_lowercase(), entry);
    }

    /// Looks up a content type, ignoring parameters and case.
    pub fn get(&self, content_type: &str) -> Option<&MimeEntry> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        self.0.get(&essence)
    }

    /// Finds the entry whose suffix matches a URL path extension.
    pub fn by_suffix(&self, suffix: &str) -> Option<(&str, &MimeEntry)> {
        let suffix = suffix.to_lowercase();
        self.0
            .iter()
            .find(|(_, entry)| entry.suffix == suffix)
            .map(|(mime, entry)| (mime.as_str(), entry))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        let mut map = Self::new();
        for (mime, resource_type, suffix) in [
            ("image/jpeg", ResourceType::Image, "jpg"),
            ("image/png", ResourceType::Image, "png"),
            ("image/gif", ResourceType::Image, "gif"),
            ("image/webp", ResourceType::Image, "webp"),
            ("image/avif", ResourceType::Image, "avif"),
            ("image/bmp", ResourceType::Image, "bmp"),
            ("video/mp4", ResourceType::Video, "mp4"),
            ("video/webm", ResourceType::Video, "webm"),
            ("video/x-flv", ResourceType::Video, "flv"),
            ("video/quicktime", ResourceType::Video, "mov"),
            ("video/mp2t", ResourceType::Video, "ts"),
            ("application/vnd.apple.mpegurl", ResourceType::Video, "m3u8"),
            ("application/x-mpegurl", ResourceType::Video, "m3u8"),
            ("audio/mpeg", ResourceType::Audio, "mp3"),
            ("audio/mp4", ResourceType::Audio, "m4a"),
            ("audio/aac", ResourceType::Audio, "aac"),
            ("audio/ogg", ResourceType::Audio, "ogg"),
            ("audio/wav", ResourceType::Audio, "wav"),
            ("audio/flac", ResourceType::Audio, "flac"),
            ("audio/webm", ResourceType::Audio, "weba"),
        ] {
            map.insert(mime, MimeEntry::new(resource_type, suffix));
        }
        map
    }
}

/// Which hosts get their TLS terminated and inspected.
///
/// Patterns are exact hosts, `*.domain` (one subdomain level) or
/// `**.domain` (any depth). An empty allow-list intercepts every host not
/// denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSettings {
    /// Hosts eligible for interception.
    pub allow: Vec<String>,
    /// Hosts always tunneled, even when allowed.
    pub deny: Vec<String>,
}

/// Network deadlines, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Upstream TCP/TLS connect.
    pub connect: u64,
    /// Waiting for upstream response headers, and idle gaps between body chunks.
    pub upstream_read: u64,
    /// Idle gaps between chunks of a download.
    pub download_read: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: 10,
            upstream_read: 30,
            download_read: 60,
        }
    }
}

impl Timeouts {
    /// Connect deadline.
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect.max(1))
    }

    /// Upstream read deadline.
    pub fn upstream_read(&self) -> Duration {
        Duration::from_secs(self.upstream_read.max(1))
    }

    /// Download read deadline.
    pub fn download_read(&self) -> Duration {
        Duration::from_secs(self.download_read.max(1))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResdConfig {
    /// Proxy listen host.
    pub host: String,
    /// Proxy listen port.
    pub port: u16,
    /// Directory downloads are saved to.
    pub save_directory: PathBuf,
    /// Resource types surfaced by listing (empty = all).
    pub type_filter: BTreeSet<ResourceType>,
    /// Interception allow/deny policy.
    pub intercept: InterceptSettings,
    /// Maximum title characters in saved file names (0 = no limit).
    pub filename_len: usize,
    /// Append the capture time to saved file names.
    pub filename_time: bool,
    /// User agent for downloads; empty keeps the captured one.
    pub user_agent: String,
    /// Proxy URL downloads go through; empty for direct.
    pub upstream_proxy: String,
    /// Comma-separated request headers captured and replayed on download.
    pub use_headers: String,
    /// Content type classification.
    pub mime_map: MimeMap,
    /// Bytes of each candidate response body kept for inspection.
    pub capture_prefix_bytes: usize,
    /// Network deadlines.
    pub timeouts: Timeouts,
}

impl Default for ResdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8899,
            save_directory: default_save_directory(),
            type_filter: BTreeSet::new(),
            intercept: InterceptSettings::default(),
            filename_len: 0,
            filename_time: false,
            user_agent: String::new(),
            upstream_proxy: String::new(),
            use_headers: "Referer,Cookie,Authorization".to_string(),
            mime_map: MimeMap::default(),
            capture_prefix_bytes: 256 * 1024,
            timeouts: Timeouts::default(),
        }
    }
}

impl ResdConfig {
    /// Loads the configuration, falling back to defaults if the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the configuration, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// File naming options.
    pub fn naming(&self) -> NamingOptions {
        NamingOptions {
            filename_len: self.filename_len,
            filename_time: self.filename_time,
        }
    }

    /// Header names captured for download replay, lowercased.
    pub fn replay_headers(&self) -> Vec<String> {
        self.use_headers
            .split(',')
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect()
    }
}

/// Returns the platform project directories.
pub fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("com", "resd", "Resd").ok_or(ConfigError::NoProjectDir)
}

/// Default configuration file path.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join(CONFIG_FILENAME))
}

fn default_save_directory() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join("resd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn mime_map_ignores_parameters_and_case() {
        let map = MimeMap::default();
        let entry = map.get("Video/MP4; codecs=\"avc1\"").unwrap();
        assert_eq!(entry.resource_type, ResourceType::Video);
        assert_eq!(entry.suffix, "mp4");
        assert!(map.get("text/html").is_none());
    }

    #[test]
    fn mime_map_by_suffix() {
        let map = MimeMap::default();
        let (mime, entry) = map.by_suffix("MP3").unwrap();
        assert_eq!(mime, "audio/mpeg");
        assert_eq!(entry.resource_type, ResourceType::Audio);
        assert!(map.by_suffix("html").is_none());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ResdConfig::load_or_default(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.port, 8899);
        assert!(config.type_filter.is_empty());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 9000, "type_filter": ["video"], "intercept": {"allow": ["**.qq.com"]}}"#,
        )
        .unwrap();

        let config = ResdConfig::load_or_default(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.type_filter.contains(&ResourceType::Video));
        assert_eq!(config.intercept.allow, vec!["**.qq.com".to_string()]);
        assert!(config.intercept.deny.is_empty());
        assert_eq!(config.timeouts, Timeouts::default());
        assert!(!config.mime_map.is_empty());
    }

    #[test]
    fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = ResdConfig {
            filename_len: 20,
            filename_time: true,
            ..ResdConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = ResdConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.naming().filename_len, 20);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ResdConfig::load_or_default(&path),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn replay_headers_are_normalized() {
        let config = ResdConfig {
            use_headers: " Referer , cookie,,".to_string(),
            ..ResdConfig::default()
        };
        assert_eq!(config.replay_headers(), vec!["referer", "cookie"]);
    }
}
