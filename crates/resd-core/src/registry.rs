//! Resource registry.
//!
//! Concurrency-safe store of captured resources keyed by fingerprint. All
//! bookkeeping lives behind one reader/writer lock; downloads run on spawned
//! tasks outside it and only take the lock for their state transitions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ResdConfig;
use crate::decode::{self, DecodeError, OutputFile, StreamDecoder};
use crate::events::{EventSink, ResourceEvent};
use crate::fetch::{FetchError, FetchRequest, ResourceFetcher};
use crate::media::{short_fingerprint, MediaInfo, NamingOptions, ResourceStatus, ResourceType};
use crate::provider::ProviderSet;

/// Chunk size used when decoding a body already held in memory.
const BODY_CHUNK: usize = 64 * 1024;

/// Suffixed names tried before a download gives up on finding a free one.
const MAX_NAME_ATTEMPTS: usize = 10_000;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No resource has this fingerprint.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A download of this resource is already running.
    #[error("download already in progress: {0}")]
    InProgress(String),

    /// Decoding failed.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Fetching the resource failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Writing the output failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No save directory is configured.
    #[error("no save directory configured")]
    NoSaveDirectory,
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// What [`Registry::capture`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A new resource was stored.
    Added,
    /// The resource was already known; its metadata was refreshed.
    Refreshed,
}

/// Download destination and naming, replaceable at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySettings {
    pub save_dir: PathBuf,
    pub naming: NamingOptions,
    /// User agent replayed on downloads instead of the captured one.
    pub user_agent: Option<String>,
}

impl RegistrySettings {
    /// Derives the settings from configuration.
    pub fn from_config(config: &ResdConfig) -> Self {
        let agent = config.user_agent.trim();
        Self {
            save_dir: config.save_directory.clone(),
            naming: config.naming(),
            user_agent: (!agent.is_empty()).then(|| agent.to_string()),
        }
    }
}

#[derive(Debug)]
struct Entry {
    info: MediaInfo,
    /// Complete body seen by the proxy, when small enough to keep.
    body: Option<Arc<Vec<u8>>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    type_filter: HashSet<ResourceType>,
}

/// The resource store.
pub struct Registry {
    state: RwLock<RegistryState>,
    settings: RwLock<RegistrySettings>,
    providers: Arc<ProviderSet>,
    fetcher: Arc<dyn ResourceFetcher>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("len", &self.len())
            .field("settings", &*self.settings.read())
            .field("providers", &self.providers)
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new(
        settings: RegistrySettings,
        providers: Arc<ProviderSet>,
        fetcher: Arc<dyn ResourceFetcher>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            settings: RwLock::new(settings),
            providers,
            fetcher,
            events,
        }
    }

    /// The provider rules used for capture and decode.
    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.providers
    }

    /// Current settings.
    pub fn settings(&self) -> RegistrySettings {
        self.settings.read().clone()
    }

    /// Replaces the settings. Running downloads keep the ones they started with.
    pub fn set_settings(&self, settings: RegistrySettings) {
        *self.settings.write() = settings;
    }

    /// Inserts a resource, or refreshes the metadata of a known one.
    ///
    /// `body` is the complete response body, if the proxy saw all of it.
    pub fn capture(&self, info: MediaInfo, body: Option<Vec<u8>>) -> CaptureOutcome {
        let body = body.map(Arc::new);
        let (outcome, snapshot) = {
            let mut state = self.state.write();
            match state.entries.get_mut(&info.fingerprint) {
                Some(entry) => {
                    refresh(&mut entry.info, info);
                    if body.is_some() {
                        entry.body = body;
                    }
                    (CaptureOutcome::Refreshed, entry.info.clone())
                }
                None => {
                    let snapshot = info.clone();
                    state.order.push(info.fingerprint.clone());
                    state
                        .entries
                        .insert(info.fingerprint.clone(), Entry { info, body });
                    (CaptureOutcome::Added, snapshot)
                }
            }
        };

        match outcome {
            CaptureOutcome::Added => {
                info!(
                    "Captured {} {} ({})",
                    snapshot.resource_type, snapshot.url, snapshot.provider
                );
                self.events.emit(ResourceEvent::Added(snapshot));
            }
            CaptureOutcome::Refreshed => {
                debug!("Refreshed {}", snapshot.fingerprint);
                self.events.emit(ResourceEvent::Updated(snapshot));
            }
        }
        outcome
    }

    /// Restricts listing to the given types; an empty set shows everything.
    pub fn set_type_filter<I>(&self, types: I)
    where
        I: IntoIterator<Item = ResourceType>,
    {
        self.state.write().type_filter = types.into_iter().collect();
    }

    /// The active type filter.
    pub fn type_filter(&self) -> Vec<ResourceType> {
        let mut types: Vec<_> = self.state.read().type_filter.iter().copied().collect();
        types.sort();
        types
    }

    /// Resources passing the type filter, in capture order.
    pub fn list(&self) -> Vec<MediaInfo> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|fp| state.entries.get(fp))
            .filter(|e| {
                state.type_filter.is_empty() || state.type_filter.contains(&e.info.resource_type)
            })
            .map(|e| e.info.clone())
            .collect()
    }

    /// Looks up one resource, ignoring the type filter.
    pub fn get(&self, fingerprint: &str) -> Option<MediaInfo> {
        self.state
            .read()
            .entries
            .get(fingerprint)
            .map(|e| e.info.clone())
    }

    /// Number of stored resources, ignoring the type filter.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a resource and its saved file. Returns false if it was absent.
    pub fn delete(&self, fingerprint: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.entries.remove(fingerprint);
            if removed.is_some() {
                state.order.retain(|fp| fp != fingerprint);
            }
            removed
        };

        let Some(entry) = removed else {
            return false;
        };
        if let Some(path) = &entry.info.save_path {
            remove_file(path);
        }
        self.events.emit(ResourceEvent::Removed {
            fingerprint: fingerprint.to_string(),
        });
        true
    }

    /// Removes every resource and their saved files.
    pub fn clear(&self) {
        let entries = {
            let mut state = self.state.write();
            state.order.clear();
            std::mem::take(&mut state.entries)
        };

        for entry in entries.values() {
            if let Some(path) = &entry.info.save_path {
                remove_file(path);
            }
        }
        info!("Cleared {} resources", entries.len());
        self.events.emit(ResourceEvent::Cleared);
    }

    /// Starts downloading and decoding a resource in the background.
    ///
    /// Returns once the resource is marked downloading. `param` overrides the
    /// decode parameter found at capture time.
    pub fn download(self: &Arc<Self>, fingerprint: &str, param: Option<String>) -> Result<()> {
        let (info, body) = {
            let mut state = self.state.write();
            let entry = state
                .entries
                .get_mut(fingerprint)
                .ok_or_else(|| RegistryError::NotFound(fingerprint.to_string()))?;
            if entry.info.status == ResourceStatus::Downloading {
                return Err(RegistryError::InProgress(fingerprint.to_string()));
            }
            entry.info.status = ResourceStatus::Downloading;
            entry.info.error = None;
            (entry.info.clone(), entry.body.clone())
        };
        self.events.emit(ResourceEvent::Updated(info.clone()));

        let settings = self.settings();
        let param = param.or_else(|| info.decode_param.clone());
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let result = registry
                .materialize(&info, body, param.as_deref(), &settings)
                .await;
            registry.finish_download(&info.fingerprint, result);
        });
        Ok(())
    }

    /// Decodes a file obtained outside the proxy with `info`'s provider.
    ///
    /// The output lands next to the input. If `info` is a stored resource it
    /// becomes ready with the output as its saved file. Fails with
    /// [`RegistryError::InProgress`] while that resource is downloading.
    pub fn decode_local_file(
        &self,
        info: &MediaInfo,
        path: &Path,
        param: Option<&str>,
    ) -> Result<PathBuf> {
        if self.is_downloading(&info.fingerprint) {
            return Err(RegistryError::InProgress(info.fingerprint.clone()));
        }
        let param = param.or(info.decode_param.as_deref());
        let transform = self.providers.transform(&info.provider, param)?;
        let output = decode::decode_local_file(path, transform.as_ref())?;

        let mut previous = None;
        let mut raced = false;
        let snapshot = {
            let mut state = self.state.write();
            match state.entries.get_mut(&info.fingerprint) {
                Some(entry) if entry.info.status == ResourceStatus::Downloading => {
                    raced = true;
                    None
                }
                Some(entry) => {
                    entry.info.status = ResourceStatus::Ready;
                    entry.info.error = None;
                    previous = entry.info.save_path.replace(output.clone());
                    Some(entry.info.clone())
                }
                None => None,
            }
        };
        if raced {
            remove_file(&output);
            return Err(RegistryError::InProgress(info.fingerprint.clone()));
        }
        // The input itself may have been the saved file.
        if let Some(previous) = previous.filter(|p| p != &output && p != path) {
            remove_file(&previous);
        }
        if let Some(snapshot) = snapshot {
            self.events.emit(ResourceEvent::Updated(snapshot));
        }
        Ok(output)
    }

    fn is_downloading(&self, fingerprint: &str) -> bool {
        self.state
            .read()
            .entries
            .get(fingerprint)
            .is_some_and(|e| e.info.status == ResourceStatus::Downloading)
    }

    async fn materialize(
        &self,
        info: &MediaInfo,
        body: Option<Arc<Vec<u8>>>,
        param: Option<&str>,
        settings: &RegistrySettings,
    ) -> Result<PathBuf> {
        if settings.save_dir.as_os_str().is_empty() {
            return Err(RegistryError::NoSaveDirectory);
        }
        let transform = self.providers.transform(&info.provider, param)?;
        fs::create_dir_all(&settings.save_dir)?;

        let mut writer = DecodingWriter::new(transform.as_ref(), info, settings);
        match body {
            Some(body) => {
                debug!("Decoding {} from captured body", info.fingerprint);
                for chunk in body.chunks(BODY_CHUNK) {
                    writer.push(chunk)?;
                }
            }
            None => {
                let request = FetchRequest {
                    url: info.url.clone(),
                    headers: info.headers.clone(),
                    user_agent: settings.user_agent.clone(),
                };
                let mut source = self.fetcher.fetch(&request).await?;
                while let Some(chunk) = source.chunk().await? {
                    writer.push(&chunk)?;
                }
            }
        }
        writer.finish()
    }

    fn finish_download(&self, fingerprint: &str, result: Result<PathBuf>) {
        let mut previous = None;
        let snapshot = {
            let mut state = self.state.write();
            match state.entries.get_mut(fingerprint) {
                Some(entry) => {
                    match &result {
                        Ok(path) => {
                            entry.info.status = ResourceStatus::Ready;
                            entry.info.error = None;
                            previous = entry.info.save_path.replace(path.clone());
                        }
                        Err(e) => {
                            entry.info.status = ResourceStatus::Failed;
                            entry.info.error = Some(e.to_string());
                        }
                    }
                    Some(entry.info.clone())
                }
                None => None,
            }
        };

        match (snapshot, result) {
            (Some(snapshot), Ok(path)) => {
                // A repeated download supersedes the earlier file.
                if let Some(previous) = previous.filter(|p| p != &path) {
                    remove_file(&previous);
                }
                info!("Saved {} to {:?}", fingerprint, path);
                self.events.emit(ResourceEvent::Updated(snapshot));
            }
            (Some(snapshot), Err(e)) => {
                warn!("Download of {} failed: {}", fingerprint, e);
                self.events.emit(ResourceEvent::Updated(snapshot));
            }
            // Deleted while downloading; the file has no owner.
            (None, Ok(path)) => remove_file(&path),
            (None, Err(_)) => {}
        }
    }
}

fn refresh(existing: &mut MediaInfo, fresh: MediaInfo) {
    existing.url = fresh.url;
    existing.captured_at = fresh.captured_at;
    if fresh.size.is_some() {
        existing.size = fresh.size;
    }
    if fresh.content_type.is_some() {
        existing.content_type = fresh.content_type;
    }
    if existing.title.is_empty() {
        existing.title = fresh.title;
    }
    if fresh.decode_param.is_some() {
        existing.decode_param = fresh.decode_param;
    }
    if !fresh.headers.is_empty() {
        existing.headers = fresh.headers;
    }
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}

/// Streams decoded bytes into the save directory, opening the output once
/// the decoded format (and so the extension) is known.
struct DecodingWriter<'a> {
    decoder: StreamDecoder<'a>,
    info: &'a MediaInfo,
    settings: &'a RegistrySettings,
    output: Option<OutputFile>,
}

impl<'a> DecodingWriter<'a> {
    fn new(
        transform: &'a dyn decode::Transform,
        info: &'a MediaInfo,
        settings: &'a RegistrySettings,
    ) -> Self {
        Self {
            decoder: StreamDecoder::new(transform),
            info,
            settings,
            output: None,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        let out = self.decoder.push(chunk)?;
        if !out.is_empty() {
            let extension = self.decoder.format().map(|f| f.extension());
            write_output(&mut self.output, self.info, self.settings, &out, extension)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<PathBuf> {
        let Self {
            decoder,
            info,
            settings,
            mut output,
        } = self;
        let (rest, format) = decoder.finish()?;
        write_output(&mut output, info, settings, &rest, format.map(|f| f.extension()))?;
        match output {
            Some(output) => Ok(output.commit()?),
            None => Err(RegistryError::Io(io::Error::other("nothing was written"))),
        }
    }
}

fn write_output(
    slot: &mut Option<OutputFile>,
    info: &MediaInfo,
    settings: &RegistrySettings,
    data: &[u8],
    extension: Option<&str>,
) -> io::Result<()> {
    if slot.is_none() {
        let name = info.file_name(&settings.naming, extension);
        *slot = Some(reserve_output(&settings.save_dir, &name, &info.fingerprint)?);
    }
    match slot.as_mut() {
        Some(output) => output.write_all(data),
        None => Ok(()),
    }
}

/// Reserves a file name in `dir`, adding a short fingerprint and then a
/// counter to the stem while the name is taken.
///
/// The reservation is the exclusively created `.part` file, so concurrent
/// downloads never share a name.
fn reserve_output(dir: &Path, name: &str, fingerprint: &str) -> io::Result<OutputFile> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let short = short_fingerprint(fingerprint);
    let candidate = |attempt: usize| {
        let stem = match attempt {
            0 => stem.to_string(),
            1 => format!("{}_{}", stem, short),
            n => format!("{}_{}_{}", stem, short, n),
        };
        match ext {
            Some(ext) => dir.join(format!("{}.{}", stem, ext)),
            None => dir.join(stem),
        }
    };

    for attempt in 0..MAX_NAME_ATTEMPTS {
        match OutputFile::create_new(candidate(attempt)) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            reserved => return reserved,
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free file name for {}", name),
    ))
}

/// Headers worth replaying, picked from captured request headers.
pub fn replay_headers<'a, I>(wanted: &[String], headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .filter(|(name, _)| wanted.iter().any(|w| w.eq_ignore_ascii_case(name)))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
        .collect()
}
