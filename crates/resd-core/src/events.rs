//! Registry change notifications.
//!
//! The registry publishes through the [`EventSink`] seam. [`EventHub`] fans
//! events out to any number of subscribers, each behind its own bounded
//! queue; a subscriber that falls behind or goes away is dropped so the
//! publisher never waits.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::media::MediaInfo;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// A registry state change.
///
/// Serializes as `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ResourceEvent {
    /// A new resource was captured.
    Added(MediaInfo),
    /// An existing resource changed (recapture or download progress).
    Updated(MediaInfo),
    /// A resource was deleted.
    Removed { fingerprint: String },
    /// All resources were removed.
    Cleared,
}

impl ResourceEvent {
    /// Fingerprint of the affected resource, if the event concerns one.
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            ResourceEvent::Added(info) | ResourceEvent::Updated(info) => Some(&info.fingerprint),
            ResourceEvent::Removed { fingerprint } => Some(fingerprint),
            ResourceEvent::Cleared => None,
        }
    }
}

/// Receives registry change notifications. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ResourceEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ResourceEvent) {}
}

/// Publish/subscribe fan-out with a drop-slow-consumer policy.
#[derive(Debug)]
pub struct EventHub {
    depth: usize,
    subscribers: Mutex<Vec<mpsc::Sender<ResourceEvent>>>,
}

impl EventHub {
    /// Creates a hub whose subscribers each get `depth` queued events.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<ResourceEvent> {
        let (tx, rx) = mpsc::channel(self.depth);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl EventSink for EventHub {
    fn emit(&self, event: ResourceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Dropping subscriber that fell behind");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
