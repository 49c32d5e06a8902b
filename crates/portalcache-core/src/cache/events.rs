//! Notifications emitted by the cache for whoever wants them (a UI toast,
//! an audit log). The cache never knows who is listening.

use serde::Serialize;
use tokio::sync::broadcast;

/// Slow receivers lose the oldest events past this many.
const EVENT_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum CacheEvent {
    Cleared { scope: ClearScope, removed: usize },
    VersionReset { previous: Option<u32>, current: u32 },
    Evicted { entries: usize, freed_bytes: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "label", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub enum ClearScope {
    All,
    Type(String),
}

#[derive(Clone)]
pub(crate) struct EventEmitter {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// No subscribers is not an error
    pub fn emit(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }
}
