//! Schema version gate.
//!
//! Cached payloads are shaped by the code that wrote them. Whenever that shape
//! changes the application bumps its schema version, and the first service
//! built by the new binary wipes everything written under the old one.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::events::CacheEvent;
use super::service::CacheService;

/// Bump whenever the shape of cached payloads changes.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Singleton record in the bounded store; never matches the entry prefix.
pub(crate) const VERSION_KEY: &str = "portal_cache_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Persisted version matched, nothing touched
    Current,
    /// Version differed (or was never written) and the cache was wiped
    Reset { previous: Option<u32> },
}

impl CacheService {
    pub(crate) fn run_version_gate(&self) -> GateOutcome {
        let current = self.inner.schema_version;
        let previous = self.persisted_version();
        if previous == Some(current) {
            debug!(version = current, "Cache schema version unchanged");
            return GateOutcome::Current;
        }

        info!(?previous, current, "Cache schema version changed, wiping cached entries");
        let removed = self.clear_sync_tiers(|_| true).len();
        self.inner.pending_large_clear.store(true, Ordering::SeqCst);

        if let Some(store) = self.bounded() {
            if let Err(e) = store.set_item(VERSION_KEY, &current.to_string()) {
                warn!(error = %e, "Failed to persist cache schema version");
            }
        }

        self.inner.stats.record_clear();
        self.inner
            .events
            .emit(CacheEvent::VersionReset { previous, current });
        debug!(removed, "Version gate finished");
        GateOutcome::Reset { previous }
    }

    fn persisted_version(&self) -> Option<u32> {
        let store = self.bounded()?;
        match store.get_item(VERSION_KEY) {
            Ok(raw) => raw.and_then(|raw| raw.trim().parse().ok()),
            Err(e) => {
                debug!(error = %e, "Failed to read cache schema version");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::storage::{DurableStore, LargeItemStore, MemoryLargeStore, MemoryStore};

    const TTL: Duration = Duration::from_secs(60);

    fn build(store: &Arc<MemoryStore>, version: u32) -> CacheService {
        CacheService::builder()
            .bounded_store(store.clone())
            .schema_version(version)
            .large_item_threshold(128)
            .build()
    }

    #[test]
    fn test_first_start_writes_version() {
        let store = Arc::new(MemoryStore::new(4096));
        let cache = build(&store, 3);
        assert_eq!(cache.gate_outcome(), GateOutcome::Reset { previous: None });
        assert_eq!(store.get_item(VERSION_KEY).unwrap().as_deref(), Some("3"));
        assert_eq!(cache.stats().clears, 1);
    }

    #[test]
    fn test_same_version_keeps_entries() {
        let store = Arc::new(MemoryStore::new(4096));
        build(&store, 3).set("users:1", &"Ann", TTL);

        let next = build(&store, 3);
        assert_eq!(next.gate_outcome(), GateOutcome::Current);
        assert_eq!(next.stats().clears, 0);
        assert_eq!(next.get::<String>("users:1").as_deref(), Some("Ann"));
    }

    #[test]
    fn test_version_bump_makes_old_entries_unreadable() {
        let store = Arc::new(MemoryStore::new(4096));
        build(&store, 3).set("users:1", &"Ann", TTL);

        let next = build(&store, 4);
        assert_eq!(next.gate_outcome(), GateOutcome::Reset { previous: Some(3) });
        assert_eq!(next.get::<String>("users:1"), None);
        assert_eq!(store.get_item(VERSION_KEY).unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_large_tier_cleared_when_attached_after_bump() {
        let store = Arc::new(MemoryStore::new(4096));
        let large = Arc::new(MemoryLargeStore::new());

        let old = build(&store, 1);
        old.attach_large_store(large.clone()).await;
        old.set_async("reports:1", &"r".repeat(500), TTL).await;
        assert_eq!(large.keys().await.unwrap().len(), 1);

        let new = build(&store, 2);
        assert_eq!(large.keys().await.unwrap().len(), 1);
        new.attach_large_store(large.clone()).await;
        assert!(large.keys().await.unwrap().is_empty());
        assert_eq!(new.get_async::<String>("reports:1").await, None);
    }

    #[test]
    fn test_garbage_version_record_resets() {
        let store = Arc::new(MemoryStore::new(4096));
        store.set_item(VERSION_KEY, "not-a-number").unwrap();
        let cache = build(&store, 1);
        assert_eq!(cache.gate_outcome(), GateOutcome::Reset { previous: None });
    }
}
