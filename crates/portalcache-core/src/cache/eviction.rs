//! Oldest-write-first eviction for the bounded-durable tier.
//!
//! Entries are ordered by `createdAt`, not by last read, so no access-order
//! index has to be maintained. Every eviction rescans the tier.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::events::CacheEvent;
use super::service::{CacheService, ENTRY_PREFIX};
use crate::storage::durable::record_size;
use crate::storage::DurableStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionReport {
    /// Valid entries removed, oldest first
    pub evicted: usize,
    /// Unparseable records removed during the scan
    pub corrupt: usize,
    pub freed_bytes: usize,
}

/// Only the timestamp is needed to order records
#[derive(Deserialize)]
struct RecordHeader {
    #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
    created_at: DateTime<Utc>,
}

struct Candidate {
    created_at: DateTime<Utc>,
    key: String,
    storage_key: String,
    size: usize,
}

impl CacheService {
    /// Free at least `target_bytes` from the bounded tier, if that much exists.
    pub fn evict(&self, target_bytes: usize) -> EvictionReport {
        self.evict_oldest(target_bytes, None)
    }

    /// `protect` is the key currently being written; its volatile mirror is
    /// already the new value and must survive.
    pub(crate) fn evict_oldest(&self, target_bytes: usize, protect: Option<&str>) -> EvictionReport {
        let mut report = EvictionReport::default();
        let Some(store) = self.bounded() else {
            return report;
        };
        let keys = match store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Eviction scan failed to list bounded tier");
                return report;
            }
        };

        let mut candidates = Vec::with_capacity(keys.len());
        for storage_key in keys {
            let Some(key) = storage_key.strip_prefix(ENTRY_PREFIX) else {
                continue;
            };
            if protect == Some(key) {
                continue;
            }
            let key = key.to_string();
            match store.get_item(&storage_key) {
                Ok(Some(raw)) => match serde_json::from_str::<RecordHeader>(&raw) {
                    Ok(header) => candidates.push(Candidate {
                        created_at: header.created_at,
                        size: record_size(&storage_key, &raw),
                        key,
                        storage_key,
                    }),
                    Err(e) => {
                        debug!(key = %key, error = %e, "Dropping corrupt record during eviction scan");
                        self.drop_entry(store, &storage_key, &key);
                        report.corrupt += 1;
                        report.freed_bytes += record_size(&storage_key, &raw);
                    }
                },
                // Removed by someone else since listing
                Ok(None) => {}
                Err(e) => {
                    debug!(key = %key, error = %e, "Dropping unreadable record during eviction scan");
                    self.drop_entry(store, &storage_key, &key);
                    report.corrupt += 1;
                }
            }
        }

        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for candidate in candidates {
            if report.freed_bytes >= target_bytes {
                break;
            }
            self.drop_entry(store, &candidate.storage_key, &candidate.key);
            report.evicted += 1;
            report.freed_bytes += candidate.size;
        }

        let removed = report.evicted + report.corrupt;
        if removed > 0 {
            self.inner.stats.record_evictions(removed as u64);
            self.inner.events.emit(CacheEvent::Evicted {
                entries: removed,
                freed_bytes: report.freed_bytes,
            });
            debug!(
                target_bytes,
                evicted = report.evicted,
                corrupt = report.corrupt,
                freed_bytes = report.freed_bytes,
                "Evicted oldest bounded cache entries"
            );
        }
        report
    }

    fn drop_entry(&self, store: &dyn DurableStore, storage_key: &str, key: &str) {
        self.remove_bounded_record(store, storage_key);
        self.memory().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::service::entry_storage_key;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    const TTL: Duration = Duration::from_secs(600);

    fn setup(capacity: usize) -> (Arc<ManualClock>, Arc<MemoryStore>, CacheService) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(MemoryStore::new(capacity));
        let cache = CacheService::builder()
            .clock(clock.clone())
            .bounded_store(store.clone())
            .large_item_threshold(10_000)
            .build();
        (clock, store, cache)
    }

    fn stored(store: &MemoryStore, key: &str) -> bool {
        store.get_item(&entry_storage_key(key)).unwrap().is_some()
    }

    #[test]
    fn test_evicts_oldest_first_until_target_met() {
        let (clock, store, cache) = setup(100_000);
        for key in ["a", "b", "c", "d"] {
            cache.set(key, &"0123456789", TTL);
            clock.advance_millis(10);
        }
        let one = store.item_size(&entry_storage_key("a")).unwrap().unwrap();

        let report = cache.evict(one + 1);
        assert_eq!(report.evicted, 2);
        assert!(!stored(&store, "a"));
        assert!(!stored(&store, "b"));
        assert!(stored(&store, "c"));
        assert!(stored(&store, "d"));
        // Volatile mirrors go too
        assert_eq!(cache.stats().memory_entries, 2);
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_zero_target_evicts_nothing() {
        let (_clock, _store, cache) = setup(100_000);
        cache.set("a", &1, TTL);
        assert_eq!(cache.evict(0), EvictionReport::default());
    }

    #[test]
    fn test_corrupt_records_removed_and_counted() {
        let (_clock, store, cache) = setup(100_000);
        cache.set("good", &1, TTL);
        store.set_item(&entry_storage_key("bad"), "garbage").unwrap();

        let report = cache.evict(1);
        assert_eq!(report.corrupt, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.freed_bytes, record_size(&entry_storage_key("bad"), "garbage"));
        assert!(!stored(&store, "bad"));
        assert!(stored(&store, "good"));
    }

    #[test]
    fn test_set_over_budget_evicts_oldest_before_writing() {
        let (clock, store, cache) = setup(4096);
        let payload = "p".repeat(900);
        for key in ["k1", "k2", "k3", "k4"] {
            cache.set(key, &payload, TTL);
            clock.advance_millis(10);
        }
        assert!(stored(&store, "k1"));

        cache.set("k5", &payload, TTL);
        assert!(!stored(&store, "k1"));
        assert!(stored(&store, "k2"));
        assert!(stored(&store, "k5"));
        assert!(store.used_bytes().unwrap() <= 4096);
        assert_eq!(cache.get::<String>("k5"), Some(payload));
    }

    #[test]
    fn test_rewriting_a_key_does_not_evict_its_fresh_copy() {
        let (clock, store, cache) = setup(2048);
        let payload = "q".repeat(900);
        cache.set("only", &payload, TTL);
        clock.advance_millis(10);
        cache.set("only", &payload, TTL);
        assert!(stored(&store, "only"));
        assert_eq!(cache.get::<String>("only"), Some(payload));
    }

    #[test]
    fn test_version_record_never_evicted() {
        let (_clock, store, cache) = setup(100_000);
        cache.set("a", &1, TTL);
        cache.evict(usize::MAX);
        assert!(store
            .get_item(crate::cache::version::VERSION_KEY)
            .unwrap()
            .is_some());
        assert_eq!(cache.stats().persistent_entries, 0);
    }
}
