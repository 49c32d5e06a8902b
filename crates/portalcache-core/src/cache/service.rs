//! The tiered store.
//!
//! Reads walk volatile memory, then the bounded-durable store, then (async
//! reads only) the large-item store, promoting hits into memory. Writes always
//! land in memory first and are then routed by serialized size to exactly one
//! durable tier.
//!
//! No operation here surfaces an error to the caller: every storage failure is
//! logged and degrades to a miss or to a memory-only entry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, EntryInfo, StoredRecord, Tier};
use super::events::{CacheEvent, ClearScope, EventEmitter};
use super::key::type_prefix;
use super::large_tier::{LargeOp, LargeTier};
use super::stats::{CacheStats, StatsCollector};
use super::version::{GateOutcome, CACHE_SCHEMA_VERSION};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, DEFAULT_LARGE_ITEM_THRESHOLD_BYTES, DEFAULT_TTL_MS};
use crate::error::{CacheError, CacheResult};
use crate::storage::durable::record_size;
use crate::storage::{DurableStore, FileLargeStore, FileStore, LargeItemStore};

/// Prefix for entry records in the bounded store.
/// The version record does not share it.
pub(crate) const ENTRY_PREFIX: &str = "portal_cache:";

pub(crate) fn entry_storage_key(key: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, key)
}

pub(crate) struct Inner {
    pub(crate) memory: Mutex<HashMap<String, CacheEntry<Value>>>,
    pub(crate) bounded: Option<Arc<dyn DurableStore>>,
    pub(crate) large: LargeTier,
    pub(crate) pending_large_clear: AtomicBool,
    pub(crate) large_item_threshold: usize,
    pub(crate) default_ttl: Duration,
    pub(crate) schema_version: u32,
    pub(crate) gate_outcome: OnceLock<GateOutcome>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stats: StatsCollector,
    pub(crate) events: EventEmitter,
}

/// Response cache shared by every consumer in the process.
/// Clone is cheap - all clones share the same tiers and counters.
#[derive(Clone)]
pub struct CacheService {
    pub(crate) inner: Arc<Inner>,
}

pub struct CacheServiceBuilder {
    bounded: Option<Arc<dyn DurableStore>>,
    large_item_threshold: usize,
    default_ttl: Duration,
    schema_version: u32,
    clock: Arc<dyn Clock>,
}

impl Default for CacheServiceBuilder {
    fn default() -> Self {
        Self {
            bounded: None,
            large_item_threshold: DEFAULT_LARGE_ITEM_THRESHOLD_BYTES,
            default_ttl: Duration::from_millis(DEFAULT_TTL_MS),
            schema_version: CACHE_SCHEMA_VERSION,
            clock: Arc::new(SystemClock),
        }
    }
}

impl CacheServiceBuilder {
    pub fn bounded_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.bounded = Some(store);
        self
    }

    pub fn large_item_threshold(mut self, bytes: usize) -> Self {
        self.large_item_threshold = bytes;
        self
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the service and run the version gate before anything reads.
    pub fn build(self) -> CacheService {
        let service = CacheService {
            inner: Arc::new(Inner {
                memory: Mutex::new(HashMap::new()),
                bounded: self.bounded,
                large: LargeTier::default(),
                pending_large_clear: AtomicBool::new(false),
                large_item_threshold: self.large_item_threshold,
                default_ttl: self.default_ttl,
                schema_version: self.schema_version,
                gate_outcome: OnceLock::new(),
                clock: self.clock,
                stats: StatsCollector::default(),
                events: EventEmitter::new(),
            }),
        };
        let outcome = service.run_version_gate();
        let _ = service.inner.gate_outcome.set(outcome);
        service
    }
}

impl CacheService {
    pub fn builder() -> CacheServiceBuilder {
        CacheServiceBuilder::default()
    }

    /// Open file-backed tiers under the configured cache directory.
    ///
    /// A tier whose directory cannot be opened is left out and behaves as
    /// permanently empty; the service itself always comes up.
    pub async fn open(config: &CacheConfig, schema_version: u32) -> Self {
        let mut builder = Self::builder()
            .schema_version(schema_version)
            .large_item_threshold(config.large_item_threshold_bytes)
            .default_ttl(config.default_ttl());

        let bounded = config
            .bounded_dir()
            .map_err(|e| CacheError::PlatformUnavailable(e.to_string()))
            .and_then(|dir| FileStore::open(dir, config.bounded_capacity_bytes));
        match bounded {
            Ok(store) => builder = builder.bounded_store(Arc::new(store)),
            Err(e) => warn!(error = %e, "Bounded cache tier unavailable, continuing without it"),
        }
        let service = builder.build();

        let large = match config.large_dir() {
            Ok(dir) => FileLargeStore::open(dir).await,
            Err(e) => Err(CacheError::PlatformUnavailable(e.to_string())),
        };
        match large {
            Ok(store) => service.attach_large_store(Arc::new(store)).await,
            Err(e) => warn!(error = %e, "Large-item cache tier unavailable, continuing without it"),
        }
        service
    }

    /// Connect the large-item tier. A clear scheduled by the version gate
    /// runs before the store starts serving.
    pub async fn attach_large_store(&self, store: Arc<dyn LargeItemStore>) {
        if self.inner.pending_large_clear.swap(false, Ordering::SeqCst) {
            match store.clear().await {
                Ok(removed) => info!(removed, "Cleared large-item tier after schema change"),
                Err(e) => warn!(error = %e, "Failed to clear large-item tier after schema change"),
            }
        }
        self.inner.large.attach(store);
    }

    pub fn default_ttl(&self) -> Duration {
        self.inner.default_ttl
    }

    pub fn schema_version(&self) -> u32 {
        self.inner.schema_version
    }

    /// What the version gate did when this service was built
    pub fn gate_outcome(&self) -> GateOutcome {
        self.inner
            .gate_outcome
            .get()
            .copied()
            .unwrap_or(GateOutcome::Current)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub(crate) fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<Value>>> {
        self.inner.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn bounded(&self) -> Option<&dyn DurableStore> {
        self.inner.bounded.as_deref()
    }


    // =========================================================================
    // Reads
    // =========================================================================

    /// Synchronous read over memory and the bounded-durable tier.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let found = self.lookup_sync(key);
        self.finish_read(key, found)
    }

    /// Full read, falling through to the large-item tier on a miss.
    pub async fn get_async<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let found = match self.lookup_sync(key) {
            Some(value) => Some(value),
            None => self.lookup_large(key).await,
        };
        self.finish_read(key, found)
    }

    fn finish_read<T: DeserializeOwned>(&self, key: &str, found: Option<Value>) -> Option<T> {
        let Some(value) = found else {
            self.inner.stats.record_miss();
            return None;
        };
        match serde_json::from_value(value) {
            Ok(data) => {
                self.inner.stats.record_hit();
                Some(data)
            }
            Err(e) => {
                let err = CacheError::deserialization(key, e);
                debug!(error = %err, "Cached payload has an unexpected shape, discarding");
                self.remove(key);
                self.inner.stats.record_miss();
                None
            }
        }
    }

    fn lookup_sync(&self, key: &str) -> Option<Value> {
        let now = self.now();
        {
            let mut memory = self.memory();
            if let Some(entry) = memory.get(key) {
                if entry.is_valid_at(now) {
                    return Some(entry.data.clone());
                }
                memory.remove(key);
                self.inner.stats.record_expired();
            }
        }

        let entry = self.read_bounded(key, now)?;
        let data = entry.data.clone();
        self.memory().insert(key.to_string(), entry);
        Some(data)
    }

    fn read_bounded(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry<Value>> {
        let store = self.bounded()?;
        let storage_key = entry_storage_key(key);
        let raw = match store.get_item(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!(key, error = %e, "Bounded tier read failed");
                return None;
            }
        };
        match parse_record(key, &raw) {
            Ok(entry) if entry.is_valid_at(now) => Some(entry),
            Ok(_) => {
                self.remove_bounded_record(store, &storage_key);
                self.inner.stats.record_expired();
                None
            }
            Err(e) => {
                debug!(error = %e, "Removing corrupt bounded record");
                self.remove_bounded_record(store, &storage_key);
                None
            }
        }
    }

    async fn lookup_large(&self, key: &str) -> Option<Value> {
        let large = &self.inner.large;
        let store = large.store()?;
        if let Some(generation) = large.superseded(key) {
            debug!(key, "Large-item copy superseded, treating as a miss");
            let op = LargeOp::Delete {
                key: key.to_string(),
                generation: Some(generation),
            };
            large.run(op).await;
            return None;
        }
        let raw = match store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!(key, error = %e, "Large-item tier read failed");
                return None;
            }
        };
        match parse_record(key, &raw) {
            Ok(entry) if entry.is_valid_at(self.now()) => {
                let data = entry.data.clone();
                self.memory().insert(key.to_string(), entry);
                Some(data)
            }
            Ok(_) => {
                self.delete_large(key).await;
                self.inner.stats.record_expired();
                None
            }
            Err(e) => {
                debug!(error = %e, "Removing corrupt large-item record");
                self.delete_large(key).await;
                None
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `data` for `ttl`. Memory and the bounded tier are updated
    /// before this returns; large-item work is queued behind earlier
    /// large-item operations.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) {
        let Some(raw) = self.mirror(key, data, ttl) else {
            return;
        };
        if let Some(op) = self.route(key, raw) {
            self.inner.large.submit(op);
        }
    }

    /// Like [`set`](Self::set) but returns only once the durable write settled.
    pub async fn set_async<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) {
        let Some(raw) = self.mirror(key, data, ttl) else {
            return;
        };
        if let Some(op) = self.route(key, raw) {
            self.inner.large.run(op).await;
        }
    }

    /// Write the bounded side of a set, returning the large-item operation
    /// that keeps the key in exactly one durable tier.
    fn route(&self, key: &str, raw: String) -> Option<LargeOp> {
        let large = &self.inner.large;
        if raw.len() > self.inner.large_item_threshold {
            self.remove_bounded(key);
            if !large.is_attached() {
                debug!(key, "Large-item tier not attached, entry kept in memory only");
                return None;
            }
            Some(large.put(key, raw))
        } else {
            self.write_bounded(key, &raw);
            large.is_attached().then(|| large.supersede(key))
        }
    }

    /// Put the entry in memory and return its serialized durable record.
    fn mirror<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) -> Option<String> {
        let value = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %CacheError::Serialization(e), "Skipping cache write");
                return None;
            }
        };
        let entry = CacheEntry::new(key, value, self.now(), ttl);
        self.memory().insert(key.to_string(), entry.clone());
        match serde_json::to_string(&entry.into_record()) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(key, error = %CacheError::Serialization(e), "Keeping entry in memory only");
                None
            }
        }
    }

    fn write_bounded(&self, key: &str, raw: &str) {
        let Some(store) = self.bounded() else {
            return;
        };
        if let Err(e) = self.try_write_bounded(store, key, raw) {
            warn!(key, error = %e, "Durable write failed, entry kept in memory only");
            // An older record for this key must not outlive the failed overwrite
            self.remove_bounded_record(store, &entry_storage_key(key));
        }
    }

    fn try_write_bounded(&self, store: &dyn DurableStore, key: &str, raw: &str) -> CacheResult<()> {
        let storage_key = entry_storage_key(key);
        let size = record_size(&storage_key, raw);
        let capacity = store.capacity_bytes();
        if size > capacity {
            return Err(CacheError::QuotaExceeded {
                needed: size,
                available: capacity,
            });
        }

        let existing = store.item_size(&storage_key)?.unwrap_or(0);
        let projected = store.used_bytes()?.saturating_sub(existing) + size;
        if projected > capacity {
            self.evict_oldest(projected - capacity, Some(key));
        }

        match store.set_item(&storage_key, raw) {
            Err(e) if e.is_quota() => {
                debug!(key, size, "Quota exceeded, evicting aggressively and retrying");
                self.evict_oldest(size * 2 + capacity / 10, Some(key));
                store.set_item(&storage_key, raw)
            }
            other => other,
        }
    }

    async fn delete_large(&self, key: &str) {
        let op = LargeOp::Delete {
            key: key.to_string(),
            generation: None,
        };
        self.inner.large.run(op).await;
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Drop one key from every tier.
    pub fn remove(&self, key: &str) {
        self.memory().remove(key);
        self.remove_bounded(key);
        let large = &self.inner.large;
        if large.is_attached() {
            large.submit(large.supersede(key));
        }
    }

    /// Like [`remove`](Self::remove) but waits for the large-item tier.
    pub async fn remove_async(&self, key: &str) {
        self.memory().remove(key);
        self.remove_bounded(key);
        let large = &self.inner.large;
        if large.is_attached() {
            large.run(large.supersede(key)).await;
        }
    }

    fn remove_bounded(&self, key: &str) {
        if let Some(store) = self.bounded() {
            self.remove_bounded_record(store, &entry_storage_key(key));
        }
    }

    pub(crate) fn remove_bounded_record(&self, store: &dyn DurableStore, storage_key: &str) {
        if let Err(e) = store.remove_item(storage_key) {
            debug!(key = storage_key, error = %e, "Failed to remove bounded record");
        }
    }

    /// Wipe every tier.
    pub async fn clear_all(&self) -> usize {
        let mut removed = self.clear_sync_tiers(|_| true).len();
        if self.inner.large.is_attached() {
            removed += self.inner.large.run(LargeOp::Clear).await;
        }
        self.inner.stats.record_clear();
        self.inner.events.emit(CacheEvent::Cleared {
            scope: ClearScope::All,
            removed,
        });
        info!(removed, "Cache cleared");
        removed
    }

    /// Remove every entry whose key was generated for `type_label`.
    /// Memory and the bounded tier are cleared before this returns; the
    /// large-item tier is cleared in the background.
    pub fn clear_by_type(&self, type_label: &str) -> usize {
        let removed = self.clear_type_sync(type_label);
        if self.inner.large.is_attached() {
            self.inner.large.submit(LargeOp::ClearPrefix {
                prefix: type_prefix(type_label),
            });
        }
        self.finish_type_clear(type_label, removed)
    }

    /// Like [`clear_by_type`](Self::clear_by_type) but waits for the large-item tier.
    pub async fn clear_by_type_async(&self, type_label: &str) -> usize {
        let removed = self.clear_type_sync(type_label) + self.clear_large_by_type(type_label).await;
        self.finish_type_clear(type_label, removed)
    }

    fn clear_type_sync(&self, type_label: &str) -> usize {
        let prefix = type_prefix(type_label);
        self.clear_sync_tiers(|key| key.starts_with(&prefix)).len()
    }

    fn finish_type_clear(&self, type_label: &str, removed: usize) -> usize {
        self.inner.stats.record_clear();
        self.inner.events.emit(CacheEvent::Cleared {
            scope: ClearScope::Type(type_label.to_string()),
            removed,
        });
        info!(type_label, removed, "Cache type cleared");
        removed
    }

    async fn clear_large_by_type(&self, type_label: &str) -> usize {
        if !self.inner.large.is_attached() {
            return 0;
        }
        let prefix = type_prefix(type_label);
        self.inner.large.run(LargeOp::ClearPrefix { prefix }).await
    }

    /// Remove matching entries from memory and the bounded tier, returning
    /// the distinct keys removed.
    pub(crate) fn clear_sync_tiers(&self, matches: impl Fn(&str) -> bool) -> HashSet<String> {
        let mut removed = HashSet::new();
        self.memory().retain(|key, _| {
            if matches(key) {
                removed.insert(key.clone());
                false
            } else {
                true
            }
        });

        let Some(store) = self.bounded() else {
            return removed;
        };
        let keys = match store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to list bounded tier");
                return removed;
            }
        };
        for storage_key in keys {
            let Some(key) = storage_key.strip_prefix(ENTRY_PREFIX) else {
                continue;
            };
            if matches(key) {
                self.remove_bounded_record(store, &storage_key);
                removed.insert(key.to_string());
            }
        }
        removed
    }

    /// Sweep memory and the bounded tier for expired or unreadable records.
    /// Returns the number of distinct keys removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.now();
        let mut expired = HashSet::new();
        self.memory().retain(|key, entry| {
            let keep = entry.is_valid_at(now);
            if !keep {
                expired.insert(key.clone());
            }
            keep
        });

        let mut corrupt = 0;
        if let Some(store) = self.bounded() {
            for storage_key in store.keys().unwrap_or_default() {
                let Some(key) = storage_key.strip_prefix(ENTRY_PREFIX) else {
                    continue;
                };
                let Ok(Some(raw)) = store.get_item(&storage_key) else {
                    continue;
                };
                match parse_record(key, &raw) {
                    Ok(entry) if entry.is_valid_at(now) => {}
                    Ok(_) => {
                        self.remove_bounded_record(store, &storage_key);
                        expired.insert(key.to_string());
                    }
                    Err(e) => {
                        debug!(error = %e, "Removing corrupt bounded record");
                        self.remove_bounded_record(store, &storage_key);
                        corrupt += 1;
                    }
                }
            }
        }

        for _ in 0..expired.len() {
            self.inner.stats.record_expired();
        }
        debug!(expired = expired.len(), corrupt, "Pruned expired entries");
        expired.len() + corrupt
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Metadata for a key held in memory or the bounded tier.
    /// Does not count as a read and does not promote.
    pub fn inspect(&self, key: &str) -> Option<EntryInfo> {
        let now = self.now();
        if let Some(entry) = self.memory().get(key) {
            let size = serde_json::to_string(&entry.clone().into_record())
                .map(|raw| record_size(&entry_storage_key(key), &raw))
                .unwrap_or(0);
            return Some(EntryInfo::describe(entry, Tier::Memory, size, now));
        }

        let store = self.bounded()?;
        let storage_key = entry_storage_key(key);
        let raw = store.get_item(&storage_key).ok().flatten()?;
        let entry = parse_record(key, &raw).ok()?;
        Some(EntryInfo::describe(
            &entry,
            Tier::Bounded,
            record_size(&storage_key, &raw),
            now,
        ))
    }

    pub fn stats(&self) -> CacheStats {
        let memory_entries = self.memory().len();
        let persistent_entries = self
            .bounded()
            .and_then(|store| store.keys().ok())
            .map(|keys| keys.iter().filter(|k| k.starts_with(ENTRY_PREFIX)).count())
            .unwrap_or(0);
        self.inner.stats.snapshot(memory_entries, persistent_entries)
    }
}

pub(crate) fn parse_record(key: &str, raw: &str) -> CacheResult<CacheEntry<Value>> {
    serde_json::from_str::<StoredRecord<Value>>(raw)
        .map(|record| record.into_entry(key))
        .map_err(|e| CacheError::deserialization(key, e))
}
