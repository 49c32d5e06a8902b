//! Response cache in front of the learning-management API.
//!
//! This module provides the `CacheService`, a three-tier store:
//!
//! - volatile process memory
//! - a bounded-durable store for small records, with a hard byte budget
//! - a large-item-durable store for records above the size threshold
//!
//! A schema version gate wipes all tiers when the payload shape changes
//! between deployments, and `cached` turns any async producer into a
//! memoized one keyed by `generate_key`.

pub mod entry;
pub mod events;
pub mod eviction;
pub mod key;
mod large_tier;
pub mod memoize;
pub mod service;
pub mod stats;
pub mod version;

pub use entry::{age_display, CacheEntry, EntryInfo, StoredRecord, Tier};
pub use events::{CacheEvent, ClearScope};
pub use eviction::EvictionReport;
pub use key::{generate_key, type_prefix};
pub use memoize::CachedProducer;
pub use service::{CacheService, CacheServiceBuilder};
pub use stats::CacheStats;
pub use version::{GateOutcome, CACHE_SCHEMA_VERSION};
