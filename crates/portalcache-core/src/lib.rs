//! Core library for portalcache - tiered response cache, storage backends,
//! configuration.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod storage;

pub use cache::{
    generate_key, CacheEvent, CacheService, CacheServiceBuilder, CacheStats, CachedProducer,
    ClearScope, EntryInfo, EvictionReport, GateOutcome, Tier, CACHE_SCHEMA_VERSION,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
