use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters. Never persisted.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    clears: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCollector {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, memory_entries: usize, persistent_entries: usize) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            expired: self.expired.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_entries,
            persistent_entries,
            hit_rate: hit_rate(hits, misses),
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Observability snapshot; has no effect on cache behavior.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub clears: u64,
    pub evictions: u64,
    pub memory_entries: usize,
    pub persistent_entries: usize,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_without_reads() {
        let stats = StatsCollector::default().snapshot(0, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn test_counters() {
        let collector = StatsCollector::default();
        collector.record_hit();
        collector.record_hit();
        collector.record_hit();
        collector.record_miss();
        collector.record_expired();
        collector.record_clear();
        collector.record_evictions(4);

        let stats = collector.snapshot(2, 1);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.clears, 1);
        assert_eq!(stats.evictions, 4);
        assert_eq!(stats.memory_entries, 2);
        assert_eq!(stats.persistent_entries, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }
}
