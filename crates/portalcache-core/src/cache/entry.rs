use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached value with its expiry bookkeeping.
///
/// `expires_at` is always `created_at + ttl`; an entry is valid while
/// `now < expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, data: T, created_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            data,
            created_at,
            ttl,
            expires_at: expiry_for(created_at, ttl),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn into_record(self) -> StoredRecord<T> {
        StoredRecord {
            data: self.data,
            created_at: self.created_at,
            ttl_ms: self.ttl.as_millis() as i64,
            expires_at: self.expires_at,
        }
    }
}

/// Saturates instead of overflowing for absurdly long TTLs
fn expiry_for(created_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// On-disk shape shared by both durable tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord<T> {
    pub data: T,
    #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "ttl")]
    pub ttl_ms: i64,
    #[serde(rename = "expiresAt", with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl<T> StoredRecord<T> {
    pub fn into_entry(self, key: impl Into<String>) -> CacheEntry<T> {
        CacheEntry {
            key: key.into(),
            data: self.data,
            created_at: self.created_at,
            ttl: Duration::from_millis(self.ttl_ms.max(0) as u64),
            expires_at: self.expires_at,
        }
    }
}

/// Which tier answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Bounded,
    Large,
}

/// Metadata about a cached key, without its payload.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: usize,
    pub age: String,
}

impl EntryInfo {
    pub(crate) fn describe<T>(
        entry: &CacheEntry<T>,
        tier: Tier,
        size_bytes: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: entry.key.clone(),
            tier,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            size_bytes,
            age: age_display(now - entry.created_at),
        }
    }
}

/// Human-readable age, e.g. "just now", "5m ago", "2h ago", "3d ago".
pub fn age_display(age: chrono::Duration) -> String {
    let minutes = age.num_minutes();
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}
