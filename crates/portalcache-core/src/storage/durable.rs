//! Bounded-durable tier: small records, synchronous access, hard byte quota.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use super::{decode_file_name, encode_file_name};
use crate::error::{CacheError, CacheResult};

/// Synchronous key-value store with a strict capacity ceiling.
///
/// Usage is measured as key bytes plus value bytes per record. Writes that
/// would push usage past `capacity_bytes()` fail with
/// [`CacheError::QuotaExceeded`] and leave the store untouched.
pub trait DurableStore: Send + Sync {
    fn get_item(&self, key: &str) -> CacheResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> CacheResult<()>;
    fn remove_item(&self, key: &str) -> CacheResult<()>;
    fn keys(&self) -> CacheResult<Vec<String>>;
    fn used_bytes(&self) -> CacheResult<usize>;
    fn capacity_bytes(&self) -> usize;

    /// Size a record occupies against the quota, if present
    fn item_size(&self, key: &str) -> CacheResult<Option<usize>> {
        Ok(self.get_item(key)?.map(|value| record_size(key, &value)))
    }
}

pub(crate) fn record_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

fn check_quota(used: usize, existing: usize, incoming: usize, capacity: usize) -> CacheResult<()> {
    let projected = used.saturating_sub(existing) + incoming;
    if projected > capacity {
        return Err(CacheError::QuotaExceeded {
            needed: incoming,
            available: capacity.saturating_sub(used.saturating_sub(existing)),
        });
    }
    Ok(())
}

// ============================================================================
// File-backed store
// ============================================================================

/// One JSON file per key under a directory.
pub struct FileStore {
    dir: PathBuf,
    capacity: usize,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    /// A directory that cannot be created means the platform has no usable storage.
    pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> CacheResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            CacheError::PlatformUnavailable(format!("{}: {}", dir.display(), e))
        })?;
        debug!(dir = %dir.display(), capacity, "Opened bounded store");
        Ok(Self { dir, capacity })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(encode_file_name(key))
    }

    fn entries(&self) -> CacheResult<Vec<(String, u64)>> {
        let mut out = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(key) = name.to_str().and_then(decode_file_name) else {
                continue;
            };
            let len = dirent.metadata()?.len();
            out.push((key, len));
        }
        Ok(out)
    }
}

impl DurableStore for FileStore {
    fn get_item(&self, key: &str) -> CacheResult<Option<String>> {
        match std::fs::read_to_string(self.item_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> CacheResult<()> {
        let path = self.item_path(key);
        let existing = match std::fs::metadata(&path) {
            Ok(meta) => key.len() + meta.len() as usize,
            Err(_) => 0,
        };
        check_quota(self.used_bytes()?, existing, record_size(key, value), self.capacity)?;
        std::fs::write(path, value)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        match std::fs::remove_file(self.item_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|(key, _)| key).collect())
    }

    fn used_bytes(&self) -> CacheResult<usize> {
        Ok(self
            .entries()?
            .iter()
            .map(|(key, len)| key.len() + *len as usize)
            .sum())
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store with the same quota semantics as [`FileStore`].
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, String>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DurableStore for MemoryStore {
    fn get_item(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> CacheResult<()> {
        let mut items = self.lock();
        let used: usize = items.iter().map(|(k, v)| record_size(k, v)).sum();
        let existing = items.get(key).map(|v| record_size(key, v)).unwrap_or(0);
        check_quota(used, existing, record_size(key, value), self.capacity)?;
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> CacheResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn used_bytes(&self) -> CacheResult<usize> {
        Ok(self.lock().iter().map(|(k, v)| record_size(k, v)).sum())
    }

    fn capacity_bytes(&self) -> usize {
        self.capacity
    }
}
