//! Large-item-durable tier: bigger records, asynchronous access.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::debug;

use super::{decode_file_name, encode_file_name};
use crate::error::{CacheError, CacheResult};

#[async_trait]
pub trait LargeItemStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn put(&self, key: &str, value: String) -> CacheResult<()>;
    async fn delete(&self, key: &str) -> CacheResult<()>;
    async fn keys(&self) -> CacheResult<Vec<String>>;

    /// Remove every record, returning how many were removed
    async fn clear(&self) -> CacheResult<usize>;
}

// ============================================================================
// File-backed store
// ============================================================================

pub struct FileLargeStore {
    dir: PathBuf,
}

impl FileLargeStore {
    pub async fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            CacheError::PlatformUnavailable(format!("{}: {}", dir.display(), e))
        })?;
        debug!(dir = %dir.display(), "Opened large-item store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_path(&self, key: &str) -> PathBuf {
        self.dir.join(encode_file_name(key))
    }
}

#[async_trait]
impl LargeItemStore for FileLargeStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        match tokio::fs::read_to_string(self.item_path(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: String) -> CacheResult<()> {
        tokio::fs::write(self.item_path(key), value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match tokio::fs::remove_file(self.item_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(key) = entry.file_name().to_str().and_then(decode_file_name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn clear(&self) -> CacheResult<usize> {
        let keys = self.keys().await?;
        let results = join_all(keys.iter().map(|key| self.delete(key))).await;
        results.into_iter().collect::<CacheResult<Vec<_>>>()?;
        Ok(keys.len())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
pub struct MemoryLargeStore {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryLargeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LargeItemStore for MemoryLargeStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> CacheResult<()> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.items.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.items.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> CacheResult<usize> {
        let mut items = self.items.write().await;
        let removed = items.len();
        items.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_large_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLargeStore::open(dir.path().join("large")).await.unwrap();

        store.put("reports:1f", "payload".to_string()).await.unwrap();
        assert_eq!(store.get("reports:1f").await.unwrap().as_deref(), Some("payload"));
        assert_eq!(store.keys().await.unwrap(), vec!["reports:1f".to_string()]);

        assert_eq!(store.clear().await.unwrap(), 1);
        assert_eq!(store.get("reports:1f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_large_store_delete_missing_is_ok() {
        let store = MemoryLargeStore::new();
        store.delete("nothing").await.unwrap();
        store.put("a", "1".into()).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
