//! Cache configuration management.
//!
//! Settings are stored at `~/.config/portalcache/config.json`. A missing file
//! yields the defaults; `PORTALCACHE_DIR` and `PORTALCACHE_CAPACITY_BYTES`
//! override the file when set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "portalcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Budget for the bounded-durable tier.
/// Sits just under the 5 MiB ceiling typical of small key-value platform stores.
pub const DEFAULT_BOUNDED_CAPACITY_BYTES: usize = 4_500 * 1024;

/// Records larger than this skip the bounded tier and go to the large-item tier.
pub const DEFAULT_LARGE_ITEM_THRESHOLD_BYTES: usize = 100 * 1024;

/// Five minutes keeps report tables fresh without hammering the remote API.
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

const ENV_CACHE_DIR: &str = "PORTALCACHE_DIR";
const ENV_CAPACITY: &str = "PORTALCACHE_CAPACITY_BYTES";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: Option<PathBuf>,
    pub bounded_capacity_bytes: usize,
    pub large_item_threshold_bytes: usize,
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            bounded_capacity_bytes: DEFAULT_BOUNDED_CAPACITY_BYTES,
            large_item_threshold_bytes: DEFAULT_LARGE_ITEM_THRESHOLD_BYTES,
            default_ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl CacheConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(ENV_CACHE_DIR) {
            if !dir.is_empty() {
                self.cache_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(raw) = std::env::var(ENV_CAPACITY) {
            match raw.parse() {
                Ok(bytes) => self.bounded_capacity_bytes = bytes,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid capacity override"),
            }
        }
    }

    /// Root directory for all durable tiers
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn bounded_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("bounded"))
    }

    pub fn large_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("large"))
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"bounded_capacity_bytes": 2048}"#).unwrap();
        assert_eq!(config.bounded_capacity_bytes, 2048);
        assert_eq!(config.large_item_threshold_bytes, DEFAULT_LARGE_ITEM_THRESHOLD_BYTES);
        assert_eq!(config.default_ttl(), Duration::from_millis(DEFAULT_TTL_MS));
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let config = CacheConfig {
            cache_dir: Some(PathBuf::from("/tmp/portal")),
            ..Default::default()
        };
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/portal"));
        assert_eq!(config.large_dir().unwrap(), PathBuf::from("/tmp/portal/large"));
    }
}
