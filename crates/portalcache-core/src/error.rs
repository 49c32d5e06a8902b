use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage unavailable: {0}")]
    PlatformUnavailable(String),

    #[error("Storage quota exceeded - needed {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Failed to parse cached record {key}: {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize cache value: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maximum length of a key echoed back in log output
const MAX_LOGGED_KEY_LENGTH: usize = 120;

impl CacheError {
    pub fn deserialization(key: &str, source: serde_json::Error) -> Self {
        CacheError::Deserialization {
            key: Self::truncate_key(key),
            source,
        }
    }

    /// True for failures that a retry after freeing space could fix
    pub fn is_quota(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }

    fn truncate_key(key: &str) -> String {
        if key.len() <= MAX_LOGGED_KEY_LENGTH {
            key.to_string()
        } else {
            let head: String = key.chars().take(MAX_LOGGED_KEY_LENGTH).collect();
            format!("{}... (truncated, {} total bytes)", head, key.len())
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_detection() {
        let err = CacheError::QuotaExceeded {
            needed: 10,
            available: 2,
        };
        assert!(err.is_quota());
        assert!(!CacheError::PlatformUnavailable("gone".into()).is_quota());
    }

    #[test]
    fn test_long_keys_truncated() {
        let source = serde_json::from_str::<u8>("x").unwrap_err();
        let err = CacheError::deserialization(&"k".repeat(500), source);
        let message = err.to_string();
        assert!(message.contains("truncated, 500 total bytes"));
    }
}
