//! Filesystem core configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest write that is still buffered; anything shorter flushes immediately
pub const MIN_CHUNK: usize = 4096;

/// Configuration consumed by the cache, the handle table and the transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// TTL for cached metadata in seconds
    pub cache_ttl_secs: u64,
    /// Bytes buffered per handle before an upload chunk is sent
    pub write_cache_bytes: usize,
    /// TTL for negative lookups (paths confirmed not to exist) in seconds
    pub negative_ttl_secs: u64,
    /// Number of file handles that may be open at once
    pub max_handles: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 120,
            write_cache_bytes: 4 * 1024 * 1024,
            negative_ttl_secs: 10,
            max_handles: 8192,
        }
    }
}

impl FsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        // Never remember a miss for longer than a positive entry
        Duration::from_secs(self.negative_ttl_secs.min(self.cache_ttl_secs))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_cache_bytes < MIN_CHUNK {
            return Err(ConfigError::WriteCacheTooSmall(self.write_cache_bytes));
        }
        if self.max_handles == 0 {
            return Err(ConfigError::NoHandles);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("The minimum write cache is {MIN_CHUNK} bytes, got {0}")]
    WriteCacheTooSmall(usize),
    #[error("max_handles must be at least 1")]
    NoHandles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_ttl(), Duration::from_secs(120));
        assert_eq!(config.write_cache_bytes, 4_194_304);
    }

    #[test]
    fn test_write_cache_minimum() {
        let config = FsConfig {
            write_cache_bytes: 4095,
            ..FsConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WriteCacheTooSmall(4095))
        ));

        let config = FsConfig {
            write_cache_bytes: MIN_CHUNK,
            ..FsConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_ttl_bounded_by_cache_ttl() {
        let config = FsConfig {
            cache_ttl_secs: 0,
            ..FsConfig::default()
        };
        assert_eq!(config.negative_ttl(), Duration::ZERO);
    }
}
