//! Cache configuration

use crate::error::{CacheError, Result};
use std::time::Duration;

/// Default name of the directory (under the host cache directory) holding track files.
pub const DEFAULT_CACHE_DIRECTORY: &str = "audio_cache";

/// Default settings key holding the JSON cache index.
pub const DEFAULT_METADATA_KEY: &str = "audio_cache_metadata_v2";

/// Configuration for the audio cache manager.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory for track files, relative to the host cache directory
    pub cache_directory: String,

    /// Settings key the index is persisted under
    pub metadata_key: String,

    /// Extension given to cached track files (default: mp3)
    pub file_extension: String,

    /// Number of transfers allowed to run at once (default: 3)
    pub max_concurrent_downloads: usize,

    /// Wall-clock budget for a single transfer (default: 100s)
    pub download_timeout: Duration,

    /// How long a file check stays trusted (default: 60s)
    pub validation_ttl: Duration,

    /// How long a connectivity observation stays trusted (default: 5s)
    pub reachability_recheck: Duration,

    /// Entries checked concurrently by the startup sweep (default: 5)
    pub sweep_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: DEFAULT_CACHE_DIRECTORY.to_string(),
            metadata_key: DEFAULT_METADATA_KEY.to_string(),
            file_extension: "mp3".to_string(),
            max_concurrent_downloads: 3,
            download_timeout: Duration::from_secs(100),
            validation_ttl: Duration::from_secs(60),
            reachability_recheck: Duration::from_secs(5),
            sweep_batch_size: 5,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set cache directory name.
    pub fn with_cache_directory(mut self, dir: impl Into<String>) -> Self {
        self.cache_directory = dir.into();
        self
    }

    /// Set the settings key used for the index.
    pub fn with_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.metadata_key = key.into();
        self
    }

    /// Set the extension of cached files.
    pub fn with_file_extension(mut self, extension: impl Into<String>) -> Self {
        self.file_extension = extension.into();
        self
    }

    /// Set maximum concurrent downloads.
    pub fn with_max_concurrent_downloads(mut self, count: usize) -> Self {
        self.max_concurrent_downloads = count;
        self
    }

    /// Set download timeout.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    /// Set how long validation judgments are reused.
    pub fn with_validation_ttl(mut self, ttl: Duration) -> Self {
        self.validation_ttl = ttl;
        self
    }

    /// Set how long a connectivity observation is reused.
    pub fn with_reachability_recheck(mut self, interval: Duration) -> Self {
        self.reachability_recheck = interval;
        self
    }

    /// Set the startup sweep batch size.
    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(invalid("max_concurrent_downloads must be at least 1"));
        }

        if self.cache_directory.trim().is_empty() {
            return Err(invalid("cache_directory cannot be empty"));
        }

        if self.cache_directory.contains("..") {
            return Err(invalid("cache_directory must stay inside the cache root"));
        }

        if self.metadata_key.trim().is_empty() {
            return Err(invalid("metadata_key cannot be empty"));
        }

        if self.file_extension.is_empty()
            || !self
                .file_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid("file_extension must be non-empty and alphanumeric"));
        }

        if self.download_timeout.is_zero() {
            return Err(invalid("download_timeout must be greater than 0"));
        }

        if self.sweep_batch_size == 0 {
            return Err(invalid("sweep_batch_size must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> CacheError {
    CacheError::InvalidConfig(message.to_string())
}
