//! # Cache Error Types
//!
//! Errors raised inside the cache. Playback-facing operations on
//! [`AudioCacheManager`](crate::AudioCacheManager) never return these; they
//! degrade to `false` or to the remote URL and log the cause instead.

use bridge_traits::BridgeError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while caching audio.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Initialization has not completed (or failed and will be retried).
    #[error("Cache manager not initialized")]
    NotInitialized,

    /// Configuration values are out of range.
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// Track id is empty or otherwise unusable.
    #[error("Invalid track id: {0:?}")]
    InvalidTrackId(String),

    /// Cache directory or track file could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache index could not be encoded or decoded.
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Remote transfer failed (connection, non-2xx status, broken stream).
    #[error("Download failed: {0}")]
    Download(String),

    /// Transfer exceeded its wall-clock budget.
    #[error("Download timed out after {0:?}")]
    Timeout(Duration),

    /// Reachability check reported no connectivity.
    #[error("Device is offline")]
    Offline,

    /// Transfer finished but produced an empty file.
    #[error("Downloaded file is empty")]
    EmptyDownload,

    /// Error surfaced by a host bridge.
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl CacheError {
    /// Whether retrying later could succeed without any local change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::Download(_) | CacheError::Timeout(_) | CacheError::Offline
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Metadata(err.to_string())
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
