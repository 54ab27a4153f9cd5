//! Cache statistics and operation reports

use crate::entry::CacheEntry;
use serde::{Deserialize, Serialize};

/// Snapshot of the cache index. Computed from metadata only, no I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of cached tracks
    pub count: usize,

    /// Sum of recorded file sizes
    pub total_bytes: u64,

    /// Mean file size, 0 when the cache is empty
    pub average_bytes: u64,

    /// Cached track ids, sorted
    pub ids: Vec<String>,
}

impl CacheStats {
    pub fn from_entries(entries: &[CacheEntry]) -> Self {
        let count = entries.len();
        let total_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let average_bytes = if count == 0 {
            0
        } else {
            total_bytes / count as u64
        };

        let mut ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        ids.sort();

        Self {
            count,
            total_bytes,
            average_bytes,
            ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total size for display, e.g. "12.4 MB".
    pub fn total_size_string(&self) -> String {
        format_bytes(self.total_bytes)
    }

    /// Average size for display.
    pub fn average_size_string(&self) -> String {
        format_bytes(self.average_bytes)
    }
}

/// Result of caching a batch of tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Tracks passed in
    pub requested: usize,

    /// Tracks available offline afterwards (including ones already cached)
    pub cached: usize,

    /// Tracks whose download failed
    pub failed: usize,

    /// Tracks not attempted because the device was offline
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn all_cached(&self) -> bool {
        self.cached == self.requested
    }
}

/// Result of a validation sweep over the cache index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Entries examined
    pub checked: usize,

    /// Entries evicted because their file was missing or empty
    pub evicted: usize,

    /// Files in the cache directory no entry referred to
    pub orphans_removed: usize,
}

/// Format a byte count as human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
