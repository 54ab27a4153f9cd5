//! Cache entries and on-disk file naming.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Record of one cached track, persisted inside the JSON index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Track identifier (e.g. surah number).
    pub id: String,
    /// Remote URL the file was fetched from.
    pub source_url: String,
    /// Absolute path of the cached file.
    pub local_path: PathBuf,
    /// When the download was committed (unix millis).
    pub cached_at_epoch_ms: i64,
    /// Size of the file when it was committed.
    pub size_bytes: u64,
    /// Last time the startup sweep confirmed the file (unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_epoch_ms: Option<i64>,
    /// Ticket of the transfer that wrote the file. Not persisted; entries
    /// loaded from the index carry 0.
    #[serde(skip)]
    pub(crate) commit: u64,
}

impl CacheEntry {
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        local_path: PathBuf,
        cached_at_epoch_ms: i64,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            local_path,
            cached_at_epoch_ms,
            size_bytes,
            last_validated_epoch_ms: None,
            commit: 0,
        }
    }

    pub(crate) fn with_commit(mut self, ticket: u64) -> Self {
        self.commit = ticket;
        self
    }

    /// Same file committed by the same download.
    pub(crate) fn same_commit(&self, other: &CacheEntry) -> bool {
        self.commit == other.commit
            && self.local_path == other.local_path
            && self.cached_at_epoch_ms == other.cached_at_epoch_ms
            && self.size_bytes == other.size_bytes
    }
}

/// Derive the file name used for a track.
///
/// Ids made of `[A-Za-z0-9_-]` map to `<id>.<ext>` unchanged. Any other
/// character becomes `_`, and a digest of the raw id is appended after a
/// `.`, which plain ids cannot contain, so no two ids share a file.
pub fn cache_file_name(id: &str, extension: &str) -> Result<String> {
    if id.trim().is_empty() {
        return Err(CacheError::InvalidTrackId(id.to_string()));
    }

    let sanitized: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized == id {
        return Ok(format!("{}.{}", sanitized, extension));
    }

    let digest = Sha256::digest(id.as_bytes());
    let suffix: String = digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect();

    Ok(format!("{}.{}.{}", sanitized, suffix, extension))
}
