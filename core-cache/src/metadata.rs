//! # Cache Index
//!
//! In-memory map of [`CacheEntry`] records mirrored to a single JSON value in
//! the host [`SettingsStore`].
//!
//! Reads are synchronous so playback can answer "is this cached?" without
//! awaiting. Every mutation persists the full map; writes are serialized and
//! each one snapshots the map while holding the persist lock, so the last
//! write to land always reflects the latest state.

use crate::entry::CacheEntry;
use crate::error::Result;
use bridge_traits::SettingsStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct MetadataStore {
    settings: Arc<dyn SettingsStore>,
    key: String,
    entries: RwLock<HashMap<String, CacheEntry>>,
    persist_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(settings: Arc<dyn SettingsStore>, key: impl Into<String>) -> Self {
        Self {
            settings,
            key: key.into(),
            entries: RwLock::new(HashMap::new()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Load the persisted index, replacing the in-memory map.
    ///
    /// A missing value yields an empty index. A value that fails to parse is
    /// logged and treated as empty; it is overwritten on the next mutation.
    pub async fn load(&self) -> Result<usize> {
        let raw = self.settings.get_string(&self.key).await?;

        let loaded = match raw {
            None => HashMap::new(),
            Some(json) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&json) {
                Ok(map) => map,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Discarding unreadable cache index");
                    HashMap::new()
                }
            },
        };

        let count = loaded.len();
        *self.entries.write() = loaded;
        debug!(entries = count, "Cache index loaded");
        Ok(count)
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Sum of recorded sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries.read().values().map(|e| e.size_bytes).sum()
    }

    pub async fn upsert(&self, entry: CacheEntry) {
        self.entries.write().insert(entry.id.clone(), entry);
        self.persist().await;
    }

    /// Remove an entry. Returns the removed record, if any.
    pub async fn remove(&self, id: &str) -> Option<CacheEntry> {
        let removed = self.entries.write().remove(id);
        if removed.is_some() {
            self.persist().await;
        }
        removed
    }

    /// Remove `id` only while it still holds the given commit.
    ///
    /// Used by eviction so a fresh download that replaced the entry after it
    /// was judged stale is left alone.
    pub async fn remove_if_same(&self, expected: &CacheEntry) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(&expected.id) {
                Some(current) if current.same_commit(expected) => {
                    entries.remove(&expected.id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.persist().await;
        }
        removed
    }

    /// Drop every entry and delete the persisted value. Returns the number
    /// of entries dropped.
    pub async fn clear(&self) -> usize {
        let _guard = self.persist_lock.lock().await;
        let dropped = {
            let mut entries = self.entries.write();
            let count = entries.len();
            entries.clear();
            count
        };

        if let Err(e) = self.settings.delete(&self.key).await {
            warn!(key = %self.key, error = %e, "Failed to delete cache index");
        }
        dropped
    }

    /// Stamp `last_validated_epoch_ms` on the given entries with one write.
    pub async fn mark_validated(&self, ids: &[String], at_epoch_ms: i64) {
        if ids.is_empty() {
            return;
        }

        let touched = {
            let mut entries = self.entries.write();
            let mut touched = 0;
            for id in ids {
                if let Some(entry) = entries.get_mut(id) {
                    entry.last_validated_epoch_ms = Some(at_epoch_ms);
                    touched += 1;
                }
            }
            touched
        };

        if touched > 0 {
            self.persist().await;
        }
    }

    /// Write the current map. Failures are logged; the in-memory map stays
    /// authoritative for this session.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;

        let json = {
            let entries = self.entries.read();
            serde_json::to_string(&*entries)
        };

        let json = match json {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode cache index");
                return;
            }
        };

        if let Err(e) = self.settings.set_string(&self.key, &json).await {
            warn!(key = %self.key, error = %e, "Failed to persist cache index");
        }
    }
}
