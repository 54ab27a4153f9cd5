//! # Audio Cache Manager
//!
//! Facade the player talks to for offline recitations.
//!
//! The manager:
//! - Lazily initializes on first use (directory, persisted index, background
//!   validation sweep, connectivity subscription)
//! - Resolves a track to a local file when a valid copy exists, otherwise to
//!   its remote URL
//! - Deduplicates and throttles downloads through the [`DownloadCoordinator`]
//! - Self-heals when files disappear behind its back
//!
//! Playback-facing operations never return errors. Failures are logged and
//! surface as `false`, an empty report, or the remote URL.
//!
//! ## Example
//!
//! ```rust,ignore
//! use core_cache::{AudioCacheManager, CacheConfig};
//!
//! let manager = AudioCacheManager::new(CacheConfig::default(), &core_config)
//!     .with_event_bus(event_bus.clone());
//! manager.initialize().await?;
//!
//! let uri = manager
//!     .resolve_playable_uri("001", "https://server8.mp3quran.net/afs/001.mp3")
//!     .await;
//! ```

use crate::config::CacheConfig;
use crate::context::{PlaybackContext, Track};
use crate::coordinator::{is_part_file, CoordinatorParts, DownloadCoordinator, EntryCheck};
use crate::entry::{cache_file_name, CacheEntry};
use crate::error::Result;
use crate::events::EventEmitter;
use crate::metadata::MetadataStore;
use crate::reachability::Reachability;
use crate::stats::{BatchOutcome, CacheStats, SweepReport};
use crate::validation::ValidationCache;
use bridge_traits::{Clock, FileSystemAccess};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CacheEvent, EventBus};
use core_runtime::logging::{redact_url, strip_path};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Cheaply cloneable handle to the offline audio cache.
#[derive(Clone)]
pub struct AudioCacheManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: CacheConfig,
    fs: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    metadata: Arc<MetadataStore>,
    validation: Arc<ValidationCache>,
    reachability: Arc<Reachability>,
    coordinator: Arc<DownloadCoordinator>,
    events: Arc<EventEmitter>,
    cache_dir: OnceCell<PathBuf>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}

impl AudioCacheManager {
    /// Create a manager over the bridges in `core`.
    ///
    /// Nothing touches the disk or network until the first operation.
    pub fn new(config: CacheConfig, core: &CoreConfig) -> Self {
        let metadata = Arc::new(MetadataStore::new(
            core.settings_store.clone(),
            config.metadata_key.clone(),
        ));
        let validation = Arc::new(ValidationCache::new(
            core.clock.clone(),
            config.validation_ttl,
        ));
        let reachability = Arc::new(Reachability::new(
            core.network_monitor.clone(),
            core.clock.clone(),
            config.reachability_recheck,
        ));
        let events = Arc::new(EventEmitter::default());

        let coordinator = Arc::new(DownloadCoordinator::new(
            CoordinatorParts {
                fs: core.file_system.clone(),
                http: core.http_client.clone(),
                clock: core.clock.clone(),
                metadata: metadata.clone(),
                validation: validation.clone(),
                reachability: reachability.clone(),
                events: events.clone(),
            },
            config.max_concurrent_downloads,
            config.download_timeout,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                fs: core.file_system.clone(),
                clock: core.clock.clone(),
                metadata,
                validation,
                reachability,
                coordinator,
                events,
                cache_dir: OnceCell::new(),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Publish cache and connectivity events on `event_bus`.
    pub fn with_event_bus(self, event_bus: EventBus) -> Self {
        self.inner.events.set_bus(event_bus);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Cache directory, once initialized.
    pub fn cache_directory(&self) -> Option<PathBuf> {
        self.inner.cache_dir.get().cloned()
    }

    /// Initialize the cache: create the directory, load the index, start
    /// watching connectivity and kick off the validation sweep.
    ///
    /// Idempotent; concurrent callers share one initialization. A failure
    /// leaves the manager uninitialized and the next call tries again.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        self.cache_dir().await.map(|_| ())
    }

    async fn cache_dir(&self) -> Result<&PathBuf> {
        self.inner
            .cache_dir
            .get_or_try_init(|| self.bootstrap())
            .await
    }

    async fn bootstrap(&self) -> Result<PathBuf> {
        info!("Initializing audio cache");

        self.inner.config.validate()?;

        let root = self.inner.fs.get_cache_directory().await.map_err(|e| {
            error!(error = %e, "Failed to get cache directory");
            e
        })?;
        let dir = root.join(&self.inner.config.cache_directory);

        self.inner.fs.create_dir_all(&dir).await.map_err(|e| {
            error!(error = %e, "Failed to create cache directory");
            e
        })?;

        let entries = self.inner.metadata.load().await?;

        let watcher = self
            .inner
            .reachability
            .clone()
            .watch(self.inner.events.clone())
            .await;

        let manager = self.clone();
        let sweep_dir = dir.clone();
        let sweep = tokio::spawn(async move {
            manager.sweep(&sweep_dir).await;
        });

        {
            let mut background = self.inner.background.lock();
            background.extend(watcher);
            background.push(sweep);
        }

        info!(
            entries,
            dir = strip_path(&dir.to_string_lossy()),
            "Audio cache initialized"
        );
        Ok(dir)
    }

    /// URI to hand to the player: the local file when a valid copy exists,
    /// otherwise `remote_url`.
    #[instrument(skip(self, remote_url))]
    pub async fn resolve_playable_uri(&self, id: &str, remote_url: &str) -> String {
        if let Err(e) = self.cache_dir().await {
            warn!(error = %e, "Cache unavailable, streaming");
            return remote_url.to_string();
        }

        match self.inner.coordinator.validate_entry(id).await {
            Some(entry) => {
                debug!("Playing from cache");
                entry.local_path.to_string_lossy().into_owned()
            }
            None => remote_url.to_string(),
        }
    }

    /// Download `id` from `remote_url` unless a valid copy already exists.
    ///
    /// Concurrent calls for the same id share one transfer and one result.
    #[instrument(skip(self, remote_url), fields(url = %redact_url(remote_url)))]
    pub async fn cache(&self, id: &str, remote_url: &str) -> bool {
        let dir = match self.cache_dir().await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "Cache unavailable, not downloading");
                return false;
            }
        };

        let file_name = match cache_file_name(id, &self.inner.config.file_extension) {
            Ok(name) => name,
            Err(e) => {
                warn!(error = %e, "Refusing to cache");
                return false;
            }
        };

        self.inner
            .coordinator
            .ensure_cached(id, remote_url, dir.join(file_name))
            .await
    }

    /// Whether the index knows about `id`. No filesystem access.
    pub fn is_cached(&self, id: &str) -> bool {
        self.inner.metadata.has(id)
    }

    /// Whether `id` has a usable file on disk. Always checks the disk and
    /// evicts stale entries.
    #[instrument(skip(self))]
    pub async fn is_cached_and_valid(&self, id: &str) -> bool {
        if self.cache_dir().await.is_err() {
            return false;
        }

        match self.inner.metadata.get(id) {
            Some(entry) => self.inner.coordinator.check_entry(&entry).await == EntryCheck::Valid,
            None => false,
        }
    }

    /// Delete the cached copy of `id`. Returns `true` when an entry existed.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> bool {
        if let Err(e) = self.cache_dir().await {
            warn!(error = %e, "Cache unavailable, nothing removed");
            return false;
        }

        let removed = self.inner.coordinator.remove(id).await;
        if removed {
            info!("Removed cached track");
            self.inner.events.cache(CacheEvent::Removed {
                track_id: id.to_string(),
            });
        }
        removed
    }

    /// Remove every cached track and the persisted index.
    ///
    /// Downloads still running finish but discard their result. Returns
    /// `false` only when the directory could not be reset.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> bool {
        let dir = match self.cache_dir().await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "Cache unavailable, nothing cleared");
                return false;
            }
        };

        let _exclusive = self.inner.coordinator.begin_clear().await;
        let mut ok = true;

        if let Err(e) = self.inner.fs.delete_dir_all(dir).await {
            if !e.is_not_found() {
                error!(error = %e, "Failed to delete cache directory");
                ok = false;
            }
        }
        if let Err(e) = self.inner.fs.create_dir_all(dir).await {
            error!(error = %e, "Failed to recreate cache directory");
            ok = false;
        }

        let entries = self.inner.metadata.clear().await;
        self.inner.validation.clear();

        info!(entries, "Audio cache cleared");
        self.inner.events.cache(CacheEvent::Cleared { entries });
        ok
    }

    /// Index statistics. No I/O.
    pub fn get_stats(&self) -> CacheStats {
        CacheStats::from_entries(&self.inner.metadata.entries())
    }

    /// Index record for `id`, if any.
    pub fn entry(&self, id: &str) -> Option<CacheEntry> {
        self.inner.metadata.get(id)
    }

    /// Cache `tracks` one after another.
    ///
    /// Connectivity is checked once up front. When offline nothing is
    /// downloaded: tracks with a valid copy count as cached, the rest as
    /// skipped.
    #[instrument(skip(self, tracks), fields(tracks = tracks.len()))]
    pub async fn cache_many(&self, tracks: &[Track]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            requested: tracks.len(),
            ..Default::default()
        };

        if tracks.is_empty() {
            return outcome;
        }

        if !self.is_online().await {
            for track in tracks {
                if self.is_cached_and_valid(&track.id).await {
                    outcome.cached += 1;
                } else {
                    outcome.skipped += 1;
                }
            }
            info!(skipped = outcome.skipped, "Offline, batch not downloaded");
            return outcome;
        }

        for track in tracks {
            if self.cache(&track.id, &track.url).await {
                outcome.cached += 1;
            } else {
                outcome.failed += 1;
            }
        }

        info!(
            cached = outcome.cached,
            failed = outcome.failed,
            "Batch caching finished"
        );
        outcome
    }

    /// Start background downloads for the tracks around the current one.
    ///
    /// Neighbors already indexed or already downloading are left alone.
    /// Returns the number of downloads scheduled.
    pub fn precache_adjacent(&self, context: &PlaybackContext) -> usize {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, neighbors not pre-cached");
                return 0;
            }
        };

        let mut scheduled = 0;
        for track in context.neighbors() {
            if self.is_cached(&track.id) || self.inner.coordinator.is_in_flight(&track.id) {
                continue;
            }

            let manager = self.clone();
            let id = track.id.clone();
            let url = track.url.clone();
            handle.spawn(async move {
                manager.cache(&id, &url).await;
            });
            scheduled += 1;
        }

        if scheduled > 0 {
            debug!(scheduled, "Pre-caching neighbors");
        }
        scheduled
    }

    /// Whether the device is online (cached for a few seconds).
    pub async fn is_online(&self) -> bool {
        self.inner.reachability.is_online().await
    }

    /// Transfers currently moving bytes.
    pub fn active_transfers(&self) -> usize {
        self.inner.coordinator.active_transfers()
    }

    /// Transfers waiting for a slot or running.
    pub fn in_flight(&self) -> usize {
        self.inner.coordinator.in_flight()
    }

    /// Check every entry against the disk, evict broken ones, and delete
    /// files nothing refers to.
    ///
    /// Runs once in the background after initialization; callable directly.
    #[instrument(skip(self))]
    pub async fn cleanup_invalid_entries(&self) -> SweepReport {
        match self.cache_dir().await {
            Ok(dir) => self.sweep(dir).await,
            Err(e) => {
                warn!(error = %e, "Cache unavailable, sweep skipped");
                SweepReport::default()
            }
        }
    }

    async fn sweep(&self, dir: &Path) -> SweepReport {
        let entries = self.inner.metadata.entries();
        let mut report = SweepReport {
            checked: entries.len(),
            ..Default::default()
        };

        let mut valid_ids = Vec::new();
        for batch in entries.chunks(self.inner.config.sweep_batch_size) {
            let checks = join_all(
                batch
                    .iter()
                    .map(|entry| self.inner.coordinator.check_entry(entry)),
            )
            .await;

            for (entry, check) in batch.iter().zip(checks) {
                match check {
                    EntryCheck::Valid => valid_ids.push(entry.id.clone()),
                    EntryCheck::Evicted => report.evicted += 1,
                    EntryCheck::Unknown => {}
                }
            }
        }

        self.inner
            .metadata
            .mark_validated(&valid_ids, self.inner.clock.unix_timestamp_millis())
            .await;

        report.orphans_removed = self.remove_orphans(dir).await;

        info!(
            checked = report.checked,
            evicted = report.evicted,
            orphans_removed = report.orphans_removed,
            "Cache sweep completed"
        );
        self.inner.events.cache(CacheEvent::SweepCompleted {
            checked: report.checked,
            evicted: report.evicted,
            orphans_removed: report.orphans_removed,
        });
        report
    }

    async fn remove_orphans(&self, dir: &Path) -> usize {
        let listed = match self.inner.fs.list_directory(dir).await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Could not list cache directory");
                return 0;
            }
        };

        let _exclusive = self.inner.coordinator.exclusive().await;

        let referenced: HashSet<OsString> = self
            .inner
            .metadata
            .entries()
            .iter()
            .filter_map(|entry| entry.local_path.file_name().map(|n| n.to_os_string()))
            .collect();
        let transfers_pending = self.inner.coordinator.in_flight() > 0;

        let mut removed = 0;
        for path in listed {
            let name = match path.file_name() {
                Some(name) => name,
                None => continue,
            };
            if referenced.contains(name) || (transfers_pending && is_part_file(&path)) {
                continue;
            }

            match self.inner.fs.metadata(&path).await {
                Ok(meta) if !meta.is_directory => {}
                _ => continue,
            }

            match self.inner.fs.delete_file(&path).await {
                Ok(()) => {
                    debug!(file = strip_path(&path.to_string_lossy()), "Removed orphaned file");
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(file = strip_path(&path.to_string_lossy()), error = %e, "Could not remove orphaned file");
                }
            }
        }
        removed
    }

    /// Stop background tasks (connectivity subscription, pending sweep).
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        if !handles.is_empty() {
            debug!(tasks = handles.len(), "Stopping cache background tasks");
        }
        for handle in handles {
            handle.abort();
        }
    }
}
