//! # Download Coordinator
//!
//! Owns every transfer into the cache directory.
//!
//! - One transfer per track id. Concurrent requests join the running one and
//!   all observe the same outcome.
//! - Transfers run on spawned tasks, so a caller that stops waiting does not
//!   cancel the download.
//! - A semaphore bounds the number of transfers moving bytes at once.
//! - Each transfer writes to its own `.part-<ticket>` file and is renamed into
//!   place only when it commits. Readers never see partial files.
//! - Commits, evictions and clears are ordered through one async `RwLock`:
//!   commits share it, evictions and clears take it exclusively. A clear also
//!   bumps a generation counter so transfers started before it discard their
//!   result instead of resurrecting an entry.

use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::events::EventEmitter;
use crate::metadata::MetadataStore;
use crate::reachability::Reachability;
use crate::validation::ValidationCache;
use bridge_traits::{Clock, FileSystemAccess, HttpClient};
use core_runtime::events::CacheEvent;
use core_runtime::logging::{redact_url, strip_path};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, RwLockWriteGuard, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Marker inserted between a track file name and the transfer ticket.
pub const PART_MARKER: &str = ".part-";

type SharedOutcome = Shared<BoxFuture<'static, bool>>;

/// Outcome of checking one entry against the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCheck {
    /// File present and non-empty
    Valid,
    /// File missing or empty; the entry was dropped
    Evicted,
    /// File could not be checked, or the entry changed meanwhile
    Unknown,
}

struct InFlight {
    ticket: u64,
    outcome: SharedOutcome,
}

/// Bridges and shared state a coordinator works with.
pub struct CoordinatorParts {
    pub fs: Arc<dyn FileSystemAccess>,
    pub http: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
    pub metadata: Arc<MetadataStore>,
    pub validation: Arc<ValidationCache>,
    pub reachability: Arc<Reachability>,
    pub events: Arc<EventEmitter>,
}

pub struct DownloadCoordinator {
    fs: Arc<dyn FileSystemAccess>,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    metadata: Arc<MetadataStore>,
    validation: Arc<ValidationCache>,
    reachability: Arc<Reachability>,
    events: Arc<EventEmitter>,
    download_semaphore: Arc<Semaphore>,
    download_timeout: Duration,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_ticket: AtomicU64,
    generation: AtomicU64,
    active: AtomicUsize,
    commit_lock: RwLock<()>,
}

impl DownloadCoordinator {
    pub fn new(parts: CoordinatorParts, max_concurrent: usize, download_timeout: Duration) -> Self {
        Self {
            fs: parts.fs,
            http: parts.http,
            clock: parts.clock,
            metadata: parts.metadata,
            validation: parts.validation,
            reachability: parts.reachability,
            events: parts.events,
            download_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            download_timeout,
            in_flight: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            commit_lock: RwLock::new(()),
        }
    }

    /// Transfers currently holding a download slot.
    pub fn active_transfers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Transfers registered, whether waiting for a slot or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains_key(id)
    }

    /// Return the entry for `id` if its file is present and non-empty.
    ///
    /// A fresh positive judgment skips the filesystem; otherwise the file is
    /// checked with [`check_entry`](Self::check_entry).
    pub async fn validate_entry(&self, id: &str) -> Option<CacheEntry> {
        let entry = match self.metadata.get(id) {
            Some(entry) => entry,
            None => {
                self.validation.invalidate(id);
                return None;
            }
        };

        if self.validation.is_valid(id) == Some(true) {
            return Some(entry);
        }

        match self.check_entry(&entry).await {
            EntryCheck::Valid => Some(entry),
            EntryCheck::Evicted | EntryCheck::Unknown => None,
        }
    }

    /// Check the file behind `entry` on disk.
    ///
    /// A missing, empty or non-regular file evicts the entry. Other I/O
    /// errors leave the entry alone.
    pub async fn check_entry(&self, entry: &CacheEntry) -> EntryCheck {
        match self.fs.metadata(&entry.local_path).await {
            Ok(meta) if !meta.is_directory && meta.size > 0 => {
                self.validation.record(&entry.id, true);
                EntryCheck::Valid
            }
            Ok(meta) => {
                debug!(track_id = %entry.id, size = meta.size, "Cached file unusable");
                self.evict_checked(entry).await
            }
            Err(e) if e.is_not_found() => {
                debug!(track_id = %entry.id, "Cached file missing");
                self.evict_checked(entry).await
            }
            Err(e) => {
                warn!(track_id = %entry.id, error = %e, "Could not stat cached file");
                EntryCheck::Unknown
            }
        }
    }

    async fn evict_checked(&self, entry: &CacheEntry) -> EntryCheck {
        if self.evict(entry).await {
            EntryCheck::Evicted
        } else {
            EntryCheck::Unknown
        }
    }

    /// Drop `entry` and its file, unless a newer commit already replaced it.
    pub async fn evict(&self, entry: &CacheEntry) -> bool {
        let _exclusive = self.commit_lock.write().await;

        if !self.metadata.remove_if_same(entry).await {
            return false;
        }

        self.validation.invalidate(&entry.id);
        delete_quietly(self.fs.as_ref(), &entry.local_path).await;

        info!(track_id = %entry.id, "Evicted stale cache entry");
        self.events.cache(CacheEvent::EntryEvicted {
            track_id: entry.id.clone(),
        });
        true
    }

    /// Drop the entry for `id` and delete its file. Returns whether an entry
    /// existed.
    pub async fn remove(&self, id: &str) -> bool {
        let _exclusive = self.commit_lock.write().await;

        self.validation.invalidate(id);
        match self.metadata.remove(id).await {
            Some(entry) => {
                delete_quietly(self.fs.as_ref(), &entry.local_path).await;
                true
            }
            None => false,
        }
    }

    /// Block commits and start a new generation.
    ///
    /// Transfers registered before this call keep running but discard their
    /// result. In-flight handles are forgotten so new requests start fresh.
    pub async fn begin_clear(&self) -> RwLockWriteGuard<'_, ()> {
        let guard = self.commit_lock.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.in_flight.lock().clear();
        self.validation.clear();
        guard
    }

    /// Block commits while the caller inspects the cache directory.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock.write().await
    }

    /// Make sure `id` is cached at `target`, downloading from `url` if needed.
    ///
    /// Never fails: every problem is logged and reported as `false`.
    #[instrument(skip(self, url, target), fields(url = %redact_url(url)))]
    pub async fn ensure_cached(self: &Arc<Self>, id: &str, url: &str, target: PathBuf) -> bool {
        if id.trim().is_empty() || url.trim().is_empty() {
            warn!("Refusing to cache without a track id and URL");
            return false;
        }

        if self.validate_entry(id).await.is_some() {
            debug!("Track already cached");
            return true;
        }

        let joined = self.in_flight.lock().get(id).map(|f| f.outcome.clone());
        if let Some(outcome) = joined {
            debug!("Joining in-flight download");
            return outcome.await;
        }

        if !self.reachability.is_online().await {
            info!("Offline, skipping download");
            return false;
        }

        self.start_or_join(id, url, target).await
    }

    async fn start_or_join(self: &Arc<Self>, id: &str, url: &str, target: PathBuf) -> bool {
        let outcome = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(id) {
                Some(existing) => existing.outcome.clone(),
                // Committed and unregistered since the entry check above
                None if self.metadata.has(id) && self.validation.is_valid(id) == Some(true) => {
                    return true;
                }
                None => {
                    let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
                    let generation = self.generation.load(Ordering::SeqCst);
                    let job = Job {
                        ticket,
                        generation,
                        id: id.to_string(),
                        url: url.to_string(),
                        part: part_path(&target, ticket),
                        target,
                    };

                    let coordinator = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        let _registration = Registration {
                            coordinator: Arc::clone(&coordinator),
                            id: job.id.clone(),
                            ticket: job.ticket,
                        };
                        coordinator.run(job).await
                    });

                    let outcome = async move { handle.await.unwrap_or(false) }
                        .boxed()
                        .shared();
                    in_flight.insert(
                        id.to_string(),
                        InFlight {
                            ticket,
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        outcome.await
    }

    async fn run(&self, job: Job) -> bool {
        let _permit = match self.download_semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let _active = ActiveTransfer::new(&self.active);

        info!(track_id = %job.id, url = %redact_url(&job.url), "Starting download");
        self.events.cache(CacheEvent::DownloadStarted {
            track_id: job.id.clone(),
        });

        match self.transfer(&job).await {
            Ok(size_bytes) => self.commit(&job, size_bytes).await,
            Err(e) => {
                self.abandon(&job, &e).await;
                false
            }
        }
    }

    /// Stream the body into the part file and return its size.
    async fn transfer(&self, job: &Job) -> Result<u64> {
        let copy = async {
            let mut body = self
                .http
                .download_stream(&job.url)
                .await
                .map_err(|e| CacheError::Download(e.to_string()))?;
            let mut file = self.fs.open_write_stream(&job.part).await?;

            tokio::io::copy(&mut body, &mut file)
                .await
                .map_err(|e| CacheError::Download(e.to_string()))?;
            file.shutdown()
                .await
                .map_err(|e| CacheError::Storage(e.to_string()))?;
            Ok::<_, CacheError>(())
        };

        timeout(self.download_timeout, copy)
            .await
            .map_err(|_| CacheError::Timeout(self.download_timeout))??;

        let meta = self.fs.metadata(&job.part).await?;
        if meta.is_directory || meta.size == 0 {
            return Err(CacheError::EmptyDownload);
        }
        Ok(meta.size)
    }

    async fn commit(&self, job: &Job, size_bytes: u64) -> bool {
        let commit_guard = self.commit_lock.read().await;

        if self.generation.load(Ordering::SeqCst) != job.generation {
            info!(track_id = %job.id, "Cache cleared during download, discarding");
            delete_quietly(self.fs.as_ref(), &job.part).await;
            return false;
        }

        if let Err(e) = self.fs.rename(&job.part, &job.target).await {
            drop(commit_guard);
            self.abandon(job, &e.into()).await;
            return false;
        }

        let entry = CacheEntry::new(
            job.id.clone(),
            job.url.clone(),
            job.target.clone(),
            self.clock.unix_timestamp_millis(),
            size_bytes,
        )
        .with_commit(job.ticket);
        self.metadata.upsert(entry).await;
        self.validation.record(&job.id, true);

        info!(
            track_id = %job.id,
            size_bytes,
            file = strip_path(&job.target.to_string_lossy()),
            "Download completed"
        );
        self.events.cache(CacheEvent::DownloadCompleted {
            track_id: job.id.clone(),
            size_bytes,
        });
        drop(commit_guard);
        true
    }

    /// Clean up after a failed transfer. Only the job's own part file is
    /// deleted; an entry committed earlier and its file stay untouched.
    async fn abandon(&self, job: &Job, error: &CacheError) {
        warn!(track_id = %job.id, error = %error, "Download failed");
        delete_quietly(self.fs.as_ref(), &job.part).await;
        self.validation.invalidate(&job.id);

        self.events.cache(CacheEvent::DownloadFailed {
            track_id: job.id.clone(),
            message: error.to_string(),
        });
    }

    fn unregister(&self, id: &str, ticket: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(id).map(|f| f.ticket) == Some(ticket) {
            in_flight.remove(id);
        }
    }
}

struct Job {
    ticket: u64,
    generation: u64,
    id: String,
    url: String,
    part: PathBuf,
    target: PathBuf,
}

/// Removes the in-flight handle for one ticket when the task ends, including
/// by panic or abort.
struct Registration {
    coordinator: Arc<DownloadCoordinator>,
    id: String,
    ticket: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.coordinator.unregister(&self.id, self.ticket);
    }
}

struct ActiveTransfer<'a>(&'a AtomicUsize);

impl<'a> ActiveTransfer<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Path of the temporary file a transfer writes before committing.
pub fn part_path(target: &Path, ticket: u64) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!("{}{}", PART_MARKER, ticket));
    target.with_file_name(name)
}

/// Whether `path` is a transfer's temporary file.
pub fn is_part_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().contains(PART_MARKER))
        .unwrap_or(false)
}

/// Best-effort delete; a missing file is not worth mentioning.
pub(crate) async fn delete_quietly(fs: &dyn FileSystemAccess, path: &Path) {
    if let Err(e) = fs.delete_file(path).await {
        if !e.is_not_found() {
            debug!(file = strip_path(&path.to_string_lossy()), error = %e, "Could not delete file");
        }
    }
}
