//! Integration tests for the audio cache manager
//!
//! These tests drive [`AudioCacheManager`] against the real Tokio filesystem
//! bridge in a scratch directory, with in-memory fakes for settings, HTTP,
//! connectivity and time.

use async_trait::async_trait;
use bridge_desktop::TokioFileSystem;
use bridge_traits::{
    error::{BridgeError, Result as BridgeResult},
    Clock, FileMetadata, FileSystemAccess, HttpClient, NetworkChangeStream, NetworkInfo,
    NetworkMonitor, NetworkType, SettingsStore,
};
use chrono::{DateTime, TimeZone, Utc};
use core_cache::{AudioCacheManager, CacheConfig, PlaybackContext, SweepReport, Track};
use core_runtime::config::CoreConfig;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus, NetworkEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const METADATA_KEY: &str = "audio_cache_metadata_v2";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
    failing_reads: AtomicUsize,
    failing_writes: AtomicBool,
}

impl MemorySettings {
    fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    /// Fail the next `count` reads.
    fn fail_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    fn fail_writes(&self, fail: bool) {
        self.failing_writes.store(fail, Ordering::SeqCst);
    }
}

fn unavailable() -> BridgeError {
    BridgeError::OperationFailed("settings store unavailable".to_string())
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(unavailable());
        }
        Ok(self.raw(key))
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Serves canned bodies after an adjustable delay and records concurrency.
#[derive(Default)]
struct FakeHttp {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    current: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

struct InProgress(Arc<AtomicUsize>);

impl Drop for InProgress {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeHttp {
    fn serving(ids: &[&str]) -> Arc<Self> {
        let http = Arc::new(Self::default());
        for id in ids {
            http.serve(&url(id), body(id));
        }
        http
    }

    fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn download_stream(
        &self,
        url: &str,
    ) -> BridgeResult<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_progress = InProgress(self.current.clone());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.bodies.lock().unwrap().get(url) {
            Some(body) => Ok(Box::new(std::io::Cursor::new(body.clone()))),
            None => Err(BridgeError::OperationFailed(
                "HTTP error: 404 Not Found".to_string(),
            )),
        }
    }
}

struct FakeNetwork {
    online: AtomicBool,
    checks: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NetworkInfo>>>,
}

impl FakeNetwork {
    fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
            checks: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn info(online: bool) -> NetworkInfo {
        if online {
            NetworkInfo::connected(NetworkType::WiFi)
        } else {
            NetworkInfo::disconnected()
        }
    }

    /// Flip connectivity and notify subscribers.
    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        for tx in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(Self::info(online));
        }
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

struct ChannelStream(mpsc::UnboundedReceiver<NetworkInfo>);

#[async_trait]
impl NetworkChangeStream for ChannelStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.0.recv().await
    }
}

#[async_trait]
impl NetworkMonitor for FakeNetwork {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(Self::info(self.online.load(Ordering::SeqCst)))
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(Box::new(ChannelStream(rx)))
    }
}

/// Real filesystem whose track-file stats can be made to fail.
struct FlakyFs {
    inner: TokioFileSystem,
    failing_stats: AtomicUsize,
}

impl FlakyFs {
    fn new(inner: TokioFileSystem) -> Self {
        Self {
            inner,
            failing_stats: AtomicUsize::new(0),
        }
    }

    /// The next stat of a committed track file fails with permission denied.
    fn fail_next_track_stat(&self) {
        self.failing_stats.store(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl FileSystemAccess for FlakyFs {
    async fn get_cache_directory(&self) -> BridgeResult<PathBuf> {
        self.inner.get_cache_directory().await
    }

    async fn get_data_directory(&self) -> BridgeResult<PathBuf> {
        self.inner.get_data_directory().await
    }

    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        self.inner.exists(path).await
    }

    async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
        let is_track = path.extension().map_or(false, |ext| ext == "mp3");
        if is_track
            && self
                .failing_stats
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into());
        }
        self.inner.metadata(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        self.inner.create_dir_all(path).await
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        self.inner.delete_file(path).await
    }

    async fn delete_dir_all(&self, path: &Path) -> BridgeResult<()> {
        self.inner.delete_dir_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        self.inner.rename(from, to).await
    }

    async fn list_directory(&self, path: &Path) -> BridgeResult<Vec<PathBuf>> {
        self.inner.list_directory(path).await
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> BridgeResult<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
        self.inner.open_write_stream(path).await
    }
}

struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(1_700_000_000_000),
        })
    }

    fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms.load(Ordering::SeqCst))
            .single()
            .unwrap()
    }
}

// ============================================================================
// Harness
// ============================================================================

fn url(id: &str) -> String {
    format!("https://server8.mp3quran.net/afs/{}.mp3?token=secret", id)
}

fn body(id: &str) -> Vec<u8> {
    let mut body = b"ID3".to_vec();
    body.extend(id.bytes().cycle().take(1021));
    body
}

fn track(id: &str) -> Track {
    Track::new(id, format!("Surah {}", id), url(id)).with_reciter("Mishary Alafasy")
}

fn scratch_root() -> PathBuf {
    std::env::temp_dir().join(format!("audio-cache-test-{}", uuid::Uuid::new_v4()))
}

struct Harness {
    manager: AudioCacheManager,
    fs: Arc<FlakyFs>,
    http: Arc<FakeHttp>,
    settings: Arc<MemorySettings>,
    bus: EventBus,
    root: PathBuf,
    owns_root: bool,
}

struct HarnessBuilder {
    config: CacheConfig,
    http: Arc<FakeHttp>,
    settings: Arc<MemorySettings>,
    network: Option<Arc<FakeNetwork>>,
    clock: Option<Arc<ManualClock>>,
    root: PathBuf,
    owns_root: bool,
}

impl HarnessBuilder {
    fn new(http: Arc<FakeHttp>) -> Self {
        Self {
            config: CacheConfig::default(),
            http,
            settings: Arc::new(MemorySettings::default()),
            network: None,
            clock: None,
            root: scratch_root(),
            owns_root: true,
        }
    }

    fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    fn settings(mut self, settings: Arc<MemorySettings>) -> Self {
        self.settings = settings;
        self
    }

    fn network(mut self, network: Arc<FakeNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    fn clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share a directory between managers; the caller cleans it up.
    fn root(mut self, root: PathBuf) -> Self {
        self.root = root;
        self.owns_root = false;
        self
    }

    fn build(self) -> Harness {
        let fs = Arc::new(FlakyFs::new(TokioFileSystem::with_directories(
            self.root.join("cache"),
            self.root.join("data"),
        )));

        let mut builder = CoreConfig::builder()
            .file_system(fs.clone())
            .settings_store(self.settings.clone())
            .http_client(self.http.clone());
        if let Some(network) = self.network {
            builder = builder.network_monitor(network);
        }
        if let Some(clock) = self.clock {
            builder = builder.clock(clock);
        }
        let core = builder.build().unwrap();

        let bus = EventBus::new(256);
        let manager = AudioCacheManager::new(self.config, &core).with_event_bus(bus.clone());

        Harness {
            manager,
            fs,
            http: self.http,
            settings: self.settings,
            bus,
            root: self.root,
            owns_root: self.owns_root,
        }
    }
}

impl Harness {
    fn cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("audio_cache")
    }

    fn file(&self, name: &str) -> PathBuf {
        self.cache_dir().join(name)
    }

    fn dir_listing(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.cache_dir())
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Initialize and wait for the startup sweep to finish.
    async fn ready(&self) {
        let mut rx = self.bus.subscribe();
        self.manager.initialize().await.unwrap();
        wait_for_sweep(&mut rx).await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.shutdown();
        if self.owns_root {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}

async fn wait_for_sweep(rx: &mut broadcast::Receiver<CoreEvent>) -> SweepReport {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(CoreEvent::Cache(CacheEvent::SweepCompleted {
                    checked,
                    evicted,
                    orphans_removed,
                })) => {
                    return SweepReport {
                        checked,
                        evicted,
                        orphans_removed,
                    }
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("sweep did not complete")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached");
}

fn drain(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Caching and resolution
// ============================================================================

#[tokio::test]
async fn test_cache_writes_file_and_resolves_locally() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["surah1"])).build();

    assert!(h.manager.cache("surah1", &url("surah1")).await);

    let path = h.file("surah1.mp3");
    let on_disk = std::fs::metadata(&path).unwrap().len();
    assert!(on_disk > 0);

    let entry = h.manager.entry("surah1").unwrap();
    assert_eq!(entry.size_bytes, on_disk);
    assert_eq!(entry.local_path, path);
    assert_eq!(entry.source_url, url("surah1"));

    let uri = h.manager.resolve_playable_uri("surah1", &url("surah1")).await;
    assert_eq!(uri, path.to_string_lossy());
    assert!(h.manager.is_cached("surah1"));
    assert!(h.manager.is_cached_and_valid("surah1").await);
}

#[tokio::test]
async fn test_uncached_track_resolves_to_remote_url() {
    let h = HarnessBuilder::new(FakeHttp::serving(&[])).build();

    let uri = h.manager.resolve_playable_uri("002", &url("002")).await;
    assert_eq!(uri, url("002"));
    assert_eq!(h.http.calls(), 0);
}

#[tokio::test]
async fn test_repeated_cache_downloads_once() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"])).build();

    assert!(h.manager.cache("001", &url("001")).await);
    assert!(h.manager.cache("001", &url("001")).await);

    assert_eq!(h.http.calls(), 1);
    assert_eq!(h.manager.get_stats().count, 1);
    assert_eq!(h.dir_listing(), vec!["001.mp3".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_transfer() {
    let http = FakeHttp::serving(&["t1"]);
    http.set_delay(Duration::from_millis(150));
    let h = HarnessBuilder::new(http).build();
    h.ready().await;

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.cache("t1", &url("t1")).await })
        })
        .collect();

    let results: Vec<bool> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(results.iter().all(|ok| *ok));
    assert_eq!(h.http.calls(), 1);
    assert_eq!(h.manager.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfers_are_bounded() {
    let ids = ["001", "002", "003", "004", "005", "006", "007"];
    let http = FakeHttp::serving(&ids);
    http.set_delay(Duration::from_millis(60));
    let h = HarnessBuilder::new(http)
        .config(CacheConfig::default().with_max_concurrent_downloads(2))
        .build();
    h.ready().await;

    let calls: Vec<_> = ids
        .iter()
        .map(|id| {
            let manager = h.manager.clone();
            let id = id.to_string();
            tokio::spawn(async move { manager.cache(&id, &url(&id)).await })
        })
        .collect();

    for call in futures::future::join_all(calls).await {
        assert!(call.unwrap());
    }

    assert_eq!(h.http.calls(), ids.len());
    assert!(h.http.peak() <= 2, "peak was {}", h.http.peak());
    assert_eq!(h.manager.active_transfers(), 0);
    assert_eq!(h.manager.get_stats().count, ids.len());
}

#[tokio::test]
async fn test_caller_giving_up_does_not_cancel_download() {
    let http = FakeHttp::serving(&["001"]);
    http.set_delay(Duration::from_millis(100));
    let h = HarnessBuilder::new(http).build();
    h.ready().await;

    let manager = h.manager.clone();
    let caller = tokio::spawn(async move { manager.cache("001", &url("001")).await });

    wait_until(|| h.manager.in_flight() == 1).await;
    caller.abort();

    wait_until(|| h.manager.in_flight() == 0).await;
    assert!(h.manager.is_cached("001"));
    assert!(h.file("001.mp3").exists());
}

#[tokio::test]
async fn test_unsafe_ids_stay_inside_cache_directory() {
    let id = "../afs/001";
    let h = HarnessBuilder::new(FakeHttp::serving(&[id])).build();

    assert!(h.manager.cache(id, &url(id)).await);

    let entry = h.manager.entry(id).unwrap();
    assert_eq!(entry.local_path.parent().unwrap(), h.cache_dir());
    assert_eq!(h.dir_listing().len(), 1);
}

#[tokio::test]
async fn test_empty_id_or_url_is_rejected() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"])).build();

    assert!(!h.manager.cache("", &url("001")).await);
    assert!(!h.manager.cache("001", "").await);
    assert_eq!(h.http.calls(), 0);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_offline_skips_download() {
    let network = FakeNetwork::new(false);
    let h = HarnessBuilder::new(FakeHttp::serving(&["surah2"]))
        .network(network)
        .build();

    assert!(!h.manager.cache("surah2", &url("surah2")).await);

    assert_eq!(h.http.calls(), 0);
    assert!(h.manager.entry("surah2").is_none());
    assert!(!h.file("surah2.mp3").exists());
}

#[tokio::test]
async fn test_offline_still_reports_existing_copy() {
    let network = FakeNetwork::new(true);
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"]))
        .network(network.clone())
        .build();
    h.ready().await;
    assert!(h.manager.cache("001", &url("001")).await);

    network.set_online(false);
    let went_offline = async {
        while h.manager.is_online().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), went_offline)
        .await
        .unwrap();

    // Valid entries short-circuit before the reachability check
    assert!(h.manager.cache("001", &url("001")).await);
    assert_eq!(h.http.calls(), 1);
}

#[tokio::test]
async fn test_slow_transfer_times_out_and_leaves_nothing() {
    let http = FakeHttp::serving(&["001"]);
    http.set_delay(Duration::from_secs(2));
    let h = HarnessBuilder::new(http)
        .config(CacheConfig::default().with_download_timeout(Duration::from_millis(100)))
        .build();
    h.ready().await;
    let mut rx = h.bus.subscribe();

    assert!(!h.manager.cache("001", &url("001")).await);

    assert!(h.manager.entry("001").is_none());
    assert!(h.dir_listing().is_empty());

    let failed = drain(&mut rx).into_iter().any(|e| {
        matches!(e, CoreEvent::Cache(CacheEvent::DownloadFailed { ref track_id, ref message })
            if track_id == "001" && message.contains("timed out"))
    });
    assert!(failed);
}

#[tokio::test]
async fn test_http_error_returns_false() {
    let h = HarnessBuilder::new(FakeHttp::serving(&[])).build();

    assert!(!h.manager.cache("404", &url("404")).await);
    assert!(h.manager.entry("404").is_none());
    assert!(h.dir_listing().is_empty());
}

#[tokio::test]
async fn test_empty_body_is_not_cached() {
    let http = FakeHttp::serving(&[]);
    http.serve(&url("001"), Vec::new());
    let h = HarnessBuilder::new(http).build();

    assert!(!h.manager.cache("001", &url("001")).await);
    assert!(!h.manager.is_cached("001"));
    assert!(h.dir_listing().is_empty());
}

#[tokio::test]
async fn test_failed_redownload_leaves_no_entry() {
    let http = FakeHttp::serving(&["001"]);
    let clock = ManualClock::new();
    let h = HarnessBuilder::new(http.clone()).clock(clock.clone()).build();
    assert!(h.manager.cache("001", &url("001")).await);

    // File vanishes and the source goes away
    std::fs::remove_file(h.file("001.mp3")).unwrap();
    http.bodies.lock().unwrap().clear();
    clock.advance(Duration::from_secs(61));

    assert!(!h.manager.cache("001", &url("001")).await);
    assert!(!h.manager.is_cached("001"));
}

#[tokio::test]
async fn test_failed_redownload_keeps_committed_copy() {
    let http = FakeHttp::serving(&["001"]);
    let clock = ManualClock::new();
    let h = HarnessBuilder::new(http.clone()).clock(clock.clone()).build();
    h.ready().await;
    assert!(h.manager.cache("001", &url("001")).await);

    // Judgment expires, the stat glitches and the source is gone
    clock.advance(Duration::from_secs(61));
    http.bodies.lock().unwrap().clear();
    h.fs.fail_next_track_stat();

    assert!(!h.manager.cache("001", &url("001")).await);
    assert_eq!(h.http.calls(), 2);

    assert!(h.file("001.mp3").exists());
    assert!(h.manager.is_cached("001"));
    assert!(h.manager.is_cached_and_valid("001").await);
    assert_eq!(h.dir_listing(), vec!["001.mp3".to_string()]);
}

// ============================================================================
// Validation and self-healing
// ============================================================================

#[tokio::test]
async fn test_deleted_file_is_evicted() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"])).build();
    h.ready().await;
    assert!(h.manager.cache("001", &url("001")).await);
    let mut rx = h.bus.subscribe();

    std::fs::remove_file(h.file("001.mp3")).unwrap();

    assert!(!h.manager.is_cached_and_valid("001").await);
    assert!(!h.manager.is_cached("001"));
    assert!(h.manager.entry("001").is_none());

    let evicted = drain(&mut rx).into_iter().any(|e| {
        e == CoreEvent::Cache(CacheEvent::EntryEvicted {
            track_id: "001".to_string(),
        })
    });
    assert!(evicted);
}

#[tokio::test]
async fn test_resolution_trusts_recent_check_then_rechecks() {
    let clock = ManualClock::new();
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"]))
        .clock(clock.clone())
        .build();
    h.ready().await;
    assert!(h.manager.cache("001", &url("001")).await);
    let local = h.file("001.mp3").to_string_lossy().into_owned();

    std::fs::remove_file(h.file("001.mp3")).unwrap();

    // Within the validation window the earlier judgment is reused
    clock.advance(Duration::from_secs(30));
    assert_eq!(h.manager.resolve_playable_uri("001", &url("001")).await, local);

    // Once it expires the file is checked again and the entry evicted
    clock.advance(Duration::from_secs(31));
    assert_eq!(
        h.manager.resolve_playable_uri("001", &url("001")).await,
        url("001")
    );
    assert!(!h.manager.is_cached("001"));
}

#[tokio::test]
async fn test_redownload_after_eviction() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"])).build();
    assert!(h.manager.cache("001", &url("001")).await);

    std::fs::write(h.file("001.mp3"), b"").unwrap();
    assert!(!h.manager.is_cached_and_valid("001").await);

    assert!(h.manager.cache("001", &url("001")).await);
    assert_eq!(h.http.calls(), 2);
    assert!(h.manager.is_cached_and_valid("001").await);
}

#[tokio::test]
async fn test_sweep_evicts_broken_entries_and_orphans() {
    let clock = ManualClock::new();
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002", "003"]))
        .clock(clock.clone())
        .build();
    h.ready().await;

    for id in ["001", "002", "003"] {
        assert!(h.manager.cache(id, &url(id)).await);
    }

    std::fs::remove_file(h.file("002.mp3")).unwrap();
    std::fs::write(h.file("003.mp3"), b"").unwrap();
    std::fs::write(h.file("stray.mp3"), b"left behind").unwrap();
    std::fs::write(h.file("004.mp3.part-99"), b"partial").unwrap();

    clock.advance(Duration::from_secs(5));
    let report = h.manager.cleanup_invalid_entries().await;

    assert_eq!(
        report,
        SweepReport {
            checked: 3,
            evicted: 2,
            orphans_removed: 2,
        }
    );
    assert_eq!(h.dir_listing(), vec!["001.mp3".to_string()]);

    let survivor = h.manager.entry("001").unwrap();
    assert_eq!(
        survivor.last_validated_epoch_ms,
        Some(clock.unix_timestamp_millis())
    );
    assert_eq!(h.manager.get_stats().ids, vec!["001".to_string()]);
}

#[tokio::test]
async fn test_startup_sweep_runs_in_background() {
    let root = scratch_root();
    let settings = Arc::new(MemorySettings::default());

    {
        let first = HarnessBuilder::new(FakeHttp::serving(&["001", "002"]))
            .settings(settings.clone())
            .root(root.clone())
            .build();
        assert!(first.manager.cache("001", &url("001")).await);
        assert!(first.manager.cache("002", &url("002")).await);
        std::fs::remove_file(first.file("002.mp3")).unwrap();
    }

    let second = HarnessBuilder::new(FakeHttp::serving(&[]))
        .settings(settings)
        .root(root.clone())
        .build();
    let mut rx = second.bus.subscribe();
    second.manager.initialize().await.unwrap();

    let report = wait_for_sweep(&mut rx).await;
    assert_eq!(report.checked, 2);
    assert_eq!(report.evicted, 1);
    assert!(second.manager.is_cached("001"));
    assert!(!second.manager.is_cached("002"));

    drop(second);
    std::fs::remove_dir_all(&root).ok();
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_index_survives_restart() {
    let root = scratch_root();
    let settings = Arc::new(MemorySettings::default());

    let first = HarnessBuilder::new(FakeHttp::serving(&["001"]))
        .settings(settings.clone())
        .root(root.clone())
        .build();
    assert!(first.manager.cache("001", &url("001")).await);
    first.manager.shutdown();

    let raw = settings.raw(METADATA_KEY).unwrap();
    assert!(raw.contains("\"sourceUrl\""));
    assert!(raw.contains("\"cachedAtEpochMs\""));

    let second = HarnessBuilder::new(FakeHttp::serving(&[]))
        .settings(settings)
        .root(root.clone())
        .build();
    assert!(!second.manager.is_cached("001"));
    second.manager.initialize().await.unwrap();
    assert!(second.manager.is_cached("001"));
    assert_eq!(
        second.manager.resolve_playable_uri("001", &url("001")).await,
        root.join("cache")
            .join("audio_cache")
            .join("001.mp3")
            .to_string_lossy()
    );

    drop(first);
    drop(second);
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn test_corrupt_index_starts_empty() {
    let settings = Arc::new(MemorySettings::default());
    settings
        .set_string(METADATA_KEY, "{\"001\": {\"id\": ")
        .await
        .unwrap();

    let h = HarnessBuilder::new(FakeHttp::serving(&["002"]))
        .settings(settings.clone())
        .build();

    h.manager.initialize().await.unwrap();
    assert_eq!(h.manager.get_stats().count, 0);

    // Next mutation overwrites the broken value
    assert!(h.manager.cache("002", &url("002")).await);
    let raw = settings.raw(METADATA_KEY).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let network = FakeNetwork::new(true);
    let h = HarnessBuilder::new(FakeHttp::serving(&[]))
        .network(network.clone())
        .build();

    let (a, b) = tokio::join!(h.manager.initialize(), h.manager.initialize());
    a.unwrap();
    b.unwrap();
    h.manager.initialize().await.unwrap();

    assert_eq!(network.subscriber_count(), 1);
    assert_eq!(h.manager.cache_directory(), Some(h.cache_dir()));
}

#[tokio::test]
async fn test_invalid_config_fails_initialize_and_degrades() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"]))
        .config(CacheConfig::default().with_max_concurrent_downloads(0))
        .build();

    assert!(h.manager.initialize().await.is_err());
    assert!(!h.manager.cache("001", &url("001")).await);
    assert_eq!(
        h.manager.resolve_playable_uri("001", &url("001")).await,
        url("001")
    );
    assert_eq!(h.manager.cleanup_invalid_entries().await, SweepReport::default());
}

#[tokio::test]
async fn test_initialize_retries_after_index_read_failure() {
    let settings = Arc::new(MemorySettings::default());
    settings.fail_reads(2);
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"]))
        .settings(settings)
        .build();

    assert!(h.manager.initialize().await.is_err());
    assert_eq!(h.manager.cache_directory(), None);

    // Still uninitialized: operations degrade instead of failing
    assert!(!h.manager.cache("001", &url("001")).await);
    assert_eq!(h.http.calls(), 0);

    h.ready().await;
    assert_eq!(h.manager.cache_directory(), Some(h.cache_dir()));
    assert!(h.manager.cache("001", &url("001")).await);
}

#[tokio::test]
async fn test_persist_failure_keeps_memory_authoritative() {
    let settings = Arc::new(MemorySettings::default());
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002"]))
        .settings(settings.clone())
        .build();
    h.ready().await;

    settings.fail_writes(true);
    assert!(h.manager.cache("001", &url("001")).await);

    assert!(settings.raw(METADATA_KEY).is_none());
    assert!(h.manager.is_cached("001"));
    assert_eq!(
        h.manager.resolve_playable_uri("001", &url("001")).await,
        h.file("001.mp3").to_string_lossy()
    );

    // The next successful write carries the whole in-memory index
    settings.fail_writes(false);
    assert!(h.manager.cache("002", &url("002")).await);
    let raw = settings.raw(METADATA_KEY).unwrap();
    assert!(raw.contains("\"001\""));
    assert!(raw.contains("\"002\""));
}

// ============================================================================
// Removal and clearing
// ============================================================================

#[tokio::test]
async fn test_remove_reports_whether_entry_existed() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"])).build();
    assert!(h.manager.cache("001", &url("001")).await);

    assert!(h.manager.remove("001").await);
    assert!(!h.file("001.mp3").exists());
    assert!(!h.manager.is_cached("001"));

    assert!(!h.manager.remove("001").await);
}

#[tokio::test]
async fn test_clear_all_empties_everything() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002"])).build();
    assert!(h.manager.cache("001", &url("001")).await);
    assert!(h.manager.cache("002", &url("002")).await);
    let mut rx = h.bus.subscribe();

    assert!(h.manager.clear_all().await);

    assert!(!h.manager.is_cached("001"));
    assert!(!h.manager.is_cached("002"));
    assert!(h.cache_dir().is_dir());
    assert!(h.dir_listing().is_empty());
    assert!(h.settings.raw(METADATA_KEY).is_none());
    assert_eq!(h.manager.get_stats().count, 0);

    let cleared = drain(&mut rx)
        .into_iter()
        .any(|e| e == CoreEvent::Cache(CacheEvent::Cleared { entries: 2 }));
    assert!(cleared);
}

#[tokio::test]
async fn test_download_finishing_after_clear_is_discarded() {
    let http = FakeHttp::serving(&["001"]);
    http.set_delay(Duration::from_millis(150));
    let h = HarnessBuilder::new(http).build();
    h.ready().await;

    let manager = h.manager.clone();
    let pending = tokio::spawn(async move { manager.cache("001", &url("001")).await });
    wait_until(|| h.manager.active_transfers() == 1).await;

    assert!(h.manager.clear_all().await);
    assert_eq!(h.manager.in_flight(), 0);

    assert!(!pending.await.unwrap());
    assert!(!h.manager.is_cached("001"));
    assert!(h.dir_listing().is_empty());

    // A fresh request after the clear downloads again
    h.http.set_delay(Duration::ZERO);
    assert!(h.manager.cache("001", &url("001")).await);
    assert_eq!(h.http.calls(), 2);
}

// ============================================================================
// Batches, neighbors, stats
// ============================================================================

#[tokio::test]
async fn test_cache_many_counts_outcomes() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002"])).build();
    assert!(h.manager.cache("001", &url("001")).await);

    let outcome = h
        .manager
        .cache_many(&[track("001"), track("002"), track("404")])
        .await;

    assert_eq!(outcome.requested, 3);
    assert_eq!(outcome.cached, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.skipped, 0);
    assert!(!outcome.all_cached());
}

#[tokio::test]
async fn test_cache_many_offline_downloads_nothing() {
    let network = FakeNetwork::new(true);
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002", "003"]))
        .network(network.clone())
        .config(CacheConfig::default().with_reachability_recheck(Duration::ZERO))
        .build();
    assert!(h.manager.cache("001", &url("001")).await);

    network.online.store(false, Ordering::SeqCst);
    let outcome = h
        .manager
        .cache_many(&[track("001"), track("002"), track("003")])
        .await;

    assert_eq!(outcome.cached, 1);
    assert_eq!(outcome.skipped, 2);
    assert_eq!(outcome.failed, 0);
    assert_eq!(h.http.calls(), 1);
}

#[tokio::test]
async fn test_precache_schedules_only_uncached_neighbors() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002", "003"])).build();
    assert!(h.manager.cache("001", &url("001")).await);

    let context = PlaybackContext::new(vec![track("001"), track("002"), track("003")], 1);
    assert_eq!(h.manager.precache_adjacent(&context), 1);

    wait_until(|| h.manager.is_cached("003")).await;
    assert!(!h.manager.is_cached("002"));
    assert_eq!(h.http.calls(), 2);

    // Everything around the current track is cached now
    assert_eq!(h.manager.precache_adjacent(&context), 0);
}

#[tokio::test]
async fn test_precache_wraps_around_queue() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001", "002", "003"])).build();

    let context =
        PlaybackContext::new(vec![track("001"), track("002"), track("003")], 2).with_wrap(true);
    assert_eq!(h.manager.precache_adjacent(&context), 2);

    wait_until(|| h.manager.is_cached("001") && h.manager.is_cached("002")).await;
}

#[tokio::test]
async fn test_stats_reflect_index() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["002", "001"])).build();
    assert!(h.manager.get_stats().is_empty());

    assert!(h.manager.cache("002", &url("002")).await);
    assert!(h.manager.cache("001", &url("001")).await);

    let stats = h.manager.get_stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.total_bytes, 2048);
    assert_eq!(stats.average_bytes, 1024);
    assert_eq!(stats.ids, vec!["001".to_string(), "002".to_string()]);
}

// ============================================================================
// Connectivity and events
// ============================================================================

#[tokio::test]
async fn test_connectivity_changes_are_published() {
    let network = FakeNetwork::new(true);
    let h = HarnessBuilder::new(FakeHttp::serving(&[]))
        .network(network.clone())
        .build();
    h.ready().await;
    let mut rx = h.bus.subscribe();

    assert!(h.manager.is_online().await);
    network.set_online(false);

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(CoreEvent::Network(event)) = rx.recv().await {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event, NetworkEvent::ConnectivityChanged { online: false });

    let checks = network.checks.load(Ordering::SeqCst);
    assert!(!h.manager.is_online().await);
    assert_eq!(network.checks.load(Ordering::SeqCst), checks);
}

#[tokio::test]
async fn test_download_events_are_emitted() {
    let h = HarnessBuilder::new(FakeHttp::serving(&["001"])).build();
    h.ready().await;
    let mut rx = h.bus.subscribe();

    assert!(h.manager.cache("001", &url("001")).await);

    let events = drain(&mut rx);
    assert!(events.contains(&CoreEvent::Cache(CacheEvent::DownloadStarted {
        track_id: "001".to_string(),
    })));
    assert!(events.contains(&CoreEvent::Cache(CacheEvent::DownloadCompleted {
        track_id: "001".to_string(),
        size_bytes: 1024,
    })));
}
