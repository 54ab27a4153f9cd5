//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP, filesystem,
//! settings, connectivity) into the offline audio core. Desktop apps
//! typically enable the `desktop-shims` feature (which depends on
//! `bridge-desktop`); mobile hosts inject their own bridges through
//! [`CoreDependencies`].
//!
//! One [`CoreService`] owns the single [`AudioCacheManager`] of the process
//! and the [`EventBus`] it publishes on. Clone the service (or the manager)
//! to share it.

pub mod error;

pub use error::{CoreError, Result};

use std::sync::Arc;

use bridge_traits::{Clock, FileSystemAccess, HttpClient, NetworkMonitor, SettingsStore};
use core_cache::{AudioCacheManager, CacheConfig};
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use tracing::info;

#[cfg(feature = "desktop-shims")]
use bridge_desktop::{
    DesktopNetworkMonitor, ReqwestHttpClient, SqliteSettingsStore, TokioFileSystem,
};

/// Aggregated handle to all bridge dependencies the core requires.
pub struct CoreDependencies {
    pub http_client: Arc<dyn HttpClient>,
    pub filesystem: Arc<dyn FileSystemAccess>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,
    pub clock: Option<Arc<dyn Clock>>,
}

impl CoreDependencies {
    /// Construct a dependency bundle from explicit bridge handles.
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        filesystem: Arc<dyn FileSystemAccess>,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            http_client,
            filesystem,
            settings_store,
            network_monitor: None,
            clock: None,
        }
    }

    /// Provide connectivity detection. Without it the device is assumed online.
    pub fn with_network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Override the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn into_config(self) -> Result<CoreConfig> {
        let mut builder = CoreConfig::builder()
            .http_client(self.http_client)
            .file_system(self.filesystem)
            .settings_store(self.settings_store);

        if let Some(monitor) = self.network_monitor {
            builder = builder.network_monitor(monitor);
        }
        if let Some(clock) = self.clock {
            builder = builder.clock(clock);
        }

        Ok(builder.build()?)
    }
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    cache: AudioCacheManager,
    events: EventBus,
}

impl CoreService {
    /// Create a new service from the provided dependencies with the default
    /// cache configuration.
    pub fn new(deps: CoreDependencies) -> Result<Self> {
        Self::with_cache_config(deps, CacheConfig::default())
    }

    /// Create a new service with a custom cache configuration.
    pub fn with_cache_config(deps: CoreDependencies, cache_config: CacheConfig) -> Result<Self> {
        Self::from_config(deps.into_config()?, cache_config)
    }

    /// Create a new service from an already validated [`CoreConfig`].
    pub fn from_config(config: CoreConfig, cache_config: CacheConfig) -> Result<Self> {
        config.validate()?;
        cache_config.validate()?;

        let events = EventBus::new(config.event_buffer_size);
        let cache = AudioCacheManager::new(cache_config, &config).with_event_bus(events.clone());

        Ok(Self {
            config: Arc::new(config),
            cache,
            events,
        })
    }

    /// Initialize the cache eagerly instead of on first use.
    pub async fn start(&self) -> Result<()> {
        self.cache.initialize().await?;
        info!("Core service started");
        Ok(())
    }

    /// The process-wide audio cache.
    pub fn cache(&self) -> &AudioCacheManager {
        &self.cache
    }

    /// Event bus the cache publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to core events. Dropping the stream unsubscribes.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    /// Access the bridge configuration being used by the service.
    pub fn config(&self) -> Arc<CoreConfig> {
        Arc::clone(&self.config)
    }

    /// Stop background work owned by the service.
    pub fn shutdown(&self) {
        self.cache.shutdown();
        info!("Core service stopped");
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// Uses the platform cache directory for audio, a SQLite settings database in
/// the platform data directory, `reqwest` for downloads and a TCP connect
/// check for connectivity.
///
/// ```no_run
/// # async fn example() -> core_service::Result<()> {
/// let core = core_service::bootstrap_desktop().await?;
/// let uri = core
///     .cache()
///     .resolve_playable_uri("001", "https://server8.mp3quran.net/afs/001.mp3")
///     .await;
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop() -> Result<CoreService> {
    bootstrap_desktop_with(CacheConfig::default()).await
}

/// Desktop bootstrapper with a custom cache configuration.
#[cfg(feature = "desktop-shims")]
pub async fn bootstrap_desktop_with(cache_config: CacheConfig) -> Result<CoreService> {
    let filesystem = Arc::new(TokioFileSystem::new());
    let data_dir = filesystem.get_data_directory().await?;

    let settings = SqliteSettingsStore::new(data_dir.join("settings.db"))
        .await
        .map_err(|e| CoreError::InitializationFailed(format!("settings store: {}", e)))?;
    let http = ReqwestHttpClient::new()?;

    let deps = CoreDependencies::new(Arc::new(http), filesystem, Arc::new(settings))
        .with_network_monitor(Arc::new(DesktopNetworkMonitor::new()));

    let service = CoreService::with_cache_config(deps, cache_config)?;
    service.start().await?;
    Ok(service)
}
