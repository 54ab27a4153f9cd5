//! # Core Configuration Module
//!
//! Provides configuration management for the offline audio core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds the host bridges the cache depends on. It enforces
//! fail-fast validation so a missing capability is reported at startup with an
//! actionable message instead of surfacing later as a failed download.
//!
//! ## Required Dependencies
//!
//! - `FileSystemAccess` - Cache directory and track files
//! - `SettingsStore` - Persisted cache index
//! - `HttpClient` - Track downloads
//!
//! ## Optional Dependencies
//!
//! - `NetworkMonitor` - Connectivity detection (absent: the device is assumed online)
//! - `Clock` - Time source (default: [`SystemClock`])
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .file_system(Arc::new(MyFileSystem))
//!     .settings_store(Arc::new(MySettingsStore))
//!     .http_client(Arc::new(MyHttpClient))
//!     .network_monitor(Arc::new(MyNetworkMonitor))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::CoreConfig;
//!
//! // Fails: no FileSystemAccess was provided
//! let config = CoreConfig::builder()
//!     .build()
//!     .expect("Should fail - missing required bridges");
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{Clock, FileSystemAccess, HttpClient, NetworkMonitor, SettingsStore, SystemClock};
use std::sync::Arc;

/// Core configuration for the offline audio core.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// File system access abstraction (required)
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Key-value store holding the cache index (required)
    pub settings_store: Arc<dyn SettingsStore>,

    /// HTTP client used for downloads (required)
    pub http_client: Arc<dyn HttpClient>,

    /// Network connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    /// Time source
    pub clock: Arc<dyn Clock>,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("settings_store", &"SettingsStore { ... }")
            .field("http_client", &"HttpClient { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn capability_missing(capability: &str, message: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: message.to_string(),
    }
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) once every required bridge is set.
#[derive(Default)]
pub struct CoreConfigBuilder {
    file_system: Option<Arc<dyn FileSystemAccess>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    http_client: Option<Arc<dyn HttpClient>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Sets the file system implementation.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the settings store that persists the cache index.
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    /// Sets the HTTP client used for downloads.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the network monitor.
    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    /// Overrides the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the event bus capacity.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapabilityMissing`] when a required bridge was not
    /// provided, or [`Error::Config`] when a value is invalid.
    pub fn build(self) -> Result<CoreConfig> {
        let file_system = self.file_system.ok_or_else(|| {
            capability_missing(
                "FileSystemAccess",
                "FileSystemAccess implementation is required to store cached tracks. \
                 Desktop: use bridge_desktop::TokioFileSystem. \
                 Mobile: inject the app sandbox file API.",
            )
        })?;

        let settings_store = self.settings_store.ok_or_else(|| {
            capability_missing(
                "SettingsStore",
                "SettingsStore implementation is required to persist the cache index. \
                 Desktop: use bridge_desktop::SqliteSettingsStore. \
                 Mobile: inject platform-native settings (UserDefaults/DataStore).",
            )
        })?;

        let http_client = self.http_client.ok_or_else(|| {
            capability_missing(
                "HttpClient",
                "HttpClient implementation is required to download tracks. \
                 Desktop: use bridge_desktop::ReqwestHttpClient. \
                 Mobile: inject URLSession/OkHttp adapters.",
            )
        })?;

        let config = CoreConfig {
            file_system,
            settings_store,
            http_client,
            network_monitor: self.network_monitor,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}
