//! # Offline Audio Cache
//!
//! Keeps recitation audio available offline.
//!
//! ## Overview
//!
//! This crate handles:
//! - Downloading tracks into a dedicated cache directory, one file per track
//! - Deduplicating concurrent requests and bounding parallel transfers
//! - Persisting a JSON index of cached tracks through the host settings store
//! - Validating cached files and evicting entries whose files went missing
//! - Resolving a track to a local file or its remote URL for playback
//! - Pre-caching the tracks around the one currently playing
//!
//! The entry point is [`AudioCacheManager`].

pub mod config;
pub mod context;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod events;
pub mod manager;
pub mod metadata;
pub mod reachability;
pub mod stats;
pub mod validation;

pub use config::CacheConfig;
pub use context::{PlaybackContext, Track};
pub use entry::{cache_file_name, CacheEntry};
pub use error::{CacheError, Result};
pub use manager::AudioCacheManager;
pub use stats::{BatchOutcome, CacheStats, SweepReport};
