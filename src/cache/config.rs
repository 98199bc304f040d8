//! Cache configuration.
//!
//! Controls the block-result store and the whole-page store via `tessera.toml`.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;

const DEFAULT_BLOCK_CAPACITY: usize = 1024;
const DEFAULT_PAGE_CAPACITY: usize = 256;
const DEFAULT_TTL_SECONDS: u64 = 3600;
const DEFAULT_MINIMAL_CACHE_TIME_SECONDS: u64 = 5;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Cache configuration from `tessera.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable caching of tagged block results.
    pub enable_block_cache: bool,
    /// Enable caching of assembled pages.
    pub enable_page_cache: bool,
    /// Maximum entries in the block store.
    pub block_capacity: usize,
    /// Maximum entries in the page store.
    pub page_capacity: usize,
    /// Store-wide lifetime of an entry in seconds; zero disables it.
    pub ttl_seconds: u64,
    /// Cache times at or below this many seconds are not worth storing.
    pub minimal_cache_time: u64,
    /// Interval (ms) between expired-entry sweeps.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_block_cache: true,
            enable_page_cache: true,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            page_capacity: DEFAULT_PAGE_CAPACITY,
            ttl_seconds: DEFAULT_TTL_SECONDS,
            minimal_cache_time: DEFAULT_MINIMAL_CACHE_TIME_SECONDS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enable_block_cache: settings.enable_block_cache,
            enable_page_cache: settings.enable_page_cache,
            block_capacity: settings.block_capacity.get(),
            page_capacity: settings.page_capacity.get(),
            ttl_seconds: settings.ttl_seconds,
            minimal_cache_time: settings.minimal_cache_time,
            sweep_interval_ms: settings.sweep_interval.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    /// Returns true if any store is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enable_block_cache || self.enable_page_cache
    }

    /// Returns the block capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn block_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.block_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the page capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn page_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.page_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }

    pub fn minimal_cache_time(&self) -> Duration {
        Duration::from_secs(self.minimal_cache_time)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
