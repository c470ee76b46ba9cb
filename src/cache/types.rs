//! Core types for the tile cache.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Default steady-state capacity target for [`CacheConfig`].
pub const DEFAULT_MAX_IMAGE_CACHE_COUNT: usize = 200;

/// Opaque string identifying the source content of a tile payload.
///
/// Equal keys imply interchangeable payloads: many tiles may share one cache
/// record through the same key. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Create a key from any string-like value.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Cache-related errors.
///
/// These surface contract misuse only; runtime inconsistencies are logged and
/// reported through `false`/`None` returns instead (callers are viewers, not
/// error handlers).
#[derive(Debug, Error)]
pub enum CacheError {
    /// A record was requested for a key the cache has never seen, without
    /// data to create it from.
    #[error("cannot create cache record for key {key}: no data supplied")]
    MissingData {
        /// The offending key.
        key: CacheKey,
    },
}

/// Tile cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Steady-state capacity target: the cache starts evicting once the
    /// number of live plus zombie records exceeds this count. A single
    /// insertion may briefly overshoot when no admissible victim exists.
    pub max_image_cache_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_image_cache_count: DEFAULT_MAX_IMAGE_CACHE_COUNT,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity target. Must be positive.
    pub fn with_max_image_cache_count(mut self, count: usize) -> Self {
        assert!(count > 0, "max_image_cache_count must be positive");
        self.max_image_cache_count = count;
        self
    }
}
