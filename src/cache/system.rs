//! Tile cache coordinator.
//!
//! [`TileCache`] owns every [`CacheRecord`] and the two retention tiers:
//! live records (at least one referring tile) and zombies (no referring
//! tile, payload retained so a future reference to the same key is cheap).
//! Insertion beyond the capacity target evicts a zombie first; with no
//! zombie available, the least-recently-touched live tile above the cutoff
//! level goes, deeper-zoom tiles first on ties.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::cache::record::CacheRecord;
use crate::cache::stats::CacheStats;
use crate::cache::types::{CacheConfig, CacheError, CacheKey};
use crate::convert::{ConversionRegistry, DataFormat, Payload};
use crate::events::ViewerEvent;
use crate::tile::{Tile, TiledImage};

/// Arguments for [`TileCache::cache_tile`].
pub struct CacheTileRequest {
    tile: Arc<dyn Tile>,
    key: Option<CacheKey>,
    data: Option<Payload>,
    data_type: Option<DataFormat>,
    cutoff: u32,
}

impl CacheTileRequest {
    /// Cache under the tile's primary key.
    pub fn new(tile: Arc<dyn Tile>) -> Self {
        Self {
            tile,
            key: None,
            data: None,
            data_type: None,
            cutoff: 0,
        }
    }

    /// Cache under an explicit key instead of the tile's primary key.
    pub fn with_key(mut self, key: impl Into<CacheKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Payload to adopt when the key has no record yet.
    pub fn with_data(mut self, data: impl Into<Payload>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Format tag of the supplied payload. Guessed (with a warning) when
    /// data is supplied untagged.
    pub fn with_data_type(mut self, format: impl Into<DataFormat>) -> Self {
        self.data_type = Some(format.into());
        self
    }

    /// Zoom cutoff for the eviction this insertion may trigger: tiles at or
    /// below this level are never evicted.
    pub fn with_cutoff(mut self, cutoff: u32) -> Self {
        self.cutoff = cutoff;
        self
    }
}

/// A tile detachment whose side effects run after the tier lock drops.
struct DeferredUnload {
    tile: Arc<dyn Tile>,
    destroyed: bool,
}

#[derive(Default)]
struct TileCacheInner {
    live: HashMap<CacheKey, Arc<CacheRecord>>,
    zombies: HashMap<CacheKey, Arc<CacheRecord>>,
    /// Eviction-candidate list. A tile appears once per distinct cache key
    /// whose payload size it contributes.
    tiles_loaded: Vec<Arc<dyn Tile>>,
    stats: CacheStats,
}

/// The content-addressed tile payload cache.
pub struct TileCache {
    config: CacheConfig,
    registry: Arc<dyn ConversionRegistry>,
    inner: Mutex<TileCacheInner>,
}

impl TileCache {
    /// Create a cache with the default configuration.
    pub fn new(registry: Arc<dyn ConversionRegistry>) -> Self {
        Self::with_config(registry, CacheConfig::default())
    }

    /// Create a cache with an explicit configuration.
    pub fn with_config(registry: Arc<dyn ConversionRegistry>, config: CacheConfig) -> Self {
        Self {
            config,
            registry,
            inner: Mutex::new(TileCacheInner::default()),
        }
    }

    /// Record a fetched payload under a cache key and link `tile` to it.
    ///
    /// Finds or creates the record for the key, revives it from the zombie
    /// tier when needed, and runs one eviction pass when the insertion pushes
    /// the cache past its capacity target.
    ///
    /// # Errors
    ///
    /// [`CacheError::MissingData`] when the key has no record yet and no
    /// data was supplied to create one.
    pub fn cache_tile(&self, request: CacheTileRequest) -> Result<Arc<CacheRecord>, CacheError> {
        let CacheTileRequest {
            tile,
            key,
            data,
            data_type,
            cutoff,
        } = request;
        let cache_key = key.unwrap_or_else(|| tile.cache_key());

        let mut deferred = Vec::new();
        let record = {
            let mut inner = self.inner.lock().unwrap();

            let record = if let Some(record) = inner.live.get(&cache_key) {
                Arc::clone(record)
            } else if let Some(record) = inner.zombies.remove(&cache_key) {
                if record.is_destroyed() {
                    record.revive();
                }
                debug!(key = %cache_key, "revived zombie cache record");
                inner.stats.records_revived += 1;
                inner.live.insert(cache_key.clone(), Arc::clone(&record));
                record
            } else {
                if data.is_none() {
                    error!(key = %cache_key, "cannot create cache record without data");
                    return Err(CacheError::MissingData { key: cache_key });
                }
                let record = CacheRecord::new(Arc::clone(&self.registry));
                inner.live.insert(cache_key.clone(), Arc::clone(&record));
                inner.stats.records_created += 1;
                record
            };

            let data_type = match (&data, data_type) {
                (Some(data), None) => {
                    warn!(key = %cache_key, "tile cached without a data type; guessing");
                    self.registry.guess_type(data)
                }
                (_, data_type) => data_type,
            };

            record.add_tile(Arc::clone(&tile), data, data_type);

            if cache_key == tile.cache_key() {
                tile.tiled_image().mark_needs_draw();
            }

            // Eviction pass: prefer zombies, then the LRU live tile.
            let mut victim_slot = None;
            if inner.live.len() + inner.zombies.len() > self.config.max_image_cache_count {
                if let Some(zombie_key) = inner.zombies.keys().next().cloned() {
                    let zombie = inner
                        .zombies
                        .remove(&zombie_key)
                        .expect("zombie key taken from the map");
                    zombie.destroy();
                    inner.stats.zombie_evictions += 1;
                    debug!(key = %zombie_key, "destroyed zombie record under capacity pressure");
                } else {
                    victim_slot = self.evict_live_locked(&mut inner, cutoff, &mut deferred);
                }
            }

            // Insertion bookkeeping: a first-time tile takes the freed slot
            // (or the tail); a tile with prior cache rows is already in the
            // sequence, so a freed slot is compacted away instead.
            let insert_idx = victim_slot.unwrap_or(inner.tiles_loaded.len());
            if tile.cache_size() == 0 {
                if insert_idx == inner.tiles_loaded.len() {
                    inner.tiles_loaded.push(tile);
                } else {
                    inner.tiles_loaded[insert_idx] = tile;
                }
            } else if victim_slot.is_some() {
                inner.tiles_loaded.remove(insert_idx);
            }

            record
        };

        self.flush_deferred(deferred);
        Ok(record)
    }

    /// Decouple one tile from one cache key.
    ///
    /// Returns false (with a log record) when the key has no live record or
    /// the tile was not attached to it. A record left with no referring
    /// tiles is destroyed or moved to the zombie tier.
    pub fn unload_cache_for_tile(
        &self,
        tile: &Arc<dyn Tile>,
        key: &CacheKey,
        destroy: bool,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.unload_cache_for_tile_locked(&mut inner, tile, key, destroy)
    }

    fn unload_cache_for_tile_locked(
        &self,
        inner: &mut TileCacheInner,
        tile: &Arc<dyn Tile>,
        key: &CacheKey,
        destroy: bool,
    ) -> bool {
        let Some(record) = inner.live.get(key).map(Arc::clone) else {
            warn!(key = %key, "no live cache record under this key; nothing to unload");
            return false;
        };
        if !record.remove_tile(tile) {
            error!(key = %key, "tile not attached to its cache record; cache is inconsistent");
            return false;
        }
        if record.tile_count() == 0 {
            if destroy {
                record.destroy();
            } else {
                inner.zombies.insert(key.clone(), record);
                inner.stats.records_zombied += 1;
            }
            inner.live.remove(key);
        }
        true
    }

    /// Fully detach a tile: every cache key it references, then the tile
    /// itself. Raises `tile-unloaded` on the viewer.
    pub fn unload_tile(&self, tile: &Arc<dyn Tile>, destroy: bool) {
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            self.unload_tile_locked(&mut inner, tile, destroy, None, &mut deferred);
        }
        self.flush_deferred(deferred);
    }

    fn unload_tile_locked(
        &self,
        inner: &mut TileCacheInner,
        tile: &Arc<dyn Tile>,
        destroy: bool,
        delete_at: Option<usize>,
        deferred: &mut Vec<DeferredUnload>,
    ) {
        for key in tile.cache_keys() {
            self.unload_cache_for_tile_locked(inner, tile, &key, destroy);
        }
        if let Some(idx) = delete_at {
            inner.tiles_loaded.remove(idx);
        }
        inner.stats.tiles_unloaded += 1;
        deferred.push(DeferredUnload {
            tile: Arc::clone(tile),
            destroyed: destroy,
        });
    }

    /// Remove every tile belonging to `tiled_image`.
    ///
    /// Records go to the zombie tier when the image opted in and the cache
    /// is not overflowing; otherwise they are destroyed.
    pub fn clear_tiles_for(&self, tiled_image: &Arc<dyn TiledImage>) {
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let mut overflow =
                inner.live.len() + inner.zombies.len() > self.config.max_image_cache_count;

            if !tiled_image.zombie_cache_enabled() && overflow {
                let drained: Vec<_> = inner.zombies.drain().collect();
                inner.stats.zombie_evictions += drained.len() as u64;
                for (_, zombie) in drained {
                    zombie.destroy();
                }
                overflow = inner.live.len() > self.config.max_image_cache_count;
            }

            let mut i = inner.tiles_loaded.len();
            while i > 0 {
                i -= 1;
                let tile = Arc::clone(&inner.tiles_loaded[i]);
                if !Arc::ptr_eq(&tile.tiled_image(), tiled_image) {
                    continue;
                }
                if !tile.loaded() {
                    inner.tiles_loaded.remove(i);
                    continue;
                }
                let destroy = !tiled_image.zombie_cache_enabled() || overflow;
                self.unload_tile_locked(&mut inner, &tile, destroy, Some(i), &mut deferred);
            }
        }
        self.flush_deferred(deferred);
    }

    /// The record under `key`, live or zombie.
    pub fn get_cache_record(&self, key: &CacheKey) -> Option<Arc<CacheRecord>> {
        let inner = self.inner.lock().unwrap();
        inner
            .live
            .get(key)
            .or_else(|| inner.zombies.get(key))
            .map(Arc::clone)
    }

    /// Length of the eviction-candidate list. A single tile may be counted
    /// once per distinct cache key it contributes payload size for.
    pub fn num_tiles_loaded(&self) -> usize {
        self.inner.lock().unwrap().tiles_loaded.len()
    }

    /// Number of live records.
    pub fn num_caches_loaded(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    /// Number of zombie records.
    pub fn num_zombie_caches(&self) -> usize {
        self.inner.lock().unwrap().zombies.len()
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats
    }

    /// Pick and unload the worst live tile; returns its slot in the
    /// candidate list.
    ///
    /// Scans from the end toward the start, skipping tiles at or below the
    /// cutoff level and tiles being drawn. Among the rest the oldest touch
    /// wins, ties broken toward the higher (deeper-zoom) level. Finding no
    /// admissible victim leaves the cache briefly over target.
    fn evict_live_locked(
        &self,
        inner: &mut TileCacheInner,
        cutoff: u32,
        deferred: &mut Vec<DeferredUnload>,
    ) -> Option<usize> {
        let mut worst: Option<(usize, u64, u32)> = None;
        for i in (0..inner.tiles_loaded.len()).rev() {
            let tile = &inner.tiles_loaded[i];
            let level = tile.level();
            if level <= cutoff || tile.being_drawn() {
                continue;
            }
            let touch = tile.last_touch_time();
            let candidate = (touch, std::cmp::Reverse(level));
            let replace = match worst {
                None => true,
                Some((_, worst_touch, worst_level)) => {
                    candidate < (worst_touch, std::cmp::Reverse(worst_level))
                }
            };
            if replace {
                worst = Some((i, touch, level));
            }
        }

        let (idx, touch, level) = worst?;
        let victim = Arc::clone(&inner.tiles_loaded[idx]);
        debug!(level, touch, "evicting least-recently-touched live tile");
        self.unload_tile_locked(inner, &victim, true, None, deferred);
        inner.stats.live_evictions += 1;
        Some(idx)
    }

    /// Run detachment side effects after the tier lock is released: the
    /// tile's own unload hook, then the viewer event.
    fn flush_deferred(&self, deferred: Vec<DeferredUnload>) {
        for DeferredUnload { tile, destroyed } in deferred {
            tile.unload();
            let tiled_image = tile.tiled_image();
            let viewer = tiled_image.viewer();
            viewer.raise_event(ViewerEvent::TileUnloaded {
                tile,
                tiled_image,
                destroyed,
            });
        }
    }
}
