//! Collaborator contracts consumed by the cache.
//!
//! Tiles and tiled images live outside this crate; the viewer owns them.
//! The cache holds non-owning identity references (`Arc<dyn Tile>`, compared
//! with `Arc::ptr_eq`) and calls back only through these traits.

use std::sync::Arc;

use crate::cache::CacheKey;
use crate::events::Viewer;

/// A region of a tiled image at one zoom level.
///
/// The cache reads these attributes during eviction and unload; it never
/// mutates a tile except through [`Tile::unload`].
pub trait Tile: Send + Sync {
    /// The tile's primary cache key.
    fn cache_key(&self) -> CacheKey;

    /// Zoom level; higher is more detailed and cheaper to re-fetch.
    fn level(&self) -> u32;

    /// Whether the drawer is currently using this tile. Guarded from
    /// eviction while true.
    fn being_drawn(&self) -> bool;

    /// Monotonic touch stamp maintained by the viewer; larger is more recent.
    fn last_touch_time(&self) -> u64;

    /// The tiled image this tile belongs to.
    fn tiled_image(&self) -> Arc<dyn TiledImage>;

    /// Every cache key this tile currently references (primary plus any
    /// auxiliary keys).
    fn cache_keys(&self) -> Vec<CacheKey>;

    /// Whether the tile finished loading.
    fn loaded(&self) -> bool;

    /// Number of cache rows this tile contributes payload size for.
    fn cache_size(&self) -> usize;

    /// Release tile-side resources after the cache detached it.
    fn unload(&self);
}

/// The tiled-image abstraction owning a set of tiles and a redraw flag.
pub trait TiledImage: Send + Sync {
    /// Flag the image so its next frame is re-rendered.
    fn mark_needs_draw(&self);

    /// Whether this image keeps zombie records when its tiles are cleared.
    fn zombie_cache_enabled(&self) -> bool;

    /// The viewer events are raised on.
    fn viewer(&self) -> Arc<dyn Viewer>;
}
