//! Viewer event surface.
//!
//! The cache raises exactly one event: `tile-unloaded`, after a tile has been
//! fully detached. Events are typed rather than stringly keyed.

use std::sync::Arc;

use crate::tile::{Tile, TiledImage};

/// Events the cache raises on the viewer.
#[derive(Clone)]
pub enum ViewerEvent {
    /// A tile was detached from every cache record it referenced.
    TileUnloaded {
        /// The detached tile.
        tile: Arc<dyn Tile>,
        /// The image the tile belongs to.
        tiled_image: Arc<dyn TiledImage>,
        /// True when the backing records were destroyed rather than kept as
        /// zombies.
        destroyed: bool,
    },
}

impl std::fmt::Debug for ViewerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewerEvent::TileUnloaded { destroyed, .. } => f
                .debug_struct("TileUnloaded")
                .field("destroyed", destroyed)
                .finish_non_exhaustive(),
        }
    }
}

/// The viewer contract: a sink for cache events.
pub trait Viewer: Send + Sync {
    /// Deliver one event to the viewer's handlers.
    ///
    /// Handlers must not call back into the cache synchronously.
    fn raise_event(&self, event: ViewerEvent);
}
