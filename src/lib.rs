//! deeptile - tile cache core for deep-zoom image viewers
//!
//! This library provides the in-memory retention layer of a deep-zoom
//! viewer: decoded tile payloads shared across tiles by cache key,
//! asynchronous in-place format conversion along a registered conversion
//! graph, and capacity-bound eviction with a zombie tier for cheap
//! re-reference.
//!
//! # High-Level API
//!
//! ```ignore
//! use deeptile::cache::{CacheTileRequest, TileCache};
//! use deeptile::convert::ConversionGraph;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ConversionGraph::new());
//! let cache = TileCache::new(registry);
//!
//! // After a fetch completes, link the tile to its payload record.
//! let record = cache.cache_tile(
//!     CacheTileRequest::new(tile)
//!         .with_data(bytes)
//!         .with_data_type("raw"),
//! )?;
//!
//! // Drawing consumers request the format they need.
//! let texture = record.transform_to("texture".into()).await;
//! ```

pub mod cache;
pub mod convert;
pub mod events;
pub mod tile;

#[cfg(test)]
pub(crate) mod testutil;

/// Version of the deeptile library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
