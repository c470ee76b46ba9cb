//! Tile payload cache: records, tiers, and eviction.
//!
//! The cache is content-addressed: many tiles referencing the same
//! [`CacheKey`] share one [`CacheRecord`]. Records with no referring tiles
//! survive as zombies until capacity pressure or an explicit clear destroys
//! them, so revisiting a key is cheap.

mod record;
mod stats;
mod system;
mod types;

pub use record::CacheRecord;
pub use stats::CacheStats;
pub use system::{CacheTileRequest, TileCache};
pub use types::{CacheConfig, CacheError, CacheKey, DEFAULT_MAX_IMAGE_CACHE_COUNT};
