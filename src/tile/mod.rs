//! External tile and tiled-image contracts.

mod contract;

pub use contract::{Tile, TiledImage};
