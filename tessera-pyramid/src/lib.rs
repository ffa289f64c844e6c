//! # Tessera Pyramid - tiled raster pyramids with a coalescing cache
//!
//! This crate models multi-resolution tiled data sources (mosaics and
//! pyramid sets) and provides the concurrent tile cache in front of their
//! origin: per-key fetch coalescing, a bounded LRU of decoded tiles, and
//! batch retrieval through a worker pool.
//!
//! ## Features
//!
//! - **Deterministic tile addressing**: tile `(col, row)` maps to its
//!   geographic envelope from the level origin, tile size and scale
//! - **At most one fetch per tile**: concurrent callers of the same tile
//!   share a single download and its outcome, success or failure
//! - **Bounded batches**: [`TileCache::tiles`] fans out over a worker pool
//!   and streams results in completion order; abandoning the stream never
//!   blocks the workers
//! - **Pluggable origin**: the [`TileFetcher`] collaborator hides where
//!   tile bytes come from
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_pyramid::{CacheConfig, FetchFn, Mosaic, PyramidSet, TileCache, TileSize};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let level = Mosaic::new("L0", 4, 4, TileSize::square_256(), (-180.0, 85.0511), 0.01)?;
//! let pyramid = PyramidSet::new("osm", "image/png", vec![level])?;
//!
//! let fetcher = Arc::new(FetchFn(
//!     |mosaic: &Mosaic, _format: &str, col: u32, row: u32| -> std::io::Result<Vec<u8>> {
//!         Ok(format!("tile {} {}x{}", mosaic.id(), col, row).into_bytes())
//!     },
//! ));
//! let cache = TileCache::new(pyramid, fetcher, CacheConfig::new());
//!
//! let bytes = cache.tile("L0", 0, 0)?;
//! println!("{} bytes", bytes.len());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod mosaic;

pub use batch::{TileCoord, TileReceiver, TileResult};
pub use cache::{CacheStats, TileCache, TileKey};
pub use config::CacheConfig;
pub use error::{PyramidError, PyramidResult};
pub use fetcher::{FetchFn, TileFetcher};
pub use mosaic::{Mosaic, PyramidSet, TileRange, TileSize};
