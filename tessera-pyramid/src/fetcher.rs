//! The tile fetch collaborator.

use std::io;

use crate::mosaic::Mosaic;

/// Downloads one tile from the origin (network, disk, object store).
///
/// The cache treats this as a black box: it guarantees at most one
/// concurrent `fetch` per tile key and propagates any error to every
/// caller waiting on that tile. Timeout policy belongs to the
/// implementation, not to the cache.
pub trait TileFetcher: Send + Sync {
    /// Fetches the raw bytes of tile `(col, row)` of `mosaic`, encoded as
    /// `format`.
    fn fetch(&self, mosaic: &Mosaic, format: &str, col: u32, row: u32) -> io::Result<Vec<u8>>;
}

/// Adapter turning a plain function into a [`TileFetcher`].
pub struct FetchFn<F>(pub F);

impl<F> TileFetcher for FetchFn<F>
where
    F: Fn(&Mosaic, &str, u32, u32) -> io::Result<Vec<u8>> + Send + Sync,
{
    fn fetch(&self, mosaic: &Mosaic, format: &str, col: u32, row: u32) -> io::Result<Vec<u8>> {
        (self.0)(mosaic, format, col, row)
    }
}
