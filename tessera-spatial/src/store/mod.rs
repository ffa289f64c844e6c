//! Backing stores for node records.
//!
//! The tree driver addresses nodes only through [`NodeStore`], so the same
//! algorithms run over an in-memory arena or a paged file. Resolution is
//! lazy: `read` materializes exactly one record, which is what keeps trees
//! larger than memory usable.

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::error::SpatialResult;
use crate::node::{DataRef, Node, PageId};

/// Tree-level metadata persisted alongside the node records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub dimension: u32,
    pub max_entries: u32,
    pub min_entries: u32,
    /// Root page id, 0 while the tree is empty
    pub root: PageId,
    /// Tree height; 0 for an empty tree, 1 for a lone root leaf
    pub height: u32,
    pub entry_count: u64,
}

impl StoreMeta {
    pub fn new(dimension: u32, max_entries: u32, min_entries: u32) -> StoreMeta {
        StoreMeta {
            dimension,
            max_entries,
            min_entries,
            root: 0,
            height: 0,
            entry_count: 0,
        }
    }
}

/// Read/write counters a store may expose.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub cached_pages: u64,
}

/// An addressable set of node records.
///
/// Page ids are allocated by the store and stay valid until freed. Page 0 is
/// reserved for metadata and is never handed out.
pub trait NodeStore: Send + Sync {
    /// Resolves one node record on demand.
    fn read(&self, page: PageId) -> SpatialResult<Node>;

    /// Writes one node record. The write may be buffered until
    /// [`flush`](NodeStore::flush).
    fn write(&self, page: PageId, node: &Node) -> SpatialResult<()>;

    /// Reserves a fresh page id, reusing freed pages when possible.
    fn allocate(&self) -> SpatialResult<PageId>;

    /// Returns a page id to the store for reuse.
    fn free(&self, page: PageId) -> SpatialResult<()>;

    fn read_meta(&self) -> SpatialResult<StoreMeta>;

    fn write_meta(&self, meta: &StoreMeta) -> SpatialResult<()>;

    /// Pushes buffered writes to the backing medium.
    fn flush(&self) -> SpatialResult<()>;

    fn stats(&self) -> StoreStats {
        StoreStats::default()
    }
}

/// Resolves opaque leaf payload references to concrete data.
///
/// The index stores only [`DataRef`] identifiers; whoever owns the actual
/// payloads (a feature file, a record table) supplies one of these to turn
/// search results back into data.
pub trait DataReader {
    type Data;

    /// Materializes the payload behind `id`.
    fn create(&self, id: DataRef) -> SpatialResult<Self::Data>;

    /// Releases any resources held by the reader.
    fn close(&self) -> SpatialResult<()>;
}
