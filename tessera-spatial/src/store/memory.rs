//! In-memory node arena.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{SpatialError, SpatialResult};
use crate::node::{Node, PageId};
use crate::store::{NodeStore, StoreMeta};

/// A node store backed by a plain map, for trees that live and die inside
/// one process. Freed page ids are recycled through a free list so long
/// insert/delete workloads do not grow the id space without bound.
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<PageId, Node>>,
    meta: RwLock<StoreMeta>,
    free: Mutex<Vec<PageId>>,
    next: AtomicU64,
}

impl MemoryNodeStore {
    pub fn new(meta: StoreMeta) -> MemoryNodeStore {
        MemoryNodeStore {
            nodes: RwLock::new(HashMap::new()),
            meta: RwLock::new(meta),
            free: Mutex::new(Vec::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Number of live node records.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    fn read(&self, page: PageId) -> SpatialResult<Node> {
        self.nodes
            .read()
            .get(&page)
            .cloned()
            .ok_or_else(|| SpatialError::CorruptIndex(format!("unallocated page {}", page)))
    }

    fn write(&self, page: PageId, node: &Node) -> SpatialResult<()> {
        self.nodes.write().insert(page, node.clone());
        Ok(())
    }

    fn allocate(&self) -> SpatialResult<PageId> {
        if let Some(page) = self.free.lock().pop() {
            return Ok(page);
        }
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn free(&self, page: PageId) -> SpatialResult<()> {
        self.nodes.write().remove(&page);
        self.free.lock().push(page);
        Ok(())
    }

    fn read_meta(&self) -> SpatialResult<StoreMeta> {
        Ok(self.meta.read().clone())
    }

    fn write_meta(&self, meta: &StoreMeta) -> SpatialResult<()> {
        *self.meta.write() = meta.clone();
        Ok(())
    }

    fn flush(&self) -> SpatialResult<()> {
        Ok(())
    }
}
