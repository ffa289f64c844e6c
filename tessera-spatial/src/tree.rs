//! The R-tree driver.
//!
//! `RTree` owns the root reference and global parameters and runs the
//! insert/search/delete algorithms over a [`NodeStore`], delegating split
//! decisions to the configured [`NodeFactory`]. Structural mutations stage
//! their node writes and commit them together, so a failed operation leaves
//! the pre-operation tree readable.
//!
//! Concurrency follows a single-writer/multiple-reader discipline: a
//! coarse structure latch excludes writers from each other and from active
//! search iterators, while searches run in parallel with each other.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::envelope::Envelope;
use crate::error::{SpatialError, SpatialResult};
use crate::hilbert::hilbert_key;
use crate::node::{ChildRef, DataRef, HilbertNodeFactory, LeafEntry, Node, NodeFactory, PageId};
use crate::store::file::FileNodeStore;
use crate::store::memory::MemoryNodeStore;
use crate::store::{DataReader, NodeStore, StoreMeta};

/// Default maximum number of members per node
pub const DEFAULT_MAX_ENTRIES: usize = 32;

/// Default minimum fill (40% of the maximum)
pub const DEFAULT_MIN_ENTRIES: usize = 13;

/// Default bounded wait for the structure latch
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Global parameters of one tree instance.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub dimension: usize,
    pub max_entries: usize,
    pub min_entries: usize,
    /// Bounded wait for the structure latch before giving up with
    /// [`SpatialError::LockTimeout`]
    pub lock_timeout: Duration,
}

impl TreeConfig {
    pub fn new(dimension: usize) -> TreeConfig {
        TreeConfig {
            dimension,
            max_entries: DEFAULT_MAX_ENTRIES,
            min_entries: DEFAULT_MIN_ENTRIES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_capacity(mut self, max_entries: usize, min_entries: usize) -> TreeConfig {
        self.max_entries = max_entries;
        self.min_entries = min_entries;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> TreeConfig {
        self.lock_timeout = timeout;
        self
    }

    fn validate(&self) -> SpatialResult<()> {
        if self.dimension < 2 {
            return Err(SpatialError::InvalidArgument(format!(
                "tree dimension must be at least 2, got {}",
                self.dimension
            )));
        }
        if self.min_entries < 2 {
            return Err(SpatialError::InvalidArgument(
                "min_entries must be at least 2".into(),
            ));
        }
        if self.min_entries * 2 > self.max_entries + 1 {
            return Err(SpatialError::InvalidArgument(format!(
                "min_entries {} too large for max_entries {}",
                self.min_entries, self.max_entries
            )));
        }
        Ok(())
    }
}

/// Mutable tree state guarded by the structure latch
#[derive(Debug, Clone)]
struct TreeMeta {
    root: PageId,
    height: u32,
    entry_count: u64,
}

/// Operation counters of one tree
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub entries: u64,
    pub height: u32,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub cached_pages: u64,
}

/// Something waiting to be (re)inserted: a fresh leaf entry, or a subtree
/// orphaned by condense-tree that rejoins at its recorded level.
enum Member {
    Entry(LeafEntry),
    Subtree(ChildRef, u32),
}

impl Member {
    fn envelope(&self) -> &Envelope {
        match self {
            Member::Entry(e) => &e.envelope,
            Member::Subtree(c, _) => &c.envelope,
        }
    }

    /// Level of the node this member belongs into.
    fn target_node_level(&self) -> u32 {
        match self {
            Member::Entry(_) => 0,
            Member::Subtree(_, level) => level + 1,
        }
    }
}

/// One step of a root-to-node descent. `child` indexes the child ref
/// leading to the next frame; `usize::MAX` marks the final frame.
struct PathFrame {
    page: PageId,
    node: Node,
    child: usize,
}

const NO_CHILD: usize = usize::MAX;

/// Node writes staged by one mutation, applied only once the whole
/// operation has been decided.
struct WriteBatch {
    writes: Vec<(PageId, Node)>,
    allocated: Vec<PageId>,
}

impl WriteBatch {
    fn new() -> WriteBatch {
        WriteBatch {
            writes: Vec::new(),
            allocated: Vec::new(),
        }
    }

    fn stage(&mut self, page: PageId, node: Node) {
        if let Some(slot) = self.writes.iter_mut().find(|(p, _)| *p == page) {
            slot.1 = node;
        } else {
            self.writes.push((page, node));
        }
    }

    fn commit(self, store: &dyn NodeStore) -> SpatialResult<()> {
        for (page, node) in &self.writes {
            store.write(*page, node)?;
        }
        Ok(())
    }

    /// Returns freshly allocated pages to the store after a failed staging.
    fn abort(self, store: &dyn NodeStore) {
        for page in self.allocated {
            let _ = store.free(page);
        }
    }
}

/// An R-tree over a pluggable node store.
///
/// Cloning is cheap and clones share the same tree.
///
/// # Example
///
/// ```rust
/// use tessera_spatial::{Envelope, RTree, TreeConfig};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let tree = RTree::in_memory(TreeConfig::new(2))?;
/// tree.insert(&Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0])?, 1)?;
///
/// let query = Envelope::new(vec![5.0, 5.0], vec![15.0, 15.0])?;
/// let hits: Vec<_> = tree.search(&query)?.collect::<Result<_, _>>()?;
/// assert_eq!(hits.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RTree {
    inner: Arc<RTreeInner>,
}

struct RTreeInner {
    store: Box<dyn NodeStore>,
    factory: Box<dyn NodeFactory>,
    config: TreeConfig,
    meta: RwLock<TreeMeta>,
    closed: RwLock<bool>,
}

impl RTree {
    /// Creates an empty tree over an in-memory arena.
    pub fn in_memory(config: TreeConfig) -> SpatialResult<RTree> {
        Self::in_memory_with(config, Box::new(HilbertNodeFactory::default()))
    }

    /// In-memory tree with an explicit node factory.
    pub fn in_memory_with(
        config: TreeConfig,
        factory: Box<dyn NodeFactory>,
    ) -> SpatialResult<RTree> {
        config.validate()?;
        let store = MemoryNodeStore::new(store_meta(&config));
        Ok(Self::from_parts(Box::new(store), factory, config, empty_meta()))
    }

    /// Creates a new file-backed tree at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<std::path::Path>, config: TreeConfig) -> SpatialResult<RTree> {
        Self::create_with(path, config, Box::new(HilbertNodeFactory::default()))
    }

    /// File-backed tree with an explicit node factory.
    pub fn create_with(
        path: impl AsRef<std::path::Path>,
        config: TreeConfig,
        factory: Box<dyn NodeFactory>,
    ) -> SpatialResult<RTree> {
        config.validate()?;
        log::debug!("creating spatial index at {:?}", path.as_ref());
        let store = FileNodeStore::create(path, store_meta(&config))?;
        Ok(Self::from_parts(Box::new(store), factory, config, empty_meta()))
    }

    /// Opens an existing file-backed tree.
    ///
    /// Only the header is read here; node records are paged in on demand.
    pub fn open(path: impl AsRef<std::path::Path>) -> SpatialResult<RTree> {
        Self::open_with(path, Box::new(HilbertNodeFactory::default()))
    }

    /// Opens an existing file-backed tree with an explicit node factory.
    pub fn open_with(
        path: impl AsRef<std::path::Path>,
        factory: Box<dyn NodeFactory>,
    ) -> SpatialResult<RTree> {
        log::debug!("opening spatial index at {:?}", path.as_ref());
        let store = FileNodeStore::open(path)?;
        let stored = store.read_meta()?;
        let config = TreeConfig {
            dimension: stored.dimension as usize,
            max_entries: stored.max_entries as usize,
            min_entries: stored.min_entries as usize,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };
        config
            .validate()
            .map_err(|e| SpatialError::CorruptIndex(format!("stored tree parameters: {}", e)))?;
        let meta = TreeMeta {
            root: stored.root,
            height: stored.height,
            entry_count: stored.entry_count,
        };
        Ok(Self::from_parts(Box::new(store), factory, config, meta))
    }

    /// Builds a tree over any node store, resuming from the store's metadata.
    pub fn with_store(
        store: Box<dyn NodeStore>,
        factory: Box<dyn NodeFactory>,
        config: TreeConfig,
    ) -> SpatialResult<RTree> {
        config.validate()?;
        let stored = store.read_meta()?;
        if stored.dimension as usize != config.dimension {
            return Err(SpatialError::DimensionMismatch {
                expected: config.dimension,
                actual: stored.dimension as usize,
            });
        }
        let meta = TreeMeta {
            root: stored.root,
            height: stored.height,
            entry_count: stored.entry_count,
        };
        Ok(Self::from_parts(store, factory, config, meta))
    }

    /// Builds a file-backed tree by packing `entries` in Hilbert order.
    ///
    /// Sorting by the curve key clusters nearby entries into the same
    /// leaves, which yields markedly tighter nodes than inserting in
    /// arrival order.
    pub fn bulk_load<I>(
        path: impl AsRef<std::path::Path>,
        config: TreeConfig,
        entries: I,
    ) -> SpatialResult<RTree>
    where
        I: IntoIterator<Item = (Envelope, DataRef)>,
    {
        let tree = Self::create(path, config)?;
        tree.bulk_extend(entries)?;
        Ok(tree)
    }

    /// In-memory counterpart of [`bulk_load`](RTree::bulk_load).
    pub fn bulk_load_in_memory<I>(config: TreeConfig, entries: I) -> SpatialResult<RTree>
    where
        I: IntoIterator<Item = (Envelope, DataRef)>,
    {
        let tree = Self::in_memory(config)?;
        tree.bulk_extend(entries)?;
        Ok(tree)
    }

    fn from_parts(
        store: Box<dyn NodeStore>,
        factory: Box<dyn NodeFactory>,
        config: TreeConfig,
        meta: TreeMeta,
    ) -> RTree {
        RTree {
            inner: Arc::new(RTreeInner {
                store,
                factory,
                config,
                meta: RwLock::new(meta),
                closed: RwLock::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.inner.config
    }

    pub fn dimension(&self) -> usize {
        self.inner.config.dimension
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> u64 {
        self.inner.meta.read().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree height; 0 for an empty tree.
    pub fn height(&self) -> u32 {
        self.inner.meta.read().height
    }

    pub fn stats(&self) -> TreeStats {
        let meta = self.inner.meta.read();
        let store = self.inner.store.stats();
        TreeStats {
            entries: meta.entry_count,
            height: meta.height,
            cache_hits: store.cache_hits,
            cache_misses: store.cache_misses,
            disk_reads: store.disk_reads,
            disk_writes: store.disk_writes,
            cached_pages: store.cached_pages,
        }
    }

    /// Inserts an entry, splitting nodes on overflow.
    pub fn insert(&self, envelope: &Envelope, data: DataRef) -> SpatialResult<()> {
        self.check_open()?;
        self.check_dimension(envelope)?;
        let mut meta = self.write_latch()?;
        let entry = LeafEntry {
            envelope: envelope.clone(),
            data,
        };
        self.insert_member(&mut meta, Member::Entry(entry))?;
        meta.entry_count += 1;
        self.persist_meta(&meta)
    }

    /// Searches for entries whose envelope intersects `query`.
    ///
    /// The returned iterator produces entries lazily, pruning subtrees
    /// whose box misses the query; dropping it early stops the traversal.
    /// It holds the reader side of the structure latch, so writers wait
    /// until every open iterator is dropped.
    pub fn search(&self, query: &Envelope) -> SpatialResult<SearchIter<'_>> {
        self.check_open()?;
        self.check_dimension(query)?;
        let latch = self
            .inner
            .meta
            .try_read_for(self.inner.config.lock_timeout)
            .ok_or(SpatialError::LockTimeout)?;
        let stack = if latch.root != 0 {
            vec![latch.root]
        } else {
            Vec::new()
        };
        Ok(SearchIter {
            inner: &*self.inner,
            _latch: latch,
            query: query.clone(),
            stack,
            pending: Vec::new().into_iter(),
            failed: false,
        })
    }

    /// Like [`search`](RTree::search), with each matching entry resolved
    /// through `reader`.
    pub fn search_with<'a, R>(
        &'a self,
        query: &Envelope,
        reader: &'a R,
    ) -> SpatialResult<impl Iterator<Item = SpatialResult<R::Data>> + 'a>
    where
        R: DataReader,
    {
        let iter = self.search(query)?;
        Ok(iter.map(move |entry| entry.and_then(|e| reader.create(e.data))))
    }

    /// Removes the entry matching `envelope` and `data` exactly.
    ///
    /// Underflowed nodes along the path are dissolved and their remaining
    /// members reinserted at their natural level (condense-tree), keeping
    /// all leaves at the same depth. Fails with [`SpatialError::NotFound`]
    /// when no such entry exists.
    pub fn delete(&self, envelope: &Envelope, data: DataRef) -> SpatialResult<()> {
        self.check_open()?;
        self.check_dimension(envelope)?;
        let mut meta = self.write_latch()?;
        if meta.root == 0 {
            return Err(SpatialError::NotFound);
        }

        let mut path = Vec::new();
        if !self.locate(meta.root, envelope, data, &mut path)? {
            return Err(SpatialError::NotFound);
        }

        {
            let leaf = path.last_mut().expect("located path is never empty");
            let Node::Leaf { entries } = &mut leaf.node else {
                return Err(SpatialError::CorruptIndex(
                    "located page is not a leaf".into(),
                ));
            };
            let pos = entries
                .iter()
                .position(|e| e.envelope == *envelope && e.data == data)
                .ok_or(SpatialError::NotFound)?;
            entries.remove(pos);
        }

        let min = self.inner.config.min_entries;
        let dim = self.inner.config.dimension;
        let mut batch = WriteBatch::new();
        let mut orphans: Vec<Member> = Vec::new();
        let mut freed: Vec<PageId> = Vec::new();
        let mut root_gone = false;

        // Condense: dissolve underflowed nodes bottom-up. Removing a child
        // ref happens before the parent's own check, so cascades fall out
        // of the traversal order.
        for i in (0..path.len()).rev() {
            let is_root = i == 0;
            let dissolve = if is_root {
                path[i].node.is_empty()
            } else {
                path[i].node.underflows(min)
            };
            if dissolve {
                match std::mem::replace(&mut path[i].node, Node::Leaf { entries: Vec::new() }) {
                    Node::Leaf { entries } => orphans.extend(entries.into_iter().map(Member::Entry)),
                    Node::Internal { children, level } => orphans.extend(
                        children
                            .into_iter()
                            .map(|c| Member::Subtree(c, level - 1)),
                    ),
                }
                freed.push(path[i].page);
                if is_root {
                    root_gone = true;
                } else {
                    let slot = path[i - 1].child;
                    let Node::Internal { children, .. } = &mut path[i - 1].node else {
                        return Err(SpatialError::CorruptIndex(
                            "leaf node has a child on the search path".into(),
                        ));
                    };
                    children.remove(slot);
                }
            } else {
                if !is_root {
                    let bounds = path[i].node.envelope(dim);
                    let slot = path[i - 1].child;
                    let Node::Internal { children, .. } = &mut path[i - 1].node else {
                        return Err(SpatialError::CorruptIndex(
                            "leaf node has a child on the search path".into(),
                        ));
                    };
                    children[slot].envelope = bounds;
                }
                batch.stage(path[i].page, path[i].node.clone());
            }
        }

        batch.commit(&*self.inner.store)?;
        for page in freed {
            self.inner.store.free(page)?;
        }
        if root_gone {
            meta.root = 0;
            meta.height = 0;
        }

        // Reinsert tallest subtrees first so the tree regrows top-down
        orphans.sort_by_key(|m| std::cmp::Reverse(m.target_node_level()));
        for member in orphans {
            self.insert_member(&mut meta, member)?;
        }

        // Shrink the root while it has a single child
        loop {
            if meta.root == 0 {
                break;
            }
            match self.inner.store.read(meta.root)? {
                Node::Internal { children, .. } if children.len() == 1 => {
                    let old = meta.root;
                    meta.root = children[0].page;
                    meta.height = meta.height.saturating_sub(1);
                    self.inner.store.free(old)?;
                }
                Node::Leaf { entries } if entries.is_empty() => {
                    let old = meta.root;
                    meta.root = 0;
                    meta.height = 0;
                    self.inner.store.free(old)?;
                    break;
                }
                _ => break,
            }
        }

        meta.entry_count = meta.entry_count.saturating_sub(1);
        self.persist_meta(&meta)
    }

    /// Removes every entry and resets the tree to its empty state.
    pub fn clear(&self) -> SpatialResult<()> {
        self.check_open()?;
        let mut meta = self.write_latch()?;
        if meta.root != 0 {
            self.free_subtree(meta.root)?;
        }
        meta.root = 0;
        meta.height = 0;
        meta.entry_count = 0;
        self.persist_meta(&meta)
    }

    /// Pushes buffered node writes to the backing store.
    pub fn flush(&self) -> SpatialResult<()> {
        self.check_open()?;
        self.inner.store.flush()
    }

    /// Flushes and closes the tree. Further operations fail with
    /// [`SpatialError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> SpatialResult<()> {
        let mut closed = self.inner.closed.write();
        if *closed {
            return Ok(());
        }
        self.inner.store.flush()?;
        *closed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn check_open(&self) -> SpatialResult<()> {
        if *self.inner.closed.read() {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_dimension(&self, envelope: &Envelope) -> SpatialResult<()> {
        if envelope.dimension() != self.inner.config.dimension {
            return Err(SpatialError::DimensionMismatch {
                expected: self.inner.config.dimension,
                actual: envelope.dimension(),
            });
        }
        Ok(())
    }

    fn write_latch(&self) -> SpatialResult<parking_lot::RwLockWriteGuard<'_, TreeMeta>> {
        self.inner
            .meta
            .try_write_for(self.inner.config.lock_timeout)
            .ok_or(SpatialError::LockTimeout)
    }

    fn persist_meta(&self, meta: &TreeMeta) -> SpatialResult<()> {
        let config = &self.inner.config;
        self.inner.store.write_meta(&StoreMeta {
            dimension: config.dimension as u32,
            max_entries: config.max_entries as u32,
            min_entries: config.min_entries as u32,
            root: meta.root,
            height: meta.height,
            entry_count: meta.entry_count,
        })
    }

    fn bulk_extend<I>(&self, entries: I) -> SpatialResult<()>
    where
        I: IntoIterator<Item = (Envelope, DataRef)>,
    {
        let dim = self.inner.config.dimension;
        let list: Vec<(Envelope, DataRef)> = entries.into_iter().collect();
        let mut world = Envelope::empty(dim);
        for (envelope, _) in &list {
            self.check_dimension(envelope)?;
            world.expand(envelope);
        }
        let order = (63 / dim as u32).min(16).max(1);
        let mut keyed: Vec<(u64, Envelope, DataRef)> = list
            .into_iter()
            .map(|(envelope, data)| {
                let key = hilbert_key(&envelope, &world, order);
                (key, envelope, data)
            })
            .collect();
        keyed.sort_by_key(|(key, _, _)| *key);
        for (_, envelope, data) in keyed {
            self.insert(&envelope, data)?;
        }
        Ok(())
    }

    /// Inserts a member at its natural level, splitting on overflow and
    /// growing the root when the split cascades all the way up. Every node
    /// write is staged and committed together.
    fn insert_member(&self, meta: &mut TreeMeta, member: Member) -> SpatialResult<()> {
        let dim = self.inner.config.dimension;
        let max = self.inner.config.max_entries;

        if meta.root == 0 {
            match member {
                Member::Entry(entry) => {
                    let page = self.inner.store.allocate()?;
                    let node = Node::Leaf {
                        entries: vec![entry],
                    };
                    self.inner.store.write(page, &node)?;
                    meta.root = page;
                    meta.height = 1;
                }
                Member::Subtree(child, level) => {
                    // An orphaned subtree rebuilding an emptied tree simply
                    // becomes the root again
                    meta.root = child.page;
                    meta.height = level + 1;
                }
            }
            return Ok(());
        }

        let root_level = meta.height - 1;
        let target = member.target_node_level();
        if target > root_level {
            let Member::Subtree(child, level) = member else {
                return Err(SpatialError::CorruptIndex(
                    "entry targeted above the root".into(),
                ));
            };
            if level != root_level {
                return Err(SpatialError::CorruptIndex(
                    "reinsertion level exceeds tree height".into(),
                ));
            }
            // A subtree as tall as the root: join both under a fresh root
            let root_env = self.inner.store.read(meta.root)?.envelope(dim);
            let page = self.inner.store.allocate()?;
            let node = Node::Internal {
                children: vec![
                    ChildRef {
                        envelope: root_env,
                        page: meta.root,
                    },
                    child,
                ],
                level: level + 1,
            };
            self.inner.store.write(page, &node)?;
            meta.root = page;
            meta.height = level + 2;
            return Ok(());
        }

        // Descend to the target level by least enlargement
        let mut path: Vec<PathFrame> = Vec::new();
        let mut page = meta.root;
        loop {
            let node = self.inner.store.read(page)?;
            if node.level() == target {
                path.push(PathFrame {
                    page,
                    node,
                    child: NO_CHILD,
                });
                break;
            }
            let slot = self.choose_child(&node, member.envelope())?;
            let next = match &node {
                Node::Internal { children, .. } => children[slot].page,
                Node::Leaf { .. } => {
                    return Err(SpatialError::CorruptIndex(
                        "leaf encountered above the target level".into(),
                    ))
                }
            };
            path.push(PathFrame {
                page,
                node,
                child: slot,
            });
            page = next;
        }

        // Append the member
        {
            let frame = path.last_mut().expect("descent pushes at least the root");
            match (&mut frame.node, member) {
                (Node::Leaf { entries }, Member::Entry(entry)) => entries.push(entry),
                (Node::Internal { children, .. }, Member::Subtree(child, _)) => {
                    children.push(child)
                }
                _ => {
                    return Err(SpatialError::CorruptIndex(
                        "target node does not match the member kind".into(),
                    ))
                }
            }
        }

        // Walk back up refreshing boxes and splitting overflowed nodes
        let mut batch = WriteBatch::new();
        let staged = (|| -> SpatialResult<Option<PageId>> {
            let mut carry: Option<ChildRef> = None;
            for i in (0..path.len()).rev() {
                if path[i].child != NO_CHILD {
                    let child_env = path[i + 1].node.envelope(dim);
                    let slot = path[i].child;
                    let Node::Internal { children, .. } = &mut path[i].node else {
                        return Err(SpatialError::CorruptIndex(
                            "leaf node has a child on the insertion path".into(),
                        ));
                    };
                    children[slot].envelope = child_env;
                    if let Some(sibling) = carry.take() {
                        children.push(sibling);
                    }
                }
                if path[i].node.overflows(max) {
                    let split_off = self.split_node(&mut path[i].node);
                    let sibling_env = split_off.envelope(dim);
                    let sibling_page = self.inner.store.allocate()?;
                    batch.allocated.push(sibling_page);
                    batch.stage(sibling_page, split_off);
                    carry = Some(ChildRef {
                        envelope: sibling_env,
                        page: sibling_page,
                    });
                }
                batch.stage(path[i].page, path[i].node.clone());
            }
            let Some(sibling) = carry else {
                return Ok(None);
            };
            // The root itself split: grow the tree by one level
            let root_env = path[0].node.envelope(dim);
            let page = self.inner.store.allocate()?;
            batch.allocated.push(page);
            let node = Node::Internal {
                children: vec![
                    ChildRef {
                        envelope: root_env,
                        page: path[0].page,
                    },
                    sibling,
                ],
                level: path[0].node.level() + 1,
            };
            batch.stage(page, node);
            Ok(Some(page))
        })();

        match staged {
            Ok(new_root) => {
                batch.commit(&*self.inner.store)?;
                if let Some(page) = new_root {
                    meta.root = page;
                    meta.height += 1;
                }
                Ok(())
            }
            Err(e) => {
                batch.abort(&*self.inner.store);
                Err(e)
            }
        }
    }

    /// Picks the child needing the least area enlargement, breaking ties by
    /// smaller area and finally by fewer members.
    fn choose_child(&self, node: &Node, envelope: &Envelope) -> SpatialResult<usize> {
        let Node::Internal { children, .. } = node else {
            return Err(SpatialError::CorruptIndex(
                "expected an internal node".into(),
            ));
        };
        if children.is_empty() {
            return Err(SpatialError::CorruptIndex(
                "internal node without children".into(),
            ));
        }
        let mut best = 0usize;
        let mut best_growth = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for (i, child) in children.iter().enumerate() {
            let growth = child.envelope.enlargement(envelope);
            let area = child.envelope.area();
            if growth < best_growth || (growth == best_growth && area < best_area) {
                best = i;
                best_growth = growth;
                best_area = area;
            } else if growth == best_growth && area == best_area && i != best {
                let best_len = self.inner.store.read(children[best].page)?.len();
                let this_len = self.inner.store.read(children[i].page)?.len();
                if this_len < best_len {
                    best = i;
                }
            }
        }
        Ok(best)
    }

    /// Splits an overflowing node in place, returning the split-off sibling.
    fn split_node(&self, node: &mut Node) -> Node {
        let min = self.inner.config.min_entries;
        match node {
            Node::Leaf { entries } => {
                let members = std::mem::take(entries);
                let (kept, split_off) = self.inner.factory.split_entries(members, min);
                *entries = kept;
                Node::Leaf { entries: split_off }
            }
            Node::Internal { children, level } => {
                let members = std::mem::take(children);
                let (kept, split_off) = self.inner.factory.split_children(members, min);
                *children = kept;
                Node::Internal {
                    children: split_off,
                    level: *level,
                }
            }
        }
    }

    /// Finds the leaf holding the exact `(envelope, data)` entry, recording
    /// the descent path. Prunes children whose box does not fully contain
    /// the entry, since member boxes always enclose their content.
    fn locate(
        &self,
        page: PageId,
        envelope: &Envelope,
        data: DataRef,
        path: &mut Vec<PathFrame>,
    ) -> SpatialResult<bool> {
        let node = self.inner.store.read(page)?;
        match &node {
            Node::Leaf { entries } => {
                if entries
                    .iter()
                    .any(|e| e.envelope == *envelope && e.data == data)
                {
                    path.push(PathFrame {
                        page,
                        node,
                        child: NO_CHILD,
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Node::Internal { children, .. } => {
                let candidates: Vec<(usize, PageId)> = children
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.envelope.contains(envelope))
                    .map(|(i, c)| (i, c.page))
                    .collect();
                path.push(PathFrame {
                    page,
                    node,
                    child: NO_CHILD,
                });
                for (slot, child_page) in candidates {
                    path.last_mut().expect("just pushed").child = slot;
                    if self.locate(child_page, envelope, data, path)? {
                        return Ok(true);
                    }
                }
                path.pop();
                Ok(false)
            }
        }
    }

    fn free_subtree(&self, page: PageId) -> SpatialResult<()> {
        if let Node::Internal { children, .. } = self.inner.store.read(page)? {
            for child in children {
                self.free_subtree(child.page)?;
            }
        }
        self.inner.store.free(page)
    }
}

impl Drop for RTreeInner {
    fn drop(&mut self) {
        if !*self.closed.read() {
            let _ = self.store.flush();
        }
    }
}

/// Lazy depth-first search over the tree.
///
/// Holds the reader side of the structure latch for its whole lifetime;
/// drop it to let writers proceed.
pub struct SearchIter<'a> {
    inner: &'a RTreeInner,
    _latch: RwLockReadGuard<'a, TreeMeta>,
    query: Envelope,
    stack: Vec<PageId>,
    pending: std::vec::IntoIter<LeafEntry>,
    failed: bool,
}

impl Iterator for SearchIter<'_> {
    type Item = SpatialResult<LeafEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(entry) = self.pending.next() {
                return Some(Ok(entry));
            }
            let page = self.stack.pop()?;
            match self.inner.store.read(page) {
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Ok(Node::Leaf { entries }) => {
                    let matched: Vec<LeafEntry> = entries
                        .into_iter()
                        .filter(|e| e.envelope.intersects(&self.query))
                        .collect();
                    self.pending = matched.into_iter();
                }
                Ok(Node::Internal { children, .. }) => {
                    for child in children {
                        if child.envelope.intersects(&self.query) {
                            self.stack.push(child.page);
                        }
                    }
                }
            }
        }
    }
}

fn store_meta(config: &TreeConfig) -> StoreMeta {
    StoreMeta::new(
        config.dimension as u32,
        config.max_entries as u32,
        config.min_entries as u32,
    )
}

fn empty_meta() -> TreeMeta {
    TreeMeta {
        root: 0,
        height: 0,
        entry_count: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::QuadraticNodeFactory;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn env2(lo: [f64; 2], hi: [f64; 2]) -> Envelope {
        Envelope::new(lo.to_vec(), hi.to_vec()).unwrap()
    }

    fn collect(tree: &RTree, query: &Envelope) -> Vec<DataRef> {
        tree.search(query)
            .unwrap()
            .map(|r| r.unwrap().data)
            .collect()
    }

    /// Walks every node, returning (level, member count) pairs plus the
    /// stored root envelope.
    fn node_census(tree: &RTree) -> (Vec<(u32, usize)>, Option<Envelope>) {
        let meta = tree.inner.meta.read();
        if meta.root == 0 {
            return (Vec::new(), None);
        }
        let mut census = Vec::new();
        let mut stack = vec![meta.root];
        while let Some(page) = stack.pop() {
            let node = tree.inner.store.read(page).unwrap();
            census.push((node.level(), node.len()));
            if let Node::Internal { children, .. } = node {
                stack.extend(children.iter().map(|c| c.page));
            }
        }
        let root_env = tree
            .inner
            .store
            .read(meta.root)
            .unwrap()
            .envelope(tree.dimension());
        (census, Some(root_env))
    }

    #[test]
    fn test_insert_and_search() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        tree.insert(&env2([0.0, 0.0], [10.0, 10.0]), 1).unwrap();
        tree.insert(&env2([5.0, 5.0], [15.0, 15.0]), 2).unwrap();
        tree.insert(&env2([20.0, 20.0], [30.0, 30.0]), 3).unwrap();
        assert_eq!(tree.len(), 3);

        let mut hits = collect(&tree, &env2([8.0, 8.0], [12.0, 12.0]));
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn test_search_empty_tree() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        assert!(collect(&tree, &env2([0.0, 0.0], [100.0, 100.0])).is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        let e3 = Envelope::new(vec![0.0; 3], vec![1.0; 3]).unwrap();
        assert!(matches!(
            tree.insert(&e3, 1),
            Err(SpatialError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            tree.search(&e3),
            Err(SpatialError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            tree.delete(&e3, 1),
            Err(SpatialError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RTree::in_memory(TreeConfig::new(1)).is_err());
        assert!(RTree::in_memory(TreeConfig::new(2).with_capacity(4, 1)).is_err());
        assert!(RTree::in_memory(TreeConfig::new(2).with_capacity(4, 4)).is_err());
    }

    #[test]
    fn test_search_union_returns_every_entry_once() {
        let mut rng = StdRng::seed_from_u64(7);
        let tree = RTree::in_memory(TreeConfig::new(2).with_capacity(8, 3)).unwrap();
        let mut world = Envelope::empty(2);
        for data in 0..500u64 {
            let x = rng.gen_range(-1000.0..1000.0);
            let y = rng.gen_range(-1000.0..1000.0);
            let envelope = env2([x, y], [x + rng.gen_range(0.0..5.0), y + rng.gen_range(0.0..5.0)]);
            world.expand(&envelope);
            tree.insert(&envelope, data).unwrap();
        }
        let world = Envelope::new(
            (0..2).map(|i| world.lower(i)).collect(),
            (0..2).map(|i| world.upper(i)).collect(),
        )
        .unwrap();
        let mut hits = collect(&tree, &world);
        hits.sort_unstable();
        assert_eq!(hits, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_early_abort_is_cheap() {
        let tree = RTree::in_memory(TreeConfig::new(2).with_capacity(8, 3)).unwrap();
        for i in 0..200u64 {
            let x = (i % 20) as f64;
            let y = (i / 20) as f64;
            tree.insert(&env2([x, y], [x + 0.5, y + 0.5]), i).unwrap();
        }
        let mut iter = tree.search(&env2([-1.0, -1.0], [25.0, 25.0])).unwrap();
        assert!(iter.next().is_some());
        drop(iter);
        // The latch is free again for writers
        tree.insert(&env2([50.0, 50.0], [51.0, 51.0]), 999).unwrap();
    }

    #[test]
    fn test_leaf_fill_bounds_after_many_inserts() {
        let mut rng = StdRng::seed_from_u64(42);
        let tree = RTree::in_memory(TreeConfig::new(2).with_capacity(8, 3)).unwrap();
        let mut world = Envelope::empty(2);
        for data in 0..1000u64 {
            let x: f64 = rng.gen_range(-500.0..500.0);
            let y: f64 = rng.gen_range(-500.0..500.0);
            let point = Envelope::point(vec![x, y]);
            world.expand(&point);
            tree.insert(&point, data).unwrap();
        }

        let (census, root_env) = node_census(&tree);
        let root_level = tree.height() - 1;
        for (level, len) in &census {
            if *level == root_level {
                continue; // the root may hold fewer members
            }
            assert!(
                *len >= 3 && *len <= 8,
                "node at level {} holds {} members",
                level,
                len
            );
        }
        // The root envelope is exactly the union of all inserted points
        let root_env = root_env.unwrap();
        let expected = Envelope::new(
            (0..2).map(|i| world.lower(i)).collect(),
            (0..2).map(|i| world.upper(i)).collect(),
        )
        .unwrap();
        assert_eq!(root_env, expected);

        // Height stays logarithmic: at min fill 3, 1000 entries fit well
        // within 8 levels
        assert!(tree.height() <= 8, "height {} too large", tree.height());
    }

    #[test]
    fn test_delete_removes_entry() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        let target = env2([5.0, 5.0], [6.0, 6.0]);
        tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 1).unwrap();
        tree.insert(&target, 2).unwrap();
        tree.delete(&target, 2).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(collect(&tree, &target).is_empty());
    }

    #[test]
    fn test_delete_missing_entry_fails() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 1).unwrap();
        // Same envelope, different data ref
        assert!(matches!(
            tree.delete(&env2([0.0, 0.0], [1.0, 1.0]), 2),
            Err(SpatialError::NotFound)
        ));
        // Different envelope, same data ref
        assert!(matches!(
            tree.delete(&env2([0.0, 0.0], [2.0, 2.0]), 1),
            Err(SpatialError::NotFound)
        ));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_delete_last_entry_empties_tree() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        let envelope = env2([0.0, 0.0], [1.0, 1.0]);
        tree.insert(&envelope, 1).unwrap();
        tree.delete(&envelope, 1).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        // The tree is usable again afterwards
        tree.insert(&envelope, 2).unwrap();
        assert_eq!(collect(&tree, &envelope), vec![2]);
    }

    #[test]
    fn test_insert_delete_cycles_keep_tree_consistent() {
        let mut rng = StdRng::seed_from_u64(99);
        let tree = RTree::in_memory(TreeConfig::new(2).with_capacity(8, 3)).unwrap();
        let mut live: Vec<(Envelope, u64)> = Vec::new();
        for data in 0..300u64 {
            let x: f64 = rng.gen_range(0.0..100.0);
            let y: f64 = rng.gen_range(0.0..100.0);
            let envelope = Envelope::point(vec![x, y]);
            tree.insert(&envelope, data).unwrap();
            live.push((envelope, data));
        }
        // Delete most of them in random order
        for _ in 0..250 {
            let victim = rng.gen_range(0..live.len());
            let (envelope, data) = live.swap_remove(victim);
            tree.delete(&envelope, data).unwrap();
        }
        assert_eq!(tree.len(), live.len() as u64);

        let world = env2([-1.0, -1.0], [101.0, 101.0]);
        let mut hits = collect(&tree, &world);
        hits.sort_unstable();
        let mut expected: Vec<u64> = live.iter().map(|(_, d)| *d).collect();
        expected.sort_unstable();
        assert_eq!(hits, expected);

        // Every survivor is individually findable
        for (envelope, data) in &live {
            assert!(collect(&tree, envelope).contains(data));
        }
        assert!(tree.height() <= 6, "height {} after churn", tree.height());
    }

    #[test]
    fn test_quadratic_factory_tree() {
        let tree = RTree::in_memory_with(
            TreeConfig::new(2).with_capacity(8, 3),
            Box::new(QuadraticNodeFactory),
        )
        .unwrap();
        for i in 0..100u64 {
            let x = (i % 10) as f64;
            let y = (i / 10) as f64;
            tree.insert(&env2([x, y], [x + 0.5, y + 0.5]), i).unwrap();
        }
        let hits = collect(&tree, &env2([0.0, 0.0], [4.0, 4.0]));
        assert!(!hits.is_empty());
        assert_eq!(tree.len(), 100);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.tsx");
        let queries = [
            env2([0.0, 0.0], [3.0, 3.0]),
            env2([5.0, 5.0], [9.0, 9.0]),
            env2([-10.0, -10.0], [100.0, 100.0]),
        ];
        let mut before: Vec<Vec<DataRef>> = Vec::new();
        {
            let tree = RTree::create(&path, TreeConfig::new(2).with_capacity(8, 3)).unwrap();
            for i in 0..200u64 {
                let x = (i % 15) as f64;
                let y = (i / 15) as f64;
                tree.insert(&env2([x, y], [x + 1.0, y + 1.0]), i).unwrap();
            }
            for q in &queries {
                let mut hits = collect(&tree, q);
                hits.sort_unstable();
                before.push(hits);
            }
            tree.close().unwrap();
        }
        let tree = RTree::open(&path).unwrap();
        assert_eq!(tree.len(), 200);
        for (q, expected) in queries.iter().zip(&before) {
            let mut hits = collect(&tree, q);
            hits.sort_unstable();
            assert_eq!(&hits, expected);
        }
    }

    #[test]
    fn test_open_pages_lazily() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.tsx");
        {
            let tree = RTree::create(&path, TreeConfig::new(2).with_capacity(8, 3)).unwrap();
            for i in 0..500u64 {
                let x = (i % 25) as f64;
                let y = (i / 25) as f64;
                tree.insert(&env2([x, y], [x + 0.5, y + 0.5]), i).unwrap();
            }
            tree.close().unwrap();
        }
        let tree = RTree::open(&path).unwrap();
        let stats = tree.stats();
        assert_eq!(stats.cached_pages, 0, "open must not materialize nodes");
        assert_eq!(stats.entries, 500);

        let hits = collect(&tree, &env2([0.0, 0.0], [2.0, 2.0]));
        assert!(!hits.is_empty());
        let stats = tree.stats();
        assert!(stats.disk_reads > 0);
        assert!(
            stats.cached_pages < 20,
            "a point query should only touch the search path, loaded {}",
            stats.cached_pages
        );
    }

    #[test]
    fn test_bulk_load_matches_incremental() {
        let entries: Vec<(Envelope, DataRef)> = (0..150u64)
            .map(|i| {
                let x = (i % 12) as f64;
                let y = (i / 12) as f64;
                (env2([x, y], [x + 1.0, y + 1.0]), i)
            })
            .collect();
        let tree =
            RTree::bulk_load_in_memory(TreeConfig::new(2).with_capacity(8, 3), entries.clone())
                .unwrap();
        assert_eq!(tree.len(), 150);
        let query = env2([0.0, 0.0], [5.0, 5.0]);
        let mut hits = collect(&tree, &query);
        hits.sort_unstable();
        let mut expected: Vec<DataRef> = entries
            .iter()
            .filter(|(e, _)| e.intersects(&query))
            .map(|(_, d)| *d)
            .collect();
        expected.sort_unstable();
        assert_eq!(hits, expected);
    }

    #[test]
    fn test_clear() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        for i in 0..50u64 {
            tree.insert(&env2([i as f64, 0.0], [i as f64 + 1.0, 1.0]), i)
                .unwrap();
        }
        tree.clear().unwrap();
        assert!(tree.is_empty());
        assert!(collect(&tree, &env2([0.0, 0.0], [100.0, 100.0])).is_empty());
    }

    #[test]
    fn test_closed_tree_rejects_operations() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        tree.close().unwrap();
        tree.close().unwrap(); // idempotent
        assert!(matches!(
            tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 1),
            Err(SpatialError::Closed)
        ));
        assert!(matches!(
            tree.search(&env2([0.0, 0.0], [1.0, 1.0])),
            Err(SpatialError::Closed)
        ));
    }

    #[test]
    fn test_writer_times_out_while_reader_active() {
        let tree = RTree::in_memory(
            TreeConfig::new(2).with_lock_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 1).unwrap();
        let iter = tree.search(&env2([0.0, 0.0], [1.0, 1.0])).unwrap();
        let result = tree.insert(&env2([2.0, 2.0], [3.0, 3.0]), 2);
        assert!(matches!(result, Err(SpatialError::LockTimeout)));
        drop(iter);
        tree.insert(&env2([2.0, 2.0], [3.0, 3.0]), 2).unwrap();
    }

    #[test]
    fn test_search_with_resolves_payloads() {
        struct NameReader;
        impl DataReader for NameReader {
            type Data = String;
            fn create(&self, id: DataRef) -> SpatialResult<String> {
                if id == 13 {
                    return Err(SpatialError::NotFound);
                }
                Ok(format!("feature-{}", id))
            }
            fn close(&self) -> SpatialResult<()> {
                Ok(())
            }
        }

        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 7).unwrap();
        let reader = NameReader;
        let resolved: Vec<String> = tree
            .search_with(&env2([0.0, 0.0], [2.0, 2.0]), &reader)
            .unwrap()
            .collect::<SpatialResult<_>>()
            .unwrap();
        assert_eq!(resolved, vec!["feature-7".to_string()]);

        tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 13).unwrap();
        let failed: SpatialResult<Vec<String>> = tree
            .search_with(&env2([0.0, 0.0], [2.0, 2.0]), &reader)
            .unwrap()
            .collect();
        assert!(failed.is_err());
        reader.close().unwrap();
    }

    #[test]
    fn test_failed_insert_leaves_tree_readable() {
        let tree = RTree::in_memory(TreeConfig::new(2)).unwrap();
        tree.insert(&env2([0.0, 0.0], [1.0, 1.0]), 1).unwrap();
        let e3 = Envelope::new(vec![0.0; 3], vec![1.0; 3]).unwrap();
        assert!(tree.insert(&e3, 2).is_err());
        assert_eq!(tree.len(), 1);
        assert_eq!(collect(&tree, &env2([0.0, 0.0], [1.0, 1.0])), vec![1]);
    }
}
