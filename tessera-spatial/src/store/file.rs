//! Paged file store with lazy node loading.
//!
//! Node records live in fixed-size pages; page 0 holds the header. Each
//! record carries a CRC32 checksum so torn or corrupted pages surface as
//! [`SpatialError::CorruptIndex`] instead of garbage nodes. Reads go
//! through an LRU page cache with dirty write-back, and each cache miss
//! costs exactly one seek and one read - nothing is preloaded.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{SpatialError, SpatialResult};
use crate::node::{Node, PageId};
use crate::store::{NodeStore, StoreMeta, StoreStats};

/// Magic number identifying an index file ("TSIX")
const MAGIC: u32 = 0x5453_4958;

/// File format version
const VERSION: u32 = 1;

/// Default page size; large enough for a full node at typical fan-out
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Smallest accepted page size; the header must always fit one page
const MIN_PAGE_SIZE: usize = 512;

/// Default cache size in pages
pub const DEFAULT_CACHE_PAGES: usize = 1024;

/// Header stored in page 0
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileHeader {
    magic: u32,
    version: u32,
    page_size: u32,
    next_page: PageId,
    free_head: PageId,
    meta: StoreMeta,
}

impl FileHeader {
    fn new(meta: StoreMeta, page_size: u32) -> FileHeader {
        FileHeader {
            magic: MAGIC,
            version: VERSION,
            page_size,
            next_page: 1,
            free_head: 0,
            meta,
        }
    }

    fn validate(&self) -> SpatialResult<()> {
        if self.magic != MAGIC {
            return Err(SpatialError::CorruptIndex(
                "not an index file (bad magic)".into(),
            ));
        }
        if self.version != VERSION {
            return Err(SpatialError::CorruptIndex(format!(
                "unsupported index format version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// A node record wrapped with its CRC32 checksum
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckedRecord {
    checksum: u32,
    node: Node,
}

impl CheckedRecord {
    fn new(node: Node) -> SpatialResult<CheckedRecord> {
        let encoded = encode(&node)?;
        Ok(CheckedRecord {
            checksum: crc32(&encoded),
            node,
        })
    }

    fn into_node(self) -> SpatialResult<Node> {
        let encoded = encode(&self.node)?;
        let expected = crc32(&encoded);
        if self.checksum != expected {
            return Err(SpatialError::CorruptIndex(format!(
                "record checksum mismatch (expected {:x}, got {:x})",
                expected, self.checksum
            )));
        }
        Ok(self.node)
    }
}

fn encode<T: Serialize>(value: &T) -> SpatialResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| SpatialError::CorruptIndex(format!("record encoding failed: {}", e)))
}

fn decode<T: for<'de> Deserialize<'de>>(buffer: &[u8]) -> SpatialResult<T> {
    bincode::serde::decode_from_slice(buffer, bincode::config::legacy())
        .map(|(value, _)| value)
        .map_err(|e| SpatialError::CorruptIndex(format!("record decoding failed: {}", e)))
}

/// CRC32-MPEG2
fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0x04C1_1DB7;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }
    crc ^ 0xFFFF_FFFF
}

struct CachedPage {
    node: Node,
    dirty: bool,
}

/// LRU page cache with dirty tracking. Pages enter only on access; the
/// caller writes evicted dirty pages back before dropping them.
struct PageCache {
    pages: HashMap<PageId, CachedPage>,
    lru: VecDeque<PageId>,
    max_pages: usize,
}

impl PageCache {
    fn new(max_pages: usize) -> PageCache {
        PageCache {
            pages: HashMap::new(),
            lru: VecDeque::new(),
            max_pages: max_pages.max(1),
        }
    }

    fn get(&mut self, page: PageId) -> Option<&Node> {
        if self.pages.contains_key(&page) {
            self.touch(page);
            self.pages.get(&page).map(|c| &c.node)
        } else {
            None
        }
    }

    fn insert(&mut self, page: PageId, node: Node, dirty: bool) {
        if self.pages.insert(page, CachedPage { node, dirty }).is_some() {
            self.touch(page);
        } else {
            self.lru.push_back(page);
        }
    }

    fn touch(&mut self, page: PageId) {
        self.lru.retain(|&id| id != page);
        self.lru.push_back(page);
    }

    fn needs_eviction(&self) -> bool {
        self.pages.len() > self.max_pages
    }

    fn evict_oldest(&mut self) -> Option<(PageId, Node, bool)> {
        while let Some(page) = self.lru.pop_front() {
            if let Some(cached) = self.pages.remove(&page) {
                return Some((page, cached.node, cached.dirty));
            }
        }
        None
    }

    fn remove(&mut self, page: PageId) {
        self.lru.retain(|&id| id != page);
        self.pages.remove(&page);
    }

    fn dirty_pages(&self) -> Vec<PageId> {
        self.pages
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(id, _)| *id)
            .collect()
    }

    fn mark_clean(&mut self, page: PageId) {
        if let Some(cached) = self.pages.get_mut(&page) {
            cached.dirty = false;
        }
    }

    fn len(&self) -> usize {
        self.pages.len()
    }
}

/// Access counters, updated wait-free
#[derive(Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

/// A node store backed by a single paged file.
pub struct FileNodeStore {
    file: Mutex<File>,
    cache: Mutex<PageCache>,
    header: RwLock<FileHeader>,
    free: Mutex<Vec<PageId>>,
    counters: Counters,
    page_size: usize,
    #[allow(dead_code)]
    path: PathBuf,
}

impl FileNodeStore {
    /// Creates a new index file, truncating anything at `path`.
    pub fn create(path: impl AsRef<Path>, meta: StoreMeta) -> SpatialResult<FileNodeStore> {
        Self::create_with(path, meta, DEFAULT_PAGE_SIZE, DEFAULT_CACHE_PAGES)
    }

    /// Creates a new index file with explicit page and cache sizes.
    pub fn create_with(
        path: impl AsRef<Path>,
        meta: StoreMeta,
        page_size: usize,
        cache_pages: usize,
    ) -> SpatialResult<FileNodeStore> {
        if page_size < MIN_PAGE_SIZE {
            return Err(SpatialError::InvalidArgument(format!(
                "page size {} below the {} byte minimum",
                page_size, MIN_PAGE_SIZE
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let header = FileHeader::new(meta, page_size as u32);
        let store = FileNodeStore {
            file: Mutex::new(file),
            cache: Mutex::new(PageCache::new(cache_pages)),
            header: RwLock::new(header),
            free: Mutex::new(Vec::new()),
            counters: Counters::default(),
            page_size,
            path: path.as_ref().to_path_buf(),
        };
        store.write_header()?;
        store.file.lock().sync_all()?;
        Ok(store)
    }

    /// Opens an existing index file, reading only the header. Node records
    /// stay on disk until they are resolved through [`NodeStore::read`].
    pub fn open(path: impl AsRef<Path>) -> SpatialResult<FileNodeStore> {
        Self::open_with(path, DEFAULT_CACHE_PAGES)
    }

    /// Opens an existing index file with an explicit cache size.
    pub fn open_with(path: impl AsRef<Path>, cache_pages: usize) -> SpatialResult<FileNodeStore> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        // The header always fits the smallest supported page, so probing
        // that much is enough to learn the real page size
        let mut probe = vec![0u8; MIN_PAGE_SIZE];
        file.seek(SeekFrom::Start(0))?;
        read_page_bytes(&mut file, &mut probe)?;
        let header: FileHeader = decode(&probe)?;
        header.validate()?;
        let page_size = header.page_size as usize;
        Ok(FileNodeStore {
            file: Mutex::new(file),
            cache: Mutex::new(PageCache::new(cache_pages)),
            header: RwLock::new(header),
            free: Mutex::new(Vec::new()),
            counters: Counters::default(),
            page_size,
            path: path.as_ref().to_path_buf(),
        })
    }

    fn write_header(&self) -> SpatialResult<()> {
        let header = self.header.read().clone();
        let bytes = encode(&header)?;
        if bytes.len() > self.page_size {
            return Err(SpatialError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "header does not fit a page",
            )));
        }
        let mut padded = bytes;
        padded.resize(self.page_size, 0);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&padded)?;
        Ok(())
    }

    /// Reads one record straight from disk, bypassing the cache.
    fn read_from_disk(&self, page: PageId) -> SpatialResult<Node> {
        if page == 0 {
            return Err(SpatialError::CorruptIndex(
                "page 0 is reserved for the header".into(),
            ));
        }
        let offset = page as u64 * self.page_size as u64;
        let mut buffer = vec![0u8; self.page_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            read_page_bytes(&mut file, &mut buffer)?;
        }
        self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        let record: CheckedRecord = decode(&buffer)?;
        record.into_node()
    }

    /// Writes one record straight to disk.
    fn write_to_disk(&self, page: PageId, node: &Node) -> SpatialResult<()> {
        if page == 0 {
            return Err(SpatialError::CorruptIndex(
                "page 0 is reserved for the header".into(),
            ));
        }
        let record = CheckedRecord::new(node.clone())?;
        let bytes = encode(&record)?;
        if bytes.len() > self.page_size {
            return Err(SpatialError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "node record of {} bytes exceeds the {} byte page",
                    bytes.len(),
                    self.page_size
                ),
            )));
        }
        let mut padded = bytes;
        padded.resize(self.page_size, 0);
        let offset = page as u64 * self.page_size as u64;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&padded)?;
        }
        self.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Inserts into the cache, writing back evicted dirty pages.
    fn cache_node(&self, page: PageId, node: Node, dirty: bool) -> SpatialResult<()> {
        let mut cache = self.cache.lock();
        cache.insert(page, node, dirty);
        while cache.needs_eviction() {
            match cache.evict_oldest() {
                Some((evicted, node, true)) => self.write_to_disk(evicted, &node)?,
                Some(_) => {}
                None => break,
            }
        }
        Ok(())
    }
}

fn read_page_bytes(file: &mut File, buffer: &mut [u8]) -> SpatialResult<()> {
    file.read_exact(buffer).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SpatialError::CorruptIndex("truncated index file".into())
        } else {
            SpatialError::Io(e)
        }
    })
}

impl NodeStore for FileNodeStore {
    fn read(&self, page: PageId) -> SpatialResult<Node> {
        {
            let mut cache = self.cache.lock();
            if let Some(node) = cache.get(page) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(node.clone());
            }
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let node = self.read_from_disk(page)?;
        self.cache_node(page, node.clone(), false)?;
        Ok(node)
    }

    fn write(&self, page: PageId, node: &Node) -> SpatialResult<()> {
        self.cache_node(page, node.clone(), true)
    }

    fn allocate(&self) -> SpatialResult<PageId> {
        {
            let mut free = self.free.lock();
            if let Some(page) = free.pop() {
                // Keep the persisted head in step with the in-memory list
                self.header.write().free_head = free.last().copied().unwrap_or(0);
                return Ok(page);
            }
        }
        let mut header = self.header.write();
        if header.free_head != 0 {
            let page = header.free_head;
            header.free_head = 0;
            return Ok(page);
        }
        let page = header.next_page;
        header.next_page += 1;
        Ok(page)
    }

    fn free(&self, page: PageId) -> SpatialResult<()> {
        self.cache.lock().remove(page);
        let mut free = self.free.lock();
        free.push(page);
        self.header.write().free_head = page;
        Ok(())
    }

    fn read_meta(&self) -> SpatialResult<StoreMeta> {
        Ok(self.header.read().meta.clone())
    }

    fn write_meta(&self, meta: &StoreMeta) -> SpatialResult<()> {
        self.header.write().meta = meta.clone();
        self.write_header()
    }

    fn flush(&self) -> SpatialResult<()> {
        let dirty = self.cache.lock().dirty_pages();
        for page in dirty {
            let node = {
                let mut cache = self.cache.lock();
                match cache.get(page) {
                    Some(node) => node.clone(),
                    None => continue,
                }
            };
            self.write_to_disk(page, &node)?;
            self.cache.lock().mark_clean(page);
        }
        self.write_header()?;
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
            cached_pages: self.cache.lock().len() as u64,
        }
    }
}
