//! The shared tile cache of one pyramid set.
//!
//! Every tile request funnels through a per-key in-flight table: the first
//! caller for a key performs the physical fetch while concurrent callers
//! for the same key block on its completion, so the origin sees at most
//! one download per tile at a time. Completed tiles land in a bounded LRU
//! of decoded payloads; failures are handed to every waiter of the failed
//! attempt and then forgotten, so a later request may retry.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::config::CacheConfig;
use crate::error::{PyramidError, PyramidResult};
use crate::fetcher::TileFetcher;
use crate::mosaic::{Mosaic, PyramidSet};

/// Cache key of one tile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub mosaic: String,
    pub col: u32,
    pub row: u32,
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}x{}", self.mosaic, self.col, self.row)
    }
}

/// State of one in-flight fetch
enum FetchState {
    Pending,
    Ready(Arc<Vec<u8>>),
    Failed(PyramidError),
}

/// One physical fetch, shared between its owner and the callers waiting
/// on it
struct Inflight {
    state: Mutex<FetchState>,
    done: Condvar,
}

impl Inflight {
    fn new() -> Inflight {
        Inflight {
            state: Mutex::new(FetchState::Pending),
            done: Condvar::new(),
        }
    }

    fn complete(&self, state: FetchState) {
        *self.state.lock() = state;
        self.done.notify_all();
    }
}

/// Snapshot of the cache counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub failures: u64,
    /// Requests that waited on a fetch owned by another caller
    pub coalesced: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
}

/// The tile cache shared across one [`PyramidSet`].
///
/// Cloning is cheap and clones share the same cache.
#[derive(Clone)]
pub struct TileCache {
    pub(crate) inner: Arc<TileCacheInner>,
}

pub(crate) struct TileCacheInner {
    pyramid: PyramidSet,
    fetcher: Arc<dyn TileFetcher>,
    pub(crate) config: CacheConfig,
    tiles: Mutex<LruCache<TileKey, Arc<Vec<u8>>>>,
    inflight: DashMap<TileKey, Arc<Inflight>>,
    counters: Counters,
    closed: AtomicBool,
}

impl TileCache {
    pub fn new(
        pyramid: PyramidSet,
        fetcher: Arc<dyn TileFetcher>,
        config: CacheConfig,
    ) -> TileCache {
        let capacity =
            NonZeroUsize::new(config.capacity_tiles.max(1)).expect("clamped to at least 1");
        TileCache {
            inner: Arc::new(TileCacheInner {
                pyramid,
                fetcher,
                config,
                tiles: Mutex::new(LruCache::new(capacity)),
                inflight: DashMap::new(),
                counters: Counters::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn pyramid(&self) -> &PyramidSet {
        &self.inner.pyramid
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Returns the bytes of tile `(col, row)` of the given mosaic.
    ///
    /// Served from cache when possible; otherwise exactly one fetch runs
    /// for this key, and every concurrent caller for the same key awaits
    /// its outcome. A fetch failure is delivered to all waiters of that
    /// attempt; the key is then dropped from the in-flight table so a
    /// later call retries.
    pub fn tile(&self, mosaic: &str, col: u32, row: u32) -> PyramidResult<Arc<Vec<u8>>> {
        self.check_open()?;
        let mosaic = self
            .inner
            .pyramid
            .mosaic(mosaic)
            .ok_or_else(|| {
                PyramidError::InvalidArgument(format!(
                    "pyramid {} has no mosaic {}",
                    self.inner.pyramid.id(),
                    mosaic
                ))
            })?
            .clone();
        if col >= mosaic.columns() || row >= mosaic.rows() {
            return Err(PyramidError::InvalidArgument(format!(
                "tile {}x{} outside the {}x{} grid of mosaic {}",
                col,
                row,
                mosaic.columns(),
                mosaic.rows(),
                mosaic.id()
            )));
        }
        let key = TileKey {
            mosaic: mosaic.id().to_string(),
            col,
            row,
        };

        if let Some(bytes) = self.inner.tiles.lock().get(&key) {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(bytes.clone());
        }
        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);

        // Atomic get-or-create of the in-flight slot decides the owner
        let (slot, owner) = match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(Inflight::new());
                vacant.insert(slot.clone());
                (slot, true)
            }
        };

        if owner {
            self.run_fetch(&mosaic, key, slot)
        } else {
            self.await_fetch(key, slot)
        }
    }

    /// Drops a tile from the cache; the next request refetches it.
    pub fn invalidate(&self, mosaic: &str, col: u32, row: u32) {
        let key = TileKey {
            mosaic: mosaic.to_string(),
            col,
            row,
        };
        self.inner.tiles.lock().pop(&key);
    }

    /// Drops every cached tile.
    pub fn clear(&self) {
        self.inner.tiles.lock().clear();
    }

    /// Closes the cache; further requests fail with
    /// [`PyramidError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn check_open(&self) -> PyramidResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(PyramidError::Closed)
        } else {
            Ok(())
        }
    }

    /// Performs the physical fetch as the owner of `slot`.
    fn run_fetch(
        &self,
        mosaic: &Mosaic,
        key: TileKey,
        slot: Arc<Inflight>,
    ) -> PyramidResult<Arc<Vec<u8>>> {
        // Someone may have completed this key between our cache miss and
        // winning the slot
        if let Some(bytes) = self.inner.tiles.lock().get(&key) {
            let bytes = bytes.clone();
            slot.complete(FetchState::Ready(bytes.clone()));
            self.inner.inflight.remove(&key);
            return Ok(bytes);
        }

        self.inner.counters.fetches.fetch_add(1, Ordering::Relaxed);
        log::debug!("fetching tile {}", key);
        let fetched = self
            .inner
            .fetcher
            .fetch(mosaic, self.inner.pyramid.format(), key.col, key.row);
        let outcome = match fetched {
            Ok(bytes) => {
                let bytes = Arc::new(bytes);
                self.inner.tiles.lock().put(key.clone(), bytes.clone());
                Ok(bytes)
            }
            Err(e) => {
                self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("tile fetch failed for {}: {}", key, e);
                Err(PyramidError::FetchFailure {
                    mosaic: key.mosaic.clone(),
                    col: key.col,
                    row: key.row,
                    message: e.to_string(),
                })
            }
        };
        let state = match &outcome {
            Ok(bytes) => FetchState::Ready(bytes.clone()),
            Err(e) => FetchState::Failed(e.clone()),
        };
        slot.complete(state);
        // Dropping the slot lets the next request for this key start over
        self.inner.inflight.remove(&key);
        outcome
    }

    /// Waits for the owner of `slot` to finish, bounded by the configured
    /// wait timeout.
    fn await_fetch(&self, key: TileKey, slot: Arc<Inflight>) -> PyramidResult<Arc<Vec<u8>>> {
        self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.inner.config.wait_timeout;
        let mut state = slot.state.lock();
        while matches!(*state, FetchState::Pending) {
            if slot.done.wait_until(&mut state, deadline).timed_out() {
                log::warn!("timed out waiting for tile {}", key);
                return Err(PyramidError::LockTimeout);
            }
        }
        match &*state {
            FetchState::Ready(bytes) => Ok(bytes.clone()),
            FetchState::Failed(e) => Err(e.clone()),
            FetchState::Pending => unreachable!("loop exits only on completion"),
        }
    }
}
