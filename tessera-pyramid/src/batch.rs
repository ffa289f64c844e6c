//! Bulk asynchronous tile retrieval.
//!
//! A batch request fans its coordinates out over a bounded pool of worker
//! threads and streams results back over a channel in completion order.
//! Dropping the receiver abandons the batch: results already in flight are
//! discarded without ever blocking a worker, and tiles fetched before the
//! abandonment stay in the cache.

use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver};

use crate::cache::TileCache;
use crate::error::PyramidResult;

/// One requested tile coordinate: `(mosaic id, col, row)`
pub type TileCoord = (String, u32, u32);

/// Outcome of one tile of a batch request
#[derive(Debug)]
pub struct TileResult {
    pub mosaic: String,
    pub col: u32,
    pub row: u32,
    pub result: PyramidResult<Arc<Vec<u8>>>,
}

/// Streaming receiver of batch results, in completion order.
///
/// Iterate to drain; drop early to abandon the rest of the batch.
pub struct TileReceiver {
    results: Receiver<TileResult>,
    requested: usize,
}

impl TileReceiver {
    /// Number of tiles the batch was asked for.
    pub fn requested(&self) -> usize {
        self.requested
    }
}

impl Iterator for TileReceiver {
    type Item = TileResult;

    fn next(&mut self) -> Option<TileResult> {
        self.results.recv().ok()
    }
}

impl TileCache {
    /// Fetches a batch of tiles through the worker pool.
    ///
    /// Each coordinate goes through the same per-key logic as
    /// [`tile`](TileCache::tile), so concurrent batches asking for
    /// overlapping tiles still download each tile once. Results arrive in
    /// completion order, not input order.
    pub fn tiles(&self, coords: &[TileCoord]) -> TileReceiver {
        let workers = self.inner.config.workers.min(coords.len()).max(1);
        // Bounded so an abandoned receiver never buffers the whole batch;
        // disconnected sends unblock the workers instead
        let (result_tx, result_rx) = bounded(workers * 2);
        let (job_tx, job_rx) = unbounded::<TileCoord>();
        for coord in coords {
            job_tx
                .send(coord.clone())
                .expect("receiver is alive in this scope");
        }
        drop(job_tx);

        for _ in 0..workers {
            let cache = self.clone();
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            std::thread::spawn(move || {
                for (mosaic, col, row) in jobs {
                    let result = cache.tile(&mosaic, col, row);
                    let outcome = TileResult {
                        mosaic,
                        col,
                        row,
                        result,
                    };
                    if results.send(outcome).is_err() {
                        // The caller abandoned the batch; the tile just
                        // fetched is cached, the rest is skipped
                        break;
                    }
                }
            });
        }

        TileReceiver {
            results: result_rx,
            requested: coords.len(),
        }
    }
}
