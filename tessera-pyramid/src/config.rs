//! Tile cache configuration.

use std::time::Duration;

/// Default number of decoded tiles kept in memory
const DEFAULT_CAPACITY_TILES: usize = 256;

/// Default bounded wait for an in-flight fetch owned by another caller
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning parameters of a [`TileCache`](crate::TileCache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of parallel fetch workers a batch request may use
    pub workers: usize,
    /// Capacity of the decoded tile cache, in tiles
    pub capacity_tiles: usize,
    /// How long a caller waits on a tile fetched by someone else before
    /// giving up with [`PyramidError::LockTimeout`](crate::PyramidError::LockTimeout)
    pub wait_timeout: Duration,
}

impl CacheConfig {
    /// Defaults: one worker per CPU core, 256 cached tiles, 60 s wait.
    pub fn new() -> CacheConfig {
        let cpus = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);
        CacheConfig {
            workers: cpus.max(1),
            capacity_tiles: DEFAULT_CAPACITY_TILES,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> CacheConfig {
        self.workers = workers.max(1);
        self
    }

    pub fn with_capacity(mut self, tiles: usize) -> CacheConfig {
        self.capacity_tiles = tiles.max(1);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> CacheConfig {
        self.wait_timeout = timeout;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::new();
        assert!(config.workers >= 1);
        assert_eq!(config.capacity_tiles, 256);
        assert_eq!(config.wait_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_builders_clamp() {
        let config = CacheConfig::new().with_workers(0).with_capacity(0);
        assert_eq!(config.workers, 1);
        assert_eq!(config.capacity_tiles, 1);
    }
}
