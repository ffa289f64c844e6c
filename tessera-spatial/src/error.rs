//! Error types for spatial indexing operations.

use std::io;
use thiserror::Error;

/// Errors that can occur while building or querying a spatial index
#[derive(Debug, Error)]
pub enum SpatialError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("entry not found")]
    NotFound,

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the structure latch")]
    LockTimeout,

    #[error("tree is closed")]
    Closed,
}

/// Result type for spatial operations
pub type SpatialResult<T> = Result<T, SpatialError>;
