//! Error types for pyramid and tile cache operations.

use thiserror::Error;

use tessera_spatial::SpatialError;

/// Errors that can occur while addressing mosaics or fetching tiles.
///
/// The type is cloneable so one fetch failure can be handed to every
/// caller waiting on the same tile.
#[derive(Debug, Clone, Error)]
pub enum PyramidError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tile fetch failed for {mosaic}:{col}x{row}: {message}")]
    FetchFailure {
        mosaic: String,
        col: u32,
        row: u32,
        message: String,
    },

    #[error("timed out waiting for a tile fetch")]
    LockTimeout,

    #[error("tile cache is closed")]
    Closed,
}

impl From<SpatialError> for PyramidError {
    fn from(err: SpatialError) -> Self {
        PyramidError::InvalidArgument(err.to_string())
    }
}

/// Result type for pyramid operations
pub type PyramidResult<T> = Result<T, PyramidError>;
