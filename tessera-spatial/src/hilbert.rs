//! Hilbert curve utilities for spatial locality optimization.
//!
//! The Hilbert curve is a continuous fractal space-filling curve that maps
//! n-dimensional grid coordinates to a 1D position while preserving spatial
//! locality. The index supports two directions:
//!
//! - [`hilbert_path`] enumerates the whole curve of a given order, yielding
//!   the traversal order over every cell of the grid. This is the ordering
//!   used when clustering entries on disk.
//! - [`hilbert_index`] maps a single grid cell to its position on the curve,
//!   the key the Hilbert split policy sorts node members by.
//!
//! Both directions use the same transpose-form bit transform, so they are
//! exact inverses of each other.

use crate::envelope::Envelope;
use crate::error::{SpatialError, SpatialResult};

/// Maximum usable curve order per dimension (`dimension * order` must fit u64)
const MAX_INDEX_BITS: u32 = 63;

/// Converts grid coordinates to transpose form, in place.
///
/// Transpose form distributes the bits of the Hilbert position over the
/// axes; `transpose_to_index` collects them back into a single integer.
fn axes_to_transpose(x: &mut [u64], order: u32) {
    let n = x.len();
    let mut q: u64 = 1 << (order - 1);
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    q = 1 << (order - 1);
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}

/// Converts transpose form back to grid coordinates, in place.
fn transpose_to_axes(x: &mut [u64], order: u32) {
    let n = x.len();
    // Gray decode by H ^ (H / 2)
    let t = x[n - 1] >> 1;
    for i in (1..n).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;
    // Undo excess work
    let mut q: u64 = 2;
    while q != 1 << order {
        let p = q - 1;
        for i in (0..n).rev() {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }
}

/// Collects a transpose-form value into a single curve position.
///
/// The position's bits interleave the axes most-significant-first, with
/// axis 0 contributing the leading bit of each group.
fn transpose_to_index(x: &[u64], order: u32) -> u64 {
    let mut h = 0u64;
    for j in (0..order).rev() {
        for v in x {
            h = (h << 1) | ((v >> j) & 1);
        }
    }
    h
}

/// Spreads a curve position into transpose form.
fn index_to_transpose(h: u64, dimension: usize, order: u32) -> Vec<u64> {
    let mut x = vec![0u64; dimension];
    let total = dimension as u32 * order;
    for k in 0..total {
        let bit = (h >> (total - 1 - k)) & 1;
        let i = k as usize % dimension;
        let j = order - 1 - k / dimension as u32;
        x[i] |= bit << j;
    }
    x
}

fn check_params(dimension: usize, order: u32) -> SpatialResult<()> {
    if dimension < 2 {
        return Err(SpatialError::InvalidArgument(format!(
            "hilbert curve requires dimension >= 2, got {}",
            dimension
        )));
    }
    if order < 1 {
        return Err(SpatialError::InvalidArgument(
            "hilbert curve requires order >= 1".into(),
        ));
    }
    if dimension as u32 * order > MAX_INDEX_BITS {
        return Err(SpatialError::InvalidArgument(format!(
            "hilbert index of {} bits does not fit u64",
            dimension as u32 * order
        )));
    }
    Ok(())
}

/// Maps a grid cell to its position on the Hilbert curve.
///
/// `coords` holds one discrete coordinate per axis, each in
/// `[0, 2^order)`. Positions of neighbouring cells are close on the curve,
/// which is what makes the result usable as a clustering sort key.
pub fn hilbert_index(coords: &[u64], order: u32) -> u64 {
    debug_assert!(coords.len() >= 2, "dimension must be >= 2");
    debug_assert!(
        coords.iter().all(|&c| c < 1 << order),
        "coordinates must fit the grid"
    );
    let mut x = coords.to_vec();
    axes_to_transpose(&mut x, order);
    transpose_to_index(&x, order)
}

/// Enumerates the Hilbert curve of the given order over an n-dimensional grid.
///
/// Returns the row-major linearized position (`sum_i coord[i] << (order * i)`)
/// of every cell, in curve traversal order. The result is a permutation of
/// `[0, 2^(dimension * order))`: each cell appears exactly once, and
/// consecutive cells differ by one step along a single axis.
///
/// Fails with [`SpatialError::InvalidArgument`] for `dimension < 2`,
/// `order < 1`, or a grid whose linearized positions do not fit `u64`.
pub fn hilbert_path(dimension: usize, order: u32) -> SpatialResult<Vec<u64>> {
    check_params(dimension, order)?;
    let len = 1u64 << (dimension as u32 * order);
    let mut path = Vec::with_capacity(len as usize);
    for h in 0..len {
        let mut x = index_to_transpose(h, dimension, order);
        transpose_to_axes(&mut x, order);
        let mut pos = 0u64;
        for (i, c) in x.iter().enumerate() {
            pos |= c << (order as usize * i);
        }
        path.push(pos);
    }
    Ok(path)
}

/// Derives a Hilbert sort key for an envelope within a world region.
///
/// The envelope center is normalized into `world`, discretized onto the
/// `2^order` grid and mapped through [`hilbert_index`]. Axes on which the
/// world has no extent normalize to the grid center.
pub fn hilbert_key(envelope: &Envelope, world: &Envelope, order: u32) -> u64 {
    debug_assert_eq!(envelope.dimension(), world.dimension());
    let n = 1u64 << order;
    let center = envelope.center();
    let mut coords = Vec::with_capacity(center.len());
    for (axis, c) in center.iter().enumerate() {
        let range = world.span(axis);
        let norm = if range > 0.0 {
            ((c - world.lower(axis)) / range).clamp(0.0, 1.0)
        } else {
            0.5
        };
        let cell = (norm * (n as f64 - 0.5)) as u64;
        coords.push(cell.min(n - 1));
    }
    hilbert_index(&coords, order)
}

/// A precomputed Hilbert traversal for one `(dimension, order)` pair.
///
/// Generating the path is exponential in `dimension * order`, so callers
/// that repeatedly walk the same grid keep one of these around and only
/// regenerate when the grid geometry changes.
#[derive(Debug, Clone)]
pub struct HilbertPath {
    dimension: usize,
    order: u32,
    positions: Vec<u64>,
}

impl HilbertPath {
    /// Generates and caches the curve for the given grid.
    pub fn generate(dimension: usize, order: u32) -> SpatialResult<HilbertPath> {
        let positions = hilbert_path(dimension, order)?;
        Ok(HilbertPath {
            dimension,
            order,
            positions,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Linearized grid positions in curve traversal order.
    pub fn positions(&self) -> &[u64] {
        &self.positions
    }

    /// The grid cell visited at the given step of the traversal.
    pub fn position_of(&self, step: usize) -> u64 {
        self.positions[step]
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
