//! An n-dimensional axis-aligned bounding box.

use serde::{Deserialize, Serialize};

use crate::error::{SpatialError, SpatialResult};

/// An axis-aligned bounding box in n-dimensional space.
///
/// An `Envelope` is the pair of its lower and upper corners, one ordinate per
/// dimension. It is the unit of all index math: node bounds, query regions and
/// entry keys are all envelopes. Once stored in a node record an envelope is
/// never mutated in place; the owning record is replaced instead.
///
/// # Examples
///
/// ```rust
/// use tessera_spatial::Envelope;
///
/// let bbox = Envelope::new(vec![0.0, 0.0], vec![100.0, 100.0]).unwrap();
/// assert!(bbox.contains(&Envelope::point(vec![50.0, 50.0])));
/// ```
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Envelope {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Envelope({:?}, {:?})", self.lower, self.upper)
    }
}

impl Envelope {
    /// Creates an envelope from its lower and upper corners.
    ///
    /// Fails with [`SpatialError::InvalidBounds`] when the corners have
    /// different lengths, are empty, contain non-finite ordinates, or are
    /// inverted (`lower[i] > upper[i]` for any axis).
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> SpatialResult<Envelope> {
        if lower.is_empty() || lower.len() != upper.len() {
            return Err(SpatialError::InvalidBounds(format!(
                "corner dimensions disagree: {} vs {}",
                lower.len(),
                upper.len()
            )));
        }
        for i in 0..lower.len() {
            if !lower[i].is_finite() || !upper[i].is_finite() {
                return Err(SpatialError::InvalidBounds(format!(
                    "non-finite ordinate on axis {}",
                    i
                )));
            }
            if lower[i] > upper[i] {
                return Err(SpatialError::InvalidBounds(format!(
                    "lower corner exceeds upper corner on axis {}: {} > {}",
                    i, lower[i], upper[i]
                )));
            }
        }
        Ok(Envelope { lower, upper })
    }

    /// Creates a degenerate envelope spanning a single point.
    pub fn point(coords: Vec<f64>) -> Envelope {
        Envelope {
            lower: coords.clone(),
            upper: coords,
        }
    }

    /// Creates the empty envelope for the given dimension.
    ///
    /// The empty envelope is inverted (`+inf` lower, `-inf` upper) and acts
    /// as the identity for [`expand`](Envelope::expand).
    pub fn empty(dimension: usize) -> Envelope {
        Envelope {
            lower: vec![f64::INFINITY; dimension],
            upper: vec![f64::NEG_INFINITY; dimension],
        }
    }

    /// Number of dimensions of this envelope.
    pub fn dimension(&self) -> usize {
        self.lower.len()
    }

    /// Lower ordinate on the given axis.
    pub fn lower(&self, axis: usize) -> f64 {
        self.lower[axis]
    }

    /// Upper ordinate on the given axis.
    pub fn upper(&self, axis: usize) -> f64 {
        self.upper[axis]
    }

    /// Extent along the given axis.
    pub fn span(&self, axis: usize) -> f64 {
        self.upper[axis] - self.lower[axis]
    }

    /// Center coordinates of this envelope.
    pub fn center(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    /// Whether this envelope is inverted on any axis (contains nothing).
    pub fn is_empty(&self) -> bool {
        self.lower
            .iter()
            .zip(&self.upper)
            .any(|(lo, hi)| lo > hi)
    }

    /// The n-dimensional volume (area in 2D) of this envelope.
    pub fn area(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Sum of the extents over all axes, the perimeter-family cost metric.
    pub fn margin(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| hi - lo)
            .sum()
    }

    /// Checks if this envelope intersects `other`, boundaries included.
    pub fn intersects(&self, other: &Envelope) -> bool {
        debug_assert_eq!(self.dimension(), other.dimension());
        self.lower
            .iter()
            .zip(&self.upper)
            .zip(other.lower.iter().zip(&other.upper))
            .all(|((lo, hi), (olo, ohi))| *lo <= *ohi && *hi >= *olo)
    }

    /// Checks if this envelope fully contains `other`.
    pub fn contains(&self, other: &Envelope) -> bool {
        debug_assert_eq!(self.dimension(), other.dimension());
        self.lower
            .iter()
            .zip(&self.upper)
            .zip(other.lower.iter().zip(&other.upper))
            .all(|((lo, hi), (olo, ohi))| *lo <= *olo && *hi >= *ohi)
    }

    /// Returns the smallest envelope covering both operands.
    pub fn union(&self, other: &Envelope) -> Envelope {
        debug_assert_eq!(self.dimension(), other.dimension());
        Envelope {
            lower: self
                .lower
                .iter()
                .zip(&other.lower)
                .map(|(a, b)| a.min(*b))
                .collect(),
            upper: self
                .upper
                .iter()
                .zip(&other.upper)
                .map(|(a, b)| a.max(*b))
                .collect(),
        }
    }

    /// Grows this envelope in place to cover `other`.
    pub fn expand(&mut self, other: &Envelope) {
        debug_assert_eq!(self.dimension(), other.dimension());
        for i in 0..self.lower.len() {
            self.lower[i] = self.lower[i].min(other.lower[i]);
            self.upper[i] = self.upper[i].max(other.upper[i]);
        }
    }

    /// Returns the overlap of both operands, if any.
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope {
            lower: self
                .lower
                .iter()
                .zip(&other.lower)
                .map(|(a, b)| a.max(*b))
                .collect(),
            upper: self
                .upper
                .iter()
                .zip(&other.upper)
                .map(|(a, b)| a.min(*b))
                .collect(),
        })
    }

    /// How much this envelope's area grows when it is enlarged to hold `other`.
    pub fn enlargement(&self, other: &Envelope) -> f64 {
        self.union(other).area() - self.area()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_valid() {
        let env = Envelope::new(vec![1.0, 2.0], vec![3.0, 4.0]).unwrap();
        assert_eq!(env.dimension(), 2);
        assert_eq!(env.lower(0), 1.0);
        assert_eq!(env.upper(1), 4.0);
    }

    #[test]
    fn test_new_inverted_rejected() {
        let result = Envelope::new(vec![10.0, 0.0], vec![0.0, 10.0]);
        assert!(matches!(result, Err(SpatialError::InvalidBounds(_))));
    }

    #[test]
    fn test_new_mismatched_corners_rejected() {
        let result = Envelope::new(vec![0.0, 0.0], vec![1.0]);
        assert!(matches!(result, Err(SpatialError::InvalidBounds(_))));
    }

    #[test]
    fn test_new_non_finite_rejected() {
        let result = Envelope::new(vec![0.0, f64::NAN], vec![1.0, 1.0]);
        assert!(matches!(result, Err(SpatialError::InvalidBounds(_))));
    }

    #[test]
    fn test_point_has_zero_area() {
        let env = Envelope::point(vec![5.0, 5.0]);
        assert_eq!(env.area(), 0.0);
        assert!(!env.is_empty());
    }

    #[test]
    fn test_area_and_margin() {
        let env = Envelope::new(vec![0.0, 0.0], vec![10.0, 5.0]).unwrap();
        assert_eq!(env.area(), 50.0);
        assert_eq!(env.margin(), 15.0);
    }

    #[test]
    fn test_area_3d() {
        let env = Envelope::new(vec![0.0, 0.0, 0.0], vec![2.0, 3.0, 4.0]).unwrap();
        assert_eq!(env.area(), 24.0);
    }

    #[test]
    fn test_center() {
        let env = Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        assert_eq!(env.center(), vec![5.0, 5.0]);
    }

    #[test]
    fn test_intersects_touching_counts() {
        let a = Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        let b = Envelope::new(vec![10.0, 10.0], vec![20.0, 20.0]).unwrap();
        let c = Envelope::new(vec![11.0, 11.0], vec![20.0, 20.0]).unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_contains() {
        let outer = Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        let inner = Envelope::new(vec![2.0, 2.0], vec![8.0, 8.0]).unwrap();
        let partial = Envelope::new(vec![5.0, 5.0], vec![15.0, 15.0]).unwrap();
        assert!(outer.contains(&inner));
        assert!(!outer.contains(&partial));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn test_union() {
        let a = Envelope::new(vec![0.0, 0.0], vec![5.0, 5.0]).unwrap();
        let b = Envelope::new(vec![3.0, 3.0], vec![10.0, 10.0]).unwrap();
        let u = a.union(&b);
        assert_eq!(u.lower(0), 0.0);
        assert_eq!(u.upper(1), 10.0);
    }

    #[test]
    fn test_expand_from_empty() {
        let mut acc = Envelope::empty(2);
        assert!(acc.is_empty());
        acc.expand(&Envelope::new(vec![1.0, 1.0], vec![2.0, 2.0]).unwrap());
        acc.expand(&Envelope::new(vec![-1.0, 0.0], vec![0.0, 3.0]).unwrap());
        assert_eq!(acc.lower(0), -1.0);
        assert_eq!(acc.upper(1), 3.0);
        assert!(!acc.is_empty());
    }

    #[test]
    fn test_intersection() {
        let a = Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        let b = Envelope::new(vec![5.0, 5.0], vec![15.0, 15.0]).unwrap();
        let c = Envelope::new(vec![20.0, 20.0], vec![30.0, 30.0]).unwrap();
        let inter = a.intersection(&b).unwrap();
        assert_eq!(inter.lower(0), 5.0);
        assert_eq!(inter.upper(0), 10.0);
        assert!(a.intersection(&c).is_none());
    }

    #[test]
    fn test_enlargement() {
        let a = Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        let inside = Envelope::new(vec![2.0, 2.0], vec![4.0, 4.0]).unwrap();
        let outside = Envelope::new(vec![10.0, 0.0], vec![20.0, 10.0]).unwrap();
        assert_eq!(a.enlargement(&inside), 0.0);
        assert_eq!(a.enlargement(&outside), 100.0);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let env = Envelope::new(vec![-1.5, 2.5], vec![3.5, 4.5]).unwrap();
        let bytes = bincode::serde::encode_to_vec(&env, bincode::config::legacy()).unwrap();
        let (back, _): (Envelope, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy()).unwrap();
        assert_eq!(env, back);
    }
}
