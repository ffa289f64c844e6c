//! Node records and the pluggable node factory.
//!
//! A node is a tagged variant: leaf nodes hold `(envelope, data)` entries,
//! internal nodes hold `(envelope, page)` references to children one level
//! below. Node identity is the page id inside the backing store, never a
//! language-level pointer, so nodes can be paged in lazily.
//!
//! Split behavior varies per R-tree flavor and is delegated to a
//! [`NodeFactory`], keeping the tree driver agnostic of the heuristic.

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::{SpatialError, SpatialResult};
use crate::hilbert::hilbert_key;

/// Page id - unique identifier for a node record in the backing store.
/// Page 0 is reserved for store metadata; an empty tree has root 0.
pub type PageId = u64;

/// Opaque reference to leaf payload, resolved by the caller (a feature id,
/// a file offset). The index never interprets it.
pub type DataRef = u64;

/// An entry in a leaf node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub envelope: Envelope,
    pub data: DataRef,
}

/// A child reference in an internal node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildRef {
    pub envelope: Envelope,
    pub page: PageId,
}

/// Node variants of the R-tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    /// Leaf node holding actual entries
    Leaf { entries: Vec<LeafEntry> },
    /// Internal node holding child references
    Internal {
        children: Vec<ChildRef>,
        /// Height above the leaf level (leaves are 0)
        level: u32,
    },
}

impl Node {
    /// Height of this node above the leaf level.
    pub fn level(&self) -> u32 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Internal { level, .. } => *level,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Internal { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The envelope enclosing every member, recomputed from scratch.
    ///
    /// Returns the empty envelope of the given dimension for a node with no
    /// members.
    pub fn envelope(&self, dimension: usize) -> Envelope {
        let mut bounds = Envelope::empty(dimension);
        match self {
            Node::Leaf { entries } => {
                for e in entries {
                    bounds.expand(&e.envelope);
                }
            }
            Node::Internal { children, .. } => {
                for c in children {
                    bounds.expand(&c.envelope);
                }
            }
        }
        bounds
    }

    pub fn overflows(&self, max_entries: usize) -> bool {
        self.len() > max_entries
    }

    pub fn underflows(&self, min_entries: usize) -> bool {
        self.len() < min_entries
    }
}

/// Member of a node, generic over both variants. Split heuristics work on
/// this so one implementation serves leaves and internal nodes alike.
pub trait Bounded {
    fn bounds(&self) -> &Envelope;
}

impl Bounded for LeafEntry {
    fn bounds(&self) -> &Envelope {
        &self.envelope
    }
}

impl Bounded for ChildRef {
    fn bounds(&self) -> &Envelope {
        &self.envelope
    }
}

/// Constructs nodes and decides how an overflowing node is divided.
///
/// The factory is the capability set that distinguishes R-tree flavors:
/// the driver calls it for node creation and on overflow, and never embeds
/// a split heuristic of its own.
pub trait NodeFactory: Send + Sync {
    /// Builds a node from explicit corners and members.
    ///
    /// The corners must satisfy `lower[i] <= upper[i]` componentwise and
    /// enclose every member; a violation fails with
    /// [`SpatialError::InvalidBounds`]. Exactly one of `children`/`entries`
    /// may be non-empty: children produce an internal node at `level`,
    /// entries (or nothing) a leaf.
    fn create_node(
        &self,
        lower: Vec<f64>,
        upper: Vec<f64>,
        level: u32,
        children: Vec<ChildRef>,
        entries: Vec<LeafEntry>,
    ) -> SpatialResult<Node> {
        let bounds = Envelope::new(lower, upper)?;
        if !children.is_empty() && !entries.is_empty() {
            return Err(SpatialError::InvalidArgument(
                "a node cannot hold both children and entries".into(),
            ));
        }
        let node = if children.is_empty() {
            Node::Leaf { entries }
        } else {
            Node::Internal { children, level }
        };
        let computed = node.envelope(bounds.dimension());
        if !computed.is_empty() && !bounds.contains(&computed) {
            return Err(SpatialError::InvalidBounds(
                "node corners do not enclose its members".into(),
            ));
        }
        Ok(node)
    }

    /// Divides an overflowing leaf's entries into two groups.
    fn split_entries(
        &self,
        entries: Vec<LeafEntry>,
        min_entries: usize,
    ) -> (Vec<LeafEntry>, Vec<LeafEntry>);

    /// Divides an overflowing internal node's children into two groups.
    fn split_children(
        &self,
        children: Vec<ChildRef>,
        min_entries: usize,
    ) -> (Vec<ChildRef>, Vec<ChildRef>);
}

// ============================================================================
// Hilbert split
// ============================================================================

/// Split policy of the Hilbert R-tree: members are ordered by the Hilbert
/// key of their envelope center within the union of all members, then cut
/// at the median.
#[derive(Debug, Clone)]
pub struct HilbertNodeFactory {
    order: u32,
}

impl HilbertNodeFactory {
    pub fn new(order: u32) -> HilbertNodeFactory {
        HilbertNodeFactory { order }
    }

    fn split<T: Bounded>(&self, mut members: Vec<T>) -> (Vec<T>, Vec<T>) {
        let dimension = members[0].bounds().dimension();
        // The key must fit u64 whatever the tree dimension
        let order = self.order.min(63 / dimension as u32).max(1);
        let mut world = Envelope::empty(dimension);
        for m in &members {
            world.expand(m.bounds());
        }
        members.sort_by_key(|m| hilbert_key(m.bounds(), &world, order));
        let split_off = members.split_off(members.len() / 2);
        (members, split_off)
    }
}

impl Default for HilbertNodeFactory {
    fn default() -> Self {
        HilbertNodeFactory::new(16)
    }
}

impl NodeFactory for HilbertNodeFactory {
    fn split_entries(
        &self,
        entries: Vec<LeafEntry>,
        _min_entries: usize,
    ) -> (Vec<LeafEntry>, Vec<LeafEntry>) {
        self.split(entries)
    }

    fn split_children(
        &self,
        children: Vec<ChildRef>,
        _min_entries: usize,
    ) -> (Vec<ChildRef>, Vec<ChildRef>) {
        self.split(children)
    }
}

// ============================================================================
// Quadratic split
// ============================================================================

/// Guttman's quadratic split for the basic R-tree flavor: pick the pair of
/// members wasting the most area as seeds, then assign the rest by least
/// enlargement, forcing assignment when a group must reach the minimum fill.
#[derive(Debug, Clone, Default)]
pub struct QuadraticNodeFactory;

impl QuadraticNodeFactory {
    fn pick_seeds<T: Bounded>(members: &[T]) -> (usize, usize) {
        let mut worst = f64::NEG_INFINITY;
        let mut seeds = (0, 1);
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let a = members[i].bounds();
                let b = members[j].bounds();
                let dead = a.union(b).area() - a.area() - b.area();
                if dead > worst {
                    worst = dead;
                    seeds = (i, j);
                }
            }
        }
        seeds
    }

    fn split<T: Bounded>(&self, mut members: Vec<T>, min_entries: usize) -> (Vec<T>, Vec<T>) {
        let (i, j) = Self::pick_seeds(&members);
        // Remove the later index first so the earlier one stays valid
        let seed_b = members.remove(j);
        let seed_a = members.remove(i);
        let mut box_a = seed_a.bounds().clone();
        let mut box_b = seed_b.bounds().clone();
        let mut group_a = vec![seed_a];
        let mut group_b = vec![seed_b];

        while let Some(member) = members.pop() {
            let remaining = members.len() + 1;
            // Force assignment once a group needs every remaining member
            if group_a.len() + remaining <= min_entries {
                box_a.expand(member.bounds());
                group_a.push(member);
                continue;
            }
            if group_b.len() + remaining <= min_entries {
                box_b.expand(member.bounds());
                group_b.push(member);
                continue;
            }
            let grow_a = box_a.enlargement(member.bounds());
            let grow_b = box_b.enlargement(member.bounds());
            let to_a = match grow_a.partial_cmp(&grow_b) {
                Some(std::cmp::Ordering::Less) => true,
                Some(std::cmp::Ordering::Greater) => false,
                _ => box_a.area() <= box_b.area(),
            };
            if to_a {
                box_a.expand(member.bounds());
                group_a.push(member);
            } else {
                box_b.expand(member.bounds());
                group_b.push(member);
            }
        }
        (group_a, group_b)
    }
}

impl NodeFactory for QuadraticNodeFactory {
    fn split_entries(
        &self,
        entries: Vec<LeafEntry>,
        min_entries: usize,
    ) -> (Vec<LeafEntry>, Vec<LeafEntry>) {
        self.split(entries, min_entries)
    }

    fn split_children(
        &self,
        children: Vec<ChildRef>,
        min_entries: usize,
    ) -> (Vec<ChildRef>, Vec<ChildRef>) {
        self.split(children, min_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lo: [f64; 2], hi: [f64; 2], data: DataRef) -> LeafEntry {
        LeafEntry {
            envelope: Envelope::new(lo.to_vec(), hi.to_vec()).unwrap(),
            data,
        }
    }

    #[test]
    fn test_node_envelope_is_union() {
        let node = Node::Leaf {
            entries: vec![
                entry([0.0, 0.0], [1.0, 1.0], 1),
                entry([5.0, 5.0], [6.0, 8.0], 2),
            ],
        };
        let bounds = node.envelope(2);
        assert_eq!(bounds.lower(0), 0.0);
        assert_eq!(bounds.upper(0), 6.0);
        assert_eq!(bounds.upper(1), 8.0);
    }

    #[test]
    fn test_empty_node_envelope_is_empty() {
        let node = Node::Leaf { entries: vec![] };
        assert!(node.envelope(2).is_empty());
    }

    #[test]
    fn test_overflow_underflow_predicates() {
        let node = Node::Leaf {
            entries: vec![entry([0.0, 0.0], [1.0, 1.0], 1)],
        };
        assert!(node.overflows(0));
        assert!(!node.overflows(1));
        assert!(node.underflows(2));
        assert!(!node.underflows(1));
    }

    #[test]
    fn test_create_node_validates_corners() {
        let factory = HilbertNodeFactory::default();
        let result = factory.create_node(vec![10.0, 10.0], vec![0.0, 0.0], 0, vec![], vec![]);
        assert!(matches!(result, Err(SpatialError::InvalidBounds(_))));
    }

    #[test]
    fn test_create_node_rejects_mixed_members() {
        let factory = HilbertNodeFactory::default();
        let child = ChildRef {
            envelope: Envelope::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap(),
            page: 1,
        };
        let result = factory.create_node(
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            1,
            vec![child],
            vec![entry([0.0, 0.0], [1.0, 1.0], 1)],
        );
        assert!(matches!(result, Err(SpatialError::InvalidArgument(_))));
    }

    #[test]
    fn test_create_node_rejects_escaping_members() {
        let factory = HilbertNodeFactory::default();
        let result = factory.create_node(
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            0,
            vec![],
            vec![entry([0.0, 0.0], [5.0, 5.0], 1)],
        );
        assert!(matches!(result, Err(SpatialError::InvalidBounds(_))));
    }

    #[test]
    fn test_create_node_variants() {
        let factory = HilbertNodeFactory::default();
        let leaf = factory
            .create_node(
                vec![0.0, 0.0],
                vec![1.0, 1.0],
                0,
                vec![],
                vec![entry([0.0, 0.0], [1.0, 1.0], 1)],
            )
            .unwrap();
        assert!(leaf.is_leaf());

        let child = ChildRef {
            envelope: Envelope::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap(),
            page: 3,
        };
        let internal = factory
            .create_node(vec![0.0, 0.0], vec![1.0, 1.0], 2, vec![child], vec![])
            .unwrap();
        assert!(!internal.is_leaf());
        assert_eq!(internal.level(), 2);
    }

    fn grid_entries(side: u64) -> Vec<LeafEntry> {
        (0..side * side)
            .map(|i| {
                let x = (i % side) as f64;
                let y = (i / side) as f64;
                entry([x, y], [x + 0.5, y + 0.5], i)
            })
            .collect()
    }

    #[test]
    fn test_hilbert_split_is_balanced() {
        let factory = HilbertNodeFactory::default();
        let entries = grid_entries(3);
        let total = entries.len();
        let (left, right) = factory.split_entries(entries, 2);
        assert_eq!(left.len() + right.len(), total);
        assert!(left.len().abs_diff(right.len()) <= 1);
    }

    #[test]
    fn test_hilbert_split_preserves_members() {
        let factory = HilbertNodeFactory::default();
        let entries = grid_entries(4);
        let (left, right) = factory.split_entries(entries, 2);
        let mut data: Vec<DataRef> = left.iter().chain(&right).map(|e| e.data).collect();
        data.sort_unstable();
        assert_eq!(data, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_quadratic_split_separates_clusters() {
        let factory = QuadraticNodeFactory;
        let mut entries = Vec::new();
        for i in 0..4 {
            entries.push(entry([i as f64, 0.0], [i as f64 + 0.5, 0.5], i));
            entries.push(entry(
                [100.0 + i as f64, 100.0],
                [100.5 + i as f64, 100.5],
                10 + i,
            ));
        }
        let (left, right) = factory.split_entries(entries, 2);
        assert_eq!(left.len() + right.len(), 8);
        // Each group should be one cluster
        for group in [&left, &right] {
            let near = group.iter().all(|e| e.envelope.lower(0) < 50.0);
            let far = group.iter().all(|e| e.envelope.lower(0) > 50.0);
            assert!(near || far, "quadratic split mixed the clusters");
        }
    }

    #[test]
    fn test_quadratic_split_honors_minimum_fill() {
        let factory = QuadraticNodeFactory;
        // One outlier far away from a tight cluster
        let mut entries = grid_entries(3);
        entries.push(entry([1000.0, 1000.0], [1001.0, 1001.0], 99));
        let min = 3;
        let (left, right) = factory.split_entries(entries, min);
        assert!(left.len() >= min);
        assert!(right.len() >= min);
    }
}
