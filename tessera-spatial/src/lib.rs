//! # Tessera Spatial - Hilbert R-tree indexing
//!
//! This crate provides the spatial index underneath the tessera toolkit:
//! an R-tree family index over n-dimensional envelopes with pluggable
//! split policies and a lazily paged on-disk representation.
//!
//! ## Features
//!
//! - **N-dimensional envelopes**: union, intersection, containment and the
//!   area/margin cost metrics used by the tree heuristics
//! - **Hilbert curve**: a space-filling-curve path generator for arbitrary
//!   dimension and the derived ordering keys
//! - **Pluggable node factories**: Hilbert-ordered median split or the
//!   classic quadratic split, selected per tree instance
//! - **Lazy disk paging**: checksummed node records loaded one page at a
//!   time through an LRU cache
//! - **Single-writer/multi-reader**: searches stream results lazily and
//!   run in parallel; writers take a coarse structure latch
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_spatial::{Envelope, RTree, TreeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = RTree::in_memory(TreeConfig::new(2))?;
//!
//! tree.insert(&Envelope::new(vec![0.0, 0.0], vec![10.0, 10.0])?, 1)?;
//! tree.insert(&Envelope::new(vec![20.0, 20.0], vec![30.0, 30.0])?, 2)?;
//!
//! let query = Envelope::new(vec![5.0, 5.0], vec![15.0, 15.0])?;
//! for entry in tree.search(&query)? {
//!     println!("hit: {}", entry?.data);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## On-disk trees
//!
//! ```rust,no_run
//! use tessera_spatial::{Envelope, RTree, TreeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let tree = RTree::create("features.tsx", TreeConfig::new(2))?;
//! tree.insert(&Envelope::new(vec![0.0, 0.0], vec![1.0, 1.0])?, 42)?;
//! tree.close()?;
//!
//! // Reopening reads only the header; nodes page in on demand
//! let tree = RTree::open("features.tsx")?;
//! # Ok(())
//! # }
//! ```

pub mod envelope;
pub mod error;
pub mod hilbert;
pub mod node;
pub mod store;
pub mod tree;

pub use envelope::Envelope;
pub use error::{SpatialError, SpatialResult};
pub use hilbert::{hilbert_index, hilbert_key, hilbert_path, HilbertPath};
pub use node::{
    ChildRef, DataRef, HilbertNodeFactory, LeafEntry, Node, NodeFactory, PageId,
    QuadraticNodeFactory,
};
pub use store::file::FileNodeStore;
pub use store::memory::MemoryNodeStore;
pub use store::{DataReader, NodeStore, StoreMeta, StoreStats};
pub use tree::{RTree, SearchIter, TreeConfig, TreeStats};
