//! Index Module
//!
//! Routes keys to leaf blocks and owns the shape of the tree.
//!
//! ## Responsibilities
//! - Binary-search child separators to find the leaf for a key
//! - Split full children and retry the pending operation once
//! - Merge underfull children with a neighbour
//! - Split and merge index nodes one level up, growing or collapsing the root
//! - Walk leaves in key order for scanners
//!
//! ## Tree Shape
//! ```text
//!                 ┌──────────────────────────────┐
//!   level 1       │ [] │ "KEY3012" │ "KEY6177"   │
//!                 └──┬──────┬────────────┬───────┘
//!                    ▼      ▼            ▼
//!   level 0     ┌────────┐ ┌────────┐ ┌────────┐
//!               │[] │K10 │ │K3012│..│ │K6177│..│
//!               └─┬───┬──┘ └──┬──────┘ └──┬─────┘
//!                 ▼   ▼       ▼           ▼
//!               leaf leaf    leaf        leaf
//! ```
//!
//! Each entry holds the smallest key its child may contain. The leftmost
//! entry of the leftmost node at every level has the empty key.

mod node;

pub use node::{Child, IndexEntry, IndexNode};

/// Per-entry bytes on top of the separator key: child reference (8) and
/// key length (4)
pub const ENTRY_OVERHEAD: usize = 12;

/// Fixed bytes per index node: level (2), entry count (4), padding (2)
pub const NODE_HEADER: usize = 8;

/// Most index bytes a single leaf split can add to a tree of `depth` levels
///
/// The leaf split and every index level above it may each copy a separator
/// of at most `longest` bytes into their parent, and the root may then grow
/// one more level.
pub fn max_split_growth(depth: usize, longest: usize) -> usize {
    (depth + 1) * (NODE_HEADER + ENTRY_OVERHEAD + longest) + NODE_HEADER + ENTRY_OVERHEAD
}

/// Outcome of a routed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Ok,
    /// Nothing visible to delete
    NotFound,
    /// The target block is full; restructure and retry
    SplitRequired,
    /// The target block was replaced; restart from the root
    Retry,
}

/// Size bounds that drive index restructuring
#[derive(Debug, Clone, Copy)]
pub struct NodeLimits {
    /// Serialized size above which an index node splits
    pub node_size: usize,
    /// Index nodes below this are merge candidates
    pub node_low_water: usize,
    /// Largest node a merge or bulk build may produce
    pub node_fill_limit: usize,
    /// Leaves below this data size are merge candidates
    pub leaf_low_water: usize,
}
