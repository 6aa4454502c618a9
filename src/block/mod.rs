//! Block Module
//!
//! Leaf blocks: the storage unit of the map.
//!
//! ## Responsibilities
//! - Hold a sorted run of versioned records within a fixed capacity
//! - Compress block bodies through the store's codec
//! - Split when full, merge when underfull
//! - Reclaim versions no reader can observe any more
//!
//! ## Block Body
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Record 0 (smallest key, newest version)│
//! ├────────────────────────────────────────┤
//! │ Record 1                               │
//! ├────────────────────────────────────────┤
//! │ ...                                    │
//! └────────────────────────────────────────┘
//!   stored in one arena allocation, raw or
//!   compressed (whichever is smaller)
//! ```

mod leaf;
pub mod record;

use std::ops::Bound;

use crate::arena::Arena;
use crate::codec::Codec;
use crate::store::stats::Counters;

pub use leaf::{LeafBlock, Lookup};
pub use record::{select_layout, Op, Record, RecordLayout};

/// Fraction of capacity a merged block may fill
pub(crate) const MERGE_FILL_LIMIT: f64 = 0.75;

/// Everything a block operation needs from its store
pub struct BlockContext<'a> {
    pub arena: &'a Arena,
    pub codec: &'static dyn Codec,
    pub counters: &'a Counters,
    /// Leaf block capacity in bytes
    pub block_size: usize,
    /// Versions at or below this are visible to every reader
    pub watermark: u64,
}

impl BlockContext<'_> {
    /// Largest combined size a merge may produce
    pub fn merge_limit(&self) -> usize {
        (self.block_size as f64 * MERGE_FILL_LIMIT) as usize
    }
}

/// A write routed to a single key
#[derive(Debug, Clone, Copy)]
pub enum Mutation<'a> {
    Put {
        key: &'a [u8],
        value: &'a [u8],
        version: u64,
    },
    Delete {
        key: &'a [u8],
        version: u64,
    },
}

impl<'a> Mutation<'a> {
    pub fn key(&self) -> &'a [u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key, .. } => key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Mutation::Put { version, .. } | Mutation::Delete { version, .. } => *version,
        }
    }
}

/// Key range `[lower, upper]` with independent bound kinds
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.above_lower(key) && self.below_upper(key)
    }

    pub fn above_lower(&self, key: &[u8]) -> bool {
        match &self.lower {
            Bound::Included(k) => key >= k.as_slice(),
            Bound::Excluded(k) => key > k.as_slice(),
            Bound::Unbounded => true,
        }
    }

    pub fn below_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Bound::Included(k) => key <= k.as_slice(),
            Bound::Excluded(k) => key < k.as_slice(),
            Bound::Unbounded => true,
        }
    }

    /// True when no key can satisfy both bounds
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    /// Key a forward walk starts routing from
    pub fn lower_key(&self) -> Option<&[u8]> {
        match &self.lower {
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
            Bound::Unbounded => None,
        }
    }

    /// Key a reverse walk starts routing from
    pub fn upper_key(&self) -> Option<&[u8]> {
        match &self.upper {
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
            Bound::Unbounded => None,
        }
    }
}
