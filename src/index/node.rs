//! Index node implementation

use std::sync::Arc;

use crate::block::{BlockContext, KeyRange, LeafBlock, Lookup, Mutation};
use crate::error::{AtlasError, Result};

use super::{NodeLimits, OpResult, ENTRY_OVERHEAD, NODE_HEADER};

/// What an index entry points at
pub enum Child {
    Leaf(Arc<LeafBlock>),
    Node(Box<IndexNode>),
}

/// Separator key plus child
pub struct IndexEntry {
    /// Smallest key the child may hold
    pub key: Vec<u8>,
    pub child: Child,
}

/// Ordered child array; level 0 nodes point at leaves
pub struct IndexNode {
    level: u16,
    entries: Vec<IndexEntry>,
    size: usize,
}

impl IndexNode {
    /// A single-leaf root
    pub fn new_root(leaf: Arc<LeafBlock>) -> Self {
        Self::with_entries(
            0,
            vec![IndexEntry {
                key: Vec::new(),
                child: Child::Leaf(leaf),
            }],
        )
    }

    fn with_entries(level: u16, entries: Vec<IndexEntry>) -> Self {
        let mut node = Self {
            level,
            entries,
            size: 0,
        };
        node.refresh_size();
        node
    }

    /// Build a tree bottom-up over leaves already in key order
    ///
    /// Nodes are filled up to the fill limit so that early inserts do not
    /// split them straight away. Returns `None` for an empty leaf list.
    pub fn build(leaves: Vec<Arc<LeafBlock>>, limits: &NodeLimits) -> Option<Self> {
        let mut entries: Vec<IndexEntry> = leaves
            .into_iter()
            .enumerate()
            .map(|(i, leaf)| IndexEntry {
                key: if i == 0 { Vec::new() } else { leaf.first_key() },
                child: Child::Leaf(leaf),
            })
            .collect();
        if entries.is_empty() {
            return None;
        }

        let mut level = 0u16;
        loop {
            let mut nodes = Vec::new();
            let mut current = Vec::new();
            let mut size = NODE_HEADER;
            for entry in entries {
                let cost = ENTRY_OVERHEAD + entry.key.len();
                if !current.is_empty() && size + cost > limits.node_fill_limit {
                    nodes.push(Self::with_entries(level, std::mem::take(&mut current)));
                    size = NODE_HEADER;
                }
                size += cost;
                current.push(entry);
            }
            if !current.is_empty() {
                nodes.push(Self::with_entries(level, current));
            }

            if nodes.len() == 1 {
                return nodes.pop();
            }
            entries = nodes
                .into_iter()
                .map(|node| IndexEntry {
                    key: node.entries[0].key.clone(),
                    child: Child::Node(Box::new(node)),
                })
                .collect();
            level += 1;
        }
    }

    // =========================================================================
    // Shape
    // =========================================================================

    pub fn level(&self) -> u16 {
        self.level
    }

    /// Number of children
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialized size of this node alone
    pub fn size(&self) -> usize {
        self.size
    }

    /// Serialized size of this node and every node below it
    pub fn serialized_size(&self) -> usize {
        self.size
            + self
                .entries
                .iter()
                .map(|e| match &e.child {
                    Child::Node(node) => node.serialized_size(),
                    Child::Leaf(_) => 0,
                })
                .sum::<usize>()
    }

    /// Levels of index nodes from here down to the leaves
    pub fn depth(&self) -> usize {
        self.level as usize + 1
    }

    pub fn leaf_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match &e.child {
                Child::Node(node) => node.leaf_count(),
                Child::Leaf(_) => 1,
            })
            .sum()
    }

    /// Visit every leaf in key order
    pub fn for_each_leaf<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&Arc<LeafBlock>) -> Result<()>,
    {
        for entry in &self.entries {
            match &entry.child {
                Child::Leaf(leaf) => f(leaf)?,
                Child::Node(node) => node.for_each_leaf(f)?,
            }
        }
        Ok(())
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Greatest child whose separator is <= key
    fn route(&self, key: &[u8]) -> usize {
        self.entries
            .partition_point(|e| e.key.as_slice() <= key)
            .saturating_sub(1)
    }

    /// Leaf responsible for `key`
    pub fn locate_leaf(&self, key: &[u8]) -> Arc<LeafBlock> {
        match &self.entries[self.route(key)].child {
            Child::Leaf(leaf) => Arc::clone(leaf),
            Child::Node(node) => node.locate_leaf(key),
        }
    }

    // =========================================================================
    // Exclusive Mutation
    // =========================================================================

    pub fn put_exclusive(
        &mut self,
        ctx: &BlockContext<'_>,
        limits: &NodeLimits,
        key: &[u8],
        value: &[u8],
        version: u64,
    ) -> Result<(OpResult, Option<IndexEntry>)> {
        self.apply(ctx, limits, &Mutation::Put { key, value, version })
    }

    pub fn delete_exclusive(
        &mut self,
        ctx: &BlockContext<'_>,
        limits: &NodeLimits,
        key: &[u8],
        version: u64,
    ) -> Result<(OpResult, Option<IndexEntry>)> {
        self.apply(ctx, limits, &Mutation::Delete { key, version })
    }

    /// Apply a mutation with the tree held exclusively
    ///
    /// A full leaf is split and the mutation retried once against the half
    /// that now owns the key. When this node overflows as a result, its
    /// upper half is returned for the parent to insert.
    pub fn apply(
        &mut self,
        ctx: &BlockContext<'_>,
        limits: &NodeLimits,
        mutation: &Mutation<'_>,
    ) -> Result<(OpResult, Option<IndexEntry>)> {
        let idx = self.route(mutation.key());
        let (result, sibling) = match &mut self.entries[idx].child {
            Child::Node(node) => node.apply(ctx, limits, mutation)?,
            Child::Leaf(leaf) => {
                let leaf = Arc::clone(leaf);
                (self.apply_to_leaf(ctx, idx, &leaf, mutation)?, None)
            }
        };
        if let Some(sibling) = sibling {
            self.insert_entry(idx + 1, sibling);
        }
        Ok((result, self.split_if_full(limits)))
    }

    fn apply_to_leaf(
        &mut self,
        ctx: &BlockContext<'_>,
        idx: usize,
        leaf: &Arc<LeafBlock>,
        mutation: &Mutation<'_>,
    ) -> Result<OpResult> {
        match leaf.apply(ctx, mutation)? {
            OpResult::SplitRequired => {}
            other => return Ok(other),
        }

        let (left, right) = match leaf.split(ctx)? {
            Some(halves) => halves,
            // A single key: puts are refused, deletes always land
            None => {
                return match mutation {
                    Mutation::Delete { .. } => leaf.apply_shedding(ctx, mutation),
                    Mutation::Put { .. } => Ok(OpResult::SplitRequired),
                }
            }
        };
        let separator = right.first_key();
        self.entries[idx].child = Child::Leaf(Arc::clone(&left));
        self.insert_entry(
            idx + 1,
            IndexEntry {
                key: separator.clone(),
                child: Child::Leaf(Arc::clone(&right)),
            },
        );

        let target = if mutation.key() >= separator.as_slice() {
            right
        } else {
            left
        };
        target.apply(ctx, mutation)
    }

    /// Grow the tree by one level above this node and its split-off sibling
    pub fn grow(&mut self, sibling: IndexEntry) {
        let level = self.level + 1;
        let old = std::mem::replace(self, Self::with_entries(level, Vec::new()));
        self.entries.push(IndexEntry {
            key: Vec::new(),
            child: Child::Node(Box::new(old)),
        });
        self.entries.push(sibling);
        self.refresh_size();
        tracing::debug!("Index root grew to level {}", self.level);
    }

    /// Replace a root that has a single index child with that child
    pub fn collapse(&mut self) -> bool {
        let mut collapsed = false;
        while self.level > 0 && self.entries.len() == 1 {
            match self.entries.pop() {
                Some(IndexEntry {
                    child: Child::Node(node),
                    ..
                }) => {
                    *self = *node;
                    if let Some(first) = self.entries.first_mut() {
                        first.key.clear();
                    }
                    self.refresh_size();
                    collapsed = true;
                }
                Some(other) => {
                    self.entries.push(other);
                    break;
                }
                None => break,
            }
        }
        if collapsed {
            tracing::debug!("Index root collapsed to level {}", self.level);
        }
        collapsed
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Merge the leaf holding `key` with a neighbour if it is underfull
    ///
    /// Underfull index nodes on the path are merged on the way back up.
    /// Returns whether the tree shape changed.
    pub fn merge_check(
        &mut self,
        ctx: &BlockContext<'_>,
        limits: &NodeLimits,
        key: &[u8],
    ) -> Result<bool> {
        let idx = self.route(key);
        match &mut self.entries[idx].child {
            Child::Node(node) => {
                let below = node.merge_check(ctx, limits, key)?;
                let here = self.merge_nodes(idx, limits);
                Ok(below || here)
            }
            Child::Leaf(leaf) => {
                let leaf = Arc::clone(leaf);
                if leaf.live_size() >= limits.leaf_low_water {
                    return Ok(false);
                }
                self.merge_leaves(ctx, idx)
            }
        }
    }

    fn merge_leaves(&mut self, ctx: &BlockContext<'_>, idx: usize) -> Result<bool> {
        for (lo, hi) in neighbour_pairs(idx, self.entries.len()) {
            let (left, right) = match (&self.entries[lo].child, &self.entries[hi].child) {
                (Child::Leaf(l), Child::Leaf(r)) => (Arc::clone(l), Arc::clone(r)),
                _ => continue,
            };
            if let Some(merged) = LeafBlock::merge(&left, &right, ctx)? {
                self.entries[lo].child = Child::Leaf(merged);
                self.entries.remove(hi);
                self.refresh_size();
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn merge_nodes(&mut self, idx: usize, limits: &NodeLimits) -> bool {
        let underfull = match &self.entries[idx].child {
            Child::Node(node) => node.size < limits.node_low_water,
            Child::Leaf(_) => false,
        };
        if !underfull {
            return false;
        }

        for (lo, hi) in neighbour_pairs(idx, self.entries.len()) {
            let fits = match (&self.entries[lo].child, &self.entries[hi].child) {
                (Child::Node(a), Child::Node(b)) => {
                    a.size + b.size - NODE_HEADER <= limits.node_fill_limit
                }
                _ => false,
            };
            if !fits {
                continue;
            }
            let IndexEntry { key, child } = self.entries.remove(hi);
            if let (Child::Node(right), Child::Node(left)) = (child, &mut self.entries[lo].child) {
                left.absorb(key, *right);
            }
            self.refresh_size();
            tracing::debug!("Merged index nodes at level {}", self.level.saturating_sub(1));
            return true;
        }
        false
    }

    fn absorb(&mut self, separator: Vec<u8>, mut right: IndexNode) {
        if let Some(first) = right.entries.first_mut() {
            first.key = separator;
        }
        self.entries.append(&mut right.entries);
        self.refresh_size();
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Collect visible records in `range`, leaf by leaf, in key order
    ///
    /// Stops after the first leaf that brings `out` to `limit` records or
    /// more. Reverse walks start from the leaf routing the upper bound.
    pub fn collect(
        &self,
        ctx: &BlockContext<'_>,
        range: &KeyRange,
        reverse: bool,
        ceiling: u64,
        limit: usize,
        out: &mut Vec<(bytes::Bytes, bytes::Bytes)>,
    ) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        self.walk(ctx, range, reverse, ceiling, limit, out).map(|_| ())
    }

    /// Returns true once the walk should stop
    fn walk(
        &self,
        ctx: &BlockContext<'_>,
        range: &KeyRange,
        reverse: bool,
        ceiling: u64,
        limit: usize,
        out: &mut Vec<(bytes::Bytes, bytes::Bytes)>,
    ) -> Result<bool> {
        let last = self.entries.len().saturating_sub(1);
        if reverse {
            let start = range.upper_key().map(|k| self.route(k)).unwrap_or(last);
            for entry in self.entries[..=start].iter().rev() {
                if Self::walk_child(&entry.child, ctx, range, reverse, ceiling, limit, out)? {
                    return Ok(true);
                }
                if !range.above_lower(&entry.key) {
                    return Ok(true);
                }
            }
        } else {
            let start = range.lower_key().map(|k| self.route(k)).unwrap_or(0);
            for entry in &self.entries[start..] {
                if !range.below_upper(&entry.key) {
                    return Ok(true);
                }
                if Self::walk_child(&entry.child, ctx, range, reverse, ceiling, limit, out)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn walk_child(
        child: &Child,
        ctx: &BlockContext<'_>,
        range: &KeyRange,
        reverse: bool,
        ceiling: u64,
        limit: usize,
        out: &mut Vec<(bytes::Bytes, bytes::Bytes)>,
    ) -> Result<bool> {
        match child {
            Child::Node(node) => node.walk(ctx, range, reverse, ceiling, limit, out),
            Child::Leaf(leaf) => match leaf.scan_from(ctx, range, reverse, ceiling, out)? {
                Lookup::Retry => Err(AtlasError::Corruption(format!(
                    "retired block {} still reachable from the index",
                    leaf.id()
                ))),
                _ => Ok(out.len() >= limit),
            },
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Free every leaf below this node
    pub fn free_all(&self, ctx: &BlockContext<'_>) -> Result<()> {
        self.for_each_leaf(&mut |leaf: &Arc<LeafBlock>| leaf.free(ctx))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn insert_entry(&mut self, at: usize, entry: IndexEntry) {
        self.entries.insert(at, entry);
        self.refresh_size();
    }

    fn refresh_size(&mut self) {
        self.size = NODE_HEADER
            + self
                .entries
                .iter()
                .map(|e| ENTRY_OVERHEAD + e.key.len())
                .sum::<usize>();
    }

    /// Split off the upper half once the node exceeds its size bound
    fn split_if_full(&mut self, limits: &NodeLimits) -> Option<IndexEntry> {
        let count = self.entries.len();
        if self.size <= limits.node_size || count < 2 {
            return None;
        }
        let half = (self.size - NODE_HEADER) / 2;
        let mut acc = 0;
        let at = self
            .entries
            .iter()
            .position(|e| {
                acc += ENTRY_OVERHEAD + e.key.len();
                acc > half
            })
            .unwrap_or(count / 2)
            .clamp(1, count - 1);

        let right = Self::with_entries(self.level, self.entries.split_off(at));
        self.refresh_size();
        let separator = right.entries[0].key.clone();
        tracing::debug!(
            "Split level {} index node: {} + {} entries",
            self.level,
            self.entries.len(),
            right.entries.len()
        );
        Some(IndexEntry {
            key: separator,
            child: Child::Node(Box::new(right)),
        })
    }
}

/// Adjacent (lo, hi) index pairs around `idx`, right neighbour first
fn neighbour_pairs(idx: usize, len: usize) -> impl Iterator<Item = (usize, usize)> {
    let right = (idx + 1 < len).then(|| (idx, idx + 1));
    let left = (idx > 0).then(|| (idx - 1, idx));
    right.into_iter().chain(left)
}
