//! Tests for IndexNode
//!
//! These tests verify:
//! - Routing picks the greatest separator at or below the key
//! - Bulk builds produce a balanced tree over ordered leaves
//! - Exclusive writes split leaves and index nodes, growing the root
//! - Merge checks shrink the tree after deletes
//! - Ordered collection in both directions

use std::ops::Bound;
use std::sync::Arc;

use atlasmap::arena::Arena;
use atlasmap::block::{BlockContext, KeyRange, LeafBlock, Lookup, Op, Record};
use atlasmap::codec::{codec_for, CodecKind};
use atlasmap::index::{IndexNode, NodeLimits, OpResult, ENTRY_OVERHEAD, NODE_HEADER};
use atlasmap::store::stats::Counters;

// =============================================================================
// Helper Functions
// =============================================================================

const BLOCK_SIZE: usize = 256;

const VALUE: [u8; 40] = [b'v'; 40];

struct Fixture {
    arena: Arena,
    counters: Counters,
}

impl Fixture {
    fn new() -> Self {
        Self {
            arena: Arena::new(),
            counters: Counters::new(),
        }
    }

    fn ctx(&self) -> BlockContext<'_> {
        BlockContext {
            arena: &self.arena,
            codec: codec_for(CodecKind::None),
            counters: &self.counters,
            block_size: BLOCK_SIZE,
            watermark: u64::MAX,
        }
    }
}

/// Small nodes so that a few dozen keys build several levels
fn limits() -> NodeLimits {
    NodeLimits {
        node_size: 64,
        node_low_water: 16,
        node_fill_limit: 48,
        leaf_low_water: BLOCK_SIZE / 4,
    }
}

fn key(i: usize) -> Vec<u8> {
    format!("k{:02}", i).into_bytes()
}

fn single_record_leaf(ctx: &BlockContext<'_>, k: &[u8]) -> Arc<LeafBlock> {
    let record = Record {
        key: k.to_vec(),
        value: VALUE.to_vec(),
        version: 1,
        op: Op::Put,
    };
    Arc::new(LeafBlock::from_records(ctx, &[record]).unwrap())
}

/// Insert keys 0..count through the root, growing it when it splits
fn populate(root: &mut IndexNode, ctx: &BlockContext<'_>, count: usize) {
    for i in 0..count {
        let (result, sibling) = root
            .put_exclusive(ctx, &limits(), &key(i), &VALUE, i as u64 + 1)
            .unwrap();
        assert_eq!(result, OpResult::Ok);
        if let Some(sibling) = sibling {
            root.grow(sibling);
        }
    }
}

fn read(root: &IndexNode, ctx: &BlockContext<'_>, k: &[u8]) -> Option<Vec<u8>> {
    match root.locate_leaf(k).get(ctx, k, u64::MAX).unwrap() {
        Lookup::Found(v) => Some(v),
        Lookup::NotFound => None,
        Lookup::Retry => panic!("index routed to a retired block"),
    }
}

fn collect_keys(root: &IndexNode, ctx: &BlockContext<'_>, range: &KeyRange, reverse: bool) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    root.collect(ctx, range, reverse, u64::MAX, usize::MAX, &mut out)
        .unwrap();
    out.into_iter().map(|(k, _)| k.to_vec()).collect()
}

// =============================================================================
// Routing Tests
// =============================================================================

#[test]
fn test_locate_leaf_by_separator() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let leaves = vec![
        single_record_leaf(&ctx, b"apple"),
        single_record_leaf(&ctx, b"mango"),
        single_record_leaf(&ctx, b"tomato"),
    ];
    let ids: Vec<u64> = leaves.iter().map(|l| l.id()).collect();
    let root = IndexNode::build(leaves, &limits()).unwrap();

    assert_eq!(root.locate_leaf(b"").id(), ids[0]);
    assert_eq!(root.locate_leaf(b"aardvark").id(), ids[0]);
    assert_eq!(root.locate_leaf(b"banana").id(), ids[0]);
    assert_eq!(root.locate_leaf(b"mango").id(), ids[1]);
    assert_eq!(root.locate_leaf(b"peach").id(), ids[1]);
    assert_eq!(root.locate_leaf(b"tomato").id(), ids[2]);
    assert_eq!(root.locate_leaf(b"zucchini").id(), ids[2]);
}

#[test]
fn test_new_root_size() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));

    assert_eq!(root.size(), NODE_HEADER + ENTRY_OVERHEAD);
    assert_eq!(root.serialized_size(), root.size());
    assert_eq!(root.level(), 0);
    assert_eq!(root.depth(), 1);
    assert_eq!(root.leaf_count(), 1);
}

// =============================================================================
// Bulk Build Tests
// =============================================================================

#[test]
fn test_build_over_many_leaves() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let leaves: Vec<_> = (0..20).map(|i| single_record_leaf(&ctx, &key(i))).collect();
    let ids: Vec<u64> = leaves.iter().map(|l| l.id()).collect();

    let root = IndexNode::build(leaves, &limits()).unwrap();

    assert!(root.depth() >= 3);
    assert_eq!(root.leaf_count(), 20);
    assert!(root.serialized_size() > root.size());
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(root.locate_leaf(&key(i)).id(), *id);
    }

    let mut visited = Vec::new();
    root.for_each_leaf(&mut |leaf: &Arc<LeafBlock>| {
        visited.push(leaf.id());
        Ok(())
    })
    .unwrap();
    assert_eq!(visited, ids);
}

#[test]
fn test_build_empty_is_none() {
    assert!(IndexNode::build(Vec::new(), &limits()).is_none());
}

// =============================================================================
// Exclusive Mutation Tests
// =============================================================================

#[test]
fn test_put_exclusive_splits_full_leaf() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));

    populate(&mut root, &ctx, 10);

    assert!(root.leaf_count() > 1);
    for i in 0..10 {
        assert_eq!(read(&root, &ctx, &key(i)), Some(VALUE.to_vec()));
    }
    assert_eq!(fx.counters.block_count(), root.leaf_count() as u64);
    assert_eq!(fx.counters.record_count(), 10);
}

#[test]
fn test_node_overflow_grows_root() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));

    populate(&mut root, &ctx, 40);

    assert!(root.level() >= 1);
    assert!(root.size() <= limits().node_size);
    for i in 0..40 {
        assert_eq!(read(&root, &ctx, &key(i)), Some(VALUE.to_vec()));
    }
    let expected: Vec<_> = (0..40).map(key).collect();
    assert_eq!(collect_keys(&root, &ctx, &KeyRange::full(), false), expected);
}

#[test]
fn test_delete_exclusive_reports_missing() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 5);

    let (result, _) = root.delete_exclusive(&ctx, &limits(), &key(3), 100).unwrap();
    assert_eq!(result, OpResult::Ok);
    let (result, _) = root.delete_exclusive(&ctx, &limits(), &key(3), 101).unwrap();
    assert_eq!(result, OpResult::NotFound);
    let (result, _) = root.delete_exclusive(&ctx, &limits(), b"missing", 102).unwrap();
    assert_eq!(result, OpResult::NotFound);

    assert_eq!(read(&root, &ctx, &key(3)), None);
    assert_eq!(read(&root, &ctx, &key(2)), Some(VALUE.to_vec()));
}

// =============================================================================
// Merge Tests
// =============================================================================

#[test]
fn test_merge_check_shrinks_tree_after_deletes() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 40);
    let peak_leaves = root.leaf_count();
    let peak_depth = root.depth();

    for i in 1..39 {
        let (result, _) = root
            .delete_exclusive(&ctx, &limits(), &key(i), 1000 + i as u64)
            .unwrap();
        assert_eq!(result, OpResult::Ok);
        if root.merge_check(&ctx, &limits(), &key(i)).unwrap() {
            root.collapse();
        }
    }

    assert!(root.leaf_count() < peak_leaves);
    assert!(root.depth() <= peak_depth);
    assert_eq!(fx.counters.block_count(), root.leaf_count() as u64);
    assert_eq!(read(&root, &ctx, &key(0)), Some(VALUE.to_vec()));
    assert_eq!(read(&root, &ctx, &key(39)), Some(VALUE.to_vec()));
    assert_eq!(
        collect_keys(&root, &ctx, &KeyRange::full(), false),
        vec![key(0), key(39)]
    );
}

#[test]
fn test_merge_check_ignores_healthy_leaf() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 10);
    let leaves = root.leaf_count();

    // Every leaf holds at least two 61-byte records, above the 64-byte low water
    for i in 0..10 {
        assert!(!root.merge_check(&ctx, &limits(), &key(i)).unwrap());
    }
    assert_eq!(root.leaf_count(), leaves);
}

#[test]
fn test_collapse_single_child_root() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let leaf = Arc::new(LeafBlock::new_empty(&ctx));
    let mut root = IndexNode::new_root(Arc::clone(&leaf));
    let sibling_leaf = single_record_leaf(&ctx, b"zz");
    let sibling = IndexNode::build(vec![sibling_leaf], &limits()).unwrap();

    root.grow(atlasmap::index::IndexEntry {
        key: b"zz".to_vec(),
        child: atlasmap::index::Child::Node(Box::new(sibling)),
    });
    assert_eq!(root.level(), 1);
    assert_eq!(root.leaf_count(), 2);
    assert!(!root.collapse());

    let mut single = IndexNode::new_root(leaf);
    assert!(!single.collapse());
    assert_eq!(single.level(), 0);
}

// =============================================================================
// Collection Tests
// =============================================================================

#[test]
fn test_collect_bounded_both_directions() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 30);

    let range = KeyRange {
        lower: Bound::Included(key(7)),
        upper: Bound::Excluded(key(21)),
    };
    let forward = collect_keys(&root, &ctx, &range, false);
    let mut reverse = collect_keys(&root, &ctx, &range, true);

    let expected: Vec<_> = (7..21).map(key).collect();
    assert_eq!(forward, expected);
    reverse.reverse();
    assert_eq!(reverse, expected);
}

#[test]
fn test_collect_stops_near_limit() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 30);

    let mut out = Vec::new();
    root.collect(&ctx, &KeyRange::full(), false, u64::MAX, 3, &mut out)
        .unwrap();

    // One leaf holds at most four records
    assert!(out.len() >= 3 && out.len() < 3 + 4);
    assert_eq!(out[0].0.as_ref(), key(0).as_slice());
}

#[test]
fn test_collect_empty_range() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 10);

    let range = KeyRange {
        lower: Bound::Included(key(5)),
        upper: Bound::Excluded(key(5)),
    };
    assert!(collect_keys(&root, &ctx, &range, false).is_empty());
    assert!(collect_keys(&root, &ctx, &range, true).is_empty());
}

#[test]
fn test_free_all_releases_arena() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let mut root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
    populate(&mut root, &ctx, 25);

    root.free_all(&ctx).unwrap();

    assert_eq!(fx.arena.allocated_bytes(), 0);
    assert_eq!(fx.counters.block_count(), 0);
}
