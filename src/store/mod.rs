//! Store Module
//!
//! The top-level façade: owns the block tree, the arena, the version clock
//! and the memory budget.
//!
//! ## Responsibilities
//! - Route put/get/delete to the right leaf
//! - Run writes optimistically, falling back to the exclusive path for
//!   splits, merges and contention
//! - Enforce the global memory limit (admission control)
//! - Keep aggregate statistics
//! - Snapshot, reload, flush and dispose the whole tree
//!
//! ## Write Path
//! ```text
//!   put(key, value)
//!        │
//!        ▼
//!   reserve budget ──── refused ───▶ Ok(false)
//!        │
//!        ▼
//!   root.read() ─▶ locate leaf ─▶ drop root lock ─▶ leaf.apply()
//!        │                                            │
//!        │              Retry (leaf retired) ◀────────┤
//!        │              up to max_retries             │
//!        ▼                                            │
//!   root.write() ─▶ apply, split, retry once ◀── SplitRequired
//!        │
//!        ▼
//!   grow root if it split
//! ```
//!
//! ## Lock Order
//! The root lock is always taken before any leaf lock. The optimistic path
//! releases the root lock before locking the leaf, so it never holds both.

mod budget;
pub mod snapshot;
pub mod stats;
mod versions;

use std::io::ErrorKind;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::arena::Arena;
use crate::block::record::{footprint, select_layout};
use crate::block::{
    BlockContext, KeyRange, LeafBlock, Lookup, Mutation, Record, RecordLayout, MERGE_FILL_LIMIT,
};
use crate::codec::{codec_for, Codec};
use crate::config::StoreConfig;
use crate::error::{AtlasError, Result};
use crate::index::{max_split_growth, IndexNode, NodeLimits, OpResult};
use crate::scanner::{next_prefix, Scanner};

use self::budget::MemoryBudget;
use self::snapshot::{SnapshotReader, SnapshotWriter};
use self::stats::{BlockFootprint, Counters};
use self::versions::VersionClock;

pub use self::budget::Reservation;
pub use self::snapshot::{SnapshotId, SnapshotSummary};
pub use self::stats::StoreStats;
pub use self::versions::VersionPin;

/// Records fetched per scanner refill
pub const SCAN_BATCH: usize = 128;

/// Attempts at claiming a fresh snapshot id before giving up
const SNAPSHOT_ID_ATTEMPTS: usize = 8;

/// Embedded sorted key-value store
///
/// ## Concurrency
/// - All methods take `&self`; share the store across threads with `Arc`
/// - `root`: `RwLock` over the index; held for writing only while the tree
///   changes shape
/// - Each leaf has its own lock (see `LeafBlock`)
/// - Counters and the version clock are atomics
/// - `snapshot_lock`: one snapshot is written at a time
pub struct Store {
    config: StoreConfig,
    arena: Arena,
    codec: &'static dyn Codec,
    counters: Counters,
    budget: MemoryBudget,
    clock: VersionClock,
    limits: NodeLimits,
    /// Longest key ever admitted; bounds separator copies in the index
    longest_key: AtomicUsize,
    snapshot_lock: Mutex<()>,
    root: RwLock<IndexNode>,
}

impl Store {
    /// Create an empty store
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let arena = Arena::new();
        let counters = Counters::new();
        let codec = codec_for(config.codec);
        let limits = NodeLimits {
            node_size: config.index_node_size,
            node_low_water: config.index_low_water(),
            node_fill_limit: (config.index_node_size as f64 * MERGE_FILL_LIMIT) as usize,
            leaf_low_water: config.block_low_water(),
        };

        let leaf = {
            let ctx = BlockContext {
                arena: &arena,
                codec,
                counters: &counters,
                block_size: config.block_size,
                watermark: 0,
            };
            Arc::new(LeafBlock::new_empty(&ctx))
        };
        let root = IndexNode::new_root(leaf);
        counters.set_index_size(root.serialized_size());

        tracing::info!(
            "Store created: block_size={}, codec={}, memory_limit={}",
            config.block_size,
            config.codec,
            config.memory_limit
        );

        Ok(Self {
            budget: MemoryBudget::new(config.memory_limit),
            config,
            arena,
            codec,
            counters,
            clock: VersionClock::new(),
            limits,
            longest_key: AtomicUsize::new(0),
            snapshot_lock: Mutex::new(()),
            root: RwLock::new(root),
        })
    }

    /// Configuration the store was built with
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or overwrite `key` at the next version
    ///
    /// Returns `Ok(false)` when the memory limit would be exceeded, or when
    /// the key's retained versions cannot fit any block.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let _reservation = match self.admit(key, value) {
            Some(reservation) => reservation,
            None => return Ok(false),
        };
        let version = self.clock.next_version()?;
        self.put_admitted(key, value, version)
    }

    /// Insert or overwrite `key` at a caller-chosen version
    ///
    /// The clock moves past `version` so later writes stay newer.
    /// `u64::MAX` is reserved as the "latest" read ceiling and is rejected.
    pub fn put_with_version(&self, key: &[u8], value: &[u8], version: u64) -> Result<bool> {
        if version == u64::MAX {
            return Err(AtlasError::InvalidVersion(version));
        }
        let _reservation = match self.admit(key, value) {
            Some(reservation) => reservation,
            None => return Ok(false),
        };
        self.clock.observe(version);
        self.put_admitted(key, value, version)
    }

    fn put_admitted(&self, key: &[u8], value: &[u8], version: u64) -> Result<bool> {
        let result = self.mutate(&Mutation::Put { key, value, version })?;
        if result == OpResult::SplitRequired {
            tracing::debug!(
                "Put of {} byte key refused: its versions do not fit a block",
                key.len()
            );
        }
        Ok(result == OpResult::Ok)
    }

    /// Hide `key` behind a tombstone
    ///
    /// Returns `Ok(false)` when no value was visible.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let version = self.clock.next_version()?;
        Ok(self.mutate(&Mutation::Delete { key, version })? == OpResult::Ok)
    }

    /// Reserve the most memory a put of this record could allocate
    ///
    /// A split holds the old body while both halves are built, so two
    /// blocks are reserved. Index growth is bounded by the longest key in
    /// the store, since any stored key may become a separator. One extra
    /// level covers a concurrent root growth.
    fn admit(&self, key: &[u8], value: &[u8]) -> Option<Reservation<'_>> {
        let layout = select_layout(key.len(), value.len(), self.config.block_size);
        let external = match layout {
            RecordLayout::Inline => 0,
            _ => key.len() + value.len(),
        };
        let longest = self
            .longest_key
            .fetch_max(key.len(), Ordering::AcqRel)
            .max(key.len());
        let depth = self.root.read().depth();
        let estimate = footprint(layout, key.len(), value.len())
            + external
            + 2 * self.config.block_size
            + max_split_growth(depth + 1, longest);
        let reservation = self
            .budget
            .try_reserve(|| self.memory_in_use(), estimate as u64);
        if reservation.is_none() {
            tracing::debug!(
                "Put refused: {} bytes in use, {} reserved, {} requested, limit {}",
                self.memory_in_use(),
                self.budget.reserved(),
                estimate,
                self.budget.limit()
            );
        }
        reservation
    }

    /// Optimistic path first, exclusive path on split or retry exhaustion
    fn mutate(&self, mutation: &Mutation<'_>) -> Result<OpResult> {
        for _ in 0..self.config.max_retries.max(1) {
            let leaf = self.root.read().locate_leaf(mutation.key());
            let ctx = self.write_context();
            match leaf.apply(&ctx, mutation)? {
                OpResult::Retry => continue,
                OpResult::SplitRequired => return self.mutate_exclusive(mutation),
                result => {
                    if result == OpResult::Ok && matches!(mutation, Mutation::Delete { .. }) {
                        self.merge_if_underfull(&leaf, mutation.key())?;
                    }
                    return Ok(result);
                }
            }
        }
        tracing::warn!(
            "Optimistic retries exhausted after {} attempts, taking exclusive path",
            self.config.max_retries
        );
        self.mutate_exclusive(mutation)
    }

    fn mutate_exclusive(&self, mutation: &Mutation<'_>) -> Result<OpResult> {
        let mut root = self.root.write();
        let ctx = self.write_context();
        let (result, sibling) = root.apply(&ctx, &self.limits, mutation)?;
        if let Some(sibling) = sibling {
            root.grow(sibling);
        }
        if result == OpResult::Ok && matches!(mutation, Mutation::Delete { .. }) {
            self.merge_locked(&mut root, &ctx, mutation.key())?;
        }
        self.counters.set_index_size(root.serialized_size());
        if self.memory_in_use() > self.budget.limit() {
            tracing::warn!(
                "Memory in use {} is above the {} byte limit after a structural change",
                self.memory_in_use(),
                self.budget.limit()
            );
        }
        Ok(result)
    }

    fn merge_if_underfull(&self, leaf: &LeafBlock, key: &[u8]) -> Result<()> {
        if leaf.live_size() >= self.limits.leaf_low_water || self.counters.block_count() <= 1 {
            return Ok(());
        }
        let mut root = self.root.write();
        let ctx = self.write_context();
        self.merge_locked(&mut root, &ctx, key)?;
        self.counters.set_index_size(root.serialized_size());
        Ok(())
    }

    fn merge_locked(&self, root: &mut IndexNode, ctx: &BlockContext<'_>, key: &[u8]) -> Result<()> {
        if root.merge_check(ctx, &self.limits, key)? {
            root.collapse();
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Newest visible value of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_leaf(key, |leaf, ctx| leaf.get(ctx, key, u64::MAX))
    }

    /// Copy the newest visible value into `buf`
    ///
    /// Returns the value's true length, which may exceed `buf.len()`; only
    /// the first `buf.len()` bytes are copied in that case.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8]) -> Result<Option<usize>> {
        self.get_at(key, buf, u64::MAX)
    }

    /// Like `get_into`, reading as of `version_ceiling`
    pub fn get_at(&self, key: &[u8], buf: &mut [u8], version_ceiling: u64) -> Result<Option<usize>> {
        self.read_leaf(key, |leaf, ctx| leaf.get_into(ctx, key, version_ceiling, buf))
    }

    /// Whether `key` has a visible value
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self
            .read_leaf(key, |leaf, ctx| leaf.contains(ctx, key, u64::MAX))?
            .is_some())
    }

    fn read_leaf<T>(
        &self,
        key: &[u8],
        mut f: impl FnMut(&LeafBlock, &BlockContext<'_>) -> Result<Lookup<T>>,
    ) -> Result<Option<T>> {
        let ctx = self.read_context();
        for _ in 0..self.config.max_retries {
            let leaf = self.root.read().locate_leaf(key);
            match f(leaf.as_ref(), &ctx)? {
                Lookup::Found(v) => return Ok(Some(v)),
                Lookup::NotFound => return Ok(None),
                Lookup::Retry => continue,
            }
        }
        // Holding the root lock keeps the leaf from being retired
        let root = self.root.read();
        let leaf = root.locate_leaf(key);
        match f(leaf.as_ref(), &ctx)? {
            Lookup::Found(v) => Ok(Some(v)),
            _ => Ok(None),
        }
    }

    /// Pin the current version; records it can see survive until it drops
    pub fn pin_version(&self) -> VersionPin<'_> {
        self.clock.pin()
    }

    /// Newest version handed out so far
    pub fn current_version(&self) -> u64 {
        self.clock.current()
    }

    // =========================================================================
    // Scanners
    // =========================================================================

    /// Scan `[start, stop)`; `None` leaves that side open
    pub fn scanner(&self, start: Option<&[u8]>, stop: Option<&[u8]>, reverse: bool) -> Scanner<'_> {
        self.scanner_at(start, stop, reverse, u64::MAX)
    }

    /// Scan `[start, stop)` as of `version_ceiling`
    ///
    /// Hold a `VersionPin` at or below the ceiling for the scan to see a
    /// stable set of versions.
    pub fn scanner_at(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
        version_ceiling: u64,
    ) -> Scanner<'_> {
        Scanner::new(self, bounded(start, stop), reverse, None, version_ceiling, None)
    }

    /// Scan `[start, stop)` as of the current version, pinned for the
    /// scanner's lifetime
    pub fn pinned_scanner(
        &self,
        start: Option<&[u8]>,
        stop: Option<&[u8]>,
        reverse: bool,
    ) -> Scanner<'_> {
        let pin = self.clock.pin();
        let ceiling = pin.version();
        Scanner::new(self, bounded(start, stop), reverse, None, ceiling, Some(pin))
    }

    /// Scan every key starting with `prefix`
    pub fn prefix_scanner(&self, prefix: &[u8], reverse: bool) -> Scanner<'_> {
        let range = KeyRange {
            lower: Bound::Included(prefix.to_vec()),
            upper: match next_prefix(prefix) {
                Some(stop) => Bound::Excluded(stop),
                None => Bound::Unbounded,
            },
        };
        Scanner::new(self, range, reverse, Some(prefix.to_vec()), u64::MAX, None)
    }

    /// Visible records in `range`, leaf by leaf, until at least `limit`
    pub(crate) fn collect_range(
        &self,
        range: &KeyRange,
        reverse: bool,
        ceiling: u64,
        limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        let root = self.root.read();
        root.collect(&self.read_context(), range, reverse, ceiling, limit, &mut out)?;
        Ok(out)
    }

    /// Number of visible keys
    pub fn count_records(&self) -> Result<u64> {
        let mut count = 0;
        for item in self.scanner(None, None, false) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Arena bytes plus index overhead
    pub fn memory_in_use(&self) -> u64 {
        self.arena.allocated_bytes() + self.counters.index_size()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            allocated_memory: self.memory_in_use(),
            memory_limit: self.budget.limit(),
            data_size: self.counters.data_size(),
            compressed_size: self.counters.stored_size(),
            index_size: self.counters.index_size(),
            block_count: self.counters.block_count(),
            compressed_blocks: self.counters.compressed_blocks(),
            record_count: self.counters.record_count(),
            depth: self.root.read().depth(),
        }
    }

    /// Recompute every counter by walking the tree
    pub fn sync_statistics(&self) -> Result<()> {
        let root = self.root.read();
        let mut totals = BlockFootprint::default();
        let mut blocks = 0;
        let mut compressed = 0;
        root.for_each_leaf(&mut |leaf: &Arc<LeafBlock>| {
            let fp = leaf.footprint();
            totals.raw += fp.raw;
            totals.stored += fp.stored;
            totals.records += fp.records;
            blocks += 1;
            compressed += fp.compressed as u64;
            Ok(())
        })?;
        self.counters.resync(blocks, totals, compressed);
        self.counters.set_index_size(root.serialized_size());
        Ok(())
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Remove every record, keeping the store usable
    pub fn flush_all(&self) -> Result<()> {
        let mut root = self.root.write();
        let ctx = self.write_context();
        root.free_all(&ctx)?;
        *root = IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx)));
        self.counters.set_index_size(root.serialized_size());
        tracing::info!(
            "Store flushed, {} bytes still allocated",
            self.arena.allocated_bytes()
        );
        Ok(())
    }

    /// Write every physical record to a new snapshot in `data_dir`
    pub fn snapshot(&self) -> Result<SnapshotId> {
        let _serial = self.snapshot_lock.lock();
        let dir = self.config.data_dir.as_path();
        let mut writer = self.claim_snapshot(dir)?;
        {
            let root = self.root.read();
            let ctx = self.read_context();
            root.for_each_leaf(&mut |leaf: &Arc<LeafBlock>| {
                let records = leaf.export(&ctx)?;
                if records.is_empty() {
                    return Ok(());
                }
                writer.add_block(&records)
            })?;
        }
        let summary = writer.finish()?;
        tracing::info!(
            "Snapshot {} written: {} blocks, {} records",
            summary.id,
            summary.block_count,
            summary.record_count
        );
        Ok(summary.id)
    }

    /// Rebuild a store from snapshot `id` in `config.data_dir`
    pub fn load(config: StoreConfig, id: SnapshotId) -> Result<Self> {
        let reader = SnapshotReader::open(&config.data_dir, id)?;
        if reader.codec() != config.codec {
            tracing::info!(
                "Snapshot {} was written with codec {}, loading with {}",
                id,
                reader.codec(),
                config.codec
            );
        }
        let mut records: Vec<Record> = reader.read_blocks()?.into_iter().flatten().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| b.version.cmp(&a.version)));

        let store = Self::new(config)?;
        let max_version = records.iter().map(|r| r.version).max().unwrap_or(0);
        let longest = records.iter().map(|r| r.key.len()).max().unwrap_or(0);
        store.longest_key.fetch_max(longest, Ordering::AcqRel);
        {
            let mut root = store.root.write();
            let ctx = store.write_context();
            let leaves = store.pack_leaves(&ctx, &records)?;
            let rebuilt = match IndexNode::build(leaves, &store.limits) {
                Some(node) => node,
                None => IndexNode::new_root(Arc::new(LeafBlock::new_empty(&ctx))),
            };
            let empty = std::mem::replace(&mut *root, rebuilt);
            empty.free_all(&ctx)?;
        }
        store.clock.observe(max_version);
        store.sync_statistics()?;

        if store.memory_in_use() > store.budget.limit() {
            tracing::warn!(
                "Snapshot {} needs {} bytes, above the {} byte limit",
                id,
                store.memory_in_use(),
                store.budget.limit()
            );
        }
        tracing::info!("Loaded snapshot {}: {} records", id, records.len());
        Ok(store)
    }

    /// Snapshot ids present in `dir`
    pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotId>> {
        snapshot::list_snapshots(dir)
    }

    /// Free every block and every arena allocation
    pub fn dispose(self) -> Result<()> {
        {
            let root = self.root.read();
            root.free_all(&self.write_context())?;
        }
        let leaked = self.arena.live_allocations();
        self.arena.clear();
        if leaked > 0 {
            tracing::warn!("Dispose reclaimed {} unowned allocations", leaked);
        }
        tracing::info!("Store disposed");
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Create the file for the next free snapshot id
    ///
    /// Another store writing to the same directory may claim an id between
    /// listing and creation; the file is opened exclusively and the next id
    /// is tried.
    fn claim_snapshot(&self, dir: &Path) -> Result<SnapshotWriter> {
        for _ in 0..SNAPSHOT_ID_ATTEMPTS {
            let id = snapshot::next_snapshot_id(dir)?;
            match SnapshotWriter::create(dir, id, self.config.codec) {
                Ok(writer) => return Ok(writer),
                Err(AtlasError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!("Snapshot id {} already taken, retrying", id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AtlasError::Snapshot(format!(
            "no free snapshot id in {} after {} attempts",
            dir.display(),
            SNAPSHOT_ID_ATTEMPTS
        )))
    }

    fn read_context(&self) -> BlockContext<'_> {
        self.context(0)
    }

    fn write_context(&self) -> BlockContext<'_> {
        self.context(self.clock.watermark())
    }

    fn context(&self, watermark: u64) -> BlockContext<'_> {
        BlockContext {
            arena: &self.arena,
            codec: self.codec,
            counters: &self.counters,
            block_size: self.config.block_size,
            watermark,
        }
    }

    /// Pack sorted records into leaves filled to the merge limit
    ///
    /// All versions of a key land in the same leaf.
    fn pack_leaves(&self, ctx: &BlockContext<'_>, records: &[Record]) -> Result<Vec<Arc<LeafBlock>>> {
        let target = ctx.merge_limit();
        let mut leaves = Vec::new();
        let mut start = 0;
        let mut size = 0;
        let mut i = 0;
        while i < records.len() {
            let mut j = i;
            let mut group = 0;
            while j < records.len() && records[j].key == records[i].key {
                let r = &records[j];
                group += footprint(
                    select_layout(r.key.len(), r.value.len(), ctx.block_size),
                    r.key.len(),
                    r.value.len(),
                );
                j += 1;
            }
            if size > 0 && size + group > target {
                leaves.push(Arc::new(LeafBlock::from_records(ctx, &records[start..i])?));
                start = i;
                size = 0;
            }
            if group > ctx.block_size {
                return Err(AtlasError::Corruption(format!(
                    "versions of one key need {} bytes, more than a block",
                    group
                )));
            }
            size += group;
            i = j;
        }
        if start < records.len() {
            leaves.push(Arc::new(LeafBlock::from_records(ctx, &records[start..])?));
        }
        Ok(leaves)
    }
}

/// Range `[start, stop)` with open sides for `None`
fn bounded(start: Option<&[u8]>, stop: Option<&[u8]>) -> KeyRange {
    KeyRange {
        lower: start.map_or(Bound::Unbounded, |k| Bound::Included(k.to_vec())),
        upper: stop.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_vec())),
    }
}
