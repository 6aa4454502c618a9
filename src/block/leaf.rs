//! Leaf block implementation
//!
//! A leaf owns one arena allocation for its body plus the external buffers
//! of its oversized records. Every operation decodes the body into a
//! scratch vector, works on the decoded entries and, for writes, encodes
//! and stores the result back.
//!
//! ## Concurrency
//! - Each leaf has its own `RwLock`; readers of different leaves never
//!   contend.
//! - Split and merge never modify a leaf in place: they build new leaves
//!   and mark the old ones retired. A thread that reaches a retired leaf
//!   through a stale reference gets `OpResult::Retry` / `Lookup::Retry` and
//!   restarts from the root.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::arena::Handle;
use crate::codec::CodecKind;
use crate::error::{AtlasError, Result};
use crate::index::OpResult;
use crate::store::stats::BlockFootprint;

use super::record::{decode_entries, encoded_len, entry_order, live_len, Entry, Op, Record};
use super::{BlockContext, KeyRange, Mutation};

/// Result of a point read against one leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    /// The leaf was replaced; restart from the root
    Retry,
}

#[derive(Default)]
struct LeafState {
    body: Option<Handle>,
    footprint: BlockFootprint,
    first_key: Vec<u8>,
}

/// Fixed-capacity container of sorted, versioned records
pub struct LeafBlock {
    id: u64,
    state: RwLock<LeafState>,
    retired: AtomicBool,
}

impl LeafBlock {
    /// Create an empty leaf
    pub fn new_empty(ctx: &BlockContext<'_>) -> Self {
        Self {
            id: ctx.counters.block_created(),
            state: RwLock::new(LeafState::default()),
            retired: AtomicBool::new(false),
        }
    }

    /// Build a leaf holding `records` (sorted, key ascending / version descending)
    ///
    /// Oversized parts are copied into fresh arena buffers.
    pub fn from_records(ctx: &BlockContext<'_>, records: &[Record]) -> Result<Self> {
        let mut entries = Vec::with_capacity(records.len());
        let mut guards = Vec::new();
        for r in records {
            let (entry, guard) =
                Entry::create(ctx.arena, &r.key, &r.value, r.version, r.op, ctx.block_size)?;
            entries.push(entry);
            guards.extend(guard);
        }
        if encoded_len(&entries) > ctx.block_size {
            return Err(AtlasError::Corruption(format!(
                "{} records do not fit a {} byte block",
                records.len(),
                ctx.block_size
            )));
        }
        entries.sort_by(entry_order);
        let leaf = Self::build(ctx, &entries)?;
        for guard in guards {
            guard.commit();
        }
        Ok(leaf)
    }

    /// Build a leaf from entries whose external buffers it takes over
    fn build(ctx: &BlockContext<'_>, entries: &[Entry]) -> Result<Self> {
        let leaf = Self::new_empty(ctx);
        {
            let mut state = leaf.state.write();
            if let Err(e) = Self::persist(&mut state, ctx, entries) {
                drop(state);
                ctx.counters.block_released();
                return Err(e);
            }
        }
        Ok(leaf)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Uncompressed size of the block body
    pub fn data_size(&self) -> usize {
        self.state.read().footprint.raw
    }

    /// Arena bytes held by the block body
    pub fn stored_size(&self) -> usize {
        self.state.read().footprint.stored
    }

    /// Encoded size of the records readers of the latest version can see
    ///
    /// Tombstones and shadowed versions do not count. Merges are triggered
    /// on this, not on `data_size`.
    pub fn live_size(&self) -> usize {
        self.state.read().footprint.live
    }

    /// Physical record count, including tombstones and old versions
    pub fn record_count(&self) -> usize {
        self.state.read().footprint.records
    }

    pub fn is_compressed(&self) -> bool {
        self.state.read().footprint.compressed
    }

    /// Smallest key held, empty for an empty block
    pub fn first_key(&self) -> Vec<u8> {
        self.state.read().first_key.clone()
    }

    pub(crate) fn footprint(&self) -> BlockFootprint {
        self.state.read().footprint
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Newest value of `key` with version at or below `ceiling`
    pub fn get(&self, ctx: &BlockContext<'_>, key: &[u8], ceiling: u64) -> Result<Lookup<Vec<u8>>> {
        self.find_visible(ctx, key, ceiling, |entry| entry.value(ctx.arena))
    }

    /// Like `get`, copying into `dst` and returning the true value length
    pub fn get_into(
        &self,
        ctx: &BlockContext<'_>,
        key: &[u8],
        ceiling: u64,
        dst: &mut [u8],
    ) -> Result<Lookup<usize>> {
        self.find_visible(ctx, key, ceiling, |entry| entry.copy_value(ctx.arena, dst))
    }

    /// Whether a visible value exists, without copying it
    pub fn contains(&self, ctx: &BlockContext<'_>, key: &[u8], ceiling: u64) -> Result<Lookup<()>> {
        self.find_visible(ctx, key, ceiling, |_| Ok(()))
    }

    fn find_visible<T>(
        &self,
        ctx: &BlockContext<'_>,
        key: &[u8],
        ceiling: u64,
        f: impl FnOnce(&Entry) -> Result<T>,
    ) -> Result<Lookup<T>> {
        let state = self.state.read();
        if self.is_retired() {
            return Ok(Lookup::Retry);
        }
        let entries = Self::load(&state, ctx)?;
        let start = entries.partition_point(|e| e.key.as_slice() < key);
        let visible = entries[start..]
            .iter()
            .take_while(|e| e.key.as_slice() == key)
            .find(|e| e.version <= ceiling);
        match visible {
            Some(entry) if entry.op == Op::Put => Ok(Lookup::Found(f(entry)?)),
            _ => Ok(Lookup::NotFound),
        }
    }

    /// Apply a put or a delete
    ///
    /// - `Ok`: applied
    /// - `NotFound`: delete of a key with no live value; nothing written
    /// - `SplitRequired`: the block cannot hold the record even after
    ///   compaction; nothing written
    /// - `Retry`: the block was retired
    pub fn apply(&self, ctx: &BlockContext<'_>, mutation: &Mutation<'_>) -> Result<OpResult> {
        self.apply_with(ctx, mutation, false)
    }

    /// Like `apply`, but a delete that cannot fit sheds retained versions
    /// of its key instead of asking for a split
    ///
    /// For blocks holding a single key, which cannot be split. Versions
    /// newer than the one the oldest pinned reader sees are dropped, oldest
    /// first, until the tombstone fits. Readers pinned between them fall
    /// back to the next older retained version.
    pub fn apply_shedding(
        &self,
        ctx: &BlockContext<'_>,
        mutation: &Mutation<'_>,
    ) -> Result<OpResult> {
        self.apply_with(ctx, mutation, true)
    }

    fn apply_with(
        &self,
        ctx: &BlockContext<'_>,
        mutation: &Mutation<'_>,
        shed: bool,
    ) -> Result<OpResult> {
        let mut state = self.state.write();
        if self.is_retired() {
            return Ok(OpResult::Retry);
        }
        let mut entries = Self::load(&state, ctx)?;
        let key = mutation.key();
        let version = mutation.version();
        let start = entries.partition_point(|e| e.key.as_slice() < key);
        let end = start + entries[start..].partition_point(|e| e.key.as_slice() == key);

        let (entry, guard) = match *mutation {
            Mutation::Put { value, .. } => {
                Entry::create(ctx.arena, key, value, version, Op::Put, ctx.block_size)?
            }
            Mutation::Delete { .. } => {
                let live = entries[start..end]
                    .first()
                    .map(|e| e.op == Op::Put)
                    .unwrap_or(false);
                if !live {
                    return Ok(OpResult::NotFound);
                }
                Entry::create(ctx.arena, key, &[], version, Op::Delete, ctx.block_size)?
            }
        };

        let mut dropped = Vec::new();
        let pos = start + entries[start..end].partition_point(|e| e.version > version);
        let end = if pos < end && entries[pos].version == version {
            dropped.push(std::mem::replace(&mut entries[pos], entry));
            end
        } else {
            entries.insert(pos, entry);
            end + 1
        };

        // Versions of this key nobody can read any more
        let group: Vec<Entry> = entries.drain(start..end).collect();
        let kept = prune(group, ctx.watermark, true, &mut dropped);
        entries.splice(start..start, kept);

        if encoded_len(&entries) > ctx.block_size {
            entries = prune(entries, ctx.watermark, false, &mut dropped);
            if shed && matches!(mutation, Mutation::Delete { .. }) {
                let before = dropped.len();
                shed_versions(&mut entries, key, version, ctx, &mut dropped);
                if dropped.len() > before {
                    tracing::warn!(
                        "Delete in block {} dropped {} pinned versions of a {} byte key",
                        self.id,
                        dropped.len() - before,
                        key.len()
                    );
                }
            }
            if encoded_len(&entries) > ctx.block_size {
                // `guard` releases the new external buffer
                return Ok(OpResult::SplitRequired);
            }
        }

        Self::persist(&mut state, ctx, &entries)?;
        if let Some(guard) = guard {
            guard.commit();
        }
        free_externals(ctx, &dropped)?;
        Ok(OpResult::Ok)
    }

    // =========================================================================
    // Structural Operations
    // =========================================================================

    /// Split into two new leaves, retiring this one
    ///
    /// Records are divided at the key boundary closest to half the body
    /// size; all versions of a key stay together. Returns `None` when the
    /// block holds a single key and cannot be divided.
    pub fn split(&self, ctx: &BlockContext<'_>) -> Result<Option<(Arc<LeafBlock>, Arc<LeafBlock>)>> {
        let mut state = self.state.write();
        if self.is_retired() {
            return Ok(None);
        }
        let mut dropped = Vec::new();
        let mut entries = prune(Self::load(&state, ctx)?, ctx.watermark, false, &mut dropped);

        let at = match split_point(&entries) {
            Some(at) => at,
            None => {
                if !dropped.is_empty() {
                    Self::persist(&mut state, ctx, &entries)?;
                    free_externals(ctx, &dropped)?;
                }
                return Ok(None);
            }
        };

        let right_entries = entries.split_off(at);
        let left = Self::build(ctx, &entries)?;
        let right = match Self::build(ctx, &right_entries) {
            Ok(right) => right,
            Err(e) => {
                left.release_body(ctx)?;
                return Err(e);
            }
        };

        self.retire_locked(&mut state, ctx)?;
        free_externals(ctx, &dropped)?;

        tracing::debug!(
            "Split block {} into {} ({} records) and {} ({} records)",
            self.id,
            left.id,
            entries.len(),
            right.id,
            right_entries.len()
        );
        Ok(Some((Arc::new(left), Arc::new(right))))
    }

    /// Merge two adjacent leaves into a new one, retiring both
    ///
    /// Returns `None` when the compacted contents would exceed the merge
    /// fill limit.
    pub fn merge(
        left: &LeafBlock,
        right: &LeafBlock,
        ctx: &BlockContext<'_>,
    ) -> Result<Option<Arc<LeafBlock>>> {
        let mut left_state = left.state.write();
        let mut right_state = right.state.write();
        if left.is_retired() || right.is_retired() {
            return Ok(None);
        }

        let mut entries = Self::load(&left_state, ctx)?;
        entries.extend(Self::load(&right_state, ctx)?);
        let mut dropped = Vec::new();
        let entries = prune(entries, ctx.watermark, false, &mut dropped);
        if encoded_len(&entries) > ctx.merge_limit() {
            return Ok(None);
        }

        let merged = Self::build(ctx, &entries)?;
        left.retire_locked(&mut left_state, ctx)?;
        right.retire_locked(&mut right_state, ctx)?;
        free_externals(ctx, &dropped)?;

        tracing::debug!(
            "Merged blocks {} and {} into {} ({} records)",
            left.id,
            right.id,
            merged.id,
            entries.len()
        );
        Ok(Some(Arc::new(merged)))
    }

    /// Free the body and every external buffer, retiring the block
    pub fn free(&self, ctx: &BlockContext<'_>) -> Result<()> {
        let mut state = self.state.write();
        if self.is_retired() {
            return Ok(());
        }
        let entries = Self::load(&state, ctx)?;
        free_externals(ctx, &entries)?;
        self.retire_locked(&mut state, ctx)
    }

    /// Discard versions no reader can observe, returning how many went
    ///
    /// Tombstones that became the oldest visible record of their key are
    /// discarded too.
    pub fn compact(&self, ctx: &BlockContext<'_>) -> Result<usize> {
        let mut state = self.state.write();
        if self.is_retired() {
            return Ok(0);
        }
        let mut dropped = Vec::new();
        let entries = prune(Self::load(&state, ctx)?, ctx.watermark, false, &mut dropped);
        if dropped.is_empty() {
            return Ok(0);
        }
        Self::persist(&mut state, ctx, &entries)?;
        free_externals(ctx, &dropped)?;
        Ok(dropped.len())
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Append the visible records inside `range` to `out`
    ///
    /// Records come out in key order, or reverse key order when `reverse`.
    pub fn scan_from(
        &self,
        ctx: &BlockContext<'_>,
        range: &KeyRange,
        reverse: bool,
        ceiling: u64,
        out: &mut Vec<(Bytes, Bytes)>,
    ) -> Result<Lookup<()>> {
        let state = self.state.read();
        if self.is_retired() {
            return Ok(Lookup::Retry);
        }
        let entries = Self::load(&state, ctx)?;

        let mut visible = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            let key = &entries[i].key;
            let mut j = i;
            let mut chosen = None;
            while j < entries.len() && &entries[j].key == key {
                if chosen.is_none() && entries[j].version <= ceiling {
                    chosen = Some(j);
                }
                j += 1;
            }
            if let Some(c) = chosen {
                let entry = &entries[c];
                if entry.op == Op::Put && range.contains(&entry.key) {
                    visible.push(c);
                }
            }
            i = j;
        }

        if reverse {
            visible.reverse();
        }
        for c in visible {
            let entry = &entries[c];
            out.push((
                Bytes::copy_from_slice(&entry.key),
                Bytes::from(entry.value(ctx.arena)?),
            ));
        }
        Ok(Lookup::Found(()))
    }

    /// Every physical record, materialized (snapshot export)
    pub fn export(&self, ctx: &BlockContext<'_>) -> Result<Vec<Record>> {
        let state = self.state.read();
        let entries = Self::load(&state, ctx)?;
        entries
            .iter()
            .map(|e| {
                Ok(Record {
                    key: e.key.clone(),
                    value: e.value(ctx.arena)?,
                    version: e.version,
                    op: e.op,
                })
            })
            .collect()
    }

    /// Highest version stored in the block
    pub fn max_version(&self, ctx: &BlockContext<'_>) -> Result<u64> {
        let state = self.state.read();
        let entries = Self::load(&state, ctx)?;
        Ok(entries.iter().map(|e| e.version).max().unwrap_or(0))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Decode the body into entries
    fn load(state: &LeafState, ctx: &BlockContext<'_>) -> Result<Vec<Entry>> {
        let body = match state.body {
            Some(body) => body,
            None => return Ok(Vec::new()),
        };
        let mut stored = Vec::with_capacity(state.footprint.stored);
        ctx.arena.read(body, |b| stored.extend_from_slice(b))?;

        let raw = if state.footprint.compressed {
            let mut raw = Vec::with_capacity(state.footprint.raw);
            ctx.codec.decompress(&stored, &mut raw, state.footprint.raw)?;
            raw
        } else {
            stored
        };
        if raw.len() != state.footprint.raw {
            return Err(AtlasError::Corruption(format!(
                "block body is {} bytes, expected {}",
                raw.len(),
                state.footprint.raw
            )));
        }
        decode_entries(&raw, ctx.arena)
    }

    /// Encode, compress and store entries as the new body
    fn persist(state: &mut LeafState, ctx: &BlockContext<'_>, entries: &[Entry]) -> Result<()> {
        let mut raw = Vec::with_capacity(encoded_len(entries));
        for entry in entries {
            entry.encode_into(&mut raw);
        }
        let raw_len = raw.len();

        let (bytes, compressed) = if ctx.codec.kind() == CodecKind::None || raw.is_empty() {
            (raw, false)
        } else {
            let mut packed = Vec::new();
            ctx.codec.compress(&raw, &mut packed)?;
            if packed.len() < raw.len() {
                (packed, true)
            } else {
                (raw, false)
            }
        };

        match (state.body, bytes.is_empty()) {
            (Some(body), true) => {
                ctx.arena.free(body)?;
                state.body = None;
            }
            (Some(body), false) => ctx.arena.reallocate(body, &bytes)?,
            (None, false) => state.body = Some(ctx.arena.allocate_from(&bytes)?),
            (None, true) => {}
        }

        let footprint = BlockFootprint {
            raw: raw_len,
            live: live_len(entries),
            stored: bytes.len(),
            records: entries.len(),
            compressed,
        };
        ctx.counters.block_changed(state.footprint, footprint);
        state.footprint = footprint;
        state.first_key = entries.first().map(|e| e.key.clone()).unwrap_or_default();
        Ok(())
    }

    /// Free the body only; external buffers have new owners
    fn release_body(&self, ctx: &BlockContext<'_>) -> Result<()> {
        let mut state = self.state.write();
        self.retire_locked(&mut state, ctx)
    }

    fn retire_locked(&self, state: &mut LeafState, ctx: &BlockContext<'_>) -> Result<()> {
        if let Some(body) = state.body.take() {
            ctx.arena.free(body)?;
        }
        ctx.counters.block_changed(state.footprint, BlockFootprint::default());
        ctx.counters.block_released();
        state.footprint = BlockFootprint::default();
        self.retired.store(true, Ordering::Release);
        Ok(())
    }
}

/// Drop versions that no reader can observe
///
/// Within each key (newest first), the first record at or below the
/// watermark is the oldest one anybody can see; everything older goes.
/// Unless `keep_tombstones`, that record also goes when it is a tombstone,
/// since nothing older survives for it to hide.
fn prune(
    entries: Vec<Entry>,
    watermark: u64,
    keep_tombstones: bool,
    dropped: &mut Vec<Entry>,
) -> Vec<Entry> {
    let mut kept = Vec::with_capacity(entries.len());
    let mut current: Option<Vec<u8>> = None;
    let mut settled = false;
    for entry in entries {
        if current.as_deref() != Some(entry.key.as_slice()) {
            current = Some(entry.key.clone());
            settled = false;
        }
        if settled {
            dropped.push(entry);
            continue;
        }
        if entry.version <= watermark {
            settled = true;
            if entry.op == Op::Delete && !keep_tombstones {
                dropped.push(entry);
                continue;
            }
        }
        kept.push(entry);
    }
    kept
}

/// Drop versions of `key` newer than the watermark, oldest first, until
/// the entries fit a block; the record at `keep` always stays
fn shed_versions(
    entries: &mut Vec<Entry>,
    key: &[u8],
    keep: u64,
    ctx: &BlockContext<'_>,
    dropped: &mut Vec<Entry>,
) {
    let mut size = encoded_len(entries);
    let start = entries.partition_point(|e| e.key.as_slice() < key);
    let mut i = start + entries[start..].partition_point(|e| e.key.as_slice() == key);
    while size > ctx.block_size && i > start {
        i -= 1;
        let entry = &entries[i];
        if entry.version == keep || entry.version <= ctx.watermark {
            continue;
        }
        size -= entry.encoded_size();
        dropped.push(entries.remove(i));
    }
}

/// Key boundary closest to half the encoded size; ties go to the lower index
fn split_point(entries: &[Entry]) -> Option<usize> {
    let total = encoded_len(entries);
    let mut best: Option<(usize, usize)> = None;
    let mut prefix = 0;
    for i in 1..entries.len() {
        prefix += entries[i - 1].encoded_size();
        if entries[i].key == entries[i - 1].key {
            continue;
        }
        let distance = prefix.abs_diff(total - prefix);
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((i, distance));
        }
    }
    best.map(|(i, _)| i)
}

fn free_externals(ctx: &BlockContext<'_>, entries: &[Entry]) -> Result<()> {
    for handle in entries.iter().filter_map(Entry::external) {
        ctx.arena.free(handle)?;
    }
    Ok(())
}
