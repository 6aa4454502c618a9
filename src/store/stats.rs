//! Store statistics
//!
//! Global counters updated on every block allocation, resize and free.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Size bookkeeping for one block body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BlockFootprint {
    /// Uncompressed encoded size
    pub raw: usize,
    /// Encoded size of the newest record of each key, puts only
    pub live: usize,
    /// Bytes held in the arena
    pub stored: usize,
    pub records: usize,
    pub compressed: bool,
}

/// Live counters shared by every block of a store
pub struct Counters {
    data_size: CachePadded<AtomicU64>,
    stored_size: CachePadded<AtomicU64>,
    compressed_blocks: CachePadded<AtomicU64>,
    block_count: CachePadded<AtomicU64>,
    record_count: CachePadded<AtomicU64>,
    index_size: CachePadded<AtomicU64>,
    next_block_id: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            data_size: CachePadded::new(AtomicU64::new(0)),
            stored_size: CachePadded::new(AtomicU64::new(0)),
            compressed_blocks: CachePadded::new(AtomicU64::new(0)),
            block_count: CachePadded::new(AtomicU64::new(0)),
            record_count: CachePadded::new(AtomicU64::new(0)),
            index_size: CachePadded::new(AtomicU64::new(0)),
            next_block_id: AtomicU64::new(1),
        }
    }

    /// Register a new block, returning its id
    pub(crate) fn block_created(&self) -> u64 {
        self.block_count.fetch_add(1, Ordering::Relaxed);
        self.next_block_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn block_released(&self) {
        self.block_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Apply the difference between two footprints of the same block
    pub(crate) fn block_changed(&self, old: BlockFootprint, new: BlockFootprint) {
        adjust(&self.data_size, old.raw, new.raw);
        adjust(&self.stored_size, old.stored, new.stored);
        adjust(&self.record_count, old.records, new.records);
        adjust(
            &self.compressed_blocks,
            old.compressed as usize,
            new.compressed as usize,
        );
    }

    pub(crate) fn set_index_size(&self, bytes: usize) {
        self.index_size.store(bytes as u64, Ordering::Relaxed);
    }

    pub fn index_size(&self) -> u64 {
        self.index_size.load(Ordering::Relaxed)
    }

    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn stored_size(&self) -> u64 {
        self.stored_size.load(Ordering::Relaxed)
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::Relaxed)
    }

    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    pub fn compressed_blocks(&self) -> u64 {
        self.compressed_blocks.load(Ordering::Relaxed)
    }

    /// Overwrite every size counter with recomputed totals
    pub(crate) fn resync(&self, blocks: u64, totals: BlockFootprint, compressed_blocks: u64) {
        self.block_count.store(blocks, Ordering::Relaxed);
        self.data_size.store(totals.raw as u64, Ordering::Relaxed);
        self.stored_size.store(totals.stored as u64, Ordering::Relaxed);
        self.record_count.store(totals.records as u64, Ordering::Relaxed);
        self.compressed_blocks.store(compressed_blocks, Ordering::Relaxed);
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

fn adjust(counter: &AtomicU64, old: usize, new: usize) {
    if new >= old {
        counter.fetch_add((new - old) as u64, Ordering::Relaxed);
    } else {
        counter.fetch_sub((old - new) as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a store's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Arena bytes plus index overhead
    pub allocated_memory: u64,
    pub memory_limit: u64,
    /// Uncompressed size of all block bodies
    pub data_size: u64,
    /// Arena bytes held by block bodies (compressed where it helped)
    pub compressed_size: u64,
    /// Serialized size of every index node
    pub index_size: u64,
    pub block_count: u64,
    pub compressed_blocks: u64,
    /// Physical records, including tombstones and retained versions
    pub record_count: u64,
    /// Index levels above the leaves
    pub depth: usize,
}

impl StoreStats {
    /// stored / raw, or 1.0 for an empty store
    pub fn compression_ratio(&self) -> f64 {
        if self.data_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.data_size as f64
        }
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "allocated memory : {} / {} bytes", self.allocated_memory, self.memory_limit)?;
        writeln!(f, "data size        : {} bytes", self.data_size)?;
        writeln!(
            f,
            "compressed size  : {} bytes (ratio {:.3})",
            self.compressed_size,
            self.compression_ratio()
        )?;
        writeln!(f, "index size       : {} bytes", self.index_size)?;
        writeln!(
            f,
            "blocks           : {} ({} compressed)",
            self.block_count, self.compressed_blocks
        )?;
        writeln!(f, "records          : {}", self.record_count)?;
        write!(f, "index depth      : {}", self.depth)
    }
}
