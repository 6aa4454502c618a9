//! Arena Module
//!
//! Manually managed memory for leaf block bodies and external key/value
//! buffers.
//!
//! ## Responsibilities
//! - Allocate, resize and free byte buffers addressed by `Handle`
//! - Detect use of freed allocations (generation mismatch)
//! - Keep global byte counters for admission control
//!
//! ## Layout
//! ```text
//! ┌─────────┐ ┌─────────┐       ┌─────────┐
//! │ Shard 0 │ │ Shard 1 │  ...  │ Shard 15│   (parking_lot::Mutex each)
//! └────┬────┘ └────┬────┘       └────┬────┘
//!      │ slots: [gen | Option<Box<[u8]>>] + free list
//! ```
//!
//! Shards are picked round-robin on allocation, so unrelated blocks rarely
//! contend on the same lock.

mod handle;
mod scoped;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::error::{AtlasError, Result};

pub use handle::Handle;
pub use scoped::ScopedAllocation;

/// log2 of the shard count
pub(crate) const SHARD_BITS: u32 = 4;

const SHARD_COUNT: usize = 1 << SHARD_BITS;

/// Largest slot index a shard can hand out
const MAX_LOCAL_SLOTS: usize = (u32::MAX >> SHARD_BITS) as usize;

struct Slot {
    generation: u32,
    data: Option<Box<[u8]>>,
}

#[derive(Default)]
struct Shard {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Sharded slab allocator with generation-tagged handles
pub struct Arena {
    shards: Box<[Mutex<Shard>]>,
    next_shard: AtomicUsize,
    allocated: CachePadded<AtomicU64>,
    live: CachePadded<AtomicU64>,
}

impl Arena {
    /// Create an empty arena
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(Shard::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            next_shard: AtomicUsize::new(0),
            allocated: CachePadded::new(AtomicU64::new(0)),
            live: CachePadded::new(AtomicU64::new(0)),
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a zero-filled buffer of `size` bytes
    pub fn allocate(&self, size: usize) -> Result<Handle> {
        let mut buf = Self::reserve(size)?;
        buf.resize(size, 0);
        self.insert(buf.into_boxed_slice())
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn allocate_from(&self, bytes: &[u8]) -> Result<Handle> {
        let mut buf = Self::reserve(bytes.len())?;
        buf.extend_from_slice(bytes);
        self.insert(buf.into_boxed_slice())
    }

    /// Allocate a copy of `bytes` that is freed unless committed
    pub fn scoped_from(&self, bytes: &[u8]) -> Result<ScopedAllocation<'_>> {
        let handle = self.allocate_from(bytes)?;
        Ok(ScopedAllocation::new(self, handle))
    }

    /// Replace the contents of an allocation, resizing it to `bytes.len()`
    pub fn reallocate(&self, handle: Handle, bytes: &[u8]) -> Result<()> {
        let mut buf = Self::reserve(bytes.len())?;
        buf.extend_from_slice(bytes);
        let new_len = bytes.len() as u64;
        let old_len = self.with_slot(handle, |slot| {
            let old = slot.data.replace(buf.into_boxed_slice());
            Ok(old.map(|b| b.len()).unwrap_or(0) as u64)
        })?;
        if new_len >= old_len {
            self.allocated.fetch_add(new_len - old_len, Ordering::Relaxed);
        } else {
            self.allocated.fetch_sub(old_len - new_len, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Free an allocation, returning its size
    pub fn free(&self, handle: Handle) -> Result<usize> {
        let len = {
            let mut shard = self.shards[handle.shard()].lock();
            let local = handle.local();
            let slot = Self::live_slot(&mut shard.slots, handle)?;
            let len = slot.data.take().map(|b| b.len()).unwrap_or(0);
            slot.generation = slot.generation.wrapping_add(1);
            shard.free.push(local as u32);
            len
        };
        self.allocated.fetch_sub(len as u64, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(len)
    }

    /// Drop every allocation; all outstanding handles become invalid
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let Shard { slots, free } = &mut *shard;
            for (local, slot) in slots.iter_mut().enumerate() {
                if slot.data.take().is_some() {
                    slot.generation = slot.generation.wrapping_add(1);
                    free.push(local as u32);
                }
            }
        }
        self.allocated.store(0, Ordering::Relaxed);
        self.live.store(0, Ordering::Relaxed);
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Run `f` over the allocation's bytes
    ///
    /// The shard stays locked while `f` runs; `f` must not call back into
    /// the arena.
    pub fn read<R>(&self, handle: Handle, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.with_slot(handle, |slot| Ok(f(slot.data.as_deref().unwrap_or(&[]))))
    }

    /// Run `f` over the allocation's bytes mutably
    pub fn write<R>(&self, handle: Handle, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.with_slot(handle, |slot| Ok(f(slot.data.as_deref_mut().unwrap_or(&mut []))))
    }

    /// Copy the allocation into `dst`, truncating to `dst.len()`
    ///
    /// Returns the allocation's true length.
    pub fn copy_out(&self, handle: Handle, dst: &mut [u8]) -> Result<usize> {
        self.read(handle, |src| {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
            src.len()
        })
    }

    /// Copy the allocation into a new owned buffer
    pub fn to_vec(&self, handle: Handle) -> Result<Vec<u8>> {
        self.read(handle, |src| src.to_vec())
    }

    /// Copy `len` bytes from the start of `src` to the start of `dst`
    pub fn copy(&self, src: Handle, dst: Handle, len: usize) -> Result<()> {
        let bytes = self.read(src, |b| b.get(..len).map(|s| s.to_vec()))?;
        let bytes = bytes.ok_or_else(|| {
            AtlasError::InvalidHandle(format!("copy of {} bytes overruns {:?}", len, src))
        })?;
        let copied = self.write(dst, |d| match d.get_mut(..len) {
            Some(d) => {
                d.copy_from_slice(&bytes);
                true
            }
            None => false,
        })?;
        if !copied {
            return Err(AtlasError::InvalidHandle(format!(
                "copy of {} bytes overruns {:?}",
                len, dst
            )));
        }
        Ok(())
    }

    /// Size of an allocation
    pub fn len(&self, handle: Handle) -> Result<usize> {
        self.read(handle, |b| b.len())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Total bytes currently allocated
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn reserve(size: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| AtlasError::OutOfMemory { requested: size })?;
        Ok(buf)
    }

    fn insert(&self, data: Box<[u8]>) -> Result<Handle> {
        let len = data.len();
        let shard_idx = self.next_shard.fetch_add(1, Ordering::Relaxed) % SHARD_COUNT;
        let (local, generation) = {
            let mut shard = self.shards[shard_idx].lock();
            match shard.free.pop() {
                Some(local) => {
                    let slot = &mut shard.slots[local as usize];
                    slot.data = Some(data);
                    (local, slot.generation)
                }
                None => {
                    if shard.slots.len() >= MAX_LOCAL_SLOTS {
                        return Err(AtlasError::OutOfMemory { requested: len });
                    }
                    shard.slots.push(Slot {
                        generation: 1,
                        data: Some(data),
                    });
                    ((shard.slots.len() - 1) as u32, 1)
                }
            }
        };
        self.allocated.fetch_add(len as u64, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(Handle::new((local << SHARD_BITS) | shard_idx as u32, generation))
    }

    fn with_slot<R>(&self, handle: Handle, f: impl FnOnce(&mut Slot) -> Result<R>) -> Result<R> {
        let mut shard = self.shards[handle.shard()].lock();
        let slot = Self::live_slot(&mut shard.slots, handle)?;
        f(slot)
    }

    fn live_slot(slots: &mut [Slot], handle: Handle) -> Result<&mut Slot> {
        slots
            .get_mut(handle.local())
            .filter(|slot| slot.generation == handle.generation() && slot.data.is_some())
            .ok_or_else(|| AtlasError::InvalidHandle(format!("{:?} is not live", handle)))
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
