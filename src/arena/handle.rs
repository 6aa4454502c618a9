//! Arena handles
//!
//! A handle names one arena slot plus the generation the slot had when the
//! allocation was made. Freeing a slot bumps its generation, so a handle
//! that outlives its allocation is rejected instead of aliasing new data.

use std::fmt;

use super::SHARD_BITS;

/// Generation-tagged reference to an arena allocation
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    /// Slot index; the low `SHARD_BITS` select the shard
    index: u32,
    /// Slot generation at allocation time
    generation: u32,
}

impl Handle {
    /// Encoded size of a handle inside block bytes
    pub const ENCODED_SIZE: usize = 8;

    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Pack into a u64 (index in the high half)
    pub fn to_u64(self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    /// Unpack a handle written by `to_u64`
    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn shard(&self) -> usize {
        (self.index & ((1 << SHARD_BITS) - 1)) as usize
    }

    pub(crate) fn local(&self) -> usize {
        (self.index >> SHARD_BITS) as usize
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{}@{})", self.shard(), self.local(), self.generation)
    }
}
