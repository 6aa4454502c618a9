//! Scoped arena allocations
//!
//! Releases the allocation on every exit path unless ownership is handed
//! over with `commit`.

use super::{Arena, Handle};

/// Allocation that is freed when dropped uncommitted
pub struct ScopedAllocation<'a> {
    arena: &'a Arena,
    handle: Handle,
    armed: bool,
}

impl<'a> ScopedAllocation<'a> {
    pub(super) fn new(arena: &'a Arena, handle: Handle) -> Self {
        Self {
            arena,
            handle,
            armed: true,
        }
    }

    /// The guarded handle
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Keep the allocation; the caller now owns the handle
    pub fn commit(mut self) -> Handle {
        self.armed = false;
        self.handle
    }
}

impl Drop for ScopedAllocation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.arena.free(self.handle) {
            tracing::warn!("Failed to release scoped allocation {:?}: {}", self.handle, e);
        }
    }
}
