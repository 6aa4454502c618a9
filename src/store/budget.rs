//! Admission control
//!
//! A write reserves the most memory it could allocate before touching the
//! tree. The reservation is checked against bytes in use plus every other
//! outstanding reservation, so concurrent writers cannot jointly overshoot
//! the limit.
//!
//! ## Counters
//! Both counters only grow; outstanding bytes are their difference. The
//! released counter is read before bytes in use, so a writer whose
//! reservation is already returned has its allocation visible, and a writer
//! whose reservation is not yet returned is still counted as outstanding.
//! The final CAS on the monotonic reserved total fails if any reservation
//! was taken in between.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Global memory limit with outstanding reservations
pub struct MemoryBudget {
    limit: u64,
    reserved: CachePadded<AtomicU64>,
    released: CachePadded<AtomicU64>,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            reserved: CachePadded::new(AtomicU64::new(0)),
            released: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes held by in-flight reservations
    pub fn reserved(&self) -> u64 {
        let released = self.released.load(Ordering::Acquire);
        self.reserved
            .load(Ordering::Acquire)
            .saturating_sub(released)
    }

    /// Reserve `bytes` on top of what `in_use` reports, or `None` if that
    /// would pass the limit
    pub fn try_reserve<F>(&self, in_use: F, bytes: u64) -> Option<Reservation<'_>>
    where
        F: Fn() -> u64,
    {
        loop {
            let released = self.released.load(Ordering::Acquire);
            let used = in_use();
            let total = self.reserved.load(Ordering::Acquire);
            let outstanding = total.saturating_sub(released);
            if used.saturating_add(outstanding).saturating_add(bytes) > self.limit {
                return None;
            }
            if self
                .reserved
                .compare_exchange_weak(total, total + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(Reservation { budget: self, bytes });
            }
        }
    }
}

/// Outstanding reservation; returned to the budget on drop
pub struct Reservation<'a> {
    budget: &'a MemoryBudget,
    bytes: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.budget.released.fetch_add(self.bytes, Ordering::AcqRel);
    }
}
