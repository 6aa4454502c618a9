//! Version clock and read pins
//!
//! Every write takes the next version from the clock. Readers that need a
//! stable view pin the current version; the garbage-collection watermark
//! is the oldest pinned version, so records a pinned reader may still see
//! are never pruned.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{AtlasError, Result};

/// Monotonic version source plus the set of pinned read versions
pub struct VersionClock {
    next: AtomicU64,
    /// pinned version -> number of pins
    pins: Mutex<BTreeMap<u64, usize>>,
}

impl VersionClock {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            pins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Take a fresh version for a write
    ///
    /// Fails once the version space is used up instead of wrapping to 0.
    pub fn next_version(&self) -> Result<u64> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .map_err(|_| AtlasError::VersionExhausted)
    }

    /// Newest version handed out so far
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Acquire).saturating_sub(1)
    }

    /// Make sure future versions are greater than `version`
    pub fn observe(&self, version: u64) {
        self.next
            .fetch_max(version.saturating_add(1), Ordering::AcqRel);
    }

    /// Pin the current version for reading
    pub fn pin(&self) -> VersionPin<'_> {
        let mut pins = self.pins.lock();
        let version = self.current();
        *pins.entry(version).or_insert(0) += 1;
        VersionPin {
            clock: self,
            version,
        }
    }

    /// Versions at or below this are visible to every reader
    pub fn watermark(&self) -> u64 {
        let pins = self.pins.lock();
        match pins.keys().next() {
            Some(&oldest) => oldest,
            None => self.next.load(Ordering::Acquire),
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pins.lock().values().sum()
    }

    fn unpin(&self, version: u64) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&version);
            }
        }
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A pinned read version; released on drop
pub struct VersionPin<'a> {
    clock: &'a VersionClock,
    version: u64,
}

impl VersionPin<'_> {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for VersionPin<'_> {
    fn drop(&mut self) {
        self.clock.unpin(self.version);
    }
}
