//! Range and prefix scanners
//!
//! A scanner never holds a lock between calls. It buffers a batch of
//! records and, when the batch runs dry, re-descends from the root for the
//! next batch strictly after the last key it emitted (strictly before, in
//! reverse). Splits, merges and deletes between batches therefore cannot
//! make it repeat a key or go backwards.
//!
//! ## State Machine
//! ```text
//!   Created ──next()──▶ Positioned ──next()──▶ Positioned
//!                           │                      │
//!                           └──── range done ──────┴──▶ Exhausted
//!
//!   any state ──close()──▶ Closed
//! ```

use std::collections::VecDeque;
use std::ops::Bound;

use bytes::Bytes;

use crate::block::KeyRange;
use crate::error::Result;
use crate::store::{Store, VersionPin, SCAN_BATCH};

/// Lifecycle of a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Created,
    Positioned,
    Exhausted,
    Closed,
}

/// Where the cursor sits relative to the emitted records
#[derive(Debug, Clone)]
enum Cursor {
    Start,
    At(Bytes),
    End,
}

/// Cursor over `[start, stop)` of a store, forward or reverse
pub struct Scanner<'a> {
    store: &'a Store,
    range: KeyRange,
    reverse: bool,
    prefix: Option<Vec<u8>>,
    ceiling: u64,
    pin: Option<VersionPin<'a>>,
    buffer: VecDeque<(Bytes, Bytes)>,
    cursor: Cursor,
    /// The last refill reached the end of the range
    drained: bool,
    state: ScannerState,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(
        store: &'a Store,
        range: KeyRange,
        reverse: bool,
        prefix: Option<Vec<u8>>,
        ceiling: u64,
        pin: Option<VersionPin<'a>>,
    ) -> Self {
        Self {
            store,
            range,
            reverse,
            prefix,
            ceiling,
            pin,
            buffer: VecDeque::new(),
            cursor: Cursor::Start,
            drained: false,
            state: ScannerState::Created,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Version ceiling the scanner reads at
    pub fn version(&self) -> u64 {
        self.ceiling
    }

    /// Whether the scanner holds a version pin
    pub fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }

    /// Whether `next()` would return a record
    pub fn has_next(&mut self) -> Result<bool> {
        if matches!(self.state, ScannerState::Closed | ScannerState::Exhausted) {
            return Ok(false);
        }
        if self.buffer.is_empty() {
            self.refill()?;
        }
        Ok(!self.buffer.is_empty())
    }

    /// Advance in scan direction
    pub fn next_entry(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        if !self.has_next()? {
            if self.state != ScannerState::Closed {
                self.state = ScannerState::Exhausted;
                self.cursor = Cursor::End;
            }
            return Ok(None);
        }
        match self.buffer.pop_front() {
            Some(record) => {
                self.cursor = Cursor::At(record.0.clone());
                self.state = ScannerState::Positioned;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Step back against scan direction
    ///
    /// Returns the record just before the cursor and moves the cursor onto
    /// it; a following `next()` continues after that record. From an
    /// exhausted scanner this is the last record of the range.
    pub fn previous(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        let mut range = self.range.clone();
        match (&self.cursor, self.reverse) {
            (Cursor::Start, _) => return Ok(None),
            (Cursor::At(key), false) => range.upper = Bound::Excluded(key.to_vec()),
            (Cursor::At(key), true) => range.lower = Bound::Excluded(key.to_vec()),
            (Cursor::End, _) => {}
        }
        if self.state == ScannerState::Closed {
            return Ok(None);
        }

        let batch = self.store.collect_range(&range, !self.reverse, self.ceiling, 1)?;
        let found = batch.into_iter().find(|(key, _)| self.matches_prefix(key));
        match found {
            Some(record) => {
                self.cursor = Cursor::At(record.0.clone());
                self.buffer.clear();
                self.drained = false;
                self.state = ScannerState::Positioned;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Release buffers and any pinned version
    pub fn close(&mut self) {
        self.buffer.clear();
        self.pin = None;
        self.state = ScannerState::Closed;
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn refill(&mut self) -> Result<()> {
        if self.drained {
            return Ok(());
        }
        let mut range = self.range.clone();
        match (&self.cursor, self.reverse) {
            (Cursor::End, _) => {
                self.drained = true;
                return Ok(());
            }
            (Cursor::Start, _) => {}
            (Cursor::At(key), false) => range.lower = Bound::Excluded(key.to_vec()),
            (Cursor::At(key), true) => range.upper = Bound::Excluded(key.to_vec()),
        }

        let batch = self
            .store
            .collect_range(&range, self.reverse, self.ceiling, SCAN_BATCH)?;
        if batch.len() < SCAN_BATCH {
            self.drained = true;
        }
        for record in batch {
            if !self.matches_prefix(&record.0) {
                self.drained = true;
                break;
            }
            self.buffer.push_back(record);
        }
        Ok(())
    }

    fn matches_prefix(&self, key: &[u8]) -> bool {
        self.prefix.as_deref().map_or(true, |p| key.starts_with(p))
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Smallest key greater than every key starting with `prefix`
///
/// `None` when no such key exists (empty or all-0xFF prefix).
pub fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < 0xFF {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}
