//! Record encoding
//!
//! ## In-block Format
//! ```text
//! ┌──────────┬───────┬─────────────┬─────────────┬─────────────┬──────────────┐
//! │Layout (1)│ Op (1)│ Version (8) │ KeyLen (4)  │ ValLen (4)  │    Body      │
//! └──────────┴───────┴─────────────┴─────────────┴─────────────┴──────────────┘
//!
//! Body by layout:
//!   Inline:           key bytes + value bytes
//!   ExternalValue:    key bytes + value handle (8)
//!   ExternalKeyValue: handle (8) of one buffer holding key then value
//! ```
//!
//! Records are kept sorted by key ascending, then version descending.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::arena::{Arena, Handle, ScopedAllocation};
use crate::error::{AtlasError, Result};

/// Fixed header in front of every encoded record
pub const RECORD_HEADER_SIZE: usize = 18;

/// Record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Put,
    /// Tombstone: hides older versions of the key
    Delete,
}

/// Physical placement of a record's key and value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Inline,
    ExternalValue,
    ExternalKeyValue,
}

impl RecordLayout {
    fn to_u8(self) -> u8 {
        match self {
            RecordLayout::Inline => 0,
            RecordLayout::ExternalValue => 1,
            RecordLayout::ExternalKeyValue => 2,
        }
    }

    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordLayout::Inline),
            1 => Some(RecordLayout::ExternalValue),
            2 => Some(RecordLayout::ExternalKeyValue),
            _ => None,
        }
    }
}

/// Largest in-block footprint a single record may take
pub fn max_inline_record(block_size: usize) -> usize {
    block_size / 4
}

/// Pick the layout for a record of the given sizes
///
/// Every layout this returns fits in an empty block of `block_size`.
pub fn select_layout(key_len: usize, value_len: usize, block_size: usize) -> RecordLayout {
    let limit = max_inline_record(block_size);
    if RECORD_HEADER_SIZE + key_len + value_len <= limit {
        RecordLayout::Inline
    } else if RECORD_HEADER_SIZE + key_len + Handle::ENCODED_SIZE <= limit {
        RecordLayout::ExternalValue
    } else {
        RecordLayout::ExternalKeyValue
    }
}

/// Encoded in-block size of a record with this layout
pub fn footprint(layout: RecordLayout, key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE
        + match layout {
            RecordLayout::Inline => key_len + value_len,
            RecordLayout::ExternalValue => key_len + Handle::ENCODED_SIZE,
            RecordLayout::ExternalKeyValue => Handle::ENCODED_SIZE,
        }
}

/// A logical record, fully materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub op: Op,
}

// =============================================================================
// Decoded Entries
// =============================================================================

/// Where an entry's value lives
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Inline(Vec<u8>),
    /// `with_key`: the buffer holds key bytes followed by the value
    External { handle: Handle, len: usize, with_key: bool },
}

/// A record as decoded from a block; keys are always materialized
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub op: Op,
    pub version: u64,
    pub key: Vec<u8>,
    pub payload: Payload,
}

impl Entry {
    /// Build an entry, placing oversized parts in the arena
    ///
    /// The returned guard owns the external buffer until the entry has been
    /// persisted into a block.
    pub fn create<'a>(
        arena: &'a Arena,
        key: &[u8],
        value: &[u8],
        version: u64,
        op: Op,
        block_size: usize,
    ) -> Result<(Entry, Option<ScopedAllocation<'a>>)> {
        let (payload, guard) = match select_layout(key.len(), value.len(), block_size) {
            RecordLayout::Inline => (Payload::Inline(value.to_vec()), None),
            RecordLayout::ExternalValue => {
                let guard = arena.scoped_from(value)?;
                let payload = Payload::External {
                    handle: guard.handle(),
                    len: value.len(),
                    with_key: false,
                };
                (payload, Some(guard))
            }
            RecordLayout::ExternalKeyValue => {
                let mut buf = Vec::with_capacity(key.len() + value.len());
                buf.extend_from_slice(key);
                buf.extend_from_slice(value);
                let guard = arena.scoped_from(&buf)?;
                let payload = Payload::External {
                    handle: guard.handle(),
                    len: value.len(),
                    with_key: true,
                };
                (payload, Some(guard))
            }
        };
        let entry = Entry {
            op,
            version,
            key: key.to_vec(),
            payload,
        };
        Ok((entry, guard))
    }

    pub fn layout(&self) -> RecordLayout {
        match self.payload {
            Payload::Inline(_) => RecordLayout::Inline,
            Payload::External { with_key: false, .. } => RecordLayout::ExternalValue,
            Payload::External { with_key: true, .. } => RecordLayout::ExternalKeyValue,
        }
    }

    pub fn value_len(&self) -> usize {
        match &self.payload {
            Payload::Inline(v) => v.len(),
            Payload::External { len, .. } => *len,
        }
    }

    pub fn encoded_size(&self) -> usize {
        footprint(self.layout(), self.key.len(), self.value_len())
    }

    /// External buffer owned by this entry, if any
    pub fn external(&self) -> Option<Handle> {
        match self.payload {
            Payload::Inline(_) => None,
            Payload::External { handle, .. } => Some(handle),
        }
    }

    /// Copy the value out of the block or the arena
    pub fn value(&self, arena: &Arena) -> Result<Vec<u8>> {
        match &self.payload {
            Payload::Inline(v) => Ok(v.clone()),
            Payload::External { handle, len, with_key } => {
                let skip = if *with_key { self.key.len() } else { 0 };
                let value = arena.read(*handle, |b| b.get(skip..skip + len).map(|s| s.to_vec()))?;
                value.ok_or_else(|| {
                    AtlasError::Corruption(format!("external buffer {:?} shorter than record", handle))
                })
            }
        }
    }

    /// Copy the value into `dst`, truncating; returns the true length
    pub fn copy_value(&self, arena: &Arena, dst: &mut [u8]) -> Result<usize> {
        match &self.payload {
            Payload::Inline(v) => {
                let n = v.len().min(dst.len());
                dst[..n].copy_from_slice(&v[..n]);
                Ok(v.len())
            }
            Payload::External { .. } => {
                let value = self.value(arena)?;
                let n = value.len().min(dst.len());
                dst[..n].copy_from_slice(&value[..n]);
                Ok(value.len())
            }
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.layout().to_u8());
        out.push(match self.op {
            Op::Put => 0,
            Op::Delete => 1,
        });
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.value_len() as u32).to_le_bytes());
        match &self.payload {
            Payload::Inline(v) => {
                out.extend_from_slice(&self.key);
                out.extend_from_slice(v);
            }
            Payload::External { handle, with_key: false, .. } => {
                out.extend_from_slice(&self.key);
                out.extend_from_slice(&handle.to_u64().to_le_bytes());
            }
            Payload::External { handle, with_key: true, .. } => {
                out.extend_from_slice(&handle.to_u64().to_le_bytes());
            }
        }
    }
}

/// Sort order inside a block: key ascending, version descending
pub(crate) fn entry_order(a: &Entry, b: &Entry) -> Ordering {
    a.key.cmp(&b.key).then_with(|| b.version.cmp(&a.version))
}

/// Total encoded size of a run of entries
pub(crate) fn encoded_len(entries: &[Entry]) -> usize {
    entries.iter().map(Entry::encoded_size).sum()
}

/// Encoded size of the newest record of each key, when that record is a put
pub(crate) fn live_len(entries: &[Entry]) -> usize {
    let mut live = 0;
    let mut previous: Option<&[u8]> = None;
    for entry in entries {
        if previous != Some(entry.key.as_slice()) {
            previous = Some(&entry.key);
            if entry.op == Op::Put {
                live += entry.encoded_size();
            }
        }
    }
    live
}

/// Decode a raw (uncompressed) block body
pub(crate) fn decode_entries(raw: &[u8], arena: &Arena) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let header = raw
            .get(pos..pos + RECORD_HEADER_SIZE)
            .ok_or_else(|| truncated(pos))?;
        let layout = RecordLayout::from_u8(header[0])
            .ok_or_else(|| AtlasError::Corruption(format!("bad record layout {}", header[0])))?;
        let op = match header[1] {
            0 => Op::Put,
            1 => Op::Delete,
            b => return Err(AtlasError::Corruption(format!("bad record op {}", b))),
        };
        let version = u64::from_le_bytes(fixed(&header[2..10]));
        let key_len = u32::from_le_bytes(fixed(&header[10..14])) as usize;
        let value_len = u32::from_le_bytes(fixed(&header[14..18])) as usize;
        pos += RECORD_HEADER_SIZE;

        let body_len = footprint(layout, key_len, value_len) - RECORD_HEADER_SIZE;
        let body = raw.get(pos..pos + body_len).ok_or_else(|| truncated(pos))?;
        pos += body_len;

        let (key, payload) = match layout {
            RecordLayout::Inline => (
                body[..key_len].to_vec(),
                Payload::Inline(body[key_len..].to_vec()),
            ),
            RecordLayout::ExternalValue => {
                let handle = Handle::from_u64(u64::from_le_bytes(fixed(&body[key_len..])));
                (
                    body[..key_len].to_vec(),
                    Payload::External {
                        handle,
                        len: value_len,
                        with_key: false,
                    },
                )
            }
            RecordLayout::ExternalKeyValue => {
                let handle = Handle::from_u64(u64::from_le_bytes(fixed(body)));
                let key = arena.read(handle, |b| b.get(..key_len).map(|k| k.to_vec()))?;
                let key = key.ok_or_else(|| {
                    AtlasError::Corruption(format!("external key buffer {:?} too short", handle))
                })?;
                (
                    key,
                    Payload::External {
                        handle,
                        len: value_len,
                        with_key: true,
                    },
                )
            }
        };

        entries.push(Entry {
            op,
            version,
            key,
            payload,
        });
    }
    Ok(entries)
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn truncated(pos: usize) -> AtlasError {
    AtlasError::Corruption(format!("block body truncated at offset {}", pos))
}
