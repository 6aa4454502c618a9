//! Snapshot files
//!
//! A snapshot is a flat, checksummed dump of every physical record, one
//! frame per leaf block. Loading repacks the records into fresh blocks, so
//! the file does not depend on arena handles or compression state.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (23 bytes)                                           │
//! │ magic "ATMS" (4) | version (2) | codec (1)                  │
//! │ block count (8) | record count (8)                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Block frames, in key order:                                 │
//! │ [payload_len (4)][crc32 (4)][bincode Vec<Record>]           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer: crc32 over every frame (4)                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::block::Record;
use crate::codec::CodecKind;
use crate::error::{AtlasError, Result};

/// Magic bytes identifying a snapshot file
pub const MAGIC: &[u8; 4] = b"ATMS";

/// Current snapshot format version
pub const FORMAT_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: u64 = 4 + 2 + 1 + 8 + 8;

/// Offset of the block count inside the header
const COUNTS_OFFSET: u64 = 4 + 2 + 1;

/// Snapshot identifier (the number in the file name)
pub type SnapshotId = u64;

/// Totals written to a finished snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub block_count: u64,
    pub record_count: u64,
}

// =============================================================================
// Writer
// =============================================================================

/// Streams block frames into a new snapshot file
pub struct SnapshotWriter {
    id: SnapshotId,
    path: PathBuf,
    writer: BufWriter<File>,
    block_count: u64,
    record_count: u64,
    hasher: crc32fast::Hasher,
}

impl SnapshotWriter {
    /// Create the file and write a header with placeholder counts
    ///
    /// Fails with `ErrorKind::AlreadyExists` if the id is taken.
    pub fn create(dir: &Path, id: SnapshotId, codec: CodecKind) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = snapshot_path(dir, id);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&[codec as u8])?;
        writer.write_all(&0u64.to_le_bytes())?; // block count, patched in finish
        writer.write_all(&0u64.to_le_bytes())?; // record count, patched in finish

        Ok(Self {
            id,
            path,
            writer,
            block_count: 0,
            record_count: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Append one block's records
    pub fn add_block(&mut self, records: &[Record]) -> Result<()> {
        let payload = bincode::serialize(records)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            AtlasError::Snapshot(format!("block frame of {} bytes is too large", payload.len()))
        })?;
        let len_bytes = len.to_le_bytes();
        let crc_bytes = crc32fast::hash(&payload).to_le_bytes();

        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&crc_bytes)?;
        self.writer.write_all(&payload)?;

        self.hasher.update(&len_bytes);
        self.hasher.update(&crc_bytes);
        self.hasher.update(&payload);

        self.block_count += 1;
        self.record_count += records.len() as u64;
        Ok(())
    }

    /// Write the footer, patch the header counts and sync
    pub fn finish(mut self) -> Result<SnapshotSummary> {
        let crc = self.hasher.finalize();
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.flush()?;

        let mut file = self.writer.into_inner().map_err(|e| {
            AtlasError::Snapshot(format!("Failed to flush {}: {}", self.path.display(), e))
        })?;
        file.seek(SeekFrom::Start(COUNTS_OFFSET))?;
        file.write_all(&self.block_count.to_le_bytes())?;
        file.write_all(&self.record_count.to_le_bytes())?;
        file.sync_all()?;

        Ok(SnapshotSummary {
            id: self.id,
            block_count: self.block_count,
            record_count: self.record_count,
        })
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Reads and verifies a snapshot file
pub struct SnapshotReader {
    reader: BufReader<File>,
    codec: CodecKind,
    block_count: u64,
    record_count: u64,
}

impl SnapshotReader {
    /// Open a snapshot and validate its header
    pub fn open(dir: &Path, id: SnapshotId) -> Result<Self> {
        let path = snapshot_path(dir, id);
        if !path.exists() {
            return Err(AtlasError::Snapshot(format!(
                "snapshot {} not found in {}",
                id,
                dir.display()
            )));
        }
        let mut reader = BufReader::new(File::open(&path)?);

        let mut header = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(AtlasError::Corruption(format!(
                "Invalid snapshot magic: expected ATMS, got {:?}",
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(AtlasError::Snapshot(format!(
                "Unsupported snapshot version: {}",
                version
            )));
        }
        let codec = CodecKind::from_u8(header[6])
            .ok_or_else(|| AtlasError::Corruption(format!("unknown codec id {}", header[6])))?;
        let block_count = read_u64(&header[7..15]);
        let record_count = read_u64(&header[15..23]);

        Ok(Self {
            reader,
            codec,
            block_count,
            record_count,
        })
    }

    /// Codec of the store that wrote the snapshot
    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Read every block, verifying frame and file checksums
    pub fn read_blocks(mut self) -> Result<Vec<Vec<Record>>> {
        let mut hasher = crc32fast::Hasher::new();
        let mut blocks = Vec::with_capacity(self.block_count as usize);
        let mut records = 0u64;

        for i in 0..self.block_count {
            let mut frame = [0u8; 8];
            self.reader.read_exact(&mut frame)?;
            let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
            let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

            let mut payload = vec![0u8; len];
            self.reader.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != crc {
                return Err(AtlasError::Corruption(format!(
                    "snapshot block {} failed checksum",
                    i
                )));
            }
            hasher.update(&frame);
            hasher.update(&payload);

            let block: Vec<Record> = bincode::deserialize(&payload)?;
            records += block.len() as u64;
            blocks.push(block);
        }

        let mut footer = [0u8; 4];
        self.reader.read_exact(&mut footer)?;
        if u32::from_le_bytes(footer) != hasher.finalize() {
            return Err(AtlasError::Corruption("snapshot file checksum mismatch".to_string()));
        }
        if records != self.record_count {
            return Err(AtlasError::Corruption(format!(
                "snapshot header promises {} records, found {}",
                self.record_count, records
            )));
        }
        Ok(blocks)
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Path of a snapshot file
pub fn snapshot_path(dir: &Path, id: SnapshotId) -> PathBuf {
    dir.join(format!("snapshot_{:06}.snap", id))
}

/// "snapshot_000042.snap" -> Some(42)
fn parse_snapshot_id(path: &Path) -> Option<SnapshotId> {
    if path.extension()? != "snap" {
        return None;
    }
    let name = path.file_stem()?.to_string_lossy();
    name.strip_prefix("snapshot_")?.parse().ok()
}

/// Snapshot ids present in `dir`, oldest first
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotId>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(id) = parse_snapshot_id(&path) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Id for the next snapshot written to `dir`
pub fn next_snapshot_id(dir: &Path) -> Result<SnapshotId> {
    Ok(list_snapshots(dir)?.last().map(|&id| id + 1).unwrap_or(1))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
