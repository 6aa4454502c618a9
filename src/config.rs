//! Configuration for AtlasMap
//!
//! Centralized configuration with sensible defaults. A `StoreConfig` is
//! fixed when the store is constructed; a live store only hands out a
//! shared reference to it.

use std::path::PathBuf;

use crate::codec::CodecKind;
use crate::error::{AtlasError, Result};

/// Smallest block or index node size accepted by the builder
pub const MIN_NODE_SIZE: usize = 256;

/// Upper bound for the merge low-water mark (fraction of capacity)
pub const MAX_MERGE_THRESHOLD: f64 = 0.45;

/// Main configuration for an AtlasMap store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Block Configuration
    // -------------------------------------------------------------------------
    /// Leaf block capacity in bytes (uncompressed)
    pub block_size: usize,

    /// Serialized-size bound for a single index node
    pub index_node_size: usize,

    /// Compression applied to every leaf block body
    pub codec: CodecKind,

    /// A block whose live data falls below `merge_threshold * block_size`
    /// becomes a merge candidate
    pub merge_threshold: f64,

    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Global memory budget in bytes (arena allocations + index overhead)
    pub memory_limit: u64,

    // -------------------------------------------------------------------------
    // Concurrency Configuration
    // -------------------------------------------------------------------------
    /// Optimistic attempts before an operation takes the exclusive path
    pub max_retries: usize,

    // -------------------------------------------------------------------------
    // Snapshot Configuration
    // -------------------------------------------------------------------------
    /// Directory where snapshots are written and loaded from
    /// Internal structure:
    ///   {data_dir}/
    ///     └── snapshot_000001.snap
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            index_node_size: 4096,
            codec: CodecKind::None,
            merge_threshold: 0.25,
            memory_limit: 1024 * 1024 * 1024, // 1 GB
            max_retries: 16,
            data_dir: PathBuf::from("./atlasmap_data"),
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Reject configurations the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit == 0 {
            return Err(AtlasError::Config("memory_limit must be non-zero".to_string()));
        }
        if self.block_size < MIN_NODE_SIZE || self.index_node_size < MIN_NODE_SIZE {
            return Err(AtlasError::Config(format!(
                "block and index node sizes must be at least {} bytes",
                MIN_NODE_SIZE
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(AtlasError::Config("block_size exceeds u32 range".to_string()));
        }
        Ok(())
    }

    /// Live-data size below which a leaf block is a merge candidate
    pub fn block_low_water(&self) -> usize {
        (self.block_size as f64 * self.merge_threshold) as usize
    }

    /// Serialized size below which an index node is a merge candidate
    pub fn index_low_water(&self) -> usize {
        (self.index_node_size as f64 * self.merge_threshold) as usize
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the leaf block capacity (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the index node size bound (in bytes)
    pub fn index_node_size(mut self, size: usize) -> Self {
        self.config.index_node_size = size;
        self
    }

    /// Set the block compression codec
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.config.codec = codec;
        self
    }

    /// Set the merge low-water mark as a fraction of capacity
    pub fn merge_threshold(mut self, fraction: f64) -> Self {
        self.config.merge_threshold = fraction;
        self
    }

    /// Set the global memory limit (in bytes)
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.memory_limit = bytes;
        self
    }

    /// Set the optimistic retry bound
    pub fn max_retries(mut self, count: usize) -> Self {
        self.config.max_retries = count;
        self
    }

    /// Set the snapshot directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    pub fn build(mut self) -> StoreConfig {
        self.config.block_size = self.config.block_size.max(MIN_NODE_SIZE);
        self.config.index_node_size = self.config.index_node_size.max(MIN_NODE_SIZE);
        self.config.merge_threshold = if self.config.merge_threshold.is_nan() {
            0.0
        } else {
            self.config.merge_threshold.clamp(0.0, MAX_MERGE_THRESHOLD)
        };
        self.config
    }
}
