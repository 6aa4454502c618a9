//! # AtlasMap
//!
//! An embedded, sorted key-value map with:
//! - Block storage in a manually managed arena (generation-checked handles)
//! - Per-block compression (LZ4 or Zstandard)
//! - Multi-version records for point-in-time reads
//! - Optimistic concurrency with retry, exclusive structural changes
//! - Admission control against a global memory budget
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                               │
//! │     put / get / delete / scanner / snapshot / dispose        │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//!   ┌─────────────────────────┐      ┌─────────────────────┐
//!   │       Index Nodes       │      │  Memory Budget      │
//!   │ (RwLock root, routing,  │      │  Version Clock      │
//!   │  split / merge)         │      │  Counters           │
//!   └────────────┬────────────┘      └─────────────────────┘
//!                │
//!                ▼
//!   ┌─────────────────────────┐      ┌─────────────────────┐
//!   │      Leaf Blocks        │─────▶│       Codec         │
//!   │ (sorted, versioned)     │      │ (none / lz4 / zstd) │
//!   └────────────┬────────────┘      └─────────────────────┘
//!                │
//!                ▼
//!   ┌─────────────────────────┐
//!   │         Arena           │
//!   │ (sharded slab, handles) │
//!   └─────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use atlasmap::{Store, StoreConfig};
//!
//! let store = Store::new(StoreConfig::default())?;
//! store.put(b"KEY1", b"VALUE1")?;
//! assert_eq!(store.get(b"KEY1")?, Some(b"VALUE1".to_vec()));
//!
//! for item in store.prefix_scanner(b"KEY", false) {
//!     let (key, value) = item?;
//!     println!("{:?} = {:?}", key, value);
//! }
//! # Ok::<(), atlasmap::AtlasError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod arena;
pub mod codec;
pub mod block;
pub mod index;
pub mod store;
pub mod scanner;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{AtlasError, Result};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use codec::CodecKind;
pub use scanner::{Scanner, ScannerState};
pub use store::{SnapshotId, Store, StoreStats, VersionPin};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasMap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
