//! Block compression codecs
//!
//! Every leaf block body is passed through one codec, chosen once per
//! store. The store never looks at compressed bytes directly: a block is
//! always decompressed into a scratch buffer before record access.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// zstd level used for block bodies
const ZSTD_LEVEL: i32 = 3;

/// Available block compression codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecKind {
    /// Blocks stored as-is
    None = 0,
    /// LZ4 block format
    Lz4 = 1,
    /// LZ4 block format, high-compression setting
    Lz4Hc = 2,
    /// Zstandard
    Zstd = 3,
}

impl CodecKind {
    /// Decode a codec id written by `as u8`
    pub fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(CodecKind::None),
            1 => Some(CodecKind::Lz4),
            2 => Some(CodecKind::Lz4Hc),
            3 => Some(CodecKind::Zstd),
            _ => None,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecKind::None => "none",
            CodecKind::Lz4 => "lz4",
            CodecKind::Lz4Hc => "lz4hc",
            CodecKind::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl FromStr for CodecKind {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CodecKind::None),
            "lz4" => Ok(CodecKind::Lz4),
            "lz4hc" | "lz4-hc" => Ok(CodecKind::Lz4Hc),
            "zstd" => Ok(CodecKind::Zstd),
            other => Err(AtlasError::Config(format!("unknown codec: {}", other))),
        }
    }
}

/// Compress/decompress contract for whole block bodies
///
/// Both directions append to `dst` after clearing it and return the number
/// of bytes produced. Implementations must be deterministic.
pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize>;

    /// `original_len` is the exact uncompressed size recorded by the block
    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, original_len: usize) -> Result<usize>;
}

/// Look up the codec implementation for a kind
pub fn codec_for(kind: CodecKind) -> &'static dyn Codec {
    match kind {
        CodecKind::None => &NoCodec,
        CodecKind::Lz4 => &Lz4Codec { kind: CodecKind::Lz4 },
        CodecKind::Lz4Hc => &Lz4Codec { kind: CodecKind::Lz4Hc },
        CodecKind::Zstd => &ZstdCodec,
    }
}

// =============================================================================
// Implementations
// =============================================================================

struct NoCodec;

impl Codec for NoCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::None
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        dst.clear();
        dst.extend_from_slice(src);
        Ok(src.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, _original_len: usize) -> Result<usize> {
        dst.clear();
        dst.extend_from_slice(src);
        Ok(src.len())
    }
}

/// lz4_flex has no high-compression matcher; both kinds share the block format.
struct Lz4Codec {
    kind: CodecKind,
}

impl Codec for Lz4Codec {
    fn kind(&self) -> CodecKind {
        self.kind
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        dst.clear();
        dst.resize(lz4_flex::block::get_maximum_output_size(src.len()), 0);
        let n = lz4_flex::block::compress_into(src, dst)
            .map_err(|e| AtlasError::Codec(format!("LZ4 compression failed: {}", e)))?;
        dst.truncate(n);
        Ok(n)
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, original_len: usize) -> Result<usize> {
        dst.clear();
        dst.resize(original_len, 0);
        let n = lz4_flex::block::decompress_into(src, dst)
            .map_err(|e| AtlasError::Codec(format!("LZ4 decompression failed: {}", e)))?;
        if n != original_len {
            return Err(AtlasError::Corruption(format!(
                "LZ4 block decoded to {} bytes, expected {}",
                n, original_len
            )));
        }
        Ok(n)
    }
}

struct ZstdCodec;

impl Codec for ZstdCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Zstd
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        let out = zstd::bulk::compress(src, ZSTD_LEVEL)
            .map_err(|e| AtlasError::Codec(format!("zstd compression failed: {}", e)))?;
        dst.clear();
        dst.extend_from_slice(&out);
        Ok(out.len())
    }

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, original_len: usize) -> Result<usize> {
        let out = zstd::bulk::decompress(src, original_len)
            .map_err(|e| AtlasError::Codec(format!("zstd decompression failed: {}", e)))?;
        if out.len() != original_len {
            return Err(AtlasError::Corruption(format!(
                "zstd block decoded to {} bytes, expected {}",
                out.len(),
                original_len
            )));
        }
        dst.clear();
        dst.extend_from_slice(&out);
        Ok(out.len())
    }
}
