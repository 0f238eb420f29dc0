//! GGUF header validation
//!
//! Only the fixed-size header is inspected; metadata parsing is left to the
//! runtime that loads the file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Fixed header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, GgufError> {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let dword = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let magic = word(0);
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }

        let version = word(4);
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: dword(8),
            metadata_kv_count: dword(16),
        })
    }
}

/// Reads and checks the header of `path`.
pub fn read_header(path: &Path) -> Result<GgufHeader, GgufError> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() < HEADER_LEN as u64 {
        return Err(GgufError::FileTooSmall);
    }

    let mut bytes = [0u8; HEADER_LEN];
    file.read_exact(&mut bytes)?;
    GgufHeader::parse(&bytes)
}

/// Extension check only; cheap enough for directory listings.
pub fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Header bytes for a model with no tensors or metadata. Used to create
/// placeholder files for the simulated runtime.
pub fn empty_header() -> [u8; HEADER_LEN] {
    let mut bytes = [0u8; HEADER_LEN];
    bytes[..4].copy_from_slice(&GGUF_MAGIC.to_le_bytes());
    bytes[4..8].copy_from_slice(&3u32.to_le_bytes());
    bytes
}
