//! Verification table shared by every device
//!
//! The table is a fixed-size blob loaded once at startup. It is never mutated
//! afterwards, so clones share the same allocation and no locking is needed.

use crate::{Error, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Exact size of the verification table in bytes
pub const TABLE_SIZE: usize = 33_554_432;

/// Read-only verification table
#[derive(Clone)]
pub struct VerificationTable {
    bytes: Arc<[u8]>,
}

impl VerificationTable {
    /// Build a table from an in-memory image
    ///
    /// The image must be exactly [`TABLE_SIZE`] bytes long. Anything else is a
    /// configuration error; the table is never truncated or padded.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != TABLE_SIZE {
            return Err(Error::table(format!(
                "Invalid table size: expected {} bytes, got {}",
                TABLE_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.into(),
        })
    }

    /// Load the table from a file, checking its size before reading
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(|e| {
            Error::table(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let size = file.metadata()?.len();
        if size != TABLE_SIZE as u64 {
            return Err(Error::table(format!(
                "Invalid table size in {}: expected {} bytes, got {}",
                path.display(),
                TABLE_SIZE,
                size
            )));
        }

        debug!("Reading verification table from {}", path.display());
        let mut bytes = Vec::with_capacity(TABLE_SIZE);
        file.read_to_end(&mut bytes)?;

        // The file may have changed between the metadata call and the read.
        let table = Self::from_bytes(bytes)?;
        info!("Loaded verification table from {}", path.display());
        Ok(table)
    }

    /// Get the raw table bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Table length in bytes (always [`TABLE_SIZE`])
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the table holds no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the 8-byte little-endian word at `index * 8`, wrapping around the table
    pub fn word(&self, index: u64) -> u64 {
        let words = (self.bytes.len() / 8) as u64;
        let start = ((index % words) * 8) as usize;
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.bytes[start..start + 8]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Debug for VerificationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationTable")
            .field("len", &self.bytes.len())
            .finish()
    }
}
