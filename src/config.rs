//! Mount-time configuration.

use std::path::PathBuf;

use crate::errors::FsError;
use crate::errors::FsResult;

/// Size of one block in the payload pool.
pub const BLOCK_SIZE: usize = 4096;

/// Longest accepted filename, in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Deepest path the tree will resolve.
pub const MAX_PATH_DEPTH: usize = 64;

/// Options recognized at mount time.
///
/// Every field corresponds to a `--option=value` flag of the `razorfs`
/// binary; library users fill the struct directly.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Shared-memory region identifier.
    pub region_name: String,
    /// Node arena capacity. Must be at least 1 (the root).
    pub node_capacity: u32,
    /// String table capacity in bytes.
    pub string_capacity: u32,
    /// Block pool capacity in bytes, rounded up to whole blocks.
    pub data_capacity: u64,
    /// Path of the write-ahead log. `None` runs the dispatcher non-durable.
    pub wal_path: Option<PathBuf>,
    /// Files below this many bytes are never compressed.
    pub compression_threshold: u32,
    /// Mutations between automatic rebalances; 0 disables.
    pub rebalance_interval: u64,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            region_name: "razorfs".to_string(),
            node_capacity: 16384,
            string_capacity: 1024 * 1024,
            data_capacity: 64 * 1024 * 1024,
            wal_path: None,
            compression_threshold: 65536,
            rebalance_interval: 0,
        }
    }
}

impl Settings {
    /// Check the option set for values the region cannot be built from.
    pub fn validate(&self) -> FsResult<()> {
        if self.region_name.is_empty() || self.region_name.contains('/') {
            return Err(FsError::InvalidArgument);
        }
        if self.node_capacity < 1 {
            return Err(FsError::InvalidArgument);
        }
        // The empty string interned for the root needs one byte.
        if self.string_capacity < 64 {
            return Err(FsError::InvalidArgument);
        }
        if self.data_capacity < BLOCK_SIZE as u64 {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// String capacity rounded so the node arena starts 64-byte aligned.
    pub(crate) fn aligned_string_capacity(&self) -> u32 {
        self.string_capacity.div_ceil(64) * 64
    }

    /// Pool capacity in whole blocks.
    pub(crate) fn pool_blocks(&self) -> u64 {
        self.data_capacity.div_ceil(BLOCK_SIZE as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_nodes() {
        let settings = Settings {
            node_capacity: 0,
            ..Settings::default()
        };
        assert_eq!(settings.validate(), Err(FsError::InvalidArgument));
    }

    #[test]
    fn string_capacity_alignment() {
        let settings = Settings {
            string_capacity: 100,
            ..Settings::default()
        };
        assert_eq!(settings.aligned_string_capacity(), 128);
    }
}
