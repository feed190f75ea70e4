//! RAZORFS: an in-memory FUSE filesystem with persistent metadata.
//!
//! The whole directory hierarchy lives in a named shared-memory region:
//! a fixed-size node arena under a 16-ary index-addressed tree, an
//! interned string table for names, and a block pool for (transparently
//! compressed) file payloads. A write-ahead log on durable storage makes
//! mutations survive crashes; on mount, committed transactions are
//! replayed and the tree invariants repaired.
//!
//! The crate is a library ([`RazorFs`] implements
//! [`fuser::Filesystem`]) plus a `razorfs` binary that mounts it.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub use crate::arena::INVALID;
pub use crate::arena::MAX_CHILDREN;
pub use crate::arena::NODE_SIZE;
pub use crate::arena::NodeFlags;
pub use crate::arena::RawNode;
pub use crate::config::BLOCK_SIZE;
pub use crate::config::MAX_NAME_LENGTH;
pub use crate::config::MAX_PATH_DEPTH;
pub use crate::config::Settings;
pub use crate::errors::FsError;
pub use crate::errors::FsResult;
pub use crate::fs::RazorFs;
pub use crate::payload::PayloadStore;
pub use crate::recovery::RecoveryReport;
pub use crate::region::Region;
pub use crate::strtab::StringTable;
pub use crate::tree::DirEntry;
pub use crate::tree::ROOT_INODE;
pub use crate::tree::Tree;
pub use crate::wal::Wal;
pub use crate::wal::WalRecord;

pub mod arena;
pub mod compress;
pub mod config;
pub mod errors;
pub mod fs;
pub mod payload;
pub mod recovery;
pub mod region;
pub mod strtab;
pub mod tree;
pub mod wal;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    /// A region name no other test (or test run) will collide with.
    pub(crate) fn unique_region_name(tag: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("razorfs-test-{}-{tag}-{n}", std::process::id())
    }
}
