//! Fixed-capacity node arena.
//!
//! Nodes are 128-byte POD records stored back to back in the region, one
//! cache-line pair each. Free slots form a singly-linked list threaded
//! through the `parent` field, with the list head kept in the region
//! header. Allocation serializes on one short mutex; each slot has its own
//! reader-writer lock in an in-memory lock table (lock state is
//! meaningless after a crash, so persisting it would only persist
//! garbage).

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::errors::FsError;
use crate::errors::FsResult;
use crate::region::Region;

/// Bytes per node slot.
pub const NODE_SIZE: usize = 128;

/// Fan-out of the tree: children per directory node.
pub const MAX_CHILDREN: usize = 16;

/// Sentinel arena index: no node.
pub const INVALID: u32 = u32::MAX;

/// Arena index of the root directory.
pub const ROOT_INDEX: u32 = 0;

bitflags! {
    /// Per-node flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// The payload extent holds a compressed image.
        const COMPRESSED = 1;
    }
}

/// One tree node as stored in the region.
///
/// `data_start`/`data_blocks`/`storage_bytes`/`flags` describe the file's
/// payload extent in the block pool; directories leave them zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RawNode {
    /// Unique identifier, never reused within a mount. 0 marks a free slot.
    pub inode: u32,
    /// Arena index of the parent; `INVALID` for the root and free slots.
    /// Free slots reuse this field as the free-list link.
    pub parent: u32,
    /// Offset of the node's name in the string table.
    pub name_offset: u32,
    /// Type and permission bits (`S_IFDIR`/`S_IFREG` plus mode).
    pub mode: u32,
    /// Logical size in bytes; directories carry 0.
    pub size: u64,
    /// Seconds since the epoch. atime and ctime collapse onto this value.
    pub mtime: u64,
    /// Live entries in `children`.
    pub num_children: u16,
    reserved0: u16,
    /// First block of the payload extent.
    pub data_start: u32,
    /// Blocks in the payload extent.
    pub data_blocks: u32,
    /// Bytes of the extent actually occupied (compressed or raw).
    pub storage_bytes: u32,
    /// `NodeFlags` bits.
    pub flags: u32,
    /// Arena indices of children; unused slots hold `INVALID`.
    pub children: [u32; MAX_CHILDREN],
    reserved1: [u32; 3],
}

const _: () = assert!(size_of::<RawNode>() == NODE_SIZE);

impl RawNode {
    /// A blank node with every index slot poisoned to `INVALID`.
    pub fn empty() -> RawNode {
        RawNode {
            inode: 0,
            parent: INVALID,
            name_offset: 0,
            mode: 0,
            size: 0,
            mtime: 0,
            num_children: 0,
            reserved0: 0,
            data_start: 0,
            data_blocks: 0,
            storage_bytes: 0,
            flags: 0,
            children: [INVALID; MAX_CHILDREN],
            reserved1: [0; 3],
        }
    }

    /// Whether this slot holds a live node.
    pub fn is_live(&self) -> bool {
        self.inode != 0
    }

    /// Whether the mode marks a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// Flag accessor.
    pub fn node_flags(&self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.flags)
    }
}

/// The node arena plus its in-memory lock table.
pub struct NodeArena {
    region: Arc<Region>,
    base: usize,
    capacity: u32,
    locks: Box<[RwLock<()>]>,
    alloc: Mutex<()>,
}

impl NodeArena {
    /// Attach to the region's node arena.
    pub fn attach(region: Arc<Region>) -> NodeArena {
        let capacity = region.node_capacity();
        let locks = (0..capacity).map(|_| RwLock::new(())).collect::<Vec<_>>();
        NodeArena {
            base: region.nodes_off(),
            capacity,
            locks: locks.into_boxed_slice(),
            alloc: Mutex::new(()),
            region,
        }
    }

    /// Slots in the arena.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// High-water mark of slots ever allocated.
    pub fn used(&self) -> u32 {
        self.region.used_nodes()
    }

    /// Copy the node at `idx` out of the region.
    ///
    /// The caller holds the node's lock (either side) or the global tree
    /// write lock.
    pub fn get(&self, idx: u32) -> RawNode {
        assert!(idx < self.capacity);
        self.region
            .read_at(self.base + idx as usize * NODE_SIZE)
    }

    /// Write the node at `idx`. Caller holds the node's write lock.
    pub fn set(&self, idx: u32, node: &RawNode) {
        assert!(idx < self.capacity);
        self.region
            .write_at(self.base + idx as usize * NODE_SIZE, node);
    }

    /// Acquire the node's read lock.
    pub fn read_lock(&self, idx: u32) -> RwLockReadGuard<'_, ()> {
        self.locks[idx as usize].read()
    }

    /// Acquire the node's write lock.
    pub fn write_lock(&self, idx: u32) -> RwLockWriteGuard<'_, ()> {
        self.locks[idx as usize].write()
    }

    /// Allocate a slot, popping the free list before bumping the
    /// high-water mark.
    ///
    /// The slot's bytes are stale; the caller must fully initialize it
    /// under the slot's write lock before publishing the index anywhere.
    pub fn alloc(&self) -> FsResult<u32> {
        let _guard = self.alloc.lock();
        let head = self.region.free_head();
        if head != INVALID {
            let node = self.get(head);
            self.region.set_free_head(node.parent);
            return Ok(head);
        }
        let used = self.region.used_nodes();
        if used >= self.capacity {
            return Err(FsError::NoSpace);
        }
        self.region.set_used_nodes(used + 1);
        Ok(used)
    }

    /// Return `idx` to the free list. The caller still holds the node's
    /// write lock and has already unlinked it from its parent, so late
    /// readers that raced the unlink see a dead slot, never a torn one.
    pub fn free(&self, idx: u32) {
        let _guard = self.alloc.lock();
        let mut node = RawNode::empty();
        node.parent = self.region.free_head();
        self.set(idx, &node);
        self.region.set_free_head(idx);
    }

    /// Free slots currently reachable through the free list plus the
    /// never-allocated tail.
    pub fn free_count(&self) -> u32 {
        let _guard = self.alloc.lock();
        let mut count = self.capacity - self.region.used_nodes();
        let mut cursor = self.region.free_head();
        let mut hops = 0u32;
        while cursor != INVALID && hops <= self.capacity {
            count += 1;
            cursor = self.get(cursor).parent;
            hops += 1;
        }
        count
    }

    /// Rebuild the free list so it contains exactly the non-live slots
    /// below the high-water mark. Caller holds the global tree write lock.
    pub fn rebuild_free_list(&self) {
        let _guard = self.alloc.lock();
        let used = self.region.used_nodes();
        let mut head = INVALID;
        for idx in (0..used).rev() {
            let node = self.get(idx);
            if !node.is_live() {
                let mut free = RawNode::empty();
                free.parent = head;
                self.set(idx, &free);
                head = idx;
            }
        }
        self.region.set_free_head(head);
    }
}

impl std::fmt::Debug for NodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeArena")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}
