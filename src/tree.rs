//! The 16-ary metadata tree.
//!
//! A logical tree layered over the node arena: children are a fixed
//! 16-slot index array, sibling names are unique, and every operation is
//! index-addressed so the whole structure is position-independent inside
//! the region.
//!
//! Locking discipline:
//!
//! - every operation holds the global tree lock for read; `rebalance`
//!   holds it for write (it permutes arena indices);
//! - node locks are acquired ancestors first, never the reverse;
//! - the arena allocator mutex is only ever taken inside a node write
//!   lock;
//! - read paths take the parent's read lock, then each scanned child's
//!   read lock just long enough to copy it.
//!
//! The bridge addresses nodes by inode number, so the public surface here
//! is inode-based; an in-memory inode-to-index map (rebuilt on attach and
//! after rebalance) does the translation under the global lock.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;
use parking_lot::RwLockReadGuard;
use parking_lot::RwLockWriteGuard;
use smallvec::SmallVec;

use crate::arena::INVALID;
use crate::arena::MAX_CHILDREN;
use crate::arena::NodeArena;
use crate::arena::ROOT_INDEX;
use crate::arena::RawNode;
use crate::config::MAX_PATH_DEPTH;
use crate::errors::FsError;
use crate::errors::FsResult;
use crate::region::Region;
use crate::strtab::StringTable;
use crate::strtab::validate_name;

/// Inode number of the root directory (the bridge's root).
pub const ROOT_INODE: u32 = 1;

/// Seconds since the epoch, saturating at zero for pre-epoch clocks.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Which node to expect when removing a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    /// `unlink`: the target must be a regular file.
    File,
    /// `rmdir`: the target must be an empty directory.
    Directory,
}

/// Field subset applied by [`Tree::update`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeUpdate {
    /// Replacement permission bits (the type bits are preserved).
    pub mode: Option<u32>,
    /// Replacement logical size (the payload store owns the bytes).
    pub size: Option<u64>,
    /// Replacement modification time.
    pub mtime: Option<u64>,
}

/// One directory entry as reported to the bridge.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Inode of the child.
    pub inode: u32,
    /// Mode bits of the child.
    pub mode: u32,
    /// Name bytes of the child.
    pub name: Vec<u8>,
}

/// The metadata tree over arena, string table, and region.
pub struct Tree {
    pub(crate) region: Arc<Region>,
    pub(crate) arena: NodeArena,
    pub(crate) strtab: StringTable,
    big: RwLock<()>,
    inode_map: RwLock<HashMap<u32, u32>>,
    next_inode: AtomicU32,
    mutations: AtomicU64,
}

impl Tree {
    /// Attach to a region, creating the root directory on a fresh one.
    pub fn attach(region: Arc<Region>) -> FsResult<Tree> {
        let arena = NodeArena::attach(region.clone());
        let strtab = StringTable::attach(region.clone())?;

        if region.used_nodes() == 0 {
            let name_offset = strtab.intern(b"")?;
            let idx = arena.alloc()?;
            debug_assert_eq!(idx, ROOT_INDEX);
            let mut root = RawNode::empty();
            root.inode = ROOT_INODE;
            root.parent = INVALID;
            root.name_offset = name_offset;
            root.mode = libc::S_IFDIR as u32 | 0o755;
            root.mtime = unix_now();
            let _guard = arena.write_lock(idx);
            arena.set(idx, &root);
        }

        let tree = Tree {
            region,
            arena,
            strtab,
            big: RwLock::new(()),
            inode_map: RwLock::new(HashMap::new()),
            next_inode: AtomicU32::new(ROOT_INODE + 1),
            mutations: AtomicU64::new(0),
        };
        tree.rebuild_inode_map();
        Ok(tree)
    }

    /// Hand out a fresh inode number.
    pub fn alloc_inode(&self) -> u32 {
        self.next_inode.fetch_add(1, Ordering::SeqCst)
    }

    /// Mutations since the last rebalance (or attach).
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Nodes currently reachable plus free-list bookkeeping, for statfs.
    pub fn free_nodes(&self) -> u32 {
        self.arena.free_count()
    }

    /// Arena capacity, for statfs.
    pub fn node_capacity(&self) -> u32 {
        self.arena.capacity()
    }

    /// Hold off rebalance while the caller touches arena indices.
    pub(crate) fn read_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.big.read()
    }

    /// Exclusive tree access; used by recovery and rebalance.
    pub(crate) fn write_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.big.write()
    }

    /// Resolve an inode to its arena index. Caller holds a guard.
    pub(crate) fn index_unguarded(&self, inode: u32) -> FsResult<u32> {
        self.inode_map
            .read()
            .get(&inode)
            .copied()
            .ok_or(FsError::NotFound)
    }

    /// Copy the node for `inode` under its read lock.
    pub fn node_by_inode(&self, inode: u32) -> FsResult<RawNode> {
        let _g = self.read_guard();
        let idx = self.index_unguarded(inode)?;
        let _lock = self.arena.read_lock(idx);
        let node = self.arena.get(idx);
        if !node.is_live() {
            return Err(FsError::NotFound);
        }
        Ok(node)
    }

    /// Name bytes of `inode`.
    pub fn name_of(&self, inode: u32) -> FsResult<Vec<u8>> {
        let node = self.node_by_inode(inode)?;
        self.strtab.get(node.name_offset)
    }

    /// [`Tree::node_by_inode`] for callers that already hold a guard.
    pub(crate) fn node_by_inode_unguarded(&self, inode: u32) -> FsResult<RawNode> {
        let idx = self.index_unguarded(inode)?;
        let _lock = self.arena.read_lock(idx);
        let node = self.arena.get(idx);
        if !node.is_live() {
            return Err(FsError::NotFound);
        }
        Ok(node)
    }

    /// Inode of the parent directory; the root is its own parent, the
    /// way `..` behaves at the mount root.
    pub fn parent_inode(&self, inode: u32) -> FsResult<u32> {
        let _g = self.read_guard();
        let idx = self.index_unguarded(inode)?;
        let node = {
            let _lock = self.arena.read_lock(idx);
            self.arena.get(idx)
        };
        if !node.is_live() {
            return Err(FsError::NotFound);
        }
        if node.parent == INVALID || node.parent >= self.arena.capacity() {
            return Ok(inode);
        }
        let _lock = self.arena.read_lock(node.parent);
        Ok(self.arena.get(node.parent).inode)
    }

    /// Find the child of `parent_inode` named `name`.
    pub fn lookup_child(&self, parent_inode: u32, name: &[u8]) -> FsResult<RawNode> {
        validate_name(name)?;
        let _g = self.read_guard();
        let parent_idx = self.index_unguarded(parent_inode)?;
        let _parent_lock = self.arena.read_lock(parent_idx);
        let parent = self.arena.get(parent_idx);
        if !parent.is_live() {
            return Err(FsError::NotFound);
        }
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        match self.scan_children(&parent, name)? {
            Some((_, child_idx)) => {
                let _child_lock = self.arena.read_lock(child_idx);
                Ok(self.arena.get(child_idx))
            }
            None => Err(FsError::NotFound),
        }
    }

    /// List the children of `inode` in slot order.
    pub fn readdir(&self, inode: u32) -> FsResult<Vec<DirEntry>> {
        let _g = self.read_guard();
        let idx = self.index_unguarded(inode)?;
        let _lock = self.arena.read_lock(idx);
        let dir = self.arena.get(idx);
        if !dir.is_live() {
            return Err(FsError::NotFound);
        }
        if !dir.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let mut entries = Vec::with_capacity(dir.num_children as usize);
        for slot in 0..dir.num_children as usize {
            let child_idx = dir.children[slot];
            if child_idx == INVALID {
                continue;
            }
            let _child_lock = self.arena.read_lock(child_idx);
            let child = self.arena.get(child_idx);
            entries.push(DirEntry {
                inode: child.inode,
                mode: child.mode,
                name: self.strtab.get(child.name_offset)?,
            });
        }
        Ok(entries)
    }

    /// Resolve an absolute path to an inode.
    ///
    /// The bridge resolves component-wise through `lookup`; this is the
    /// path form used by recovery and tooling.
    pub fn path_lookup(&self, path: &str) -> FsResult<u32> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.len() > MAX_PATH_DEPTH {
            return Err(FsError::InvalidArgument);
        }

        // One guard across the whole descent: component indices must not
        // shift under a concurrent rebalance.
        let _g = self.read_guard();
        let mut cursor = ROOT_INDEX;
        let mut inode = ROOT_INODE;
        for component in components {
            // Hand-over-hand: each lock is released before the next is
            // taken, so a queued writer can never wedge the descent.
            let child_idx = {
                let _lock = self.arena.read_lock(cursor);
                let node = self.arena.get(cursor);
                if !node.is_live() {
                    return Err(FsError::NotFound);
                }
                if !node.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                match self.scan_children(&node, component.as_bytes())? {
                    Some((_, child_idx)) => child_idx,
                    None => return Err(FsError::NotFound),
                }
            };
            let _child_lock = self.arena.read_lock(child_idx);
            inode = self.arena.get(child_idx).inode;
            cursor = child_idx;
        }
        Ok(inode)
    }

    /// Insert a node named `name` under `parent_inode`.
    ///
    /// `log` runs after the child slot is initialized but before it is
    /// linked into the parent; a logging failure unwinds the allocation
    /// and the tree is unchanged.
    pub fn insert(
        &self,
        parent_inode: u32,
        name: &[u8],
        mode: u32,
        inode: u32,
        log: impl FnOnce(u32) -> FsResult<()>,
    ) -> FsResult<RawNode> {
        let _g = self.read_guard();
        let parent_idx = self.index_unguarded(parent_inode)?;
        self.insert_at(parent_idx, name, mode, inode, log)
    }

    /// Index-addressed insert; recovery replays with a fixed inode.
    pub(crate) fn insert_at(
        &self,
        parent_idx: u32,
        name: &[u8],
        mode: u32,
        inode: u32,
        log: impl FnOnce(u32) -> FsResult<()>,
    ) -> FsResult<RawNode> {
        validate_name(name)?;
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if parent_idx >= self.arena.capacity() {
            return Err(FsError::NotFound);
        }

        let _parent_lock = self.arena.write_lock(parent_idx);
        let mut parent = self.arena.get(parent_idx);
        if !parent.is_live() {
            return Err(FsError::NotFound);
        }
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if self.scan_children(&parent, name)?.is_some() {
            return Err(FsError::Exists);
        }
        if parent.num_children as usize >= MAX_CHILDREN {
            return Err(FsError::NoSpace);
        }

        let name_offset = self.strtab.intern(name)?;
        let idx = self.arena.alloc()?;

        let mut node = RawNode::empty();
        node.inode = inode;
        node.parent = parent_idx;
        node.name_offset = name_offset;
        node.mode = mode;
        node.mtime = unix_now();

        let child_lock = self.arena.write_lock(idx);
        self.arena.set(idx, &node);

        if let Err(err) = log(parent_idx) {
            self.arena.free(idx);
            drop(child_lock);
            return Err(err);
        }

        parent.children[parent.num_children as usize] = idx;
        parent.num_children += 1;
        parent.mtime = node.mtime;
        self.arena.set(parent_idx, &parent);
        drop(child_lock);

        self.inode_map.write().insert(inode, idx);
        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Remove the child of `parent_inode` named `name`.
    ///
    /// Returns a copy of the removed node so the caller can release its
    /// payload extent.
    pub fn delete_child(
        &self,
        parent_inode: u32,
        name: &[u8],
        kind: DeleteKind,
        log: impl FnOnce(&RawNode) -> FsResult<()>,
    ) -> FsResult<RawNode> {
        let _g = self.read_guard();
        let parent_idx = self.index_unguarded(parent_inode)?;
        self.delete_child_at(parent_idx, name, kind, log)
    }

    pub(crate) fn delete_child_at(
        &self,
        parent_idx: u32,
        name: &[u8],
        kind: DeleteKind,
        log: impl FnOnce(&RawNode) -> FsResult<()>,
    ) -> FsResult<RawNode> {
        if parent_idx >= self.arena.capacity() {
            return Err(FsError::NotFound);
        }
        let _parent_lock = self.arena.write_lock(parent_idx);
        let mut parent = self.arena.get(parent_idx);
        if !parent.is_live() {
            return Err(FsError::NotFound);
        }
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let Some((slot, child_idx)) = self.scan_children(&parent, name)? else {
            return Err(FsError::NotFound);
        };

        let child_lock = self.arena.write_lock(child_idx);
        let child = self.arena.get(child_idx);
        match kind {
            DeleteKind::File if child.is_dir() => return Err(FsError::IsDirectory),
            DeleteKind::Directory if !child.is_dir() => return Err(FsError::NotDirectory),
            _ => {}
        }
        if child.is_dir() && child.num_children > 0 {
            return Err(FsError::NotEmpty);
        }

        log(&child)?;

        let last = parent.num_children as usize - 1;
        parent.children[slot] = parent.children[last];
        parent.children[last] = INVALID;
        parent.num_children -= 1;
        parent.mtime = unix_now();
        self.arena.set(parent_idx, &parent);

        self.inode_map.write().remove(&child.inode);
        // Free while still holding the child's write lock; racing readers
        // block on the lock and then observe a dead slot.
        self.arena.free(child_idx);
        drop(child_lock);

        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(child)
    }

    /// Rename a child of `parent_inode` in place.
    pub fn rename_child(
        &self,
        parent_inode: u32,
        old_name: &[u8],
        new_name: &[u8],
        log: impl FnOnce(u32, &RawNode) -> FsResult<()>,
    ) -> FsResult<()> {
        let _g = self.read_guard();
        let parent_idx = self.index_unguarded(parent_inode)?;
        self.rename_child_at(parent_idx, old_name, new_name, log)
    }

    pub(crate) fn rename_child_at(
        &self,
        parent_idx: u32,
        old_name: &[u8],
        new_name: &[u8],
        log: impl FnOnce(u32, &RawNode) -> FsResult<()>,
    ) -> FsResult<()> {
        validate_name(new_name)?;
        if new_name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if parent_idx >= self.arena.capacity() {
            return Err(FsError::NotFound);
        }
        let _parent_lock = self.arena.write_lock(parent_idx);
        let mut parent = self.arena.get(parent_idx);
        if !parent.is_live() || !parent.is_dir() {
            return Err(FsError::NotFound);
        }
        let Some((_, child_idx)) = self.scan_children(&parent, old_name)? else {
            return Err(FsError::NotFound);
        };
        if old_name != new_name && self.scan_children(&parent, new_name)?.is_some() {
            return Err(FsError::Exists);
        }

        let name_offset = self.strtab.intern(new_name)?;
        let _child_lock = self.arena.write_lock(child_idx);
        let mut child = self.arena.get(child_idx);

        log(parent_idx, &child)?;

        child.name_offset = name_offset;
        child.mtime = unix_now();
        self.arena.set(child_idx, &child);
        parent.mtime = child.mtime;
        self.arena.set(parent_idx, &parent);

        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply a metadata update to `inode` under its write lock.
    pub fn update(
        &self,
        inode: u32,
        update: NodeUpdate,
        log: impl FnOnce(&RawNode) -> FsResult<()>,
    ) -> FsResult<RawNode> {
        let _g = self.read_guard();
        let idx = self.index_unguarded(inode)?;
        let _lock = self.arena.write_lock(idx);
        let mut node = self.arena.get(idx);
        if !node.is_live() {
            return Err(FsError::NotFound);
        }

        log(&node)?;

        if let Some(mode) = update.mode {
            node.mode = (node.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        }
        if let Some(size) = update.size {
            node.size = size;
        }
        node.mtime = update.mtime.unwrap_or_else(unix_now);
        self.arena.set(idx, &node);
        self.mutations.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Re-link an existing node under `parent_idx` with `name`.
    ///
    /// Replay-only reconciliation: a committed insert whose node survived
    /// in the region but never made it into the parent's child table is
    /// linked by identity instead of allocated twice. No-ops when the
    /// name is already taken or the node is already linked.
    pub(crate) fn relink(&self, idx: u32, parent_idx: u32, name: &[u8]) -> FsResult<()> {
        let _g = self.read_guard();
        if idx >= self.arena.capacity() || parent_idx >= self.arena.capacity() || idx == parent_idx
        {
            return Err(FsError::NotFound);
        }
        let _parent_lock = self.arena.write_lock(parent_idx);
        let mut parent = self.arena.get(parent_idx);
        if !parent.is_live() || !parent.is_dir() {
            return Err(FsError::NotFound);
        }
        if parent.children[..parent.num_children as usize].contains(&idx) {
            return Ok(());
        }
        if self.scan_children(&parent, name)?.is_some() {
            return Ok(());
        }
        if parent.num_children as usize >= MAX_CHILDREN {
            return Err(FsError::NoSpace);
        }
        let name_offset = self.strtab.intern(name)?;

        let _child_lock = self.arena.write_lock(idx);
        let mut child = self.arena.get(idx);
        if !child.is_live() {
            return Err(FsError::NotFound);
        }
        child.parent = parent_idx;
        child.name_offset = name_offset;
        self.arena.set(idx, &child);
        parent.children[parent.num_children as usize] = idx;
        parent.num_children += 1;
        self.arena.set(parent_idx, &parent);
        Ok(())
    }

    /// Remove a node by identity, wherever it is linked.
    ///
    /// Replay-only: a committed delete is re-applied against whatever
    /// state survived. Returns the removed node, or `None` when the inode
    /// is already gone.
    pub(crate) fn delete_by_inode(&self, inode: u32) -> FsResult<Option<RawNode>> {
        let _g = self.read_guard();
        let Ok(idx) = self.index_unguarded(inode) else {
            return Ok(None);
        };
        let probe = {
            let _lock = self.arena.read_lock(idx);
            self.arena.get(idx)
        };
        if !probe.is_live() || probe.inode != inode {
            return Ok(None);
        }
        if idx == ROOT_INDEX {
            return Err(FsError::InvalidArgument);
        }

        if probe.parent != INVALID && probe.parent < self.arena.capacity() && probe.parent != idx {
            let _parent_lock = self.arena.write_lock(probe.parent);
            let mut parent = self.arena.get(probe.parent);
            let child_lock = self.arena.write_lock(idx);
            let child = self.arena.get(idx);
            if child.is_dir() && child.num_children > 0 {
                return Err(FsError::NotEmpty);
            }
            if let Some(slot) = parent.children[..parent.num_children as usize]
                .iter()
                .position(|&c| c == idx)
            {
                let last = parent.num_children as usize - 1;
                parent.children[slot] = parent.children[last];
                parent.children[last] = INVALID;
                parent.num_children -= 1;
                self.arena.set(probe.parent, &parent);
            }
            self.inode_map.write().remove(&inode);
            self.arena.free(idx);
            drop(child_lock);
            Ok(Some(child))
        } else {
            // Unreachable orphan: just release the slot.
            let child_lock = self.arena.write_lock(idx);
            let child = self.arena.get(idx);
            self.inode_map.write().remove(&inode);
            self.arena.free(idx);
            drop(child_lock);
            Ok(Some(child))
        }
    }

    /// Scan `parent.children` for `name`; returns `(slot, index)`.
    ///
    /// Caller holds the parent's lock (either side); each child is copied
    /// under its own read lock.
    fn scan_children(&self, parent: &RawNode, name: &[u8]) -> FsResult<Option<(usize, u32)>> {
        // An interned-offset probe makes the common comparison O(1): a
        // name that was never interned cannot be in any directory.
        let probe = self.strtab.lookup(name);
        for slot in 0..parent.num_children as usize {
            let child_idx = parent.children[slot];
            if child_idx == INVALID || child_idx >= self.arena.capacity() {
                continue;
            }
            let _child_lock = self.arena.read_lock(child_idx);
            let child = self.arena.get(child_idx);
            if !child.is_live() {
                continue;
            }
            match probe {
                Some(offset) => {
                    if child.name_offset == offset {
                        return Ok(Some((slot, child_idx)));
                    }
                }
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Rebuild the inode map by scanning every slot below the high-water
    /// mark. Includes live-but-unreachable nodes so recovery can relink
    /// them by identity.
    pub(crate) fn rebuild_inode_map(&self) {
        let mut map = HashMap::new();
        let mut max_inode = ROOT_INODE;
        for idx in 0..self.arena.used() {
            let node = self.arena.get(idx);
            if node.is_live() {
                map.insert(node.inode, idx);
                max_inode = max_inode.max(node.inode);
            }
        }
        *self.inode_map.write() = map;
        // Only ever raise the counter: a deleted maximum must not make
        // its inode number reusable within this mount.
        self.next_inode.fetch_max(max_inode + 1, Ordering::SeqCst);
    }

    /// Permute the arena into breadth-first order.
    ///
    /// Semantics are preserved exactly; the point is cache locality:
    /// after the permutation siblings sit in adjacent slots. Unreachable
    /// live nodes do not survive the permutation (recovery reattaches
    /// orphans before any rebalance can run).
    pub fn rebalance(&self) -> FsResult<usize> {
        let _g = self.big.write();

        let capacity = self.arena.capacity();
        let mut seen = vec![false; capacity as usize];
        let mut order: Vec<u32> = Vec::new();
        let mut queue: VecDeque<u32> = VecDeque::new();
        queue.push_back(ROOT_INDEX);
        seen[ROOT_INDEX as usize] = true;
        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            let node = self.arena.get(idx);
            let children: SmallVec<[u32; MAX_CHILDREN]> = node.children
                [..node.num_children as usize]
                .iter()
                .copied()
                .filter(|&c| c != INVALID && c < capacity && !seen[c as usize])
                .collect();
            for child in children {
                seen[child as usize] = true;
                queue.push_back(child);
            }
        }

        let mut old_to_new = vec![INVALID; capacity as usize];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            old_to_new[old_idx as usize] = new_idx as u32;
        }

        // Copy through a scratch image, then write back in one pass.
        let mut scratch: Vec<RawNode> = Vec::with_capacity(order.len());
        for &old_idx in &order {
            let mut node = self.arena.get(old_idx);
            if node.parent != INVALID {
                node.parent = old_to_new[node.parent as usize];
            }
            for slot in 0..MAX_CHILDREN {
                let child = node.children[slot];
                if child != INVALID && child < capacity {
                    node.children[slot] = old_to_new[child as usize];
                }
            }
            scratch.push(node);
        }

        let old_used = self.arena.used();
        for (new_idx, node) in scratch.iter().enumerate() {
            self.arena.set(new_idx as u32, node);
        }
        // Everything past the live prefix becomes bump-allocatable again.
        for idx in order.len() as u32..old_used {
            self.arena.set(idx, &RawNode::empty());
        }
        self.region.set_used_nodes(order.len() as u32);
        self.region.set_free_head(INVALID);

        self.rebuild_inode_map();
        self.mutations.store(0, Ordering::Relaxed);
        Ok(order.len())
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("arena", &self.arena)
            .field("strtab", &self.strtab)
            .finish()
    }
}
