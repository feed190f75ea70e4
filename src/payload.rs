//! File payload storage.
//!
//! Payload bytes live in the region's block pool as one contiguous run of
//! 4 KiB blocks per file; the owning node records the extent
//! (`data_start`, `data_blocks`, `storage_bytes`, `COMPRESSED`). Block
//! accounting is an in-memory bitmap rebuilt on attach by scanning live
//! nodes, the same way the string-table index is rebuilt.
//!
//! Every file has its own reader-writer lock, separate from the node
//! lock: readers of one file never contend with writers of another, and
//! the node lock is only taken briefly to publish new metadata.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::arena::NodeFlags;
use crate::arena::RawNode;
use crate::compress;
use crate::config::BLOCK_SIZE;
use crate::errors::FsError;
use crate::errors::FsResult;
use crate::region::Region;
use crate::tree::Tree;
use crate::tree::unix_now;

/// Hard ceiling on one file: extent bookkeeping is 32-bit.
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

struct BlockMap {
    words: Vec<u64>,
    blocks: u32,
}

impl BlockMap {
    fn new(blocks: u32) -> BlockMap {
        BlockMap {
            words: vec![0; blocks.div_ceil(64) as usize],
            blocks,
        }
    }

    fn is_set(&self, block: u32) -> bool {
        self.words[(block / 64) as usize] & (1u64 << (block % 64)) != 0
    }

    fn set(&mut self, block: u32) {
        self.words[(block / 64) as usize] |= 1u64 << (block % 64);
    }

    fn clear(&mut self, block: u32) {
        self.words[(block / 64) as usize] &= !(1u64 << (block % 64));
    }

    fn mark_run(&mut self, start: u32, len: u32) {
        for block in start..start + len {
            self.set(block);
        }
    }

    fn free_run(&mut self, start: u32, len: u32) {
        for block in start..start.saturating_add(len).min(self.blocks) {
            self.clear(block);
        }
    }

    /// First-fit search for `len` contiguous free blocks.
    fn alloc_run(&mut self, len: u32) -> Option<u32> {
        if len == 0 || len > self.blocks {
            return None;
        }
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for block in 0..self.blocks {
            if self.is_set(block) {
                run_start = block + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == len {
                self.mark_run(run_start, len);
                return Some(run_start);
            }
        }
        None
    }

    fn free_count(&self) -> u32 {
        let set: u32 = self.words.iter().map(|w| w.count_ones()).sum();
        self.blocks - set
    }
}

/// Per-inode payload records over the block pool.
pub struct PayloadStore {
    region: Arc<Region>,
    pool_off: usize,
    pool_blocks: u32,
    threshold: u32,
    bitmap: Mutex<BlockMap>,
    locks: RwLock<HashMap<u32, Arc<RwLock<()>>>>,
}

impl PayloadStore {
    /// Attach to the region's block pool and rebuild the allocation
    /// bitmap from the live nodes.
    pub fn attach(region: Arc<Region>, threshold: u32, tree: &Tree) -> PayloadStore {
        let store = PayloadStore {
            pool_off: region.pool_off(),
            pool_blocks: region.pool_blocks(),
            threshold,
            bitmap: Mutex::new(BlockMap::new(region.pool_blocks())),
            locks: RwLock::new(HashMap::new()),
            region,
        };
        store.rebuild(tree);
        store
    }

    /// Re-derive the bitmap from node extents. Runs at attach and after
    /// recovery repairs; the caller guarantees quiescence.
    pub(crate) fn rebuild(&self, tree: &Tree) {
        let mut bitmap = BlockMap::new(self.pool_blocks);
        for idx in 0..tree.arena.used() {
            let node = tree.arena.get(idx);
            let in_range = node
                .data_start
                .checked_add(node.data_blocks)
                .is_some_and(|end| end <= self.pool_blocks);
            if node.is_live() && !node.is_dir() && node.data_blocks > 0 && in_range {
                bitmap.mark_run(node.data_start, node.data_blocks);
            }
        }
        *self.bitmap.lock() = bitmap;
    }

    /// Free blocks, for statfs.
    pub fn free_blocks(&self) -> u32 {
        self.bitmap.lock().free_count()
    }

    /// Total pool blocks, for statfs.
    pub fn total_blocks(&self) -> u32 {
        self.pool_blocks
    }

    /// Whether a write extending the file to `bytes` could find a home.
    ///
    /// Advisory: the dispatcher asks before journaling so an apply-stage
    /// allocation failure stays rare, not impossible.
    pub fn has_room_for(&self, bytes: u64) -> bool {
        if bytes == 0 {
            return true;
        }
        if bytes > MAX_FILE_SIZE {
            return false;
        }
        let needed = (bytes.div_ceil(BLOCK_SIZE as u64)) as u32;
        let mut bitmap = self.bitmap.lock();
        match bitmap.alloc_run(needed) {
            Some(start) => {
                bitmap.free_run(start, needed);
                true
            }
            None => false,
        }
    }

    /// The file's lock. The dispatcher holds it across journal commit
    /// and apply so replay order matches apply order per file.
    pub(crate) fn lock_for(&self, inode: u32) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.read().get(&inode) {
            return lock.clone();
        }
        self.locks
            .write()
            .entry(inode)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Read `size` bytes at `offset`, decompressing transparently.
    pub fn read(&self, tree: &Tree, inode: u32, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let lock = self.lock_for(inode);
        let _file = lock.read();
        let _g = tree.read_guard();
        let idx = tree.index_unguarded(inode)?;
        let node = {
            let _node = tree.arena.read_lock(idx);
            tree.arena.get(idx)
        };
        if !node.is_live() {
            return Err(FsError::NotFound);
        }
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if offset >= node.size {
            return Ok(Vec::new());
        }

        let data = self.load_logical(&node)?;
        let end = node.size.min(offset + size as u64) as usize;
        Ok(data[offset as usize..end].to_vec())
    }

    /// Write `data` at `offset`, growing and (re)compressing as needed.
    ///
    /// Returns the file's new logical size.
    pub fn write(&self, tree: &Tree, inode: u32, offset: u64, data: &[u8]) -> FsResult<u64> {
        let lock = self.lock_for(inode);
        let _file = lock.write();
        let _g = tree.read_guard();
        self.write_locked(tree, inode, offset, data)
    }

    /// Lock-free variant of [`PayloadStore::write`]: the caller already
    /// holds the file's write lock and a tree read guard (file lock
    /// before guard, always).
    pub(crate) fn write_locked(
        &self,
        tree: &Tree,
        inode: u32,
        offset: u64,
        data: &[u8],
    ) -> FsResult<u64> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::InvalidArgument)?;
        if end > MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let idx = tree.index_unguarded(inode)?;
        let node = {
            let _node = tree.arena.read_lock(idx);
            tree.arena.get(idx)
        };
        if !node.is_live() {
            return Err(FsError::NotFound);
        }
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }

        // A compressed record is rewritten through its raw form.
        let mut buf = self.load_logical(&node)?;
        if end as usize > buf.len() {
            buf.resize(end as usize, 0);
        }
        buf[offset as usize..end as usize].copy_from_slice(data);

        let new_size = buf.len() as u64;
        self.store_logical(tree, idx, &node, buf)?;
        Ok(new_size)
    }

    /// Set the logical size, zero-filling growth.
    pub fn truncate(&self, tree: &Tree, inode: u32, new_size: u64) -> FsResult<()> {
        let lock = self.lock_for(inode);
        let _file = lock.write();
        let _g = tree.read_guard();
        self.truncate_locked(tree, inode, new_size)
    }

    /// Lock-free variant of [`PayloadStore::truncate`]; same contract as
    /// [`PayloadStore::write_locked`].
    pub(crate) fn truncate_locked(&self, tree: &Tree, inode: u32, new_size: u64) -> FsResult<()> {
        if new_size > MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let idx = tree.index_unguarded(inode)?;
        let node = {
            let _node = tree.arena.read_lock(idx);
            tree.arena.get(idx)
        };
        if !node.is_live() {
            return Err(FsError::NotFound);
        }
        if node.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if node.size == new_size {
            return Ok(());
        }

        let mut buf = self.load_logical(&node)?;
        buf.resize(new_size as usize, 0);
        self.store_logical(tree, idx, &node, buf)
    }

    /// Release the extent of a node that just left the tree.
    pub fn release(&self, node: &RawNode) {
        if !node.is_dir() && node.data_blocks > 0 {
            self.bitmap.lock().free_run(node.data_start, node.data_blocks);
        }
        self.locks.write().remove(&node.inode);
    }

    /// The whole logical (uncompressed) content of a node.
    fn load_logical(&self, node: &RawNode) -> FsResult<Vec<u8>> {
        if node.data_blocks == 0 {
            if node.size != 0 {
                return Err(FsError::Io);
            }
            return Ok(Vec::new());
        }
        let in_range = node
            .data_start
            .checked_add(node.data_blocks)
            .is_some_and(|end| end <= self.pool_blocks);
        if !in_range {
            return Err(FsError::Io);
        }
        if node.storage_bytes as usize > node.data_blocks as usize * BLOCK_SIZE {
            return Err(FsError::Io);
        }
        let raw = self.region.read_bytes(
            self.pool_off + node.data_start as usize * BLOCK_SIZE,
            node.storage_bytes as usize,
        );
        let data = if node.node_flags().contains(NodeFlags::COMPRESSED) {
            compress::decompress(&raw).map_err(|_| FsError::Io)?
        } else {
            raw
        };
        if data.len() as u64 != node.size {
            return Err(FsError::Io);
        }
        Ok(data)
    }

    /// Store `buf` as the node's new content, compressing when the file
    /// is at or past the threshold and the result is actually smaller.
    fn store_logical(
        &self,
        tree: &Tree,
        idx: u32,
        old: &RawNode,
        buf: Vec<u8>,
    ) -> FsResult<()> {
        let compressed = if buf.len() >= self.threshold as usize {
            compress::compress(&buf)
        } else {
            None
        };
        let (stored, is_compressed): (&[u8], bool) = match &compressed {
            Some(packed) => (packed, true),
            None => (&buf, false),
        };

        let blocks_needed = (stored.len() as u64).div_ceil(BLOCK_SIZE as u64) as u32;
        let (data_start, data_blocks) = if blocks_needed == 0 {
            if old.data_blocks > 0 {
                self.bitmap.lock().free_run(old.data_start, old.data_blocks);
            }
            (0, 0)
        } else if blocks_needed <= old.data_blocks {
            // Fits in the current run: rewrite in place, give back the
            // tail. Shrinking must work even when the pool is full.
            if blocks_needed < old.data_blocks {
                self.bitmap.lock().free_run(
                    old.data_start + blocks_needed,
                    old.data_blocks - blocks_needed,
                );
            }
            (old.data_start, blocks_needed)
        } else {
            let start = self
                .bitmap
                .lock()
                .alloc_run(blocks_needed)
                .ok_or(FsError::NoSpace)?;
            if old.data_blocks > 0 {
                self.bitmap.lock().free_run(old.data_start, old.data_blocks);
            }
            (start, blocks_needed)
        };
        if data_blocks > 0 {
            self.region
                .write_bytes(self.pool_off + data_start as usize * BLOCK_SIZE, stored);
        }

        // Publish the new extent and size under the node's write lock;
        // mode changes raced in between are preserved by refetching.
        let _node_lock = tree.arena.write_lock(idx);
        let mut node = tree.arena.get(idx);
        node.data_start = data_start;
        node.data_blocks = data_blocks;
        node.storage_bytes = stored.len() as u32;
        node.flags = if is_compressed {
            NodeFlags::COMPRESSED.bits()
        } else {
            NodeFlags::empty().bits()
        };
        node.size = buf.len() as u64;
        node.mtime = unix_now();
        tree.arena.set(idx, &node);
        Ok(())
    }
}

impl std::fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStore")
            .field("pool_blocks", &self.pool_blocks)
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::tree::ROOT_INODE;
    use crate::test_support::unique_region_name;

    const FILE_MODE: u32 = libc::S_IFREG as u32 | 0o644;

    fn test_store(name: &str, data_capacity: u64) -> (Tree, PayloadStore, String) {
        let region_name = unique_region_name(name);
        let settings = Settings {
            region_name: region_name.clone(),
            node_capacity: 32,
            string_capacity: 8192,
            data_capacity,
            ..Settings::default()
        };
        let (region, _) = Region::open_or_create(&settings).unwrap();
        let tree = Tree::attach(region.clone()).unwrap();
        let store = PayloadStore::attach(region, 65536, &tree);
        (tree, store, region_name)
    }

    fn new_file(tree: &Tree, name: &[u8]) -> u32 {
        let inode = tree.alloc_inode();
        tree.insert(ROOT_INODE, name, FILE_MODE, inode, |_| Ok(()))
            .unwrap();
        inode
    }

    #[test]
    fn write_then_read_back() {
        let (tree, store, region_name) = test_store("payload-rw", 1024 * 1024);
        let inode = new_file(&tree, b"f");
        store.write(&tree, inode, 0, b"hello world").unwrap();
        assert_eq!(store.read(&tree, inode, 0, 1024).unwrap(), b"hello world");
        assert_eq!(store.read(&tree, inode, 6, 5).unwrap(), b"world");
        assert_eq!(tree.node_by_inode(inode).unwrap().size, 11);
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn sparse_write_zero_fills() {
        let (tree, store, region_name) = test_store("payload-sparse", 1024 * 1024);
        let inode = new_file(&tree, b"f");
        store.write(&tree, inode, 8192, b"tail").unwrap();
        let data = store.read(&tree, inode, 0, 8196).unwrap();
        assert_eq!(data.len(), 8196);
        assert!(data[..8192].iter().all(|&b| b == 0));
        assert_eq!(&data[8192..], b"tail");
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn large_uniform_file_is_compressed_at_rest() {
        let (tree, store, region_name) = test_store("payload-compress", 4 * 1024 * 1024);
        let inode = new_file(&tree, b"big");
        let content = vec![0x41u8; 1024 * 1024];
        store.write(&tree, inode, 0, &content).unwrap();

        let node = tree.node_by_inode(inode).unwrap();
        assert_eq!(node.size, content.len() as u64);
        assert!(node.node_flags().contains(NodeFlags::COMPRESSED));
        assert!((node.storage_bytes as u64) < node.size);

        // Transparent on the way out.
        let back = store.read(&tree, inode, 0, content.len() as u32).unwrap();
        assert_eq!(back, content);
        assert_eq!(store.read(&tree, inode, node.size - 1, 1).unwrap(), [0x41]);
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn below_threshold_stays_raw() {
        let (tree, store, region_name) = test_store("payload-raw", 1024 * 1024);
        let inode = new_file(&tree, b"small");
        let content = vec![0x42u8; 65535];
        store.write(&tree, inode, 0, &content).unwrap();
        let node = tree.node_by_inode(inode).unwrap();
        assert!(!node.node_flags().contains(NodeFlags::COMPRESSED));
        assert_eq!(node.storage_bytes as u64, node.size);
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn writes_across_compression_transitions() {
        let (tree, store, region_name) = test_store("payload-transition", 4 * 1024 * 1024);
        let inode = new_file(&tree, b"f");
        // Start compressed.
        store.write(&tree, inode, 0, &vec![7u8; 128 * 1024]).unwrap();
        assert!(
            tree.node_by_inode(inode)
                .unwrap()
                .node_flags()
                .contains(NodeFlags::COMPRESSED)
        );
        // Overwrite a slice in the middle; content must merge with the old.
        store.write(&tree, inode, 1000, b"patch").unwrap();
        let data = store.read(&tree, inode, 0, 128 * 1024).unwrap();
        assert_eq!(&data[1000..1005], b"patch");
        assert_eq!(data[999], 7);
        assert_eq!(data[1005], 7);
        assert_eq!(data.len(), 128 * 1024);
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let (tree, store, region_name) = test_store("payload-truncate", 1024 * 1024);
        let inode = new_file(&tree, b"f");
        store.write(&tree, inode, 0, b"0123456789").unwrap();
        store.truncate(&tree, inode, 4).unwrap();
        assert_eq!(store.read(&tree, inode, 0, 64).unwrap(), b"0123");
        store.truncate(&tree, inode, 8).unwrap();
        assert_eq!(store.read(&tree, inode, 0, 64).unwrap(), b"0123\0\0\0\0");
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn pool_exhaustion_reports_no_space() {
        // 4 blocks of pool.
        let (tree, store, region_name) = test_store("payload-full", 4 * 4096);
        let a = new_file(&tree, b"a");
        store.write(&tree, a, 0, &vec![1u8; 3 * 4096]).unwrap();
        let b = new_file(&tree, b"b");
        assert_eq!(
            store.write(&tree, b, 0, &vec![2u8; 2 * 4096]).unwrap_err(),
            FsError::NoSpace
        );
        // The little one still fits.
        store.write(&tree, b, 0, &vec![2u8; 100]).unwrap();
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn release_returns_blocks() {
        let (tree, store, region_name) = test_store("payload-release", 8 * 4096);
        let inode = new_file(&tree, b"f");
        store.write(&tree, inode, 0, &vec![1u8; 4 * 4096]).unwrap();
        let before = store.free_blocks();
        let node = tree
            .delete_child(ROOT_INODE, b"f", crate::tree::DeleteKind::File, |_| Ok(()))
            .unwrap();
        store.release(&node);
        assert_eq!(store.free_blocks(), before + 4);
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn survives_reattach_with_bitmap_rebuild() {
        let region_name = unique_region_name("payload-reattach");
        let settings = Settings {
            region_name: region_name.clone(),
            node_capacity: 32,
            string_capacity: 8192,
            data_capacity: 1024 * 1024,
            ..Settings::default()
        };
        let (region, _) = Region::open_or_create(&settings).unwrap();
        let tree = Tree::attach(region.clone()).unwrap();
        let store = PayloadStore::attach(region, 65536, &tree);
        let inode = new_file(&tree, b"kept");
        store.write(&tree, inode, 0, b"payload bytes").unwrap();
        let used_before = store.free_blocks();
        drop(store);
        drop(tree);

        let region = Region::attach(&region_name).unwrap();
        let tree = Tree::attach(region.clone()).unwrap();
        let store = PayloadStore::attach(region, 65536, &tree);
        assert_eq!(store.free_blocks(), used_before);
        assert_eq!(
            store.read(&tree, inode, 0, 64).unwrap(),
            b"payload bytes"
        );
        Region::destroy(&region_name).unwrap();
    }
}
