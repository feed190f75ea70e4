//! Persistent shared-memory backing.
//!
//! One named region holds the whole metadata image:
//!
//! ```text
//! [ header | string_table_data | node_arena | block_pool ]
//! ```
//!
//! The header occupies the first 64 bytes with the fixed little-endian
//! layout below. The region survives process exit (it lives in the
//! kernel's shared-memory filesystem) but not reboot; true durability
//! comes from the write-ahead log. All references into the region are
//! offsets or indices, so the mapping address is irrelevant.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;
use log::error;
use nix::fcntl::OFlag;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::shm_open;
use nix::sys::mman::shm_unlink;
use nix::sys::stat::Mode;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::arena::NODE_SIZE;
use crate::config::BLOCK_SIZE;
use crate::config::Settings;
use crate::errors::FsError;
use crate::errors::FsResult;

/// Identifies a region created by this filesystem.
pub const REGION_MAGIC: [u8; 8] = *b"RAZORFS\0";

/// On-region format version. Must match exactly; there is no migration.
pub const REGION_VERSION: u32 = 1;

/// Byte offset of the string table, immediately after the header.
pub const HEADER_LEN: usize = 64;

// Offsets of the header's mutable counters.
const OFF_FLAGS: usize = 12;
const OFF_USED_NODES: usize = 32;
const OFF_STRING_USED: usize = 40;
const OFF_FREE_HEAD: usize = 48;

bitflags! {
    /// Header flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Set when the last detach went through a full checkpoint.
        const CLEAN_SHUTDOWN = 1;
    }
}

/// The 64-byte region header at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
pub struct RegionHeader {
    /// `REGION_MAGIC`.
    pub magic: [u8; 8],
    /// `REGION_VERSION`.
    pub version: u32,
    /// `RegionFlags` bits.
    pub flags: u32,
    /// Slots in the node arena.
    pub node_capacity: u64,
    /// Bytes in the string table arena.
    pub string_capacity: u64,
    /// High-water mark of allocated node slots.
    pub used_nodes: u64,
    /// Bytes of the string table handed out so far.
    pub string_used: u64,
    /// Head of the node free list, `INVALID` when empty.
    pub free_head: u32,
    reserved: [u8; 12],
}

const _: () = assert!(size_of::<RegionHeader>() == HEADER_LEN);

/// A mapped shared-memory region.
///
/// Mutation happens through the typed wrappers (string table, node arena,
/// block pool), each of which serializes access with its own locks; the
/// raw accessors here only bounds-check.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    shm_name: String,
    string_off: usize,
    nodes_off: usize,
    pool_off: usize,
    node_capacity: u32,
    string_capacity: u32,
    pool_blocks: u32,
}

// The mapping is shared mutable state; the component wrappers guarantee
// that every byte range has a single writer xor concurrent readers.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Attach the named region, creating and formatting it when absent.
    ///
    /// Returns the region and whether it was freshly created.
    pub fn open_or_create(settings: &Settings) -> FsResult<(Arc<Region>, bool)> {
        let name = shm_path(&settings.region_name);
        match Region::attach_path(&name) {
            Ok(region) => Ok((Arc::new(region), false)),
            Err(FsError::NotFound) => {
                let region = Region::create_path(&name, settings)?;
                Ok((Arc::new(region), true))
            }
            Err(err) => Err(err),
        }
    }

    /// Attach an existing region by its configured name.
    pub fn attach(region_name: &str) -> FsResult<Arc<Region>> {
        Ok(Arc::new(Region::attach_path(&shm_path(region_name))?))
    }

    /// Unlink the named region from the shared-memory namespace.
    ///
    /// Existing mappings stay usable until dropped; new attaches fail.
    pub fn destroy(region_name: &str) -> FsResult<()> {
        shm_unlink(shm_path(region_name).as_str()).map_err(|err| {
            error!("shm_unlink({region_name}) failed: {err}");
            FsError::Io
        })
    }

    fn create_path(name: &str, settings: &Settings) -> FsResult<Region> {
        let string_capacity = settings.aligned_string_capacity();
        let pool_blocks = settings.pool_blocks();
        let len = HEADER_LEN
            + string_capacity as usize
            + settings.node_capacity as usize * NODE_SIZE
            + pool_blocks as usize * BLOCK_SIZE;

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|err| {
            error!("shm_open({name}) failed: {err}");
            FsError::Io
        })?;
        let file = File::from(fd);
        file.set_len(len as u64)?;

        let ptr = map(&file, len)?;
        let region = Region {
            ptr,
            len,
            shm_name: name.to_string(),
            string_off: HEADER_LEN,
            nodes_off: HEADER_LEN + string_capacity as usize,
            pool_off: HEADER_LEN
                + string_capacity as usize
                + settings.node_capacity as usize * NODE_SIZE,
            node_capacity: settings.node_capacity,
            string_capacity,
            pool_blocks: pool_blocks as u32,
        };

        // Fresh mappings from ftruncate are zero pages; only the header
        // needs explicit initialization.
        let header = RegionHeader {
            magic: REGION_MAGIC,
            version: REGION_VERSION,
            flags: RegionFlags::empty().bits(),
            node_capacity: settings.node_capacity as u64,
            string_capacity: string_capacity as u64,
            used_nodes: 0,
            string_used: 0,
            free_head: crate::arena::INVALID,
            reserved: [0; 12],
        };
        region.write_at(0, &header);
        Ok(region)
    }

    fn attach_path(name: &str) -> FsResult<Region> {
        let fd = match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::ENOENT) => return Err(FsError::NotFound),
            Err(err) => {
                error!("shm_open({name}) failed: {err}");
                return Err(FsError::Io);
            }
        };
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len < HEADER_LEN {
            error!("region {name} is smaller than its header; corrupt or foreign region");
            return Err(FsError::Io);
        }

        let ptr = map(&file, len)?;
        let mut region = Region {
            ptr,
            len,
            shm_name: name.to_string(),
            string_off: HEADER_LEN,
            nodes_off: 0,
            pool_off: 0,
            node_capacity: 0,
            string_capacity: 0,
            pool_blocks: 0,
        };

        let header: RegionHeader = region.read_at(0);
        if header.magic != REGION_MAGIC {
            error!("region {name} has wrong magic; corrupt or foreign region");
            return Err(FsError::Io);
        }
        if header.version != REGION_VERSION {
            error!(
                "region {name} is version {}, expected {REGION_VERSION}; no migration available",
                header.version
            );
            return Err(FsError::Io);
        }
        let metadata_len = HEADER_LEN
            + header.string_capacity as usize
            + header.node_capacity as usize * NODE_SIZE;
        if len < metadata_len || (len - metadata_len) % BLOCK_SIZE != 0 {
            error!("region {name} length {len} disagrees with its header geometry");
            return Err(FsError::Io);
        }
        if header.used_nodes > header.node_capacity || header.string_used > header.string_capacity {
            error!("region {name} header counters exceed capacity; corrupt region");
            return Err(FsError::Io);
        }

        region.string_capacity = header.string_capacity as u32;
        region.node_capacity = header.node_capacity as u32;
        region.nodes_off = HEADER_LEN + header.string_capacity as usize;
        region.pool_off = metadata_len;
        region.pool_blocks = ((len - metadata_len) / BLOCK_SIZE) as u32;
        Ok(region)
    }

    /// Copy of the current header.
    pub fn header(&self) -> RegionHeader {
        self.read_at(0)
    }

    // The mutable header counters are written field-by-field at their
    // fixed offsets. Each field has exactly one owning lock (allocator
    // mutex, string-table lock, mount lifecycle), so whole-struct
    // read-modify-write cycles would let one owner clobber another's
    // field; scalar stores cannot.

    pub(crate) fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_truncate(self.read_at::<u32>(OFF_FLAGS))
    }

    pub(crate) fn set_flags(&self, flags: RegionFlags) {
        self.write_at(OFF_FLAGS, &flags.bits());
    }

    pub(crate) fn used_nodes(&self) -> u32 {
        self.read_at::<u64>(OFF_USED_NODES) as u32
    }

    pub(crate) fn set_used_nodes(&self, used: u32) {
        self.write_at(OFF_USED_NODES, &(used as u64));
    }

    pub(crate) fn string_used(&self) -> u32 {
        self.read_at::<u64>(OFF_STRING_USED) as u32
    }

    pub(crate) fn set_string_used(&self, used: u32) {
        self.write_at(OFF_STRING_USED, &(used as u64));
    }

    pub(crate) fn free_head(&self) -> u32 {
        self.read_at::<u32>(OFF_FREE_HEAD)
    }

    pub(crate) fn set_free_head(&self, head: u32) {
        self.write_at(OFF_FREE_HEAD, &head);
    }

    pub(crate) fn string_off(&self) -> usize {
        self.string_off
    }

    pub(crate) fn nodes_off(&self) -> usize {
        self.nodes_off
    }

    pub(crate) fn pool_off(&self) -> usize {
        self.pool_off
    }

    pub(crate) fn node_capacity(&self) -> u32 {
        self.node_capacity
    }

    pub(crate) fn string_capacity(&self) -> u32 {
        self.string_capacity
    }

    pub(crate) fn pool_blocks(&self) -> u32 {
        self.pool_blocks
    }

    /// Read a POD value at `off`.
    pub(crate) fn read_at<T: FromBytes>(&self, off: usize) -> T {
        assert!(off + size_of::<T>() <= self.len);
        let mut value = T::new_zeroed();
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(off),
                &mut value as *mut T as *mut u8,
                size_of::<T>(),
            );
        }
        value
    }

    /// Write a POD value at `off`.
    pub(crate) fn write_at<T: IntoBytes + Immutable + ?Sized>(&self, off: usize, value: &T) {
        let bytes = value.as_bytes();
        assert!(off + bytes.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(off), bytes.len());
        }
    }

    /// Copy `len` bytes starting at `off` out of the region.
    pub(crate) fn read_bytes(&self, off: usize, len: usize) -> Vec<u8> {
        assert!(off + len <= self.len);
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(off), out.as_mut_ptr(), len);
        }
        out
    }

    /// Copy `buf` into the region at `off`.
    pub(crate) fn write_bytes(&self, off: usize, buf: &[u8]) {
        self.write_at(off, buf);
    }

    /// Zero `len` bytes starting at `off`.
    pub(crate) fn zero_bytes(&self, off: usize, len: usize) {
        assert!(off + len <= self.len);
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(off), 0, len);
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let addr = self.ptr.cast();
        if let Err(err) = unsafe { munmap(addr, self.len) } {
            error!("munmap of region {} failed: {err}", self.shm_name);
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("shm_name", &self.shm_name)
            .field("len", &self.len)
            .field("node_capacity", &self.node_capacity)
            .field("string_capacity", &self.string_capacity)
            .field("pool_blocks", &self.pool_blocks)
            .finish()
    }
}

fn map(file: &File, len: usize) -> FsResult<NonNull<u8>> {
    let length = NonZeroUsize::new(len).ok_or(FsError::InvalidArgument)?;
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(|err| {
        error!("mmap failed: {err}");
        FsError::Io
    })?;
    Ok(ptr.cast())
}

fn shm_path(region_name: &str) -> String {
    format!("/{}", region_name.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unique_region_name;

    #[test]
    fn create_then_attach() {
        let name = unique_region_name("region-roundtrip");
        let settings = Settings {
            region_name: name.clone(),
            node_capacity: 64,
            string_capacity: 4096,
            data_capacity: 64 * 1024,
            ..Settings::default()
        };
        let (region, created) = Region::open_or_create(&settings).unwrap();
        assert!(created);
        assert_eq!(region.node_capacity(), 64);
        assert_eq!(region.pool_blocks(), 16);
        drop(region);

        let region = Region::attach(&name).unwrap();
        let header = region.header();
        assert_eq!(header.magic, REGION_MAGIC);
        assert_eq!(header.node_capacity, 64);
        drop(region);
        Region::destroy(&name).unwrap();
    }

    #[test]
    fn attach_missing_region() {
        let name = unique_region_name("region-missing");
        assert_eq!(Region::attach(&name).unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn refuses_foreign_magic() {
        let name = unique_region_name("region-foreign");
        let settings = Settings {
            region_name: name.clone(),
            node_capacity: 8,
            string_capacity: 1024,
            data_capacity: 4096,
            ..Settings::default()
        };
        let (region, _) = Region::open_or_create(&settings).unwrap();
        let mut header = region.header();
        header.magic = *b"NOTRAZOR";
        region.write_at(0, &header);
        drop(region);

        assert_eq!(Region::attach(&name).unwrap_err(), FsError::Io);
        Region::destroy(&name).unwrap();
    }
}
