//! Interned filename table.
//!
//! Names live in an append-only byte arena inside the region, one
//! NUL-terminated entry after another. Offsets are stable for the life of
//! the region, so nodes can refer to their name by a single `u32`. The
//! lookup index is in-memory only and is rebuilt with one linear scan when
//! attaching to an existing region.

use std::collections::HashMap;
use std::sync::Arc;

use memchr::memchr;
use parking_lot::RwLock;

use crate::config::MAX_NAME_LENGTH;
use crate::errors::FsError;
use crate::errors::FsResult;
use crate::region::Region;

/// Interned, append-only string storage.
pub struct StringTable {
    region: Arc<Region>,
    base: usize,
    capacity: u32,
    // Maps name bytes to their arena offset. Appends hold the write lock,
    // which also serializes the underlying arena growth.
    index: RwLock<HashMap<Box<[u8]>, u32>>,
}

impl StringTable {
    /// Attach to the region's string arena, rebuilding the lookup index.
    pub fn attach(region: Arc<Region>) -> FsResult<StringTable> {
        let base = region.string_off();
        let capacity = region.string_capacity();
        let used = region.string_used();
        if used > capacity {
            return Err(FsError::Io);
        }

        let mut index = HashMap::new();
        let data = region.read_bytes(base, used as usize);
        let mut off = 0usize;
        while off < data.len() {
            let Some(nul) = memchr(0, &data[off..]) else {
                // The live portion must end on a terminator.
                return Err(FsError::Io);
            };
            index.insert(data[off..off + nul].to_vec().into_boxed_slice(), off as u32);
            off += nul + 1;
        }

        Ok(StringTable {
            region,
            base,
            capacity,
            index: RwLock::new(index),
        })
    }

    /// Intern `name`, returning its stable offset.
    ///
    /// Duplicate inputs return the offset handed out the first time.
    pub fn intern(&self, name: &[u8]) -> FsResult<u32> {
        validate_name(name)?;
        if let Some(&off) = self.index.read().get(name) {
            return Ok(off);
        }

        let mut index = self.index.write();
        // A racing intern of the same name may have won.
        if let Some(&off) = index.get(name) {
            return Ok(off);
        }
        let used = self.region.string_used();
        let needed = name.len() as u32 + 1;
        if used + needed > self.capacity {
            return Err(FsError::NoSpace);
        }
        self.region.write_bytes(self.base + used as usize, name);
        self.region
            .write_bytes(self.base + used as usize + name.len(), &[0]);
        self.region.set_string_used(used + needed);
        index.insert(name.to_vec().into_boxed_slice(), used);
        Ok(used)
    }

    /// Offset of `name` if it is already interned. Never appends.
    pub fn lookup(&self, name: &[u8]) -> Option<u32> {
        self.index.read().get(name).copied()
    }

    /// The bytes stored at `offset`.
    pub fn get(&self, offset: u32) -> FsResult<Vec<u8>> {
        let used = self.region.string_used();
        if offset >= used {
            return Err(FsError::InvalidArgument);
        }
        // Names are bounded, so scanning a small window is enough.
        let window = (used - offset).min(MAX_NAME_LENGTH as u32 + 1) as usize;
        let bytes = self.region.read_bytes(self.base + offset as usize, window);
        match memchr(0, &bytes) {
            Some(nul) => Ok(bytes[..nul].to_vec()),
            None => Err(FsError::InvalidArgument),
        }
    }

    /// Bytes of arena space handed out.
    pub fn used(&self) -> u32 {
        self.region.string_used()
    }

    /// Total arena capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl std::fmt::Debug for StringTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringTable")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

/// Reject names the tree cannot store.
pub fn validate_name(name: &[u8]) -> FsResult<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(FsError::InvalidArgument);
    }
    if name.contains(&0) || name.contains(&b'/') {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}
