//! The FUSE dispatcher.
//!
//! `RazorFs` owns the region, tree, payload store, and (optionally) the
//! write-ahead log, and maps every bridge callback onto them. Mutations
//! follow one discipline: validate under the proper locks, journal the
//! mutation, force the commit, then apply to the region. The region never
//! runs ahead of the log, so a crash at any instant replays to a
//! consistent tree.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fuser::AccessFlags;
use fuser::BsdFileFlags;
use fuser::Errno;
use fuser::FileAttr;
use fuser::FileHandle;
use fuser::FileType;
use fuser::FopenFlags;
use fuser::INodeNo;
use fuser::KernelConfig;
use fuser::LockOwner;
use fuser::OpenAccMode;
use fuser::OpenFlags;
use fuser::RenameFlags;
use fuser::ReplyAttr;
use fuser::ReplyCreate;
use fuser::ReplyData;
use fuser::ReplyDirectory;
use fuser::ReplyEmpty;
use fuser::ReplyEntry;
use fuser::ReplyOpen;
use fuser::ReplyStatfs;
use fuser::ReplyWrite;
use fuser::Request;
use fuser::TimeOrNow;
use fuser::WriteFlags;
use log::debug;
use log::error;
use log::info;
use log::warn;
use nix::unistd::getegid;
use nix::unistd::geteuid;

use crate::arena::RawNode;
use crate::config::BLOCK_SIZE;
use crate::config::MAX_NAME_LENGTH;
use crate::config::Settings;
use crate::errors::FsError;
use crate::errors::FsResult;
use crate::payload::PayloadStore;
use crate::recovery;
use crate::region::Region;
use crate::region::RegionFlags;
use crate::tree::DeleteKind;
use crate::tree::NodeUpdate;
use crate::tree::Tree;
use crate::tree::unix_now;
use crate::wal::Wal;
use crate::wal::WalRecord;
use std::sync::Arc;

const TTL: Duration = Duration::ZERO;

// Top two file handle bits carry the handle's access mode, the way the
// reference fuser filesystem does it.
const FILE_HANDLE_READ_BIT: u64 = 1 << 63;
const FILE_HANDLE_WRITE_BIT: u64 = 1 << 62;

/// Journal size that triggers an opportunistic checkpoint.
const WAL_CHECKPOINT_BYTES: u64 = 4 * 1024 * 1024;

/// The mounted filesystem.
pub struct RazorFs {
    settings: Settings,
    region: Arc<Region>,
    tree: Tree,
    payload: PayloadStore,
    wal: Option<Wal>,
    read_only: AtomicBool,
    next_fh: AtomicU64,
    mount_uid: u32,
    mount_gid: u32,
}

impl RazorFs {
    /// Attach (or create) the region, open the journal, and recover.
    pub fn new(settings: Settings) -> FsResult<RazorFs> {
        settings.validate()?;
        let (region, created) = Region::open_or_create(&settings)?;
        if created {
            info!(
                "created region '{}': {} nodes, {} string bytes, {} payload blocks",
                settings.region_name,
                region.node_capacity(),
                region.string_capacity(),
                region.pool_blocks()
            );
        } else {
            info!("attached existing region '{}'", settings.region_name);
        }

        let tree = Tree::attach(region.clone())?;
        let payload =
            PayloadStore::attach(region.clone(), settings.compression_threshold, &tree);
        let wal = match &settings.wal_path {
            Some(path) => Some(Wal::open(path)?),
            None => {
                warn!("no journal configured; mutations will not survive reboot");
                None
            }
        };

        let fs = RazorFs {
            settings,
            region,
            tree,
            payload,
            wal,
            read_only: AtomicBool::new(false),
            next_fh: AtomicU64::new(1),
            mount_uid: geteuid().as_raw(),
            mount_gid: getegid().as_raw(),
        };

        match recovery::run(&fs.tree, &fs.payload, fs.wal.as_ref()) {
            Ok(_) => {
                if let Some(wal) = &fs.wal {
                    wal.checkpoint()?;
                    wal.mark_clean()?;
                    fs.region.set_flags(RegionFlags::CLEAN_SHUTDOWN);
                } else {
                    // Without a journal the flag is the only crash signal:
                    // dirty while serving, clean again on shutdown.
                    fs.region.set_flags(RegionFlags::empty());
                }
            }
            Err(err) => {
                error!("recovery failed: {err}; serving read-only");
                fs.read_only.store(true, Ordering::SeqCst);
            }
        }
        Ok(fs)
    }

    /// The metadata tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The payload store.
    pub fn payload(&self) -> &PayloadStore {
        &self.payload
    }

    /// Whether recovery degraded the mount to read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Checkpoint and mark both the journal and the region clean.
    ///
    /// Called from the bridge's `destroy`; also the clean way for library
    /// users to end a mount.
    pub fn shutdown(&self) {
        if self.is_read_only() {
            warn!("shutting down a read-only mount; region left as found");
            return;
        }
        if let Some(wal) = &self.wal {
            let _quiesce = self.tree.write_guard();
            if let Err(err) = wal.checkpoint().and_then(|()| wal.mark_clean()) {
                error!("final checkpoint failed: {err}");
                return;
            }
        }
        self.region.set_flags(RegionFlags::CLEAN_SHUTDOWN);
    }

    /// Create a directory entry. `perm` carries only permission bits.
    pub fn create_dir(&self, parent: u32, name: &[u8], perm: u32) -> FsResult<RawNode> {
        self.insert_entry(parent, name, libc::S_IFDIR as u32 | (perm & 0o7777))
    }

    /// Create a regular file entry.
    pub fn create_file(&self, parent: u32, name: &[u8], perm: u32) -> FsResult<RawNode> {
        self.insert_entry(parent, name, libc::S_IFREG as u32 | (perm & 0o7777))
    }

    fn insert_entry(&self, parent: u32, name: &[u8], mode: u32) -> FsResult<RawNode> {
        self.ensure_writable()?;
        let inode = self.tree.alloc_inode();
        let node = self.tree.insert(parent, name, mode, inode, |parent_idx| {
            self.log_txn(&[WalRecord::Insert {
                parent: parent_idx,
                inode,
                mode,
                name: name.to_vec(),
            }])
        })?;
        self.after_mutation();
        Ok(node)
    }

    /// Unlink a regular file.
    pub fn remove_file(&self, parent: u32, name: &[u8]) -> FsResult<()> {
        self.remove_entry(parent, name, DeleteKind::File)
    }

    /// Remove an empty directory.
    pub fn remove_dir(&self, parent: u32, name: &[u8]) -> FsResult<()> {
        self.remove_entry(parent, name, DeleteKind::Directory)
    }

    fn remove_entry(&self, parent: u32, name: &[u8], kind: DeleteKind) -> FsResult<()> {
        self.ensure_writable()?;
        let node = self.tree.delete_child(parent, name, kind, |victim| {
            self.log_txn(&[WalRecord::Delete {
                inode: victim.inode,
            }])
        })?;
        self.payload.release(&node);
        self.after_mutation();
        Ok(())
    }

    /// Rename within one directory; cross-directory moves are refused.
    pub fn rename_entry(&self, parent: u32, old_name: &[u8], new_name: &[u8]) -> FsResult<()> {
        self.ensure_writable()?;
        self.tree
            .rename_child(parent, old_name, new_name, |parent_idx, victim| {
                self.log_txn(&[WalRecord::Rename {
                    inode: victim.inode,
                    parent: parent_idx,
                    new_name: new_name.to_vec(),
                }])
            })?;
        self.after_mutation();
        Ok(())
    }

    /// Write bytes, journaled; returns the count written.
    pub fn write_at(&self, inode: u32, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.ensure_writable()?;
        {
            let lock = self.payload.lock_for(inode);
            let _file = lock.write();
            let _g = self.tree.read_guard();
            // Pre-flight so an apply failure after the forced commit
            // stays an exceptional event rather than a routine one.
            let node = self.tree.node_by_inode_unguarded(inode)?;
            if node.is_dir() {
                return Err(FsError::IsDirectory);
            }
            let end = offset
                .checked_add(data.len() as u64)
                .ok_or(FsError::InvalidArgument)?;
            if end > node.size && !self.payload.has_room_for(end) {
                return Err(FsError::NoSpace);
            }

            self.log_txn(&[WalRecord::Write {
                inode,
                offset,
                data: data.to_vec(),
            }])?;
            self.payload.write_locked(&self.tree, inode, offset, data)?;
        }
        self.after_mutation();
        Ok(data.len() as u32)
    }

    /// Read bytes, decompressing transparently.
    pub fn read_at(&self, inode: u32, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.payload.read(&self.tree, inode, offset, size)
    }

    /// Journaled truncate.
    pub fn truncate_to(&self, inode: u32, size: u64) -> FsResult<()> {
        self.ensure_writable()?;
        {
            let lock = self.payload.lock_for(inode);
            let _file = lock.write();
            let _g = self.tree.read_guard();
            let node = self.tree.node_by_inode_unguarded(inode)?;
            if node.is_dir() {
                return Err(FsError::IsDirectory);
            }
            if size > node.size && !self.payload.has_room_for(size) {
                return Err(FsError::NoSpace);
            }

            self.log_txn(&[WalRecord::Update {
                inode,
                mode: None,
                size: Some(size),
                mtime: Some(unix_now()),
            }])?;
            self.payload.truncate_locked(&self.tree, inode, size)?;
        }
        self.after_mutation();
        Ok(())
    }

    /// Journaled chmod.
    pub fn set_mode(&self, inode: u32, perm: u32) -> FsResult<RawNode> {
        self.ensure_writable()?;
        let now = unix_now();
        let node = self.tree.update(
            inode,
            NodeUpdate {
                mode: Some(perm),
                size: None,
                mtime: Some(now),
            },
            |_| {
                self.log_txn(&[WalRecord::Update {
                    inode,
                    mode: Some(perm),
                    size: None,
                    mtime: Some(now),
                }])
            },
        )?;
        self.after_mutation();
        Ok(node)
    }

    /// Journaled utimens (atime and ctime collapse onto mtime).
    pub fn set_mtime(&self, inode: u32, mtime: u64) -> FsResult<RawNode> {
        self.ensure_writable()?;
        let node = self.tree.update(
            inode,
            NodeUpdate {
                mode: None,
                size: None,
                mtime: Some(mtime),
            },
            |_| {
                self.log_txn(&[WalRecord::Update {
                    inode,
                    mode: None,
                    size: None,
                    mtime: Some(mtime),
                }])
            },
        )?;
        self.after_mutation();
        Ok(node)
    }

    fn ensure_writable(&self) -> FsResult<()> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    /// One transaction around `records`: begin, stage, forced commit.
    fn log_txn(&self, records: &[WalRecord]) -> FsResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let txn = wal.begin()?;
        for record in records {
            if let Err(err) = wal.append(txn, record) {
                let _ = wal.abort(txn);
                return Err(err);
            }
        }
        wal.commit(txn)
    }

    /// Post-mutation housekeeping: automatic rebalance and journal
    /// truncation. Runs with no locks held.
    fn after_mutation(&self) {
        let interval = self.settings.rebalance_interval;
        if interval > 0 && self.tree.mutations() >= interval {
            match self.tree.rebalance() {
                Ok(live) => {
                    debug!("rebalanced {live} live nodes into breadth-first order");
                    // Retire every journal record that predates the
                    // permutation; stale indices must never replay.
                    if let Some(wal) = &self.wal {
                        let _quiesce = self.tree.write_guard();
                        if let Err(err) = wal.checkpoint() {
                            error!("post-rebalance checkpoint failed: {err}");
                        }
                    }
                }
                Err(err) => warn!("rebalance skipped: {err}"),
            }
            return;
        }
        if let Some(wal) = &self.wal {
            if wal.size() > WAL_CHECKPOINT_BYTES {
                let _quiesce = self.tree.write_guard();
                if let Err(err) = wal.checkpoint() {
                    error!("checkpoint failed: {err}");
                }
            }
        }
    }

    fn attr(&self, node: &RawNode) -> FileAttr {
        let mtime = system_time_from_secs(node.mtime);
        FileAttr {
            ino: INodeNo(node.inode as u64),
            size: node.size,
            blocks: node.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: UNIX_EPOCH,
            kind: if node.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: (node.mode & 0o7777) as u16,
            nlink: if node.is_dir() { 2 } else { 1 },
            uid: self.mount_uid,
            gid: self.mount_gid,
            rdev: 0,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        }
    }

    fn allocate_file_handle(&self, read: bool, write: bool) -> FileHandle {
        let mut fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        assert!(fh < FILE_HANDLE_WRITE_BIT.min(FILE_HANDLE_READ_BIT));
        if read {
            fh |= FILE_HANDLE_READ_BIT;
        }
        if write {
            fh |= FILE_HANDLE_WRITE_BIT;
        }
        FileHandle(fh)
    }

    fn check_handle_read(fh: FileHandle) -> bool {
        u64::from(fh) & FILE_HANDLE_READ_BIT != 0
    }

    fn check_handle_write(fh: FileHandle) -> bool {
        u64::from(fh) & FILE_HANDLE_WRITE_BIT != 0
    }

    fn open_common(&self, ino: u32, flags: OpenFlags) -> FsResult<(FileHandle, bool)> {
        let (write, read) = match flags.acc_mode() {
            OpenAccMode::O_RDONLY => {
                if flags.0 & libc::O_TRUNC != 0 {
                    return Err(FsError::InvalidArgument);
                }
                (false, true)
            }
            OpenAccMode::O_WRONLY => (true, false),
            OpenAccMode::O_RDWR => (true, true),
        };
        if write {
            self.ensure_writable()?;
        }
        let _ = self.tree.node_by_inode(ino)?;
        Ok((self.allocate_file_handle(read, write), write))
    }
}

impl std::fmt::Debug for RazorFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RazorFs")
            .field("region", &self.region)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

fn system_time_from_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn secs_from_time_or_now(value: TimeOrNow) -> u64 {
    match value {
        TimeOrNow::SpecificTime(time) => time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        TimeOrNow::Now => unix_now(),
    }
}

fn ino32(ino: INodeNo) -> FsResult<u32> {
    u32::try_from(u64::from(ino)).map_err(|_| FsError::NotFound)
}

fn name_bytes(name: &OsStr) -> FsResult<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME_LENGTH {
        return Err(FsError::InvalidArgument);
    }
    Ok(bytes)
}

fn check_access(
    file_uid: u32,
    file_gid: u32,
    file_mode: u32,
    uid: u32,
    gid: u32,
    mut access_mask: AccessFlags,
) -> bool {
    if access_mask == AccessFlags::F_OK {
        return true;
    }
    let file_mode = (file_mode & 0o7777) as i32;

    // root may read and write anything, and exec when any x bit is set
    if uid == 0 {
        access_mask &= AccessFlags::X_OK;
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & (file_mode >> 6));
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & (file_mode >> 3));
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & file_mode);
        return access_mask.is_empty();
    }

    if uid == file_uid {
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & (file_mode >> 6));
    } else if gid == file_gid {
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & (file_mode >> 3));
    } else {
        access_mask &= !AccessFlags::from_bits_retain(access_mask.bits() & file_mode);
    }

    access_mask.is_empty()
}

impl fuser::Filesystem for RazorFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> io::Result<()> {
        info!(
            "serving region '{}'{}",
            self.settings.region_name,
            if self.is_read_only() {
                " (read-only)"
            } else {
                ""
            }
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("unmounting; writing final checkpoint");
        self.shutdown();
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let result: FsResult<FileAttr> = (|| {
            let parent = ino32(parent)?;
            let node = self.tree.lookup_child(parent, name_bytes(name)?)?;
            Ok(self.attr(&node))
        })();
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, fuser::Generation(0)),
            Err(err) => reply.error(err.into()),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match ino32(ino).and_then(|ino| self.tree.node_by_inode(ino)) {
            Ok(node) => reply.attr(&TTL, &self.attr(&node)),
            Err(err) => reply.error(err.into()),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let result = (|| {
            let ino = ino32(ino)?;

            if let Some(mode) = mode {
                debug!("chmod() called with inode {ino}, mode {mode:o}");
                self.set_mode(ino, mode)?;
            }

            if uid.is_some() || gid.is_some() {
                // Ownership is not stored; the mounting user owns every
                // node. Accept the request without effect.
                debug!("chown() called with inode {ino}; ownership is fixed at mount");
            }

            if let Some(size) = size {
                debug!("truncate() called with inode {ino}, size {size}");
                if let Some(handle) = fh {
                    if !Self::check_handle_write(handle) {
                        return Err(FsError::InvalidArgument);
                    }
                }
                self.truncate_to(ino, size)?;
            }

            // atime collapses onto mtime; apply whichever is latest.
            let stamp = mtime.or(atime).map(secs_from_time_or_now);
            if let Some(stamp) = stamp {
                debug!("utimens() called with inode {ino}");
                self.set_mtime(ino, stamp)?;
            }

            self.tree.node_by_inode(ino)
        })();
        match result {
            Ok(node) => reply.attr(&TTL, &self.attr(&node)),
            Err(err) => reply.error(err.into()),
        }
    }

    fn mknod(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod() called with parent {parent:?}, name {name:?}, mode {mode:o}");
        let result: FsResult<FileAttr> = (|| {
            if mode & libc::S_IFMT as u32 != libc::S_IFREG as u32 {
                // Special files are out of scope.
                return Err(FsError::InvalidArgument);
            }
            let parent = ino32(parent)?;
            let node = self.create_file(parent, name_bytes(name)?, mode)?;
            Ok(self.attr(&node))
        })();
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, fuser::Generation(0)),
            Err(err) => reply.error(err.into()),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir() called with parent {parent:?}, name {name:?}, mode {mode:o}");
        let result: FsResult<FileAttr> = (|| {
            let parent = ino32(parent)?;
            let node = self.create_dir(parent, name_bytes(name)?, mode)?;
            Ok(self.attr(&node))
        })();
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, fuser::Generation(0)),
            Err(err) => reply.error(err.into()),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink() called with parent {parent:?}, name {name:?}");
        let result = ino32(parent)
            .and_then(|parent| name_bytes(name).and_then(|n| self.remove_file(parent, n)));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into()),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir() called with parent {parent:?}, name {name:?}");
        let result = ino32(parent)
            .and_then(|parent| name_bytes(name).and_then(|n| self.remove_dir(parent, n)));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into()),
        }
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        debug!("rename() called with {parent:?} {name:?} -> {newparent:?} {newname:?}");
        let result = (|| {
            if parent != newparent {
                return Err(FsError::CrossDevice);
            }
            let parent = ino32(parent)?;
            self.rename_entry(parent, name_bytes(name)?, name_bytes(newname)?)
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.into()),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        debug!("open() called for {ino:?}");
        let result = (|| {
            let ino = ino32(ino)?;
            let node = self.tree.node_by_inode(ino)?;
            if node.is_dir() {
                return Err(FsError::IsDirectory);
            }
            self.open_common(ino, flags)
        })();
        match result {
            Ok((fh, _)) => reply.opened(fh, FopenFlags::empty()),
            Err(err) => reply.error(err.into()),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        debug!("read() called on {ino:?} offset={offset} size={size}");
        if !Self::check_handle_read(fh) {
            reply.error(Errno::EACCES);
            return;
        }
        match ino32(ino).and_then(|ino| self.read_at(ino, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.into()),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        debug!("write() called on {ino:?} offset={offset} len={}", data.len());
        if !Self::check_handle_write(fh) {
            reply.error(Errno::EACCES);
            return;
        }
        match ino32(ino).and_then(|ino| self.write_at(ino, offset, data)) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err.into()),
        }
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        // Commits are forced as they happen; nothing is buffered.
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&self, _req: &Request, ino: INodeNo, _fh: FileHandle, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync() called on {ino:?}, datasync={datasync}");
        match &self.wal {
            Some(wal) => match wal.sync() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.into()),
            },
            None => reply.ok(),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        debug!("opendir() called on {ino:?}");
        let result = (|| {
            let ino = ino32(ino)?;
            let node = self.tree.node_by_inode(ino)?;
            if !node.is_dir() {
                return Err(FsError::NotDirectory);
            }
            self.open_common(ino, flags)
        })();
        match result {
            Ok((fh, _)) => reply.opened(fh, FopenFlags::empty()),
            Err(err) => reply.error(err.into()),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir() called with {ino:?}");
        let result: FsResult<(u32, u32, Vec<crate::tree::DirEntry>)> = (|| {
            let ino = ino32(ino)?;
            let parent = self.tree.parent_inode(ino)?;
            let children = self.tree.readdir(ino)?;
            Ok((ino, parent, children))
        })();
        let (ino, parent, children) = match result {
            Ok(listing) => listing,
            Err(err) => {
                reply.error(err.into());
                return;
            }
        };

        let dots = [
            (ino, FileType::Directory, Vec::from(*b".")),
            (parent, FileType::Directory, Vec::from(*b"..")),
        ];
        let entries = dots.into_iter().chain(children.into_iter().map(|entry| {
            let kind = if entry.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            (entry.inode, kind, entry.name)
        }));

        for (index, (inode, kind, name)) in entries.enumerate().skip(offset as usize) {
            let full = reply.add(
                INodeNo(inode as u64),
                index as u64 + 1,
                kind,
                OsStr::from_bytes(&name),
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let blocks = self.payload.total_blocks() as u64;
        let bfree = self.payload.free_blocks() as u64;
        let files = self.tree.node_capacity() as u64;
        let ffree = self.tree.free_nodes() as u64;
        reply.statfs(
            blocks,
            bfree,
            bfree,
            files,
            ffree,
            BLOCK_SIZE as u32,
            MAX_NAME_LENGTH as u32,
            BLOCK_SIZE as u32,
        );
    }

    fn access(&self, req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        debug!("access() called with {ino:?} {mask:?}");
        match ino32(ino).and_then(|ino| self.tree.node_by_inode(ino)) {
            Ok(node) => {
                if check_access(
                    self.mount_uid,
                    self.mount_gid,
                    node.mode,
                    req.uid(),
                    req.gid(),
                    mask,
                ) {
                    reply.ok();
                } else {
                    reply.error(Errno::EACCES);
                }
            }
            Err(err) => reply.error(err.into()),
        }
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create() called with {parent:?} {name:?} mode {mode:o}");
        let result: FsResult<(FileAttr, FileHandle)> = (|| {
            let (read, write) = match flags & libc::O_ACCMODE {
                libc::O_RDONLY => (true, false),
                libc::O_WRONLY => (false, true),
                libc::O_RDWR => (true, true),
                _ => return Err(FsError::InvalidArgument),
            };
            let parent = ino32(parent)?;
            let node = self.create_file(parent, name_bytes(name)?, mode)?;
            Ok((self.attr(&node), self.allocate_file_handle(read, write)))
        })();
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, fuser::Generation(0), fh, FopenFlags::empty()),
            Err(err) => reply.error(err.into()),
        }
    }
}
