//! Write-ahead log.
//!
//! An append-only journal on a durable file, separate from the
//! shared-memory region. Every metadata mutation is framed as a
//! checksummed record inside a transaction; a mutation counts as durable
//! only once its COMMIT record has been forced to storage. The file
//! layout:
//!
//! ```text
//! header: magic='RZWL', version, head_lsn, tail_lsn, checkpoint_lsn, flags, reserved
//! record: [length:4][lsn:8][txn_id:4][type:1][reserved:3][crc32:4][payload:length]
//! ```
//!
//! Records are padded to 8-byte alignment. A torn record (one whose
//! length runs past EOF or whose CRC mismatches) ends the log; everything
//! behind it is treated as never written.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use bitflags::bitflags;
use log::error;
use log::warn;
use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::little_endian::U32;
use zerocopy::little_endian::U64;

use crate::errors::FsError;
use crate::errors::FsResult;

/// Identifies a RAZORFS journal file.
pub const WAL_MAGIC: [u8; 4] = *b"RZWL";

/// Journal format version.
pub const WAL_VERSION: u32 = 1;

const WAL_HEADER_LEN: u64 = 64;
const RECORD_HEADER_LEN: usize = 24;

/// Upper bound on one record payload: one bridge write plus framing slack.
const MAX_PAYLOAD: u32 = 17 * 1024 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct WalFlags: u32 {
        /// The log was closed behind a full checkpoint.
        const CLEAN = 1;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
struct WalFileHeader {
    magic: [u8; 4],
    version: U32,
    /// Next LSN to assign.
    head_lsn: U64,
    /// First LSN not yet retired by a checkpoint.
    tail_lsn: U64,
    /// LSN of the most recent checkpoint record.
    checkpoint_lsn: U64,
    flags: U32,
    reserved: [u8; 28],
}

const _: () = assert!(size_of::<WalFileHeader>() == WAL_HEADER_LEN as usize);

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
struct RecordHeader {
    length: U32,
    lsn: U64,
    txn_id: U32,
    rtype: u8,
    reserved: [u8; 3],
    crc32: U32,
}

const _: () = assert!(size_of::<RecordHeader>() == RECORD_HEADER_LEN);

/// Record tags as stored in the `type` byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
enum RecordType {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    Insert = 4,
    Delete = 5,
    Update = 6,
    Write = 7,
    Rename = 8,
    Checkpoint = 9,
}

/// Transaction handle returned by [`Wal::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnId(pub u32);

/// One logical journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Transaction open.
    Begin,
    /// Transaction durable.
    Commit,
    /// Transaction discarded.
    Abort,
    /// All prior committed state is reflected in the region.
    Checkpoint,
    /// A node joined `parent` under `name`.
    Insert {
        /// Arena index of the parent directory.
        parent: u32,
        /// Inode assigned to the new node.
        inode: u32,
        /// Type and permission bits.
        mode: u32,
        /// Name bytes.
        name: Vec<u8>,
    },
    /// The node with `inode` left the tree.
    Delete {
        /// Inode of the removed node.
        inode: u32,
    },
    /// A subset of node fields changed.
    Update {
        /// Target inode.
        inode: u32,
        /// New mode bits, when changed.
        mode: Option<u32>,
        /// New logical size, when changed (also truncates the payload).
        size: Option<u64>,
        /// New modification time, when changed.
        mtime: Option<u64>,
    },
    /// Bytes written into a file payload.
    Write {
        /// Target inode.
        inode: u32,
        /// Byte offset of the write.
        offset: u64,
        /// The written bytes.
        data: Vec<u8>,
    },
    /// A node was renamed within its parent.
    Rename {
        /// Target inode.
        inode: u32,
        /// Arena index of the (unchanged) parent directory.
        parent: u32,
        /// Replacement name bytes.
        new_name: Vec<u8>,
    },
}

impl WalRecord {
    fn rtype(&self) -> RecordType {
        match self {
            WalRecord::Begin => RecordType::Begin,
            WalRecord::Commit => RecordType::Commit,
            WalRecord::Abort => RecordType::Abort,
            WalRecord::Checkpoint => RecordType::Checkpoint,
            WalRecord::Insert { .. } => RecordType::Insert,
            WalRecord::Delete { .. } => RecordType::Delete,
            WalRecord::Update { .. } => RecordType::Update,
            WalRecord::Write { .. } => RecordType::Write,
            WalRecord::Rename { .. } => RecordType::Rename,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            WalRecord::Begin | WalRecord::Commit | WalRecord::Abort | WalRecord::Checkpoint => {}
            WalRecord::Insert {
                parent,
                inode,
                mode,
                name,
            } => {
                out.extend_from_slice(&parent.to_le_bytes());
                out.extend_from_slice(&inode.to_le_bytes());
                out.extend_from_slice(&mode.to_le_bytes());
                out.extend_from_slice(&(name.len() as u32).to_le_bytes());
                out.extend_from_slice(name);
            }
            WalRecord::Delete { inode } => {
                out.extend_from_slice(&inode.to_le_bytes());
            }
            WalRecord::Update {
                inode,
                mode,
                size,
                mtime,
            } => {
                let mut mask = 0u32;
                if mode.is_some() {
                    mask |= 1;
                }
                if size.is_some() {
                    mask |= 2;
                }
                if mtime.is_some() {
                    mask |= 4;
                }
                out.extend_from_slice(&inode.to_le_bytes());
                out.extend_from_slice(&mask.to_le_bytes());
                out.extend_from_slice(&mode.unwrap_or(0).to_le_bytes());
                out.extend_from_slice(&size.unwrap_or(0).to_le_bytes());
                out.extend_from_slice(&mtime.unwrap_or(0).to_le_bytes());
            }
            WalRecord::Write {
                inode,
                offset,
                data,
            } => {
                out.extend_from_slice(&inode.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            WalRecord::Rename {
                inode,
                parent,
                new_name,
            } => {
                out.extend_from_slice(&inode.to_le_bytes());
                out.extend_from_slice(&parent.to_le_bytes());
                out.extend_from_slice(&(new_name.len() as u32).to_le_bytes());
                out.extend_from_slice(new_name);
            }
        }
        out
    }

    fn decode(rtype: RecordType, payload: &[u8]) -> Option<WalRecord> {
        let mut cursor = Cursor::new(payload);
        let record = match rtype {
            RecordType::Begin => WalRecord::Begin,
            RecordType::Commit => WalRecord::Commit,
            RecordType::Abort => WalRecord::Abort,
            RecordType::Checkpoint => WalRecord::Checkpoint,
            RecordType::Insert => {
                let parent = cursor.u32()?;
                let inode = cursor.u32()?;
                let mode = cursor.u32()?;
                let len = cursor.u32()? as usize;
                let name = cursor.bytes(len)?.to_vec();
                WalRecord::Insert {
                    parent,
                    inode,
                    mode,
                    name,
                }
            }
            RecordType::Delete => WalRecord::Delete {
                inode: cursor.u32()?,
            },
            RecordType::Update => {
                let inode = cursor.u32()?;
                let mask = cursor.u32()?;
                let mode = cursor.u32()?;
                let size = cursor.u64()?;
                let mtime = cursor.u64()?;
                WalRecord::Update {
                    inode,
                    mode: (mask & 1 != 0).then_some(mode),
                    size: (mask & 2 != 0).then_some(size),
                    mtime: (mask & 4 != 0).then_some(mtime),
                }
            }
            RecordType::Write => {
                let inode = cursor.u32()?;
                let _reserved = cursor.u32()?;
                let offset = cursor.u64()?;
                let len = cursor.u32()? as usize;
                let data = cursor.bytes(len)?.to_vec();
                WalRecord::Write {
                    inode,
                    offset,
                    data,
                }
            }
            RecordType::Rename => {
                let inode = cursor.u32()?;
                let parent = cursor.u32()?;
                let len = cursor.u32()? as usize;
                let new_name = cursor.bytes(len)?.to_vec();
                WalRecord::Rename {
                    inode,
                    parent,
                    new_name,
                }
            }
        };
        Some(record)
    }
}

/// Little-endian payload reader; every accessor returns `None` past the
/// end, which the scanner treats as a torn record.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Some(out)
    }

    fn u32(&mut self) -> Option<u32> {
        let raw = self.bytes(4)?;
        Some(u32::from_le_bytes(raw.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let raw = self.bytes(8)?;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }
}

/// A scanned record with its framing identity.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    /// Log sequence number.
    pub lsn: u64,
    /// Owning transaction.
    pub txn_id: u32,
    /// Decoded body.
    pub record: WalRecord,
}

struct WalInner {
    file: File,
    head_off: u64,
    next_lsn: u64,
    next_txn: u32,
    checkpoint_lsn: u64,
    clean: bool,
    open_txns: usize,
}

/// The journal. One appender at a time; the mutex is internal.
pub struct Wal {
    path: PathBuf,
    needs_recovery: bool,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open or create the journal at `path` and scan its records.
    pub fn open(path: &Path) -> FsResult<Wal> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();

        let header = if len < WAL_HEADER_LEN {
            let header = WalFileHeader {
                magic: WAL_MAGIC,
                version: U32::new(WAL_VERSION),
                head_lsn: U64::new(1),
                tail_lsn: U64::new(0),
                checkpoint_lsn: U64::new(0),
                flags: U32::new(WalFlags::CLEAN.bits()),
                reserved: [0; 28],
            };
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(header.as_bytes())?;
            file.sync_data()?;
            header
        } else {
            let mut buf = [0u8; WAL_HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header =
                WalFileHeader::read_from_bytes(&buf).map_err(|_| FsError::Io)?;
            if header.magic != WAL_MAGIC {
                error!("{} is not a RAZORFS journal", path.display());
                return Err(FsError::Io);
            }
            if header.version.get() != WAL_VERSION {
                error!(
                    "journal {} is version {}, expected {WAL_VERSION}",
                    path.display(),
                    header.version.get()
                );
                return Err(FsError::Io);
            }
            header
        };

        let scan = scan_records(&mut file)?;
        if scan.torn {
            warn!(
                "journal {} has a torn tail after lsn {}; discarding it",
                path.display(),
                scan.max_lsn
            );
        }
        // Drop everything behind the last well-framed record so stale
        // bytes can never masquerade as future records.
        file.set_len(scan.end_off)?;

        let clean = WalFlags::from_bits_truncate(header.flags.get()).contains(WalFlags::CLEAN);
        let checkpoint_lsn = header.checkpoint_lsn.get();
        let unapplied = scan
            .records
            .iter()
            .any(|r| r.lsn > checkpoint_lsn && r.record != WalRecord::Checkpoint);
        let needs_recovery = !clean || unapplied;

        Ok(Wal {
            path: path.to_path_buf(),
            needs_recovery,
            inner: Mutex::new(WalInner {
                file,
                head_off: scan.end_off,
                next_lsn: header.head_lsn.get().max(scan.max_lsn + 1),
                next_txn: scan.max_txn.wrapping_add(1).max(1),
                checkpoint_lsn,
                clean,
                open_txns: 0,
            }),
        })
    }

    /// Whether the last shutdown was unclean or unapplied records follow
    /// the last checkpoint.
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    /// All well-framed records currently in the log, in order.
    pub fn records(&self) -> FsResult<Vec<ScannedRecord>> {
        let mut inner = self.inner.lock();
        Ok(scan_records(&mut inner.file)?.records)
    }

    /// Bytes the journal currently occupies.
    pub fn size(&self) -> u64 {
        self.inner.lock().head_off
    }

    /// Start a transaction; writes the BEGIN record.
    pub fn begin(&self) -> FsResult<TxnId> {
        let mut inner = self.inner.lock();
        if inner.clean {
            inner.clean = false;
            write_header_locked(&mut inner)?;
        }
        let txn = TxnId(inner.next_txn);
        inner.next_txn = inner.next_txn.wrapping_add(1).max(1);
        append_locked(&mut inner, txn.0, &WalRecord::Begin)?;
        inner.open_txns += 1;
        Ok(txn)
    }

    /// Stage a mutation record inside `txn`.
    pub fn append(&self, txn: TxnId, record: &WalRecord) -> FsResult<()> {
        let mut inner = self.inner.lock();
        append_locked(&mut inner, txn.0, record)
    }

    /// Write COMMIT and force everything to storage.
    pub fn commit(&self, txn: TxnId) -> FsResult<()> {
        let mut inner = self.inner.lock();
        append_locked(&mut inner, txn.0, &WalRecord::Commit)?;
        inner.file.sync_data()?;
        inner.open_txns = inner.open_txns.saturating_sub(1);
        Ok(())
    }

    /// Write ABORT; the transaction's staged records become dead weight
    /// until the next checkpoint truncates them.
    pub fn abort(&self, txn: TxnId) -> FsResult<()> {
        let mut inner = self.inner.lock();
        append_locked(&mut inner, txn.0, &WalRecord::Abort)?;
        inner.open_txns = inner.open_txns.saturating_sub(1);
        Ok(())
    }

    /// Record that the region reflects all committed state, then retire
    /// the replayed records.
    ///
    /// The caller guarantees quiescence (it holds the global tree write
    /// lock or is the only thread).
    pub fn checkpoint(&self) -> FsResult<()> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        append_locked(&mut inner, 0, &WalRecord::Checkpoint)?;
        inner.file.sync_data()?;

        inner.checkpoint_lsn = lsn;
        if inner.open_txns == 0 {
            // Nothing in flight: the whole record area is retired.
            inner.file.set_len(WAL_HEADER_LEN)?;
            inner.head_off = WAL_HEADER_LEN;
        }
        write_header_locked(&mut inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Mark the journal clean. Called after the final checkpoint of an
    /// unmount, or at the end of recovery.
    pub fn mark_clean(&self) -> FsResult<()> {
        let mut inner = self.inner.lock();
        inner.clean = true;
        write_header_locked(&mut inner)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Force pending journal bytes to storage (fsync surface).
    pub fn sync(&self) -> FsResult<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("needs_recovery", &self.needs_recovery)
            .finish()
    }
}

fn record_crc(header: &RecordHeader, payload: &[u8]) -> u32 {
    let mut unsummed = *header;
    unsummed.crc32 = U32::new(0);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(unsummed.as_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn padded_len(payload_len: usize) -> usize {
    // Record headers are 24 bytes, so padding the payload to 8 keeps every
    // record word-aligned.
    RECORD_HEADER_LEN + payload_len.div_ceil(8) * 8
}

fn append_locked(inner: &mut WalInner, txn_id: u32, record: &WalRecord) -> FsResult<()> {
    let payload = record.encode_payload();
    if payload.len() > MAX_PAYLOAD as usize {
        return Err(FsError::InvalidArgument);
    }
    let mut header = RecordHeader {
        length: U32::new(payload.len() as u32),
        lsn: U64::new(inner.next_lsn),
        txn_id: U32::new(txn_id),
        rtype: record.rtype().into(),
        reserved: [0; 3],
        crc32: U32::new(0),
    };
    header.crc32 = U32::new(record_crc(&header, &payload));

    let mut frame = Vec::with_capacity(padded_len(payload.len()));
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&payload);
    frame.resize(padded_len(payload.len()), 0);

    inner.file.seek(SeekFrom::Start(inner.head_off))?;
    inner.file.write_all(&frame)?;
    inner.head_off += frame.len() as u64;
    inner.next_lsn += 1;
    Ok(())
}

fn write_header_locked(inner: &mut WalInner) -> FsResult<()> {
    let flags = if inner.clean {
        WalFlags::CLEAN
    } else {
        WalFlags::empty()
    };
    let header = WalFileHeader {
        magic: WAL_MAGIC,
        version: U32::new(WAL_VERSION),
        head_lsn: U64::new(inner.next_lsn),
        tail_lsn: U64::new(inner.checkpoint_lsn),
        checkpoint_lsn: U64::new(inner.checkpoint_lsn),
        flags: U32::new(flags.bits()),
        reserved: [0; 28],
    };
    inner.file.seek(SeekFrom::Start(0))?;
    inner.file.write_all(header.as_bytes())?;
    Ok(())
}

struct ScanOutcome {
    records: Vec<ScannedRecord>,
    end_off: u64,
    max_lsn: u64,
    max_txn: u32,
    torn: bool,
}

fn scan_records(file: &mut File) -> FsResult<ScanOutcome> {
    let len = file.metadata()?.len();
    let mut outcome = ScanOutcome {
        records: Vec::new(),
        end_off: WAL_HEADER_LEN,
        max_lsn: 0,
        max_txn: 0,
        torn: false,
    };

    let mut off = WAL_HEADER_LEN;
    while off + RECORD_HEADER_LEN as u64 <= len {
        let mut head_buf = [0u8; RECORD_HEADER_LEN];
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(&mut head_buf)?;
        let Ok(header) = RecordHeader::read_from_bytes(&head_buf) else {
            outcome.torn = true;
            break;
        };
        let payload_len = header.length.get();
        let Ok(rtype) = RecordType::try_from(header.rtype) else {
            outcome.torn = true;
            break;
        };
        if payload_len > MAX_PAYLOAD {
            outcome.torn = true;
            break;
        }
        let frame_len = padded_len(payload_len as usize) as u64;
        if off + frame_len > len {
            outcome.torn = true;
            break;
        }
        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;
        if record_crc(&header, &payload) != header.crc32.get() {
            outcome.torn = true;
            break;
        }
        let Some(record) = WalRecord::decode(rtype, &payload) else {
            outcome.torn = true;
            break;
        };

        outcome.max_lsn = outcome.max_lsn.max(header.lsn.get());
        outcome.max_txn = outcome.max_txn.max(header.txn_id.get());
        outcome.records.push(ScannedRecord {
            lsn: header.lsn.get(),
            txn_id: header.txn_id.get(),
            record,
        });
        off += frame_len;
        outcome.end_off = off;
    }
    if !outcome.torn && outcome.end_off != len && len > WAL_HEADER_LEN {
        // Trailing partial header.
        outcome.torn = true;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn wal_path(dir: &TempDir) -> PathBuf {
        dir.path().join("razorfs.wal")
    }

    #[test]
    fn fresh_log_is_clean() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(&wal_path(&dir)).unwrap();
        assert!(!wal.needs_recovery());
        assert!(wal.records().unwrap().is_empty());
    }

    #[test]
    fn committed_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        {
            let wal = Wal::open(&path).unwrap();
            let txn = wal.begin().unwrap();
            wal.append(
                txn,
                &WalRecord::Insert {
                    parent: 0,
                    inode: 2,
                    mode: libc::S_IFREG as u32 | 0o644,
                    name: b"hello.txt".to_vec(),
                },
            )
            .unwrap();
            wal.commit(txn).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert!(wal.needs_recovery());
        let records = wal.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].record, WalRecord::Begin);
        assert!(matches!(records[1].record, WalRecord::Insert { inode: 2, .. }));
        assert_eq!(records[2].record, WalRecord::Commit);
        assert_eq!(records[0].txn_id, records[2].txn_id);
    }

    #[test]
    fn checkpoint_retires_records() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        {
            let wal = Wal::open(&path).unwrap();
            let txn = wal.begin().unwrap();
            wal.append(txn, &WalRecord::Delete { inode: 9 }).unwrap();
            wal.commit(txn).unwrap();
            wal.checkpoint().unwrap();
            wal.mark_clean().unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert!(!wal.needs_recovery());
        assert!(wal.records().unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        {
            let wal = Wal::open(&path).unwrap();
            let txn = wal.begin().unwrap();
            wal.append(
                txn,
                &WalRecord::Write {
                    inode: 5,
                    offset: 0,
                    data: vec![1, 2, 3],
                },
            )
            .unwrap();
            wal.commit(txn).unwrap();
        }
        // Simulate a torn append: half a record header of garbage.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 11]).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let records = wal.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records.last().unwrap().record, WalRecord::Commit);
    }

    #[test]
    fn corrupt_record_stops_the_scan() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        {
            let wal = Wal::open(&path).unwrap();
            let txn = wal.begin().unwrap();
            wal.append(txn, &WalRecord::Delete { inode: 1 }).unwrap();
            wal.append(txn, &WalRecord::Delete { inode: 2 }).unwrap();
            wal.commit(txn).unwrap();
        }
        // Flip a payload byte in the middle record.
        {
            let mut bytes = fs::read(&path).unwrap();
            let second_record_payload =
                WAL_HEADER_LEN as usize + padded_len(0) + RECORD_HEADER_LEN;
            bytes[second_record_payload] ^= 0xFF;
            fs::write(&path, &bytes).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let records = wal.records().unwrap();
        // BEGIN survives; the corrupted DELETE and everything after it is gone.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record, WalRecord::Begin);
    }

    #[test]
    fn update_mask_round_trips() {
        let record = WalRecord::Update {
            inode: 12,
            mode: None,
            size: Some(4096),
            mtime: Some(1_700_000_000),
        };
        let payload = record.encode_payload();
        let back = WalRecord::decode(RecordType::Update, &payload).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn refuses_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = wal_path(&dir);
        fs::write(&path, vec![0u8; 128]).unwrap();
        assert_eq!(Wal::open(&path).unwrap_err(), FsError::Io);
    }
}
