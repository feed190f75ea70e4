//! Crash-window recovery: the region is reattached after simulated
//! process death at every interesting point in the journal protocol.

mod common;

use razorfs::FsError;
use razorfs::ROOT_INODE;
use razorfs::RazorFs;
use razorfs::Region;
use razorfs::Wal;
use razorfs::WalRecord;
use tempfile::TempDir;

use crate::common::small_settings;
use crate::common::unique_region_name;

const FILE_MODE: u32 = libc::S_IFREG as u32 | 0o644;

/// Kill after WAL.append but before WAL.commit: the staged operation
/// must not exist after remount.
#[test]
fn crash_before_commit_discards_the_operation() {
    let region_name = unique_region_name("crash-precommit");
    let wal_dir = TempDir::new().unwrap();
    let wal_path = wal_dir.path().join("razorfs.wal");
    let mut settings = small_settings(&region_name);
    settings.wal_path = Some(wal_path.clone());

    {
        let fs = RazorFs::new(settings.clone()).unwrap();
        fs.create_dir(ROOT_INODE, b"a", 0o755).unwrap();
        // Dropped without shutdown: the simulated process death.
    }

    // Re-stage what the dispatcher would have written for
    // write("/a/x", "data"), stopping short of the commit. The fresh
    // region put /a at arena index 1 (the root holds index 0).
    {
        let wal = Wal::open(&wal_path).unwrap();
        let txn = wal.begin().unwrap();
        wal.append(
            txn,
            &WalRecord::Insert {
                parent: 1,
                inode: 100,
                mode: FILE_MODE,
                name: b"x".to_vec(),
            },
        )
        .unwrap();
        wal.append(
            txn,
            &WalRecord::Write {
                inode: 100,
                offset: 0,
                data: b"data".to_vec(),
            },
        )
        .unwrap();
        // No commit.
    }

    let fs = RazorFs::new(settings).unwrap();
    assert!(!fs.is_read_only());
    let a = fs.tree().lookup_child(ROOT_INODE, b"a").unwrap();
    assert_eq!(
        fs.tree().lookup_child(a.inode, b"x").unwrap_err(),
        FsError::NotFound
    );
    fs.shutdown();
    Region::destroy(&region_name).unwrap();
}

/// Kill after WAL.commit but before the region was touched: replay must
/// reconstruct the operation.
#[test]
fn crash_after_commit_replays_the_operation() {
    let region_name = unique_region_name("crash-postcommit");
    let wal_dir = TempDir::new().unwrap();
    let wal_path = wal_dir.path().join("razorfs.wal");
    let mut settings = small_settings(&region_name);
    settings.wal_path = Some(wal_path.clone());

    {
        let fs = RazorFs::new(settings.clone()).unwrap();
        fs.create_dir(ROOT_INODE, b"a", 0o755).unwrap();
    }

    {
        let wal = Wal::open(&wal_path).unwrap();
        let txn = wal.begin().unwrap();
        wal.append(
            txn,
            &WalRecord::Insert {
                parent: 1,
                inode: 100,
                mode: FILE_MODE,
                name: b"x".to_vec(),
            },
        )
        .unwrap();
        wal.append(
            txn,
            &WalRecord::Write {
                inode: 100,
                offset: 0,
                data: b"data".to_vec(),
            },
        )
        .unwrap();
        wal.commit(txn).unwrap();
    }

    let fs = RazorFs::new(settings).unwrap();
    let inode = fs.tree().path_lookup("/a/x").unwrap();
    assert_eq!(inode, 100);
    assert_eq!(fs.read_at(inode, 0, 64).unwrap(), b"data");
    fs.shutdown();
    Region::destroy(&region_name).unwrap();
}

/// A committed operation that also survived in the region must not be
/// applied twice.
#[test]
fn replay_is_idempotent_when_region_survived() {
    let region_name = unique_region_name("replay-idempotent");
    let wal_dir = TempDir::new().unwrap();
    let mut settings = small_settings(&region_name);
    settings.wal_path = Some(wal_dir.path().join("razorfs.wal"));

    {
        let fs = RazorFs::new(settings.clone()).unwrap();
        let dir = fs.create_dir(ROOT_INODE, b"d", 0o755).unwrap();
        let file = fs.create_file(dir.inode, b"f", 0o644).unwrap();
        fs.write_at(file.inode, 0, b"payload").unwrap();
        // Crash: region fully applied, journal not yet checkpointed.
    }

    let fs = RazorFs::new(settings).unwrap();
    let dir = fs.tree().lookup_child(ROOT_INODE, b"d").unwrap();
    // Exactly one "d", exactly one "f".
    assert_eq!(fs.tree().readdir(ROOT_INODE).unwrap().len(), 1);
    assert_eq!(fs.tree().readdir(dir.inode).unwrap().len(), 1);
    let inode = fs.tree().path_lookup("/d/f").unwrap();
    assert_eq!(fs.read_at(inode, 0, 64).unwrap(), b"payload");
    fs.shutdown();
    Region::destroy(&region_name).unwrap();
}

/// A torn record at the journal tail is treated as never written.
#[test]
fn torn_tail_does_not_block_mounting() {
    use std::fs::OpenOptions;
    use std::io::Write;

    let region_name = unique_region_name("torn-tail");
    let wal_dir = TempDir::new().unwrap();
    let wal_path = wal_dir.path().join("razorfs.wal");
    let mut settings = small_settings(&region_name);
    settings.wal_path = Some(wal_path.clone());

    {
        let fs = RazorFs::new(settings.clone()).unwrap();
        fs.create_file(ROOT_INODE, b"kept", 0o644).unwrap();
    }
    {
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[0x5A; 17]).unwrap();
    }

    let fs = RazorFs::new(settings).unwrap();
    assert!(!fs.is_read_only());
    assert!(fs.tree().lookup_child(ROOT_INODE, b"kept").is_ok());
    fs.shutdown();
    Region::destroy(&region_name).unwrap();
}

/// Deleting and re-creating under a crash window replays cleanly.
#[test]
fn delete_then_crash_replays_the_delete() {
    let region_name = unique_region_name("crash-delete");
    let wal_dir = TempDir::new().unwrap();
    let wal_path = wal_dir.path().join("razorfs.wal");
    let mut settings = small_settings(&region_name);
    settings.wal_path = Some(wal_path.clone());

    let victim_inode;
    {
        let fs = RazorFs::new(settings.clone()).unwrap();
        let node = fs.create_file(ROOT_INODE, b"victim", 0o644).unwrap();
        victim_inode = node.inode;
        fs.shutdown();
    }

    // A committed delete the region never saw.
    {
        let wal = Wal::open(&wal_path).unwrap();
        let txn = wal.begin().unwrap();
        wal.append(
            txn,
            &WalRecord::Delete {
                inode: victim_inode,
            },
        )
        .unwrap();
        wal.commit(txn).unwrap();
    }

    let fs = RazorFs::new(settings).unwrap();
    assert_eq!(
        fs.tree().lookup_child(ROOT_INODE, b"victim").unwrap_err(),
        FsError::NotFound
    );
    fs.shutdown();
    Region::destroy(&region_name).unwrap();
}

/// Without a journal, an unclean detach still mounts; the invariant
/// sweep repairs what it can and keeps the intact part of the tree.
#[test]
fn non_durable_unclean_detach_recovers_structure() {
    let region_name = unique_region_name("non-durable-crash");
    let settings = small_settings(&region_name);

    {
        let fs = RazorFs::new(settings.clone()).unwrap();
        let dir = fs.create_dir(ROOT_INODE, b"d", 0o755).unwrap();
        fs.create_file(dir.inode, b"f", 0o644).unwrap();
        // No shutdown: clean flag stays unset.
    }

    let fs = RazorFs::new(settings).unwrap();
    assert!(fs.tree().path_lookup("/d/f").is_ok());
    fs.shutdown();
    Region::destroy(&region_name).unwrap();
}
