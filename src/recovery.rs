//! Mount-time recovery.
//!
//! The shared-memory region is an optimistic cache of the state the
//! journal implies. On attach, committed transactions since the last
//! checkpoint are replayed idempotently, then the tree invariants are
//! verified and repaired: dangling child references are purged, orphaned
//! nodes are reattached under `/lost+found`, the free list and the block
//! bitmap are rebuilt from reachability.

use std::collections::HashMap;
use std::collections::VecDeque;

use log::info;
use log::warn;

use crate::arena::INVALID;
use crate::arena::MAX_CHILDREN;
use crate::arena::ROOT_INDEX;
use crate::errors::FsError;
use crate::errors::FsResult;
use crate::payload::PayloadStore;
use crate::region::RegionFlags;
use crate::tree::DeleteKind;
use crate::tree::NodeUpdate;
use crate::tree::Tree;
use crate::wal::Wal;
use crate::wal::WalRecord;

/// What recovery did, for the mount log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    /// Committed transactions re-applied from the journal.
    pub replayed_txns: usize,
    /// Orphaned nodes reattached under `/lost+found`.
    pub reattached: usize,
    /// Dangling or duplicate references purged.
    pub purged: usize,
}

impl RecoveryReport {
    fn is_quiet(&self) -> bool {
        self.replayed_txns == 0 && self.reattached == 0 && self.purged == 0
    }
}

/// Run recovery for a freshly attached region.
///
/// Skips entirely when the region carries the clean-shutdown flag and the
/// journal has nothing unapplied. Runs single-threaded, before the
/// dispatcher starts serving.
pub fn run(tree: &Tree, payload: &PayloadStore, wal: Option<&Wal>) -> FsResult<RecoveryReport> {
    let clean = tree
        .region
        .flags()
        .contains(RegionFlags::CLEAN_SHUTDOWN);
    let wal_dirty = wal.map(Wal::needs_recovery).unwrap_or(false);
    if clean && !wal_dirty {
        return Ok(RecoveryReport::default());
    }

    let mut report = RecoveryReport::default();
    if let Some(wal) = wal {
        report.replayed_txns = replay(tree, payload, wal)?;
    }
    let (reattached, purged) = repair(tree, payload)?;
    report.reattached = reattached;
    report.purged = purged;

    tree.rebuild_inode_map();
    payload.rebuild(tree);

    if report.is_quiet() {
        info!("recovery: region verified, nothing to repair");
    } else {
        info!(
            "recovery: replayed {} transaction(s), reattached {}, purged {}",
            report.replayed_txns, report.reattached, report.purged
        );
    }
    Ok(report)
}

/// Replay committed transactions in log order.
fn replay(tree: &Tree, payload: &PayloadStore, wal: &Wal) -> FsResult<usize> {
    let records = wal.records()?;
    let mut pending: HashMap<u32, Vec<WalRecord>> = HashMap::new();
    let mut replayed = 0usize;

    for scanned in records {
        match scanned.record {
            WalRecord::Begin => {
                pending.insert(scanned.txn_id, Vec::new());
            }
            WalRecord::Commit => {
                if let Some(mutations) = pending.remove(&scanned.txn_id) {
                    for mutation in &mutations {
                        apply(tree, payload, mutation);
                    }
                    replayed += 1;
                }
            }
            WalRecord::Abort => {
                pending.remove(&scanned.txn_id);
            }
            WalRecord::Checkpoint => {}
            mutation => {
                pending
                    .entry(scanned.txn_id)
                    .or_default()
                    .push(mutation);
            }
        }
    }
    // Transactions with a BEGIN but no COMMIT died with the process;
    // their staged records are discarded.
    Ok(replayed)
}

/// Apply one committed mutation against whatever state survived.
///
/// Each arm is a no-op when the region already reflects the record.
fn apply(tree: &Tree, payload: &PayloadStore, record: &WalRecord) {
    match record {
        WalRecord::Insert {
            parent,
            inode,
            mode,
            name,
        } => {
            let outcome = match existing_index(tree, *inode) {
                // The node survived and is already linked somewhere:
                // trust the region over a possibly stale parent index.
                Some(idx) if is_attached(tree, idx) => Ok(()),
                // The node survived unlinked; link it where the log says
                // it belongs.
                Some(idx) => tree.relink(idx, *parent, name),
                None => tree
                    .insert_at(*parent, name, *mode, *inode, |_| Ok(()))
                    .map(|_| ()),
            };
            match outcome {
                Ok(()) | Err(FsError::Exists) => {}
                Err(err) => warn!("replay: insert of inode {inode} not applied: {err}"),
            }
        }
        WalRecord::Delete { inode } => match tree.delete_by_inode(*inode) {
            Ok(Some(node)) => payload.release(&node),
            Ok(None) => {}
            Err(err) => warn!("replay: delete of inode {inode} not applied: {err}"),
        },
        WalRecord::Update {
            inode,
            mode,
            size,
            mtime,
        } => {
            if existing_index(tree, *inode).is_none() {
                return;
            }
            if let Some(size) = size {
                if let Err(err) = payload.truncate(tree, *inode, *size) {
                    warn!("replay: truncate of inode {inode} not applied: {err}");
                }
            }
            if mode.is_some() || mtime.is_some() {
                let update = NodeUpdate {
                    mode: *mode,
                    size: None,
                    mtime: *mtime,
                };
                if let Err(err) = tree.update(*inode, update, |_| Ok(())) {
                    warn!("replay: update of inode {inode} not applied: {err}");
                }
            }
        }
        WalRecord::Write {
            inode,
            offset,
            data,
        } => {
            if existing_index(tree, *inode).is_none() {
                return;
            }
            if let Err(err) = payload.write(tree, *inode, *offset, data) {
                warn!("replay: write to inode {inode} not applied: {err}");
            }
        }
        WalRecord::Rename {
            inode,
            parent: _,
            new_name,
        } => {
            // Reconcile from current state: the node knows its parent.
            let Some(_) = existing_index(tree, *inode) else {
                return;
            };
            let Ok(node) = tree.node_by_inode(*inode) else {
                return;
            };
            let Ok(old_name) = tree.strtab.get(node.name_offset) else {
                return;
            };
            if old_name == *new_name || node.parent == INVALID {
                return;
            }
            match tree.rename_child_at(node.parent, &old_name, new_name, |_, _| Ok(())) {
                Ok(()) | Err(FsError::Exists) | Err(FsError::NotFound) => {}
                Err(err) => warn!("replay: rename of inode {inode} not applied: {err}"),
            }
        }
        WalRecord::Begin
        | WalRecord::Commit
        | WalRecord::Abort
        | WalRecord::Checkpoint => {}
    }
}

fn existing_index(tree: &Tree, inode: u32) -> Option<u32> {
    let _g = tree.read_guard();
    tree.index_unguarded(inode).ok()
}

/// Whether the node at `idx` is linked into its recorded parent.
fn is_attached(tree: &Tree, idx: u32) -> bool {
    let node = tree.arena.get(idx);
    if node.parent == INVALID || node.parent >= tree.arena.capacity() {
        return false;
    }
    is_linked(tree, idx, node.parent)
}

/// Verify the structural invariants and repair what replay could not.
///
/// Returns `(reattached, purged)`.
fn repair(tree: &Tree, payload: &PayloadStore) -> FsResult<(usize, usize)> {
    let arena = &tree.arena;
    let used = arena.used();
    let capacity = arena.capacity();
    let mut purged = 0usize;

    // The root is not repairable; without it there is no tree.
    let root = arena.get(ROOT_INDEX);
    if used == 0 || !root.is_live() || !root.is_dir() {
        warn!("recovery: root node is damaged");
        return Err(FsError::Io);
    }
    if root.parent != INVALID {
        let mut fixed = root;
        fixed.parent = INVALID;
        arena.set(ROOT_INDEX, &fixed);
    }

    // Pass 1: forward pointers win. Every directory keeps only child
    // entries that point at live, unclaimed nodes; the child's parent
    // backref is rewritten to match.
    let mut claimed = vec![false; used as usize];
    claimed[ROOT_INDEX as usize] = true;
    for idx in 0..used {
        let node = arena.get(idx);
        if !node.is_live() || !node.is_dir() {
            continue;
        }
        let mut kept: Vec<u32> = Vec::with_capacity(MAX_CHILDREN);
        let mut seen_names: Vec<u32> = Vec::with_capacity(MAX_CHILDREN);
        for slot in 0..(node.num_children as usize).min(MAX_CHILDREN) {
            let child_idx = node.children[slot];
            if child_idx == INVALID
                || child_idx >= used.min(capacity)
                || child_idx == idx
                || claimed[child_idx as usize]
            {
                purged += 1;
                continue;
            }
            let mut child = arena.get(child_idx);
            if !child.is_live() {
                purged += 1;
                continue;
            }
            if seen_names.contains(&child.name_offset) {
                // Duplicate sibling name: the later entry is unlinked and
                // will be swept up as an orphan.
                purged += 1;
                continue;
            }
            seen_names.push(child.name_offset);
            claimed[child_idx as usize] = true;
            if child.parent != idx {
                child.parent = idx;
                arena.set(child_idx, &child);
            }
            kept.push(child_idx);
        }
        if kept.len() != node.num_children as usize
            || kept[..] != node.children[..kept.len()]
        {
            let mut fixed = node;
            fixed.children = [INVALID; MAX_CHILDREN];
            fixed.children[..kept.len()].copy_from_slice(&kept);
            fixed.num_children = kept.len() as u16;
            arena.set(idx, &fixed);
        }
    }

    // Pass 2: reachability from the root.
    let mut visited = vec![false; used as usize];
    mark_subtree(tree, ROOT_INDEX, &mut visited);

    // Pass 3: orphans are reattached under /lost+found; each reattached
    // subtree is then marked so its descendants are not reattached twice.
    let mut reattached = 0usize;
    let mut lost_found: Option<u32> = None;
    let mut lost_found_failed = false;
    for idx in 0..used {
        if visited[idx as usize] {
            continue;
        }
        let node = arena.get(idx);
        if !node.is_live() {
            continue;
        }
        if lost_found.is_none() && !lost_found_failed {
            match ensure_lost_found(tree) {
                Ok(lf) => {
                    // lost+found may itself have just been created past
                    // the original scan window; never treat it as an
                    // orphan.
                    if (lf as usize) < visited.len() {
                        visited[lf as usize] = true;
                    }
                    lost_found = Some(lf);
                }
                Err(err) => {
                    warn!("recovery: cannot create /lost+found: {err}");
                    lost_found_failed = true;
                }
            }
        }

        let kept = match lost_found {
            Some(lf_idx) => reattach(tree, idx, lf_idx).is_ok(),
            None => false,
        };
        if kept {
            reattached += 1;
            mark_subtree(tree, idx, &mut visited);
        } else {
            // No home for the orphan: it is dropped outright.
            warn!("recovery: dropping unreachable inode {}", node.inode);
            let dead_lock = arena.write_lock(idx);
            arena.free(idx);
            drop(dead_lock);
            visited[idx as usize] = true;
            purged += 1;
        }
    }

    // Pass 4: payload extents must stay inside the pool and must not
    // overlap; the later claimant loses its content.
    let mut block_owner: HashMap<u32, u32> = HashMap::new();
    for idx in 0..used {
        let node = arena.get(idx);
        if !node.is_live() || node.is_dir() || node.data_blocks == 0 {
            continue;
        }
        let in_range = node
            .data_start
            .checked_add(node.data_blocks)
            .is_some_and(|end| end <= payload.total_blocks());
        let mut overlaps = false;
        if in_range {
            for block in node.data_start..node.data_start + node.data_blocks {
                if block_owner.insert(block, idx).is_some() {
                    overlaps = true;
                }
            }
        }
        if !in_range || overlaps {
            warn!(
                "recovery: discarding damaged payload extent of inode {}",
                node.inode
            );
            let mut fixed = node;
            fixed.data_start = 0;
            fixed.data_blocks = 0;
            fixed.storage_bytes = 0;
            fixed.flags = 0;
            fixed.size = 0;
            arena.set(idx, &fixed);
            purged += 1;
        }
    }

    // Pass 5: the free list must contain exactly the dead slots.
    arena.rebuild_free_list();

    Ok((reattached, purged))
}

/// BFS from `start`, marking every reachable slot. Links to already
/// visited nodes are cut (they are owned elsewhere).
fn mark_subtree(tree: &Tree, start: u32, visited: &mut [bool]) {
    let arena = &tree.arena;
    let mut queue = VecDeque::from([start]);
    if (start as usize) < visited.len() {
        visited[start as usize] = true;
    }
    while let Some(idx) = queue.pop_front() {
        let node = arena.get(idx);
        let mut kept: Vec<u32> = Vec::with_capacity(MAX_CHILDREN);
        let mut changed = false;
        for slot in 0..node.num_children as usize {
            let child_idx = node.children[slot];
            if child_idx == INVALID || child_idx as usize >= visited.len() {
                changed = true;
                continue;
            }
            if visited[child_idx as usize] {
                changed = true;
                continue;
            }
            visited[child_idx as usize] = true;
            kept.push(child_idx);
            queue.push_back(child_idx);
        }
        if changed {
            let mut fixed = node;
            fixed.children = [INVALID; MAX_CHILDREN];
            fixed.children[..kept.len()].copy_from_slice(&kept);
            fixed.num_children = kept.len() as u16;
            arena.set(idx, &fixed);
        }
    }
}

/// Find or create `/lost+found`, returning its arena index.
fn ensure_lost_found(tree: &Tree) -> FsResult<u32> {
    if let Ok(node) = tree.lookup_child(crate::tree::ROOT_INODE, b"lost+found") {
        if node.is_dir() {
            let _g = tree.read_guard();
            return tree.index_unguarded(node.inode);
        }
        // A file squatting on the name moves aside as an orphan would.
        tree.delete_child(
            crate::tree::ROOT_INODE,
            b"lost+found",
            DeleteKind::File,
            |_| Ok(()),
        )?;
    }
    let inode = tree.alloc_inode();
    tree.insert_at(
        ROOT_INDEX,
        b"lost+found",
        libc::S_IFDIR as u32 | 0o700,
        inode,
        |_| Ok(()),
    )?;
    let _g = tree.read_guard();
    tree.index_unguarded(inode)
}

/// Attach the orphan at `idx` to `lost_found_idx`, renaming on collision.
fn reattach(tree: &Tree, idx: u32, lost_found_idx: u32) -> FsResult<()> {
    let node = tree.arena.get(idx);
    let name = tree.strtab.get(node.name_offset).unwrap_or_default();
    if !name.is_empty() {
        tree.relink(idx, lost_found_idx, &name)?;
        if is_linked(tree, idx, lost_found_idx) {
            return Ok(());
        }
    }
    // Name collision or unreadable name: fall back to a unique one.
    let unique = format!("orphan-{}", node.inode).into_bytes();
    tree.relink(idx, lost_found_idx, &unique)?;
    if is_linked(tree, idx, lost_found_idx) {
        Ok(())
    } else {
        Err(FsError::NoSpace)
    }
}

fn is_linked(tree: &Tree, idx: u32, parent_idx: u32) -> bool {
    let parent = tree.arena.get(parent_idx);
    parent.children[..parent.num_children as usize].contains(&idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::RawNode;
    use crate::config::Settings;
    use crate::region::Region;
    use crate::test_support::unique_region_name;
    use crate::tree::ROOT_INODE;

    const DIR_MODE: u32 = libc::S_IFDIR as u32 | 0o755;
    const FILE_MODE: u32 = libc::S_IFREG as u32 | 0o644;

    fn setup(name: &str) -> (Tree, PayloadStore, String) {
        let region_name = unique_region_name(name);
        let settings = Settings {
            region_name: region_name.clone(),
            node_capacity: 64,
            string_capacity: 8192,
            data_capacity: 256 * 1024,
            ..Settings::default()
        };
        let (region, _) = Region::open_or_create(&settings).unwrap();
        let tree = Tree::attach(region.clone()).unwrap();
        let payload = PayloadStore::attach(region, 65536, &tree);
        (tree, payload, region_name)
    }

    fn index_of(tree: &Tree, inode: u32) -> u32 {
        let _g = tree.read_guard();
        tree.index_unguarded(inode).unwrap()
    }

    #[test]
    fn orphan_is_reattached_under_lost_found() {
        let (tree, payload, region_name) = setup("recovery-orphan");
        let dir = tree
            .insert(ROOT_INODE, b"a", DIR_MODE, tree.alloc_inode(), |_| Ok(()))
            .unwrap();
        let file = tree
            .insert(dir.inode, b"b", FILE_MODE, tree.alloc_inode(), |_| Ok(()))
            .unwrap();

        // Sever the link the way a crash mid-unlink would: the child
        // stays live but no directory claims it.
        let dir_idx = index_of(&tree, dir.inode);
        let mut damaged = tree.arena.get(dir_idx);
        damaged.children = [crate::arena::INVALID; MAX_CHILDREN];
        damaged.num_children = 0;
        tree.arena.set(dir_idx, &damaged);

        let report = run(&tree, &payload, None).unwrap();
        assert_eq!(report.reattached, 1);
        let found = tree.path_lookup("/lost+found/b").unwrap();
        assert_eq!(found, file.inode);
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn dangling_child_reference_is_purged() {
        let (tree, payload, region_name) = setup("recovery-dangling");
        let file = tree
            .insert(ROOT_INODE, b"f", FILE_MODE, tree.alloc_inode(), |_| Ok(()))
            .unwrap();

        // Kill the child slot behind the parent's back.
        let idx = index_of(&tree, file.inode);
        tree.arena.set(idx, &RawNode::empty());

        let report = run(&tree, &payload, None).unwrap();
        assert!(report.purged >= 1);
        assert_eq!(
            tree.lookup_child(ROOT_INODE, b"f").unwrap_err(),
            FsError::NotFound
        );
        Region::destroy(&region_name).unwrap();
    }

    #[test]
    fn clean_region_skips_recovery() {
        let (tree, payload, region_name) = setup("recovery-clean");
        tree.insert(ROOT_INODE, b"kept", FILE_MODE, tree.alloc_inode(), |_| Ok(()))
            .unwrap();
        tree.region.set_flags(RegionFlags::CLEAN_SHUTDOWN);

        let report = run(&tree, &payload, None).unwrap();
        assert_eq!(report.reattached + report.purged, 0);
        assert!(tree.lookup_child(ROOT_INODE, b"kept").is_ok());
        Region::destroy(&region_name).unwrap();
    }
}
