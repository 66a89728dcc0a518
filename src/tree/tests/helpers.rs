use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tempfile::TempDir;

use crate::cleaner::profile::UtilizationTracker;
use crate::evictor::{CacheBudget, InList};
use crate::log::{FileManager, LnEntry, LogConfig, LogEntry, LogManager};
use crate::tree::node::{Child, Slot, SlotSearch};
use crate::tree::{Tree, TreeContext, default_comparator};

/// A tree over a real log in a temporary directory.
pub struct Harness {
    pub tree: Arc<Tree>,
    _dir: TempDir,
}

pub fn harness(max_entries: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let files = FileManager::open(dir.path(), false, true).unwrap();
    let tracker = Arc::new(UtilizationTracker::new());
    let log = Arc::new(
        LogManager::open(files, LogConfig::default(), Arc::clone(&tracker), false).unwrap(),
    );
    let ctx = TreeContext {
        log,
        tracker,
        cache: Arc::new(CacheBudget::new(64 * 1024 * 1024)),
        inlist: Arc::new(InList::new()),
        node_ids: Arc::new(AtomicU64::new(1)),
        generation: Arc::new(AtomicU64::new(1)),
    };
    Harness {
        tree: Arc::new(Tree::new(
            2,
            ctx,
            max_entries,
            default_comparator(),
            default_comparator(),
        )),
        _dir: dir,
    }
}

/// Insert a record the way the cursor layer does, minus locking.
pub fn put(tree: &Arc<Tree>, key: &[u8], value: &[u8]) {
    let (mut bin, pos) = tree.insert_position(key).unwrap();
    let node_id = tree.ctx.next_node_id();
    let lsn = tree
        .ctx
        .log
        .append(
            &LogEntry::Ln(LnEntry {
                db_id: tree.db_id,
                node_id,
                key: key.to_vec(),
                value: value.to_vec(),
                deleted: false,
                abort_lsn: None,
                abort_known_deleted: false,
            }),
            false,
            0,
        )
        .unwrap();
    match pos {
        SlotSearch::Exact(idx) => {
            let slot = &mut bin.slots[idx];
            slot.lsn = Some(lsn);
            slot.child = Child::Ln(value.to_vec());
            slot.known_deleted = false;
            slot.dirty = true;
        }
        SlotSearch::Insert(idx) => {
            bin.insert_slot(
                idx,
                Slot {
                    key: key.to_vec(),
                    child_id: node_id,
                    lsn: Some(lsn),
                    child: Child::Ln(value.to_vec()),
                    known_deleted: false,
                    dirty: true,
                },
            );
        }
    }
    tree.recharge(&bin);
}

/// Every key in order, via edge + next traversal.
pub fn collect_keys(tree: &Arc<Tree>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let Some((guard, idx)) = tree.first_position().unwrap() else {
        return out;
    };
    let mut anchor = guard.slots[idx].key.clone();
    out.push(anchor.clone());
    drop(guard);
    while let Some((guard, idx)) = tree.next_position(&anchor, false).unwrap() {
        anchor = guard.slots[idx].key.clone();
        out.push(anchor.clone());
    }
    out
}
