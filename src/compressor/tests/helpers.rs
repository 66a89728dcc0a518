use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};

use tempfile::TempDir;

use crate::cleaner::profile::UtilizationTracker;
use crate::compressor::{BinRefQueue, Compressor};
use crate::db::{DatabaseImpl, DbRegistry};
use crate::evictor::{CacheBudget, InList};
use crate::log::{FileManager, LnEntry, LogConfig, LogEntry, LogManager};
use crate::tree::node::{Child, NodeId, Slot, SlotSearch};
use crate::tree::{Tree, TreeContext, default_comparator};

pub const DB_ID: u64 = 2;

/// One registered database plus the worker and its queue.
pub struct Harness {
    pub tree: Arc<Tree>,
    pub queue: Arc<BinRefQueue>,
    pub compressor: Compressor,
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
    let tree = Arc::new(Tree::new(
        DB_ID,
        ctx,
        max_entries,
        default_comparator(),
        default_comparator(),
    ));
    let registry = Arc::new(DbRegistry::new());
    registry.insert(Arc::new(DatabaseImpl {
        id: DB_ID,
        name: Mutex::new("comp-db".to_string()),
        tree: Arc::clone(&tree),
        sorted_duplicates: false,
        transactional: false,
        triggers: RwLock::new(Vec::new()),
        foreign_links: RwLock::new(Vec::new()),
    }));
    let queue = Arc::new(BinRefQueue::new());
    let compressor = Compressor::new(registry, Arc::clone(&queue));
    Harness {
        tree,
        queue,
        compressor,
        _dir: dir,
    }
}

/// Insert a record (logged, resident value).
pub fn put(tree: &Arc<Tree>, key: &[u8]) {
    let (mut bin, pos) = tree.insert_position(key).unwrap();
    let SlotSearch::Insert(idx) = pos else {
        panic!("duplicate insert in helper");
    };
    let node_id = tree.ctx.next_node_id();
    let lsn = tree
        .ctx
        .log
        .append(
            &LogEntry::Ln(LnEntry {
                db_id: tree.db_id,
                node_id,
                key: key.to_vec(),
                value: b"v".to_vec(),
                deleted: false,
                abort_lsn: None,
                abort_known_deleted: false,
            }),
            false,
            0,
        )
        .unwrap();
    bin.insert_slot(
        idx,
        Slot {
            key: key.to_vec(),
            child_id: node_id,
            lsn: Some(lsn),
            child: Child::Ln(b"v".to_vec()),
            known_deleted: false,
            dirty: true,
        },
    );
    tree.recharge(&bin);
}

/// Mark a record known-deleted (the cursor layer's delete, minus locking
/// and logging) and return the bottom node that holds it.
pub fn mark_deleted(tree: &Arc<Tree>, key: &[u8]) -> NodeId {
    let (mut bin, pos) = tree.search_position(key).unwrap().unwrap();
    let SlotSearch::Exact(idx) = pos else {
        panic!("key {key:?} not found");
    };
    bin.slots[idx].known_deleted = true;
    bin.slots[idx].child = Child::None;
    bin.dirty = true;
    bin.id
}

/// Count live (non-deleted) slots reachable from the root.
pub fn live_count(tree: &Arc<Tree>) -> usize {
    let Some(root) = tree.root_cell().unwrap() else {
        return 0;
    };
    let mut queue = vec![root];
    let mut count = 0;
    while let Some(cell) = queue.pop() {
        let mut guard = cell.write(tree.ctx.next_generation());
        if guard.kind.is_bottom() {
            count += guard.live_slots();
        } else {
            for i in 0..guard.slots.len() {
                let child = tree.fetch_child(&mut guard, i).unwrap();
                queue.push(child);
            }
        }
    }
    count
}
