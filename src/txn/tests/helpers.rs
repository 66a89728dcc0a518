use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tempfile::TempDir;

use crate::cleaner::profile::UtilizationTracker;
use crate::db::{DatabaseImpl, DbRegistry};
use crate::evictor::{CacheBudget, InList};
use crate::lock::LockTable;
use crate::log::{FileManager, LnEntry, LogConfig, LogEntry, LogManager, Lsn};
use crate::tree::node::{Child, Slot, SlotSearch};
use crate::tree::{Tree, TreeContext, default_comparator};
use crate::txn::{Durability, TransactionConfig, Txn, TxnManager};

pub const DB_ID: u64 = 2;

/// Everything the transaction manager touches: log, lock table, one
/// registered database.
pub struct Harness {
    pub txns: TxnManager,
    pub ids: AtomicU64,
    pub locks: LockTable,
    pub registry: Arc<DbRegistry>,
    pub tree: Arc<Tree>,
    pub log: Arc<LogManager>,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let files = FileManager::open(dir.path(), false, true).unwrap();
    let tracker = Arc::new(UtilizationTracker::new());
    let log = Arc::new(
        LogManager::open(files, LogConfig::default(), Arc::clone(&tracker), false).unwrap(),
    );
    let ctx = TreeContext {
        log: Arc::clone(&log),
        tracker,
        cache: Arc::new(CacheBudget::new(64 * 1024 * 1024)),
        inlist: Arc::new(InList::new()),
        node_ids: Arc::new(AtomicU64::new(1)),
        generation: Arc::new(AtomicU64::new(1)),
    };
    let tree = Arc::new(Tree::new(
        DB_ID,
        ctx,
        16,
        default_comparator(),
        default_comparator(),
    ));
    let registry = Arc::new(DbRegistry::new());
    registry.insert(Arc::new(DatabaseImpl {
        id: DB_ID,
        name: Mutex::new("txn-db".to_string()),
        tree: Arc::clone(&tree),
        sorted_duplicates: false,
        transactional: true,
        triggers: RwLock::new(Vec::new()),
        foreign_links: RwLock::new(Vec::new()),
    }));
    Harness {
        txns: TxnManager::new(),
        ids: AtomicU64::new(1),
        locks: LockTable::new(),
        registry,
        tree,
        log,
        _dir: dir,
    }
}

impl Harness {
    /// Begin with buffered durability and a short lock wait.
    pub fn begin(&self) -> Arc<Txn> {
        self.txns
            .begin(
                &self.ids,
                &self.log,
                (Durability::NoSync, Duration::from_millis(100)),
                &TransactionConfig::default(),
            )
            .unwrap()
    }
}

/// Insert a committed base record; returns `(leaf node id, record LSN)`.
pub fn put(tree: &Arc<Tree>, key: &[u8], value: &[u8]) -> (u64, Lsn) {
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
                value: value.to_vec(),
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
            child: Child::Ln(value.to_vec()),
            known_deleted: false,
            dirty: true,
        },
    );
    tree.recharge(&bin);
    (node_id, lsn)
}

/// Overwrite a record under a transaction (log + slot update, no locks).
/// Returns the new LSN.
pub fn overwrite(tree: &Arc<Tree>, txn_id: u64, key: &[u8], value: &[u8]) -> Lsn {
    let (mut bin, pos) = tree.search_position(key).unwrap().unwrap();
    let SlotSearch::Exact(idx) = pos else {
        panic!("key {key:?} not found");
    };
    let abort_lsn = bin.slots[idx].lsn;
    let lsn = tree
        .ctx
        .log
        .append(
            &LogEntry::Ln(LnEntry {
                db_id: tree.db_id,
                node_id: bin.slots[idx].child_id,
                key: key.to_vec(),
                value: value.to_vec(),
                deleted: false,
                abort_lsn,
                abort_known_deleted: false,
            }),
            false,
            txn_id,
        )
        .unwrap();
    let slot = &mut bin.slots[idx];
    slot.lsn = Some(lsn);
    slot.child = Child::Ln(value.to_vec());
    slot.dirty = true;
    bin.dirty = true;
    lsn
}

/// The current slot state for a key: `(lsn, known_deleted)`.
pub fn slot_state(tree: &Arc<Tree>, key: &[u8]) -> (Option<Lsn>, bool) {
    let (bin, pos) = tree.search_position(key).unwrap().unwrap();
    let SlotSearch::Exact(idx) = pos else {
        panic!("key {key:?} not found");
    };
    (bin.slots[idx].lsn, bin.slots[idx].known_deleted)
}

/// Types of every record currently in the log.
pub fn record_types(log: &LogManager) -> Vec<crate::log::LogEntryType> {
    log.iter_from(None)
        .unwrap()
        .map(|item| item.unwrap().1.ty)
        .collect()
}
