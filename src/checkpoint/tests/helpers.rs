use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::cleaner::profile::UtilizationTracker;
use crate::compressor::BinRefQueue;
use crate::db::{DatabaseImpl, DbRegistry};
use crate::env::{EnvCore, EnvironmentConfig, FIRST_USER_DB_ID};
use crate::evictor::{CacheBudget, InList};
use crate::lock::LockTable;
use crate::log::{
    FileManager, LnEntry, LogConfig, LogEntry, LogManager, Lsn, RecordHeader,
};
use crate::tree::node::{Child, Slot, SlotSearch};
use crate::tree::{Tree, TreeContext};
use crate::txn::TxnManager;

/// A full environment core over a temporary directory, with one database
/// registered — everything `run_checkpoint` touches.
pub struct Harness {
    pub core: Arc<EnvCore>,
    pub db: Arc<DatabaseImpl>,
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
    let core = Arc::new(EnvCore {
        config: EnvironmentConfig {
            node_max_entries: max_entries,
            ..EnvironmentConfig::default()
        },
        ctx,
        locks: Arc::new(LockTable::new()),
        txns: TxnManager::new(),
        registry: Arc::new(DbRegistry::new()),
        compressor_queue: Arc::new(BinRefQueue::new()),
        txn_ids: AtomicU64::new(1),
        db_ids: AtomicU64::new(FIRST_USER_DB_ID + 1),
        ckpt_ids: AtomicU64::new(1),
        ckpt_mutex: Mutex::new(()),
        last_ckpt_end: Mutex::new(None),
        retired_names: Mutex::new(HashMap::new()),
        invalid: Mutex::new(None),
        read_only: false,
        n_checkpoints: AtomicU64::new(0),
    });
    let db = core.build_db(FIRST_USER_DB_ID, "ckpt-db".to_string(), false);
    core.registry.insert(Arc::clone(&db));
    Harness {
        core,
        db,
        _dir: dir,
    }
}

/// Insert (or overwrite) a record the way the cursor layer does, minus
/// locking; overwrites dirty exactly one slot.
pub fn put(tree: &Arc<Tree>, key: &[u8], value: &[u8]) {
    let (mut bin, pos) = tree.insert_position(key).unwrap();
    let node_id = match pos {
        SlotSearch::Exact(i) => bin.slots[i].child_id,
        SlotSearch::Insert(_) => tree.ctx.next_node_id(),
    };
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
            bin.dirty = true;
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

/// Every record in the log, decoded.
pub fn records(log: &LogManager) -> Vec<(Lsn, RecordHeader, LogEntry)> {
    log.iter_from(None)
        .unwrap()
        .map(|item| {
            let (lsn, header, payload) = item.unwrap();
            let entry = LogEntry::decode_payload(header.ty, &payload).unwrap();
            (lsn, header, entry)
        })
        .collect()
}

/// The records written after `from` (exclusive).
pub fn records_after(log: &LogManager, from: Lsn) -> Vec<(Lsn, RecordHeader, LogEntry)> {
    records(log).into_iter().filter(|(l, _, _)| *l > from).collect()
}
