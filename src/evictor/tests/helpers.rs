use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};

use tempfile::TempDir;

use crate::cleaner::profile::UtilizationTracker;
use crate::db::{DatabaseImpl, DbRegistry};
use crate::evictor::{CacheBudget, Evictor, InList};
use crate::log::{FileManager, LnEntry, LogConfig, LogEntry, LogManager};
use crate::tree::node::{Child, Slot, SlotSearch};
use crate::tree::{Tree, TreeContext, default_comparator};

pub const DB_ID: u64 = 2;

/// A registered database over a tiny, configurable cache budget.
pub struct Harness {
    pub registry: Arc<DbRegistry>,
    pub tree: Arc<Tree>,
    pub cache: Arc<CacheBudget>,
    pub inlist: Arc<InList>,
    _dir: TempDir,
}

pub fn harness(max_entries: usize, cache_max: u64) -> Harness {
    let dir = TempDir::new().unwrap();
    let files = FileManager::open(dir.path(), false, true).unwrap();
    let tracker = Arc::new(UtilizationTracker::new());
    let log = Arc::new(
        LogManager::open(files, LogConfig::default(), Arc::clone(&tracker), false).unwrap(),
    );
    let cache = Arc::new(CacheBudget::new(cache_max));
    let inlist = Arc::new(InList::new());
    let ctx = TreeContext {
        log,
        tracker,
        cache: Arc::clone(&cache),
        inlist: Arc::clone(&inlist),
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
        name: Mutex::new("evict-db".to_string()),
        tree: Arc::clone(&tree),
        sorted_duplicates: false,
        transactional: false,
        triggers: RwLock::new(Vec::new()),
        foreign_links: RwLock::new(Vec::new()),
    }));
    Harness {
        registry,
        tree,
        cache,
        inlist,
        _dir: dir,
    }
}

/// The worker over the harness state, scanning the whole IN-list per pass.
pub fn evictor(h: &Harness, floor_percent: u32) -> Evictor {
    Evictor::new(
        Arc::clone(&h.cache),
        Arc::clone(&h.inlist),
        Arc::clone(&h.registry),
        floor_percent,
        1.0,
        false,
    )
}

/// Insert a record with a resident value.
pub fn put(tree: &Arc<Tree>, key: &[u8], value: &[u8]) {
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
}

/// How many slots of the given bottom node still hold resident values.
pub fn resident_values(tree: &Arc<Tree>, node_id: u64) -> usize {
    let cell = tree.get(node_id).unwrap();
    let guard = cell.read();
    guard
        .slots
        .iter()
        .filter(|s| matches!(s.child, Child::Ln(_)))
        .count()
}
