//! The environment: one on-disk directory, one log, one set of databases.
//!
//! `Environment::open` locks the directory, opens the log, runs recovery,
//! and starts the four daemons (evictor, compressor, cleaner,
//! checkpointer) on dedicated threads driven by crossbeam channels — a
//! shared shutdown channel plus a per-daemon tick. `close` runs a final
//! checkpoint, stops the daemons and releases the directory lock.
//!
//! A fatal error anywhere (log corruption, I/O failure) **invalidates**
//! the environment: every subsequent call fails with
//! [`Error::RunRecovery`] until the process reopens it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, bounded, tick};
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointConfig, run_checkpoint};
use crate::cleaner::profile::UtilizationTracker;
use crate::cleaner::{Cleaner, CleanerConfig, CleanerStats};
use crate::compressor::{BinRefQueue, Compressor, CompressorStats};
use crate::cursor::Cursor;
use crate::db::secondary::{ForeignLink, SecondaryConfig, SecondaryDatabase, SecondaryTrigger};
use crate::db::{Database, DatabaseConfig, DatabaseImpl, DbRegistry};
use crate::error::{Error, Result};
use crate::evictor::{CacheBudget, Evictor, EvictorStats, InList};
use crate::lock::{LockMode, LockStatsSnapshot, LockTable};
use crate::log::{FileManager, LogConfig, LogEntry, LogManager, Lsn, NameEntry, RootEntry};
use crate::tree::node::Child;
use crate::tree::{Comparator, Tree, TreeContext, default_comparator};
use crate::txn::Durability;

pub use crate::txn::{TransactionConfig, TxnStatsSnapshot};

/// User databases start here; lower ids are reserved namespaces (name
/// mapping, utilization profile).
pub const FIRST_USER_DB_ID: u64 = 2;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Environment-wide configuration.
#[derive(Clone)]
pub struct EnvironmentConfig {
    /// Create the directory and log when missing.
    pub allow_create: bool,
    /// Fail when an environment already exists in the directory.
    pub exclusive_create: bool,
    /// Disable all writes and background daemons.
    pub read_only: bool,
    /// Enable transactional semantics by default for databases.
    pub transactional: bool,
    /// Cache budget in bytes; mutually exclusive with
    /// `max_memory_percent`.
    pub max_memory: u64,
    /// Cache budget as a percentage of a nominal 1 GiB heap; mutually
    /// exclusive with `max_memory`.
    pub max_memory_percent: u32,
    /// Eviction stops once usage falls below this percentage of the
    /// budget.
    pub evictor_floor_percent: u32,
    /// Fraction of the IN-list examined per eviction pass.
    pub evictor_scan_fraction: f64,
    /// Cleaner tunables.
    pub cleaner: CleanerConfig,
    /// Log tunables (segment size, read/write buffering).
    pub log: LogConfig,
    /// Fanout limit per tree node.
    pub node_max_entries: usize,
    /// Default record-lock wait.
    pub lock_timeout: Duration,
    /// Default whole-transaction deadline.
    pub txn_timeout: Option<Duration>,
    /// Default commit durability.
    pub durability: Durability,
    /// Background wake interval.
    pub daemon_interval: Duration,
    /// Key comparators by database name, applied at recovery and open.
    pub key_comparators: HashMap<String, Comparator>,
    /// Duplicate comparators by database name.
    pub dup_comparators: HashMap<String, Comparator>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            allow_create: true,
            exclusive_create: false,
            read_only: false,
            transactional: false,
            max_memory: 0,
            max_memory_percent: 0,
            evictor_floor_percent: 80,
            evictor_scan_fraction: 0.1,
            cleaner: CleanerConfig::default(),
            log: LogConfig::default(),
            node_max_entries: 128,
            lock_timeout: Duration::from_millis(500),
            txn_timeout: None,
            durability: Durability::Sync,
            daemon_interval: Duration::from_secs(1),
            key_comparators: HashMap::new(),
            dup_comparators: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("allow_create", &self.allow_create)
            .field("read_only", &self.read_only)
            .field("transactional", &self.transactional)
            .field("max_memory", &self.max_memory)
            .field("node_max_entries", &self.node_max_entries)
            .finish_non_exhaustive()
    }
}

impl EnvironmentConfig {
    fn validate(&self) -> Result<()> {
        if self.max_memory > 0 && self.max_memory_percent > 0 {
            return Err(Error::InvalidConfig(
                "max_memory and max_memory_percent are mutually exclusive".into(),
            ));
        }
        if self.max_memory_percent > 100 {
            return Err(Error::InvalidConfig(
                "max_memory_percent must be at most 100".into(),
            ));
        }
        if self.evictor_floor_percent > 100 {
            return Err(Error::InvalidConfig(
                "evictor_floor_percent must be at most 100".into(),
            ));
        }
        if self.cleaner.min_utilization > 100 {
            return Err(Error::InvalidConfig(
                "cleaner min_utilization must be at most 100".into(),
            ));
        }
        if self.node_max_entries < 4 {
            return Err(Error::InvalidConfig(
                "node_max_entries must be at least 4".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.evictor_scan_fraction) {
            return Err(Error::InvalidConfig(
                "evictor_scan_fraction must be within [0, 1]".into(),
            ));
        }
        if self.read_only && self.exclusive_create {
            return Err(Error::InvalidConfig(
                "read_only and exclusive_create are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    fn resolved_cache_max(&self) -> u64 {
        if self.max_memory > 0 {
            self.max_memory
        } else if self.max_memory_percent > 0 {
            (1 << 30) / 100 * u64::from(self.max_memory_percent)
        } else {
            64 * 1024 * 1024
        }
    }
}

// ------------------------------------------------------------------------------------------------
// EnvCore
// ------------------------------------------------------------------------------------------------

/// Shared state behind every handle of one environment.
pub(crate) struct EnvCore {
    pub config: EnvironmentConfig,
    pub ctx: TreeContext,
    pub locks: Arc<LockTable>,
    pub txns: crate::txn::TxnManager,
    pub registry: Arc<DbRegistry>,
    pub compressor_queue: Arc<BinRefQueue>,
    /// Transaction and non-transactional locker ids, one sequence.
    pub txn_ids: AtomicU64,
    pub db_ids: AtomicU64,
    pub ckpt_ids: AtomicU64,
    /// Serializes checkpoints.
    pub ckpt_mutex: Mutex<()>,
    pub last_ckpt_end: Mutex<Option<Lsn>>,
    /// Retired database names; tombstones re-logged by the cleaner.
    pub retired_names: Mutex<HashMap<String, u64>>,
    /// `Some(reason)` once a fatal error invalidated the environment.
    pub invalid: Mutex<Option<String>>,
    pub read_only: bool,
    pub n_checkpoints: AtomicU64,
}

impl EnvCore {
    pub(crate) fn check_valid(&self) -> Result<()> {
        let invalid = self
            .invalid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*invalid {
            Some(reason) => Err(Error::RunRecovery(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn invalidate(&self, reason: &str) {
        error!(reason, "environment invalidated");
        let mut invalid = self
            .invalid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if invalid.is_none() {
            *invalid = Some(reason.to_string());
        }
    }

    /// Run `op`; a fatal error invalidates the environment on the way out.
    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.invalidate(&e.to_string());
            }
        }
        result
    }

    pub(crate) fn next_locker_id(&self) -> u64 {
        self.txn_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn begin_txn_inner(
        &self,
        config: &TransactionConfig,
    ) -> Result<Arc<crate::txn::Txn>> {
        self.txns.begin(
            &self.txn_ids,
            &self.ctx.log,
            (self.config.durability, self.config.lock_timeout),
            config,
        )
    }

    /// Build the shared per-database state, honoring any registered
    /// comparators for the name.
    pub(crate) fn build_db(
        &self,
        id: u64,
        name: String,
        sorted_duplicates: bool,
    ) -> Arc<DatabaseImpl> {
        self.build_db_with(id, name, sorted_duplicates, None, None)
    }

    /// [`EnvCore::build_db`] with per-handle comparator overrides (database
    /// creation; afterwards the environment registry governs, since
    /// closures cannot be persisted).
    pub(crate) fn build_db_with(
        &self,
        id: u64,
        name: String,
        sorted_duplicates: bool,
        key_override: Option<Comparator>,
        dup_override: Option<Comparator>,
    ) -> Arc<DatabaseImpl> {
        let key_cmp = key_override
            .or_else(|| self.config.key_comparators.get(&name).cloned())
            .unwrap_or_else(default_comparator);
        let dup_cmp = dup_override
            .or_else(|| self.config.dup_comparators.get(&name).cloned())
            .unwrap_or_else(default_comparator);
        let tree = Arc::new(Tree::new(
            id,
            self.ctx.clone(),
            self.config.node_max_entries,
            key_cmp,
            dup_cmp,
        ));
        Arc::new(DatabaseImpl {
            id,
            name: Mutex::new(name),
            tree,
            sorted_duplicates,
            transactional: self.config.transactional,
            triggers: std::sync::RwLock::new(Vec::new()),
            foreign_links: std::sync::RwLock::new(Vec::new()),
        })
    }

    /// Truncate: empty the tree and log an empty root so recovery observes
    /// the generation switch.
    pub(crate) fn truncate_database(
        &self,
        imp: &Arc<DatabaseImpl>,
        handle_locker: u64,
        count_records: bool,
    ) -> Result<u64> {
        let key = crate::txn::handle_lock_key(imp.id);
        // Take over the handle lock exclusively; other open handles block
        // the upgrade until they close.
        let op_locker = self.next_locker_id();
        self.locks.transfer(key, handle_locker, op_locker);
        let taken = self
            .locks
            .lock(key, op_locker, LockMode::Write, self.config.lock_timeout);
        if let Err(e) = taken {
            self.locks.transfer(key, op_locker, handle_locker);
            return Err(e);
        }

        let count = if count_records {
            count_live_records(&imp.tree)?
        } else {
            0
        };
        imp.tree.clear();
        self.ctx.log.append(
            &LogEntry::Root(RootEntry {
                db_id: imp.id,
                node_id: 0,
                lsn: None,
            }),
            false,
            0,
        )?;
        self.ctx.log.sync()?;
        info!(db = imp.id, count, "database truncated");

        self.locks.release(key, op_locker);
        self.locks
            .lock(key, handle_locker, LockMode::Read, self.config.lock_timeout)?;
        Ok(count)
    }
}

fn count_live_records(tree: &Arc<Tree>) -> Result<u64> {
    let mut count = 0u64;
    let Some(root) = tree.root_cell()? else {
        return Ok(0);
    };
    let mut queue = vec![root];
    while let Some(cell) = queue.pop() {
        let mut guard = cell.write(tree.ctx.next_generation());
        if guard.kind.is_bottom() {
            count += guard.live_slots() as u64;
        } else {
            for i in 0..guard.slots.len() {
                queue.push(tree.fetch_child(&mut guard, i)?);
            }
        }
    }
    Ok(count)
}

// ------------------------------------------------------------------------------------------------
// Transaction (public wrapper)
// ------------------------------------------------------------------------------------------------

/// A transaction handle. Dropping an unresolved transaction aborts it.
pub struct Transaction {
    pub(crate) core: Arc<EnvCore>,
    pub(crate) inner: Arc<crate::txn::Txn>,
    resolved: AtomicBool,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Commit with the transaction's configured durability.
    pub fn commit(self) -> Result<()> {
        self.finish(None, true)
    }

    /// Commit and fsync regardless of configuration.
    pub fn commit_sync(self) -> Result<()> {
        self.finish(Some(Durability::Sync), true)
    }

    /// Commit without waiting for durability.
    pub fn commit_no_sync(self) -> Result<()> {
        self.finish(Some(Durability::NoSync), true)
    }

    /// Roll back every write of this transaction.
    pub fn abort(self) -> Result<()> {
        self.finish(None, false)
    }

    fn finish(self, durability: Option<Durability>, commit: bool) -> Result<()> {
        self.resolved.store(true, Ordering::SeqCst);
        let result = if commit {
            self.core
                .txns
                .commit(&self.inner, &self.core.ctx.log, &self.core.locks, durability)
        } else {
            self.core.txns.abort(
                &self.inner,
                &self.core.ctx.log,
                &self.core.locks,
                &self.core.registry,
            )
        };
        self.core.guard(result)
    }

    /// Override the lock wait for subsequent operations.
    pub fn set_lock_timeout(&self, timeout: Duration) {
        self.inner.lock_state().lock_timeout = timeout;
    }

    /// Override the whole-transaction deadline.
    pub fn set_txn_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock_state().txn_timeout = timeout;
    }

    /// Attach a diagnostic name (shows up in stats).
    pub fn set_name(&self, name: &str) {
        self.inner.lock_state().name = Some(name.to_string());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.resolved.swap(true, Ordering::SeqCst) {
            let result = self.core.txns.abort(
                &self.inner,
                &self.core.ctx.log,
                &self.core.locks,
                &self.core.registry,
            );
            if let Err(e) = result {
                warn!(txn = self.inner.id, error = %e, "abort on drop failed");
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Environment-wide statistics snapshot.
#[derive(Debug, Clone)]
pub struct EnvironmentStats {
    /// Bytes charged to the cache.
    pub cache_bytes_used: u64,
    /// Configured cache budget.
    pub cache_bytes_max: u64,
    /// Resident nodes on the IN-list.
    pub n_resident_nodes: usize,
    /// Bytes across live segment files.
    pub log_size_bytes: u64,
    /// Checkpoints completed since open.
    pub n_checkpoints: u64,
    /// Evictor counters.
    pub evictor: EvictorStats,
    /// Compressor counters.
    pub compressor: CompressorStats,
    /// Cleaner counters.
    pub cleaner: CleanerStats,
}

/// Result of [`Environment::verify`].
#[derive(Debug, Default, Clone)]
pub struct VerifyReport {
    /// Databases examined.
    pub n_databases: usize,
    /// Nodes examined.
    pub n_nodes: u64,
    /// Invariant violations found (empty means the walk was clean).
    pub errors: Vec<String>,
}

// ------------------------------------------------------------------------------------------------
// Environment
// ------------------------------------------------------------------------------------------------

/// An open environment.
pub struct Environment {
    core: Arc<EnvCore>,
    evictor: Arc<Evictor>,
    compressor: Arc<Compressor>,
    cleaner: Arc<Cleaner>,
    daemons: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("closed", &self.closed.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl Environment {
    /// Open (or create) the environment at `dir`, run recovery, start the
    /// daemons.
    pub fn open(dir: &Path, config: EnvironmentConfig) -> Result<Environment> {
        config.validate()?;
        let read_only = config.read_only;

        let files = FileManager::open(dir, read_only, config.allow_create)?;
        if config.exclusive_create && !files.list_segments()?.is_empty() {
            return Err(Error::DatabaseExists(format!(
                "environment at {}",
                dir.display()
            )));
        }

        let tracker = Arc::new(UtilizationTracker::new());
        let log = Arc::new(LogManager::open(
            files,
            config.log.clone(),
            Arc::clone(&tracker),
            read_only,
        )?);
        let cache = Arc::new(CacheBudget::new(config.resolved_cache_max()));
        let inlist = Arc::new(InList::new());
        let ctx = TreeContext {
            log,
            tracker,
            cache,
            inlist,
            node_ids: Arc::new(AtomicU64::new(1)),
            generation: Arc::new(AtomicU64::new(1)),
        };

        let core = Arc::new(EnvCore {
            config: config.clone(),
            ctx,
            locks: Arc::new(LockTable::new()),
            txns: crate::txn::TxnManager::new(),
            registry: Arc::new(DbRegistry::new()),
            compressor_queue: Arc::new(BinRefQueue::new()),
            txn_ids: AtomicU64::new(1),
            db_ids: AtomicU64::new(FIRST_USER_DB_ID),
            ckpt_ids: AtomicU64::new(1),
            ckpt_mutex: Mutex::new(()),
            last_ckpt_end: Mutex::new(None),
            retired_names: Mutex::new(HashMap::new()),
            invalid: Mutex::new(None),
            read_only,
            n_checkpoints: AtomicU64::new(0),
        });

        crate::recovery::run_recovery(&core)?;
        if !read_only {
            run_checkpoint(
                &core,
                &CheckpointConfig {
                    force: false,
                    full: false,
                    invoker: "recovery".to_string(),
                },
            )?;
        }

        let evictor = Arc::new(Evictor::new(
            Arc::clone(&core.ctx.cache),
            Arc::clone(&core.ctx.inlist),
            Arc::clone(&core.registry),
            config.evictor_floor_percent,
            config.evictor_scan_fraction,
            read_only,
        ));
        let compressor = Arc::new(Compressor::new(
            Arc::clone(&core.registry),
            Arc::clone(&core.compressor_queue),
        ));
        let cleaner = Arc::new(Cleaner::new(Arc::clone(&core), config.cleaner.clone()));

        let env = Environment {
            core,
            evictor,
            compressor,
            cleaner,
            daemons: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if !read_only {
            env.start_daemons();
        }
        info!(dir = %dir.display(), read_only, "environment open");
        Ok(env)
    }

    fn start_daemons(&self) {
        let (tx, rx) = bounded::<()>(0);
        *self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        let interval = self.core.config.daemon_interval;

        let mut handles = Vec::with_capacity(4);

        let core = Arc::clone(&self.core);
        let evictor = Arc::clone(&self.evictor);
        handles.push(spawn_daemon("arbor-evictor", rx.clone(), interval, move || {
            core.guard(evictor.run_once().map(|_| ())).err()
        }));

        let core = Arc::clone(&self.core);
        let compressor = Arc::clone(&self.compressor);
        handles.push(spawn_daemon(
            "arbor-compressor",
            rx.clone(),
            interval,
            move || core.guard(compressor.run_once().map(|_| ())).err(),
        ));

        let core = Arc::clone(&self.core);
        let cleaner = Arc::clone(&self.cleaner);
        handles.push(spawn_daemon("arbor-cleaner", rx.clone(), interval, move || {
            core.guard(cleaner.run_once(false).map(|_| ())).err()
        }));

        let core = Arc::clone(&self.core);
        handles.push(spawn_daemon("arbor-checkpointer", rx, interval, move || {
            let cfg = CheckpointConfig {
                force: false,
                full: false,
                invoker: "daemon".to_string(),
            };
            core.guard(run_checkpoint(&core, &cfg).map(|_| ())).err()
        }));

        *self
            .daemons
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = handles;
    }

    fn stop_daemons(&self) {
        // Dropping the sender disconnects every daemon's shutdown channel.
        self.shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .daemons
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Begin a transaction. `parent` is accepted for interface parity;
    /// nested transactions are not supported and it must be `None`.
    pub fn begin_transaction(
        &self,
        parent: Option<&Transaction>,
        config: TransactionConfig,
    ) -> Result<Transaction> {
        self.core.check_valid()?;
        if self.core.read_only {
            return Err(Error::ReadOnly);
        }
        if parent.is_some() {
            return Err(Error::InvalidConfig(
                "nested transactions are not supported".into(),
            ));
        }
        let inner = self.core.begin_txn_inner(&config)?;
        Ok(Transaction {
            core: Arc::clone(&self.core),
            inner,
            resolved: AtomicBool::new(false),
        })
    }

    /// Open (or create) a database by name.
    pub fn open_database(
        &self,
        txn: Option<&Transaction>,
        name: &str,
        config: &DatabaseConfig,
    ) -> Result<Database> {
        self.core.check_valid()?;
        let _ = txn; // name-map records are logged auto-committed
        let imp = match self.core.registry.by_name(name) {
            Some(existing) => {
                if config.exclusive_create {
                    return Err(Error::DatabaseExists(name.to_string()));
                }
                if existing.sorted_duplicates != config.sorted_duplicates {
                    return Err(Error::InvalidConfig(format!(
                        "database {name} was created with sorted_duplicates={}",
                        existing.sorted_duplicates
                    )));
                }
                existing
            }
            None => {
                if !config.allow_create {
                    return Err(Error::DatabaseNotFound(name.to_string()));
                }
                if self.core.read_only {
                    return Err(Error::ReadOnly);
                }
                let id = self.core.db_ids.fetch_add(1, Ordering::SeqCst);
                let imp = self.core.build_db_with(
                    id,
                    name.to_string(),
                    config.sorted_duplicates,
                    config.key_comparator.clone(),
                    config.duplicate_comparator.clone(),
                );
                self.core.registry.insert(Arc::clone(&imp));
                self.core
                    .retired_names
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(name);
                self.core.guard(
                    self.core
                        .ctx
                        .log
                        .append(
                            &LogEntry::Name(NameEntry {
                                db_id: id,
                                name: name.to_string(),
                                deleted: false,
                                sorted_duplicates: config.sorted_duplicates,
                            }),
                            false,
                            0,
                        )
                        .map_err(Error::from)
                        .and_then(|_| self.core.ctx.log.sync().map_err(Error::from)),
                )?;
                info!(db = id, name, "database created");
                imp
            }
        };
        let handle_locker = self.core.next_locker_id();
        self.core.locks.lock(
            crate::txn::handle_lock_key(imp.id),
            handle_locker,
            LockMode::Read,
            self.core.config.lock_timeout,
        )?;
        Ok(Database {
            core: Arc::clone(&self.core),
            imp,
            handle_locker,
            read_only: config.read_only,
        })
    }

    /// Open (or create and populate) a secondary database over `primary`.
    pub fn open_secondary_database(
        &self,
        txn: Option<&Transaction>,
        name: &str,
        primary: &Database,
        config: &SecondaryConfig,
    ) -> Result<SecondaryDatabase> {
        let db_config = DatabaseConfig {
            allow_create: config.allow_create,
            sorted_duplicates: true,
            transactional: primary.imp.transactional,
            ..DatabaseConfig::default()
        };
        let secondary = self.open_database(txn, name, &db_config)?;
        let was_empty = secondary.imp.tree.root_id().is_none();

        let trigger = Arc::new(SecondaryTrigger {
            secondary: Arc::clone(&secondary.imp),
            key_creator: Arc::clone(&config.key_creator),
        });
        primary
            .imp
            .triggers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::clone(&trigger));

        if let Some(foreign) = &config.foreign {
            foreign
                .foreign
                .foreign_links
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(Arc::new(ForeignLink {
                    secondary: Arc::clone(&secondary.imp),
                    primary: Arc::clone(&primary.imp),
                    action: foreign.action,
                    nullifier: foreign.nullifier.clone(),
                }));
        }

        // Initial population from the existing primary contents.
        if was_empty && primary.imp.tree.root_id().is_some() {
            let mut cursor = Cursor::open(
                Arc::clone(&self.core),
                Arc::clone(&primary.imp),
                txn.map(|t| Arc::clone(&t.inner)),
                true,
            )?;
            let mut item = cursor.first()?;
            while let Some(record) = item {
                if let Some(sec_key) = (config.key_creator)(&record.key, &record.value) {
                    let mut sec_cursor = Cursor::open(
                        Arc::clone(&self.core),
                        Arc::clone(&secondary.imp),
                        txn.map(|t| Arc::clone(&t.inner)),
                        false,
                    )?;
                    sec_cursor.put_no_dup_data(&sec_key, &record.key)?;
                    sec_cursor.close()?;
                }
                item = cursor.next()?;
            }
            cursor.close()?;
        }

        Ok(SecondaryDatabase {
            db: secondary,
            primary: Arc::clone(&primary.imp),
        })
    }

    /// Remove a database by name; fails while other handles hold it open.
    pub fn remove_database(&self, txn: Option<&Transaction>, name: &str) -> Result<()> {
        self.core.check_valid()?;
        let _ = txn;
        if self.core.read_only {
            return Err(Error::ReadOnly);
        }
        let Some(imp) = self.core.registry.by_name(name) else {
            return Err(Error::DatabaseNotFound(name.to_string()));
        };
        let key = crate::txn::handle_lock_key(imp.id);
        let locker = self.core.next_locker_id();
        self.core
            .locks
            .lock(key, locker, LockMode::Write, self.core.config.lock_timeout)?;
        let result = (|| {
            self.core.registry.remove(name);
            imp.tree.clear();
            self.core
                .retired_names
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(name.to_string(), imp.id);
            self.core.ctx.log.append(
                &LogEntry::Name(NameEntry {
                    db_id: imp.id,
                    name: name.to_string(),
                    deleted: true,
                    sorted_duplicates: imp.sorted_duplicates,
                }),
                false,
                0,
            )?;
            self.core.ctx.log.sync()?;
            info!(db = imp.id, name, "database removed");
            Ok(())
        })();
        self.core.locks.release(key, locker);
        self.core.guard(result)
    }

    /// Rename a database; fails while other handles hold it open.
    pub fn rename_database(&self, txn: Option<&Transaction>, from: &str, to: &str) -> Result<()> {
        self.core.check_valid()?;
        let _ = txn;
        if self.core.read_only {
            return Err(Error::ReadOnly);
        }
        if self.core.registry.by_name(to).is_some() {
            return Err(Error::DatabaseExists(to.to_string()));
        }
        let Some(imp) = self.core.registry.by_name(from) else {
            return Err(Error::DatabaseNotFound(from.to_string()));
        };
        let key = crate::txn::handle_lock_key(imp.id);
        let locker = self.core.next_locker_id();
        self.core
            .locks
            .lock(key, locker, LockMode::Write, self.core.config.lock_timeout)?;
        let result = (|| {
            self.core.registry.rename(from, to);
            self.core
                .retired_names
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(from.to_string(), imp.id);
            self.core.ctx.log.append(
                &LogEntry::Name(NameEntry {
                    db_id: imp.id,
                    name: from.to_string(),
                    deleted: true,
                    sorted_duplicates: imp.sorted_duplicates,
                }),
                false,
                0,
            )?;
            self.core.ctx.log.append(
                &LogEntry::Name(NameEntry {
                    db_id: imp.id,
                    name: to.to_string(),
                    deleted: false,
                    sorted_duplicates: imp.sorted_duplicates,
                }),
                false,
                0,
            )?;
            self.core.ctx.log.sync()?;
            info!(db = imp.id, from, to, "database renamed");
            Ok(())
        })();
        self.core.locks.release(key, locker);
        self.core.guard(result)
    }

    /// Run a checkpoint now.
    pub fn checkpoint(&self, config: &CheckpointConfig) -> Result<()> {
        self.core.check_valid()?;
        if self.core.read_only {
            return Ok(());
        }
        self.core.guard(run_checkpoint(&self.core, config).map(|_| ()))
    }

    /// Flush and fsync the log.
    pub fn sync(&self) -> Result<()> {
        self.core.check_valid()?;
        self.core.guard(self.core.ctx.log.sync().map_err(Error::from))
    }

    /// Run cleaning to completion; returns the number of files cleaned.
    pub fn clean_log(&self) -> Result<u64> {
        self.core.check_valid()?;
        let before = self.cleaner.stats().n_files_deleted;
        while self.core.guard(self.cleaner.run_once(true))? {}
        Ok(self.cleaner.stats().n_files_deleted - before)
    }

    /// Run one eviction pass; returns bytes freed.
    pub fn evict_memory(&self) -> Result<u64> {
        self.core.check_valid()?;
        self.core.guard(self.evictor.run_once())
    }

    /// Run one compression pass.
    pub fn compress(&self) -> Result<()> {
        self.core.check_valid()?;
        self.core.guard(self.compressor.run_once().map(|_| ()))
    }

    /// Environment statistics.
    pub fn stats(&self) -> Result<EnvironmentStats> {
        self.core.check_valid()?;
        Ok(EnvironmentStats {
            cache_bytes_used: self.core.ctx.cache.usage(),
            cache_bytes_max: self.core.ctx.cache.max(),
            n_resident_nodes: self.core.ctx.inlist.len(),
            log_size_bytes: self.core.ctx.log.files().live_size()?,
            n_checkpoints: self.core.n_checkpoints.load(Ordering::Relaxed),
            evictor: self.evictor.stats(),
            compressor: self.compressor.stats(),
            cleaner: self.cleaner.stats(),
        })
    }

    /// Lock-table statistics.
    pub fn lock_stats(&self) -> LockStatsSnapshot {
        self.core.locks.stats()
    }

    /// Transaction statistics.
    pub fn txn_stats(&self) -> TxnStatsSnapshot {
        self.core.txns.stats()
    }

    /// Walk every tree checking structural invariants; corruption found
    /// here invalidates the environment.
    pub fn verify(&self) -> Result<VerifyReport> {
        self.core.check_valid()?;
        let mut report = VerifyReport::default();
        for db in self.core.registry.all() {
            report.n_databases += 1;
            verify_tree(&db.tree, &mut report)?;
        }
        // Cache accounting: the budget equals the sum of charged sizes.
        let mut charged = 0u64;
        for db in self.core.registry.all() {
            for cell in db.tree.resident_cells() {
                charged += cell.charged();
            }
        }
        let used = self.core.ctx.cache.usage();
        if charged != used {
            report.errors.push(format!(
                "cache accounting mismatch: charged {charged}, reported {used}"
            ));
        }
        if !report.errors.is_empty() {
            self.core.invalidate("verify found inconsistencies");
        }
        Ok(report)
    }

    /// Close cleanly: abort stray transactions, final checkpoint, stop
    /// daemons, sync and release the directory lock.
    pub fn close(self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_daemons();
        if !self.core.read_only && self.core.check_valid().is_ok() {
            self.core.txns.abort_all(
                &self.core.ctx.log,
                &self.core.locks,
                &self.core.registry,
            );
            run_checkpoint(
                &self.core,
                &CheckpointConfig {
                    force: true,
                    full: true,
                    invoker: "close".to_string(),
                },
            )?;
            self.core.ctx.log.sync()?;
        }
        info!("environment closed");
        Ok(())
    }

    /// Close without the final checkpoint (crash simulation, emergency
    /// shutdown). Buffered log records are flushed but nothing else is
    /// written.
    pub fn close_no_checkpoint(self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_daemons();
        if !self.core.read_only {
            self.core.ctx.log.flush()?;
        }
        info!("environment closed without checkpoint");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop_daemons();
            if !self.core.read_only {
                if let Err(e) = self.core.ctx.log.sync() {
                    warn!(error = %e, "log sync on drop failed");
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Daemon harness
// ------------------------------------------------------------------------------------------------

fn spawn_daemon(
    name: &'static str,
    shutdown: Receiver<()>,
    interval: Duration,
    work: impl Fn() -> Option<Error> + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let ticker = tick(interval);
            loop {
                crossbeam::channel::select! {
                    recv(shutdown) -> msg => {
                        if msg.is_err() {
                            break;
                        }
                    }
                    recv(ticker) -> _ => {
                        if let Some(e) = work() {
                            if e.is_fatal() {
                                error!(daemon = name, error = %e, "fatal error, stopping");
                                break;
                            }
                            warn!(daemon = name, error = %e, "background error");
                        }
                    }
                }
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn {name}: {e}"))
}

// ------------------------------------------------------------------------------------------------
// Verify walk
// ------------------------------------------------------------------------------------------------

fn verify_tree(tree: &Arc<Tree>, report: &mut VerifyReport) -> Result<()> {
    let Some(root) = tree.root_cell()? else {
        return Ok(());
    };
    let mut queue: Vec<(Arc<crate::tree::node::NodeCell>, Option<Vec<u8>>)> = vec![(root, None)];
    while let Some((cell, lower_bound)) = queue.pop() {
        report.n_nodes += 1;
        let guard = cell.read();
        let cmp: &Comparator = if guard.kind.is_dup() {
            &tree.dup_cmp
        } else {
            &tree.key_cmp
        };
        // Key order within the node; slot 0 of an internal level is the
        // sentinel and stays out of the ordering check.
        let start = if guard.kind.has_sentinel() { 1 } else { 0 };
        for i in (start + 1)..guard.slots.len() {
            if cmp(&guard.slots[i - 1].key, &guard.slots[i].key) != std::cmp::Ordering::Less {
                report.errors.push(format!(
                    "node {}: slots {} and {} out of order",
                    guard.id,
                    i - 1,
                    i
                ));
            }
        }
        // Parent-child bound: every live key is >= the parent slot's key.
        if let Some(bound) = &lower_bound {
            for slot in guard.slots.iter().filter(|s| !s.known_deleted) {
                if cmp(&slot.key, bound) == std::cmp::Ordering::Less {
                    report.errors.push(format!(
                        "node {}: key below parent bound",
                        guard.id
                    ));
                    break;
                }
            }
        }
        if !guard.kind.is_bottom() {
            for (i, slot) in guard.slots.iter().enumerate() {
                if let Child::Node(id) = slot.child {
                    if let Some(child) = tree.get(id) {
                        let bound = (i > 0 || guard.kind.is_bottom()).then(|| slot.key.clone());
                        queue.push((child, bound));
                    }
                } else if slot.lsn.is_none() {
                    report.errors.push(format!(
                        "node {}: non-resident child without LSN",
                        guard.id
                    ));
                }
            }
        }
    }
    Ok(())
}
