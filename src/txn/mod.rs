//! Transactions, lockers and undo.
//!
//! A transaction id doubles as its **locker id** in the lock table; ids for
//! transactions and non-transactional lockers come from one shared
//! sequence, so the deadlock detector's "youngest" rule is a plain id
//! comparison.
//!
//! Every write adds one [`UndoRecord`] carrying the pre-image LSN and
//! known-deleted state of the slot it replaced. Abort walks the list in
//! reverse, reinstating pre-images in the owning BIN/DBIN slots and
//! restoring duplicate counts, then appends the abort record and releases
//! all locks. The same pre-image linkage is embedded in each logged LN
//! (`abort_lsn`), which is what crash rollback replays — so an in-memory
//! undo list is never required for recovery correctness.
//!
//! Commit appends the commit record and applies the durability policy:
//! `Sync` fsyncs, `WriteNoSync` flushes to the OS, `NoSync` leaves the
//! write buffered.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, trace, warn};

use crate::db::DbRegistry;
use crate::error::{Error, Result};
use crate::lock::LockTable;
use crate::log::{CommitRecord, LogEntry, LogManager, Lsn, TxnRecord};
use crate::tree::node::{Child, DupCount, SlotSearch};

/// High bit marks handle-lock keys so database ids never collide with node
/// ids in the lock table.
pub(crate) const HANDLE_LOCK_BIT: u64 = 1 << 63;

/// Lock-table key guarding exclusive operations on a database.
pub(crate) fn handle_lock_key(db_id: u64) -> u64 {
    db_id | HANDLE_LOCK_BIT
}

// ------------------------------------------------------------------------------------------------
// Durability
// ------------------------------------------------------------------------------------------------

/// Commit durability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Commit blocks until the log is fsynced.
    Sync,
    /// Commit leaves the record in the write buffer.
    NoSync,
    /// Commit flushes to the OS but does not fsync.
    WriteNoSync,
}

/// Per-transaction configuration.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// Durability override; the environment default applies when `None`.
    pub durability: Option<Durability>,
    /// Lock-wait override.
    pub lock_timeout: Option<Duration>,
    /// Whole-transaction deadline; `None` means unlimited.
    pub txn_timeout: Option<Duration>,
}

// ------------------------------------------------------------------------------------------------
// Undo records
// ------------------------------------------------------------------------------------------------

/// Restores a duplicate count on abort.
#[derive(Debug, Clone)]
pub(crate) struct DupCountUndo {
    pub node_id: u64,
    pub pre_count: u32,
    pub pre_lsn: Option<Lsn>,
}

/// One write's pre-image, applied in reverse order on abort.
#[derive(Debug, Clone)]
pub(crate) struct UndoRecord {
    pub db_id: u64,
    pub key: Vec<u8>,
    /// Set when the write landed inside a duplicate subtree.
    pub dup_key: Option<Vec<u8>>,
    pub ln_node_id: u64,
    pub pre_lsn: Option<Lsn>,
    pub pre_known_deleted: bool,
    /// The slot was created by this transaction; abort retires it.
    pub inserted: bool,
    pub dup_count_undo: Option<DupCountUndo>,
}

// ------------------------------------------------------------------------------------------------
// Transaction internals
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct TxnState {
    pub status: TxnStatus,
    pub undo: Vec<UndoRecord>,
    pub durability: Durability,
    pub lock_timeout: Duration,
    pub txn_timeout: Option<Duration>,
    pub name: Option<String>,
}

/// Internal transaction object; the public wrapper is
/// [`Transaction`](crate::env::Transaction).
#[derive(Debug)]
pub(crate) struct Txn {
    /// Transaction id == locker id.
    pub id: u64,
    /// LSN of the begin record; bounds the first-active LSN.
    pub begin_lsn: Lsn,
    pub started: Instant,
    pub state: Mutex<TxnState>,
}

impl Txn {
    pub(crate) fn lock_state(&self) -> std::sync::MutexGuard<'_, TxnState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record one write's pre-image.
    pub(crate) fn push_undo(&self, undo: UndoRecord) {
        self.lock_state().undo.push(undo);
    }

    /// Effective lock timeout, clipped by the transaction deadline.
    ///
    /// An expired transaction deadline surfaces as a lock timeout on the
    /// next lock request.
    pub(crate) fn remaining_lock_timeout(&self) -> Result<Duration> {
        let st = self.lock_state();
        if let Some(limit) = st.txn_timeout {
            let elapsed = self.started.elapsed();
            if elapsed >= limit {
                return Err(Error::LockTimeout {
                    record: 0,
                    millis: limit.as_millis() as u64,
                });
            }
            return Ok(st.lock_timeout.min(limit - elapsed));
        }
        Ok(st.lock_timeout)
    }
}

// ------------------------------------------------------------------------------------------------
// Manager
// ------------------------------------------------------------------------------------------------

/// Counters and active set reported by `Environment::txn_stats`.
#[derive(Debug, Default, Clone)]
pub struct TxnStatsSnapshot {
    /// Transactions begun since open.
    pub n_begun: u64,
    /// Committed.
    pub n_committed: u64,
    /// Aborted.
    pub n_aborted: u64,
    /// Ids of transactions currently active.
    pub active: Vec<u64>,
}

/// Registry of active transactions.
#[derive(Debug, Default)]
pub(crate) struct TxnManager {
    active: Mutex<HashMap<u64, Arc<Txn>>>,
    n_begun: AtomicU64,
    n_committed: AtomicU64,
    n_aborted: AtomicU64,
}

impl TxnManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Txn>>> {
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Begin a transaction: allocate the id, append the begin record,
    /// register.
    pub fn begin(
        &self,
        ids: &AtomicU64,
        log: &LogManager,
        defaults: (Durability, Duration),
        config: &TransactionConfig,
    ) -> Result<Arc<Txn>> {
        let id = ids.fetch_add(1, Ordering::SeqCst);
        let begin_lsn = log.append(&LogEntry::TxnBegin(TxnRecord { id }), false, id)?;
        let txn = Arc::new(Txn {
            id,
            begin_lsn,
            started: Instant::now(),
            state: Mutex::new(TxnState {
                status: TxnStatus::Active,
                undo: Vec::new(),
                durability: config.durability.unwrap_or(defaults.0),
                lock_timeout: config.lock_timeout.unwrap_or(defaults.1),
                txn_timeout: config.txn_timeout,
                name: None,
            }),
        });
        self.lock_active().insert(id, Arc::clone(&txn));
        self.n_begun.fetch_add(1, Ordering::Relaxed);
        trace!(txn = id, %begin_lsn, "transaction begun");
        Ok(txn)
    }

    /// Oldest begin-LSN among active transactions.
    pub fn first_active_lsn(&self) -> Option<Lsn> {
        self.lock_active().values().map(|t| t.begin_lsn).min()
    }

    /// Commit: append the commit record, apply durability, release locks.
    pub fn commit(
        &self,
        txn: &Arc<Txn>,
        log: &LogManager,
        locks: &LockTable,
        durability_override: Option<Durability>,
    ) -> Result<()> {
        {
            let mut st = txn.lock_state();
            if st.status != TxnStatus::Active {
                return Err(Error::Internal(format!(
                    "commit of finished transaction {}",
                    txn.id
                )));
            }
            st.status = TxnStatus::Committed;
        }
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        log.append(
            &LogEntry::TxnCommit(CommitRecord { id: txn.id, time }),
            false,
            txn.id,
        )?;
        let durability = durability_override.unwrap_or_else(|| txn.lock_state().durability);
        match durability {
            Durability::Sync => log.sync()?,
            Durability::WriteNoSync => log.flush()?,
            Durability::NoSync => {}
        }
        locks.release_all(txn.id);
        self.lock_active().remove(&txn.id);
        self.n_committed.fetch_add(1, Ordering::Relaxed);
        debug!(txn = txn.id, ?durability, "transaction committed");
        Ok(())
    }

    /// Abort: undo in reverse, append the abort record, release locks.
    pub fn abort(
        &self,
        txn: &Arc<Txn>,
        log: &LogManager,
        locks: &LockTable,
        registry: &DbRegistry,
    ) -> Result<()> {
        let undo = {
            let mut st = txn.lock_state();
            if st.status != TxnStatus::Active {
                return Err(Error::Internal(format!(
                    "abort of finished transaction {}",
                    txn.id
                )));
            }
            st.status = TxnStatus::Aborted;
            std::mem::take(&mut st.undo)
        };
        for u in undo.iter().rev() {
            if let Err(e) = undo_one(registry, u) {
                // Keep unwinding; a db that vanished mid-abort is not fatal.
                warn!(txn = txn.id, error = %e, "undo step failed");
                if e.is_fatal() {
                    return Err(e);
                }
            }
        }
        log.append(&LogEntry::TxnAbort(TxnRecord { id: txn.id }), false, txn.id)?;
        locks.release_all(txn.id);
        self.lock_active().remove(&txn.id);
        self.n_aborted.fetch_add(1, Ordering::Relaxed);
        debug!(txn = txn.id, "transaction aborted");
        Ok(())
    }

    /// Abort every active transaction (environment close).
    pub fn abort_all(
        &self,
        log: &LogManager,
        locks: &LockTable,
        registry: &DbRegistry,
    ) {
        let all: Vec<Arc<Txn>> = self.lock_active().values().cloned().collect();
        for txn in all {
            if let Err(e) = self.abort(&txn, log, locks, registry) {
                error!(txn = txn.id, error = %e, "abort at close failed");
            }
        }
    }

    /// Snapshot for stats.
    pub fn stats(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            n_begun: self.n_begun.load(Ordering::Relaxed),
            n_committed: self.n_committed.load(Ordering::Relaxed),
            n_aborted: self.n_aborted.load(Ordering::Relaxed),
            active: self.lock_active().keys().copied().collect(),
        }
    }

    /// Number of active transactions.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }
}

// ------------------------------------------------------------------------------------------------
// Undo application
// ------------------------------------------------------------------------------------------------

/// Reinstate one pre-image.
fn undo_one(registry: &DbRegistry, u: &UndoRecord) -> Result<()> {
    let Some(db) = registry.by_id(u.db_id) else {
        return Ok(());
    };
    let tree = &db.tree;
    let Some((mut bin, pos)) = tree.search_position(&u.key)? else {
        return Ok(());
    };
    let SlotSearch::Exact(idx) = pos else {
        return Ok(());
    };

    match &u.dup_key {
        None => {
            reinstate(tree, &mut bin, idx, u);
            tree.recharge(&bin);
        }
        Some(dup_key) => {
            let din = tree.fetch_child(&mut bin, idx)?;
            if let Some(dc) = &u.dup_count_undo {
                let mut din_guard = din.write(tree.ctx.next_generation());
                din_guard.dup_count = Some(DupCount {
                    node_id: dc.node_id,
                    count: dc.pre_count,
                    lsn: dc.pre_lsn,
                });
                din_guard.dirty = true;
            }
            let (mut dbin, dpos) = tree.dup_search_position(&din, dup_key)?;
            if let SlotSearch::Exact(didx) = dpos {
                reinstate(tree, &mut dbin, didx, u);
                tree.recharge(&dbin);
            }
        }
    }
    Ok(())
}

fn reinstate(
    tree: &crate::tree::Tree,
    bottom: &mut crate::tree::node::NodeWriteGuard,
    idx: usize,
    u: &UndoRecord,
) {
    let slot = &mut bottom.slots[idx];
    if slot.child_id != u.ln_node_id {
        // The slot was re-used by someone else; nothing of ours remains.
        return;
    }
    if let Some(cur) = slot.lsn {
        tree.ctx.tracker.note_obsolete_ln(cur.file);
    }
    if u.inserted {
        slot.known_deleted = true;
        slot.lsn = None;
    } else {
        slot.lsn = u.pre_lsn;
        slot.known_deleted = u.pre_known_deleted;
    }
    slot.child = Child::None;
    slot.dirty = true;
    bottom.dirty = true;
}
