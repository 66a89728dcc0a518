//! Record-level two-phase locking.
//!
//! Locks are keyed by a 64-bit node id: the leaf's node id for ordinary
//! records, the duplicate-count node id for duplicate sets, and a database
//! id for handle locks. The table is partitioned by key hash; each
//! partition has its own mutex and condvar, so unrelated records never
//! contend.
//!
//! ## Grant rules
//!
//! - A shared request is granted iff no conflicting owner exists **and** no
//!   writer is ahead of it in the waiter queue (FIFO fairness — readers
//!   cannot starve a writer).
//! - An exclusive request is granted iff the requester is the only owner
//!   (upgrade) or there are no owners, and it is first in line.
//! - An upgrade (shared → exclusive by the sole co-owner) waits like any
//!   writer; two simultaneous upgraders on one record are a deadlock by
//!   construction and are reported immediately.
//!
//! ## Deadlock handling
//!
//! Each blocked locker registers one wait-for edge (locker → record). On
//! blocking, the requester walks the wait-for graph (edges resolved against
//! the owner sets, one partition at a time — no nested partition locks);
//! if a cycle through the requester exists, the **youngest** locker on the
//! cycle (highest id) is marked victim and woken; its request fails with
//! [`Error::Deadlock`]. Timeouts arm per-request deadlines and fail with
//! [`Error::LockTimeout`].

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Lock-table identity (a transaction, a per-operation non-transactional
/// locker, or a handle-lifetime locker). Allocated from one shared
/// sequence, so "youngest" is simply "highest id".
pub type LockerId = u64;

/// Number of lock-table partitions.
const PARTITIONS: usize = 16;

// ------------------------------------------------------------------------------------------------
// Modes
// ------------------------------------------------------------------------------------------------

/// Record lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared.
    Read,
    /// Exclusive.
    Write,
    /// Shared, covering the gap to the next key (range search).
    RangeRead,
    /// Exclusive, covering the gap to the next key.
    RangeWrite,
    /// Exclusive insertion into a locked range.
    RangeInsert,
}

impl LockMode {
    /// `true` for exclusive-flavoured modes.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            LockMode::Write | LockMode::RangeWrite | LockMode::RangeInsert
        )
    }

    /// `true` when two modes cannot be held together.
    pub fn conflicts(self, other: LockMode) -> bool {
        self.is_write() || other.is_write()
    }

    /// The stronger of two modes held by the same owner.
    fn max(self, other: LockMode) -> LockMode {
        if self.is_write() { self } else { other }
    }
}

// ------------------------------------------------------------------------------------------------
// Table internals
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Waiter {
    locker: LockerId,
    mode: LockMode,
    /// Requester already owns a shared grant and wants exclusive.
    upgrade: bool,
}

#[derive(Debug, Default)]
struct LockEntry {
    owners: Vec<(LockerId, LockMode)>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Partition {
    table: Mutex<HashMap<u64, LockEntry>>,
    cond: Condvar,
}

/// Counters reported by [`LockTable::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LockStatsSnapshot {
    /// Lock requests served.
    pub n_requests: u64,
    /// Requests that had to wait.
    pub n_waits: u64,
    /// Requests that failed as deadlock victims.
    pub n_deadlocks: u64,
    /// Requests that timed out.
    pub n_timeouts: u64,
    /// Granted locks currently held.
    pub n_owned: u64,
    /// Lockers currently waiting.
    pub n_waiters: u64,
}

/// The partitioned record-lock table.
pub struct LockTable {
    partitions: Vec<Partition>,
    /// Wait-for edges: locker → record it is blocked on.
    waits: Mutex<HashMap<LockerId, u64>>,
    /// Lockers chosen as deadlock victims, pending wake-up.
    victims: Mutex<HashSet<LockerId>>,
    /// Per-locker held set, for operation-end and commit/abort release.
    held: Mutex<HashMap<LockerId, HashSet<u64>>>,
    n_requests: AtomicU64,
    n_waits: AtomicU64,
    n_deadlocks: AtomicU64,
    n_timeouts: AtomicU64,
}

enum Grant {
    Granted,
    Wait { upgrade: bool },
}

fn lock_mutex<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    /// Fresh table.
    pub fn new() -> Self {
        Self {
            partitions: (0..PARTITIONS).map(|_| Partition::default()).collect(),
            waits: Mutex::new(HashMap::new()),
            victims: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
            n_requests: AtomicU64::new(0),
            n_waits: AtomicU64::new(0),
            n_deadlocks: AtomicU64::new(0),
            n_timeouts: AtomicU64::new(0),
        }
    }

    fn part(&self, record: u64) -> &Partition {
        // Identifiers are sequential, so the low bits spread well.
        &self.partitions[(record as usize) % PARTITIONS]
    }

    /// Acquire `mode` on `record` for `locker`, waiting up to `timeout`.
    pub fn lock(
        &self,
        record: u64,
        locker: LockerId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        self.n_requests.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let part = self.part(record);
        let mut queued = false;
        let mut table = lock_mutex(&part.table);

        loop {
            let grant = match Self::try_grant(&mut table, record, locker, mode, queued) {
                Ok(g) => g,
                Err(e) => {
                    // Upgrade-upgrade deadlock, reported without queueing.
                    if matches!(e, Error::Deadlock { .. }) {
                        self.n_deadlocks.fetch_add(1, Ordering::Relaxed);
                    }
                    return Err(e);
                }
            };
            match grant {
                Grant::Granted => {
                    if queued {
                        Self::unqueue(&mut table, record, locker);
                        lock_mutex(&self.waits).remove(&locker);
                    }
                    lock_mutex(&self.held)
                        .entry(locker)
                        .or_default()
                        .insert(record);
                    trace!(record, locker, ?mode, "lock granted");
                    return Ok(());
                }
                Grant::Wait { upgrade } => {
                    if !queued {
                        let entry = table.entry(record).or_default();
                        // An upgrader must be served before later arrivals
                        // or two upgraders spin forever; queue at the front.
                        let waiter = Waiter {
                            locker,
                            mode,
                            upgrade,
                        };
                        if upgrade {
                            entry.waiters.push_front(waiter);
                        } else {
                            entry.waiters.push_back(waiter);
                        }
                        queued = true;
                        lock_mutex(&self.waits).insert(locker, record);
                        self.n_waits.fetch_add(1, Ordering::Relaxed);

                        // Deadlock detection runs without nested partition
                        // locks.
                        drop(table);
                        if let Some(victim) = self.find_victim(locker) {
                            debug!(victim, requester = locker, record, "deadlock cycle");
                            if victim == locker {
                                let mut t = lock_mutex(&part.table);
                                Self::unqueue(&mut t, record, locker);
                                lock_mutex(&self.waits).remove(&locker);
                                self.n_deadlocks.fetch_add(1, Ordering::Relaxed);
                                return Err(Error::Deadlock { locker });
                            }
                            lock_mutex(&self.victims).insert(victim);
                            self.wake_all();
                        }
                        table = lock_mutex(&part.table);
                        continue;
                    }

                    if lock_mutex(&self.victims).remove(&locker) {
                        Self::unqueue(&mut table, record, locker);
                        lock_mutex(&self.waits).remove(&locker);
                        self.n_deadlocks.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::Deadlock { locker });
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        Self::unqueue(&mut table, record, locker);
                        lock_mutex(&self.waits).remove(&locker);
                        part.cond.notify_all();
                        self.n_timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(Error::LockTimeout {
                            record,
                            millis: timeout.as_millis() as u64,
                        });
                    }
                    let (t, _timed_out) = part
                        .cond
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    table = t;
                }
            }
        }
    }

    fn try_grant(
        table: &mut HashMap<u64, LockEntry>,
        record: u64,
        locker: LockerId,
        mode: LockMode,
        queued: bool,
    ) -> Result<Grant> {
        let entry = table.entry(record).or_default();

        if let Some(pos) = entry.owners.iter().position(|(l, _)| *l == locker) {
            let current = entry.owners[pos].1;
            if !mode.is_write() || current.is_write() {
                // Same or weaker request; keep the stronger mode.
                entry.owners[pos].1 = current.max(mode);
                return Ok(Grant::Granted);
            }
            // Upgrade: granted only as the sole owner.
            if entry.owners.len() == 1 {
                entry.owners[pos].1 = mode;
                return Ok(Grant::Granted);
            }
            // A second reader asking to upgrade the same record can never
            // be granted: both hold shares the other must drop.
            if !queued && entry.waiters.iter().any(|w| w.upgrade) {
                return Err(Error::Deadlock { locker });
            }
            return Ok(Grant::Wait { upgrade: true });
        }

        let ahead = entry
            .waiters
            .iter()
            .take_while(|w| w.locker != locker)
            .collect::<Vec<_>>();
        if mode.is_write() {
            let sole_or_none = entry.owners.is_empty();
            if sole_or_none && ahead.is_empty() {
                entry.owners.push((locker, mode));
                return Ok(Grant::Granted);
            }
        } else {
            let conflict = entry.owners.iter().any(|(_, m)| mode.conflicts(*m));
            let writer_ahead = ahead.iter().any(|w| w.mode.is_write());
            if !conflict && !writer_ahead {
                entry.owners.push((locker, mode));
                return Ok(Grant::Granted);
            }
        }
        Ok(Grant::Wait { upgrade: false })
    }

    fn unqueue(table: &mut HashMap<u64, LockEntry>, record: u64, locker: LockerId) {
        if let Some(entry) = table.get_mut(&record) {
            entry.waiters.retain(|w| w.locker != locker);
            if entry.owners.is_empty() && entry.waiters.is_empty() {
                table.remove(&record);
            }
        }
    }

    fn wake_all(&self) {
        for p in &self.partitions {
            let _guard = lock_mutex(&p.table);
            p.cond.notify_all();
        }
    }

    /// Owners of `record` (snapshot).
    fn owners_of(&self, record: u64) -> Vec<LockerId> {
        let table = lock_mutex(&self.part(record).table);
        table
            .get(&record)
            .map(|e| e.owners.iter().map(|(l, _)| *l).collect())
            .unwrap_or_default()
    }

    /// Walk the wait-for graph from `requester`; if a cycle through it
    /// exists, return the youngest locker on the cycle.
    fn find_victim(&self, requester: LockerId) -> Option<LockerId> {
        let waits = lock_mutex(&self.waits).clone();
        // DFS with an explicit path so the cycle members are known.
        let mut path: Vec<LockerId> = vec![requester];
        let mut stack: Vec<(LockerId, Vec<LockerId>)> = Vec::new();
        if let Some(&record) = waits.get(&requester) {
            stack.push((requester, self.owners_of(record)));
        }
        let mut visited: HashSet<LockerId> = HashSet::new();
        while let Some((at, mut owners)) = stack.pop() {
            // Re-sync the path with the DFS position.
            while path.last().is_some_and(|l| *l != at) {
                path.pop();
            }
            match owners.pop() {
                None => {
                    path.pop();
                    continue;
                }
                Some(owner) => {
                    stack.push((at, owners));
                    if owner == requester {
                        // Cycle: everyone on the current path participates.
                        return path.iter().copied().max();
                    }
                    if !visited.insert(owner) {
                        continue;
                    }
                    if let Some(&record) = waits.get(&owner) {
                        path.push(owner);
                        stack.push((owner, self.owners_of(record)));
                    }
                }
            }
        }
        None
    }

    /// Drop one lock.
    pub fn release(&self, record: u64, locker: LockerId) {
        let part = self.part(record);
        let mut table = lock_mutex(&part.table);
        if let Some(entry) = table.get_mut(&record) {
            entry.owners.retain(|(l, _)| *l != locker);
            if entry.owners.is_empty() && entry.waiters.is_empty() {
                table.remove(&record);
            }
        }
        drop(table);
        part.cond.notify_all();
        if let Some(set) = lock_mutex(&self.held).get_mut(&locker) {
            set.remove(&record);
        }
    }

    /// Drop every lock held by `locker` (operation end, commit, abort).
    pub fn release_all(&self, locker: LockerId) {
        let records: Vec<u64> = lock_mutex(&self.held)
            .remove(&locker)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for record in records {
            let part = self.part(record);
            let mut table = lock_mutex(&part.table);
            if let Some(entry) = table.get_mut(&record) {
                entry.owners.retain(|(l, _)| *l != locker);
                if entry.owners.is_empty() && entry.waiters.is_empty() {
                    table.remove(&record);
                }
            }
            drop(table);
            part.cond.notify_all();
        }
        lock_mutex(&self.waits).remove(&locker);
        lock_mutex(&self.victims).remove(&locker);
    }

    /// Move a held lock between lockers (handle-lock transfer on
    /// truncate/remove/rename).
    pub fn transfer(&self, record: u64, from: LockerId, to: LockerId) {
        let part = self.part(record);
        let mut table = lock_mutex(&part.table);
        if let Some(entry) = table.get_mut(&record) {
            for owner in entry.owners.iter_mut() {
                if owner.0 == from {
                    owner.0 = to;
                }
            }
        }
        drop(table);
        let mut held = lock_mutex(&self.held);
        if let Some(set) = held.get_mut(&from) {
            set.remove(&record);
        }
        held.entry(to).or_default().insert(record);
    }

    /// `true` when `locker` owns `record` (at least shared; exclusively
    /// when `write` is set).
    pub fn holds(&self, record: u64, locker: LockerId, write: bool) -> bool {
        let table = lock_mutex(&self.part(record).table);
        table
            .get(&record)
            .map(|e| {
                e.owners
                    .iter()
                    .any(|(l, m)| *l == locker && (!write || m.is_write()))
            })
            .unwrap_or(false)
    }

    /// `true` when any locker other than `locker` owns `record` (the
    /// cleaner's pending-LN test).
    pub fn locked_by_other(&self, record: u64, locker: LockerId) -> bool {
        let table = lock_mutex(&self.part(record).table);
        table
            .get(&record)
            .map(|e| e.owners.iter().any(|(l, _)| *l != locker))
            .unwrap_or(false)
    }

    /// Counter snapshot plus current owner/waiter totals.
    pub fn stats(&self) -> LockStatsSnapshot {
        let mut n_owned = 0u64;
        let mut n_waiters = 0u64;
        for p in &self.partitions {
            let table = lock_mutex(&p.table);
            for e in table.values() {
                n_owned += e.owners.len() as u64;
                n_waiters += e.waiters.len() as u64;
            }
        }
        LockStatsSnapshot {
            n_requests: self.n_requests.load(Ordering::Relaxed),
            n_waits: self.n_waits.load(Ordering::Relaxed),
            n_deadlocks: self.n_deadlocks.load(Ordering::Relaxed),
            n_timeouts: self.n_timeouts.load(Ordering::Relaxed),
            n_owned,
            n_waiters,
        }
    }
}
