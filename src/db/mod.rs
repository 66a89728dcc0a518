//! Databases: named ordered maps inside an environment.
//!
//! A [`Database`] handle pairs the environment core with one
//! [`DatabaseImpl`] (id, tree, persistent flags, secondary triggers).
//! Opening a handle takes a **handle lock** keyed by the database id, so
//! truncate/remove/rename serialize against users of the name. Data
//! operations are thin wrappers over an internal cursor.
//!
//! Secondary databases live in [`secondary`]: writes to a primary are
//! mirrored into its secondaries under the same transaction through the
//! trigger list registered here.

pub mod secondary;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::cursor::Cursor;
use crate::env::EnvCore;
use crate::error::{Error, OpStatus, Result};
use crate::tree::{Comparator, Tree};
use crate::txn::{Txn, handle_lock_key};
use secondary::SecondaryTrigger;

/// One key/value pair returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record key.
    pub key: Vec<u8>,
    /// Record value.
    pub value: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Per-database configuration.
#[derive(Clone, Default)]
pub struct DatabaseConfig {
    /// Create the database when the name is unknown.
    pub allow_create: bool,
    /// Fail with `DatabaseExists` when the name is already present.
    pub exclusive_create: bool,
    /// Permit multiple (ordered) values per key.
    pub sorted_duplicates: bool,
    /// Operations default to transactional semantics.
    pub transactional: bool,
    /// Reject writes through this handle.
    pub read_only: bool,
    /// Main key order; lexicographic bytes when `None`.
    pub key_comparator: Option<Comparator>,
    /// Duplicate (value) order; lexicographic bytes when `None`.
    pub duplicate_comparator: Option<Comparator>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("allow_create", &self.allow_create)
            .field("exclusive_create", &self.exclusive_create)
            .field("sorted_duplicates", &self.sorted_duplicates)
            .field("transactional", &self.transactional)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Snapshot returned by [`Database::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DatabaseStats {
    /// Internal nodes (IN/DIN) in the tree.
    pub n_internal_nodes: u64,
    /// Bottom nodes (BIN/DBIN).
    pub n_bottom_nodes: u64,
    /// Live leaf records.
    pub n_records: u64,
    /// Logically deleted slots awaiting compression.
    pub n_deleted_slots: u64,
    /// Tree height (root level).
    pub height: u8,
}

// ------------------------------------------------------------------------------------------------
// DatabaseImpl and registry
// ------------------------------------------------------------------------------------------------

/// Shared per-database state (one per database id, however many handles).
pub(crate) struct DatabaseImpl {
    /// Database id (also the handle-lock key, tagged).
    pub id: u64,
    /// Current name.
    pub name: Mutex<String>,
    /// The tree.
    pub tree: Arc<Tree>,
    /// Duplicates permitted (persistent flag).
    pub sorted_duplicates: bool,
    /// Transactional semantics by default.
    pub transactional: bool,
    /// Secondary-index triggers fired by primary writes.
    pub triggers: RwLock<Vec<Arc<SecondaryTrigger>>>,
    /// Foreign-key constraints watching deletes on this database.
    pub foreign_links: RwLock<Vec<Arc<secondary::ForeignLink>>>,
}

impl DatabaseImpl {
    pub(crate) fn read_triggers(&self) -> Vec<Arc<SecondaryTrigger>> {
        self.triggers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn read_foreign_links(&self) -> Vec<Arc<secondary::ForeignLink>> {
        self.foreign_links
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

/// All databases known to the environment (open or not), by id and name.
#[derive(Default)]
pub struct DbRegistry {
    by_id: Mutex<HashMap<u64, Arc<DatabaseImpl>>>,
    by_name: Mutex<HashMap<String, u64>>,
}

impl DbRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock_ids(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<DatabaseImpl>>> {
        self.by_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_names(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.by_name
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, db: Arc<DatabaseImpl>) {
        let name = db
            .name
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        self.lock_names().insert(name, db.id);
        self.lock_ids().insert(db.id, db);
    }

    pub(crate) fn by_id(&self, id: u64) -> Option<Arc<DatabaseImpl>> {
        self.lock_ids().get(&id).cloned()
    }

    pub(crate) fn id_of(&self, name: &str) -> Option<u64> {
        self.lock_names().get(name).copied()
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<DatabaseImpl>> {
        let id = self.id_of(name)?;
        self.by_id(id)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<DatabaseImpl>> {
        let id = self.lock_names().remove(name)?;
        self.lock_ids().remove(&id)
    }

    pub(crate) fn rename(&self, from: &str, to: &str) -> bool {
        let mut names = self.lock_names();
        let Some(id) = names.remove(from) else {
            return false;
        };
        names.insert(to.to_string(), id);
        drop(names);
        if let Some(db) = self.by_id(id) {
            *db.name
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = to.to_string();
        }
        true
    }

    pub(crate) fn all(&self) -> Vec<Arc<DatabaseImpl>> {
        self.lock_ids().values().cloned().collect()
    }

    /// The tree behind a database id (background workers).
    pub fn tree(&self, db_id: u64) -> Option<Arc<Tree>> {
        self.by_id(db_id).map(|db| Arc::clone(&db.tree))
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// A handle to one named database.
///
/// Obtained from `Environment::open_database`; dropping the handle releases
/// its handle lock.
pub struct Database {
    pub(crate) core: Arc<EnvCore>,
    pub(crate) imp: Arc<DatabaseImpl>,
    /// Handle locker owning the read handle lock.
    pub(crate) handle_locker: u64,
    pub(crate) read_only: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.imp.id)
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Database {
    /// The database's current name.
    pub fn name(&self) -> String {
        self.imp
            .name
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// `true` when this database permits duplicate values per key.
    pub fn sorted_duplicates(&self) -> bool {
        self.imp.sorted_duplicates
    }

    fn check_writable(&self) -> Result<()> {
        self.core.check_valid()?;
        if self.read_only || self.core.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Open a cursor over this database.
    pub fn open_cursor(&self, txn: Option<&crate::env::Transaction>) -> Result<Cursor> {
        self.core.check_valid()?;
        Cursor::open(
            Arc::clone(&self.core),
            Arc::clone(&self.imp),
            txn.map(|t| Arc::clone(&t.inner)),
            self.read_only,
        )
    }

    /// Insert or update; with duplicates enabled this inserts another
    /// value under the key.
    pub fn put(&self, txn: Option<&crate::env::Transaction>, key: &[u8], value: &[u8]) -> Result<OpStatus> {
        self.check_writable()?;
        self.with_auto_txn(txn, |cursor| cursor.put(key, value))
    }

    /// Insert only if the key is absent.
    pub fn put_no_overwrite(
        &self,
        txn: Option<&crate::env::Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> Result<OpStatus> {
        self.check_writable()?;
        self.with_auto_txn(txn, |cursor| cursor.put_no_overwrite(key, value))
    }

    /// Insert only if the exact (key, value) pair is absent.
    pub fn put_no_dup_data(
        &self,
        txn: Option<&crate::env::Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> Result<OpStatus> {
        self.check_writable()?;
        self.with_auto_txn(txn, |cursor| cursor.put_no_dup_data(key, value))
    }

    /// Point lookup.
    pub fn get(
        &self,
        txn: Option<&crate::env::Transaction>,
        key: &[u8],
        dirty_read: bool,
    ) -> Result<Option<Record>> {
        self.core.check_valid()?;
        let mut cursor = self.open_cursor(txn)?;
        cursor.set_dirty_read(dirty_read);
        let found = cursor.search(key)?;
        cursor.close()?;
        Ok(found)
    }

    /// Exact (key, value) lookup, descending into duplicates.
    pub fn get_search_both(
        &self,
        txn: Option<&crate::env::Transaction>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Record>> {
        self.core.check_valid()?;
        let mut cursor = self.open_cursor(txn)?;
        let found = cursor.search_both(key, value)?;
        cursor.close()?;
        Ok(found)
    }

    /// Delete all values of a key.
    pub fn delete(&self, txn: Option<&crate::env::Transaction>, key: &[u8]) -> Result<OpStatus> {
        self.check_writable()?;
        self.with_auto_txn(txn, |cursor| {
            if cursor.search(key)?.is_none() {
                return Ok(OpStatus::NotFound);
            }
            // Delete every duplicate under the key.
            loop {
                cursor.delete()?;
                match cursor.next_dup()? {
                    Some(_) => continue,
                    None => break,
                }
            }
            Ok(OpStatus::Success)
        })
    }

    /// Run `op` on an internal cursor under the given transaction, or an
    /// auto-transaction when the database is transactional and none was
    /// supplied.
    fn with_auto_txn<F, T>(&self, txn: Option<&crate::env::Transaction>, op: F) -> Result<T>
    where
        F: FnOnce(&mut Cursor) -> Result<T>,
    {
        match (txn, self.imp.transactional) {
            (Some(t), _) => {
                let mut cursor = self.open_cursor(Some(t))?;
                let out = op(&mut cursor);
                cursor.close()?;
                out
            }
            (None, true) => {
                let auto = self.core.begin_txn_inner(&Default::default())?;
                let mut cursor = Cursor::open(
                    Arc::clone(&self.core),
                    Arc::clone(&self.imp),
                    Some(Arc::clone(&auto)),
                    self.read_only,
                )?;
                let out = op(&mut cursor);
                cursor.close()?;
                match &out {
                    Ok(_) => self.core.txns.commit(&auto, &self.core.ctx.log, &self.core.locks, None)?,
                    Err(_) => {
                        self.core
                            .txns
                            .abort(&auto, &self.core.ctx.log, &self.core.locks, &self.core.registry)?;
                    }
                }
                out
            }
            (None, false) => {
                let mut cursor = self.open_cursor(None)?;
                let out = op(&mut cursor);
                cursor.close()?;
                out
            }
        }
    }

    /// Empty the database; returns the number of records discarded when
    /// `count_records` is set.
    ///
    /// Runs auto-committed: the handle lock is transferred to an exclusive
    /// locker for the duration, so concurrent handles block rather than
    /// observe a half-truncated tree.
    pub fn truncate(&self, count_records: bool) -> Result<u64> {
        self.check_writable()?;
        self.core
            .truncate_database(&self.imp, self.handle_locker, count_records)
    }

    /// Warm the cache by walking the tree until `max_bytes` of additional
    /// memory is resident.
    pub fn preload(&self, max_bytes: u64) -> Result<()> {
        self.core.check_valid()?;
        let tree = &self.imp.tree;
        let start = tree.ctx.cache.usage();
        let Some(root) = tree.root_cell()? else {
            return Ok(());
        };
        let mut queue = vec![root];
        while let Some(cell) = queue.pop() {
            if tree.ctx.cache.usage().saturating_sub(start) >= max_bytes {
                break;
            }
            let mut guard = cell.write(tree.ctx.next_generation());
            if guard.kind.is_bottom() {
                for i in 0..guard.slots.len() {
                    if !guard.slots[i].known_deleted && guard.slots[i].lsn.is_some() {
                        let _ = tree.fetch_ln(&mut guard, i)?;
                    }
                }
            } else {
                for i in 0..guard.slots.len() {
                    queue.push(tree.fetch_child(&mut guard, i)?);
                }
            }
        }
        Ok(())
    }

    /// Tree-shape statistics from a full walk.
    pub fn stats(&self) -> Result<DatabaseStats> {
        self.core.check_valid()?;
        let tree = &self.imp.tree;
        let mut stats = DatabaseStats::default();
        let Some(root) = tree.root_cell()? else {
            return Ok(stats);
        };
        {
            let guard = root.read();
            stats.height = guard.level;
        }
        let mut queue = vec![root];
        while let Some(cell) = queue.pop() {
            let mut guard = cell.write(tree.ctx.next_generation());
            if guard.kind.is_bottom() {
                stats.n_bottom_nodes += 1;
                for slot in &guard.slots {
                    if slot.known_deleted {
                        stats.n_deleted_slots += 1;
                    } else {
                        stats.n_records += 1;
                    }
                }
            } else {
                stats.n_internal_nodes += 1;
                for i in 0..guard.slots.len() {
                    queue.push(tree.fetch_child(&mut guard, i)?);
                }
            }
        }
        Ok(stats)
    }

    /// Equality join over cursors positioned on secondary keys; see
    /// [`JoinCursor`].
    pub fn join(&self, cursors: Vec<Cursor>) -> Result<JoinCursor> {
        if cursors.is_empty() {
            return Err(Error::InvalidConfig("join requires at least one cursor".into()));
        }
        Ok(JoinCursor {
            core: Arc::clone(&self.core),
            primary: Arc::clone(&self.imp),
            cursors,
            started: false,
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.core.locks.release(handle_lock_key(self.imp.id), self.handle_locker);
        debug!(db = self.imp.id, "database handle closed");
    }
}

// ------------------------------------------------------------------------------------------------
// Join cursor
// ------------------------------------------------------------------------------------------------

/// Intersects the primary keys referenced by several secondary cursors and
/// yields the matching primary records.
pub struct JoinCursor {
    core: Arc<EnvCore>,
    primary: Arc<DatabaseImpl>,
    cursors: Vec<Cursor>,
    started: bool,
}

impl JoinCursor {
    /// Next primary record referenced by *all* join cursors.
    pub fn next(&mut self) -> Result<Option<Record>> {
        loop {
            // Candidate primary key from the first cursor's current
            // duplicate; advance it each round.
            let candidate = if self.started {
                self.cursors[0].next_dup()?
            } else {
                self.started = true;
                self.cursors[0].current()?
            };
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            let pk = candidate.value;
            let mut all_match = true;
            for cursor in self.cursors.iter_mut().skip(1) {
                let sec_key = match cursor.current()? {
                    Some(r) => r.key,
                    None => return Ok(None),
                };
                if cursor.search_both(&sec_key, &pk)?.is_none() {
                    all_match = false;
                    break;
                }
            }
            if !all_match {
                continue;
            }
            let mut primary_cursor = Cursor::open(
                Arc::clone(&self.core),
                Arc::clone(&self.primary),
                None,
                true,
            )?;
            let found = primary_cursor.search(&pk)?;
            primary_cursor.close()?;
            match found {
                Some(record) => return Ok(Some(record)),
                None => {
                    return Err(Error::SecondaryCorrupt(format!(
                        "join candidate {:?} missing from primary",
                        pk
                    )));
                }
            }
        }
    }
}

/// Lock timeout for an operation, honoring the transaction's settings.
pub(crate) fn op_lock_timeout(core: &EnvCore, txn: Option<&Arc<Txn>>) -> Result<Duration> {
    match txn {
        Some(t) => t.remaining_lock_timeout(),
        None => Ok(core.config.lock_timeout),
    }
}
