//! Positional cursors.
//!
//! A cursor's logical position is a key (plus a duplicate key inside a
//! duplicate subtree) with a cached `(node, index)` hint. Between
//! operations no latch is held: every operation re-latches the remembered
//! bottom node, verifies the hint against the key, and falls back to a
//! fresh tree search when a split or compression moved things. While a
//! cursor is parked on a node the node's cursor count is raised, which is
//! what makes the compressor defer physical slot removal under it.
//!
//! ## Dup-and-swap
//!
//! Every navigation computes its target on a scratch value and adopts it
//! only on success; a failed operation leaves the cursor exactly where it
//! was.
//!
//! ## Lock protocol
//!
//! No node latch is ever held across a record-lock wait. Read targets go
//! through: note the record id under the latch → pin the node → drop the
//! latch → acquire the lock → re-latch and re-verify. Write paths use the
//! retry shape instead: if a needed lock is not yet held, all latches are
//! dropped, the lock is acquired blocking, and the descent restarts — the
//! second pass finds every lock already held and never blocks under a
//! latch.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use tracing::trace;

use crate::db::{DatabaseImpl, Record, secondary};
use crate::env::EnvCore;
use crate::error::{Error, OpStatus, Result};
use crate::lock::LockMode;
use crate::log::{DupCountEntry, LnEntry, LogEntry, Lsn};
use crate::tree::node::{Child, NodeCell, NodeWriteGuard, SlotSearch};
use crate::txn::{DupCountUndo, Txn, UndoRecord};

// ------------------------------------------------------------------------------------------------
// Position
// ------------------------------------------------------------------------------------------------

#[derive(Clone)]
struct DupPos {
    din: Arc<NodeCell>,
    dbin: Arc<NodeCell>,
    index: usize,
    dup_key: Vec<u8>,
}

#[derive(Clone)]
struct Position {
    bin: Arc<NodeCell>,
    index: usize,
    key: Vec<u8>,
    dup: Option<DupPos>,
}

/// Put flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Overwrite,
    NoOverwrite,
    NoDupData,
}

/// A target computed by navigation, before locking.
enum RawTarget {
    Main {
        bin: Arc<NodeCell>,
        index: usize,
        key: Vec<u8>,
        record: u64,
    },
    Dup {
        bin: Arc<NodeCell>,
        bin_index: usize,
        key: Vec<u8>,
        din: Arc<NodeCell>,
        dbin: Arc<NodeCell>,
        index: usize,
        dup_key: Vec<u8>,
        record: u64,
    },
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// A positional cursor over one database.
pub struct Cursor {
    core: Arc<EnvCore>,
    db: Arc<DatabaseImpl>,
    txn: Option<Arc<Txn>>,
    locker: u64,
    dirty_read: bool,
    read_only: bool,
    pos: Option<Position>,
    closed: bool,
}

impl Cursor {
    pub(crate) fn open(
        core: Arc<EnvCore>,
        db: Arc<DatabaseImpl>,
        txn: Option<Arc<Txn>>,
        read_only: bool,
    ) -> Result<Self> {
        let locker = match &txn {
            Some(t) => t.id,
            None => core.next_locker_id(),
        };
        Ok(Self {
            core,
            db,
            txn,
            locker,
            dirty_read: false,
            read_only,
            pos: None,
            closed: false,
        })
    }

    /// Skip record locks on reads; may observe uncommitted writes.
    pub fn set_dirty_read(&mut self, dirty: bool) {
        self.dirty_read = dirty;
    }

    /// Release remaining locks and drop the position.
    pub fn close(mut self) -> Result<()> {
        self.close_inner();
        Ok(())
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.clear_position();
        if self.txn.is_none() {
            self.core.locks.release_all(self.locker);
        }
    }

    /// Clone this cursor (shared locker), optionally at the same position.
    pub fn dup(&self, same_position: bool) -> Result<Cursor> {
        let mut c = Cursor {
            core: Arc::clone(&self.core),
            db: Arc::clone(&self.db),
            txn: self.txn.clone(),
            locker: self.locker,
            dirty_read: self.dirty_read,
            read_only: self.read_only,
            pos: None,
            closed: false,
        };
        if same_position {
            if let Some(p) = &self.pos {
                c.adopt_position(p.clone());
            }
        }
        Ok(c)
    }

    // --------------------------------------------------------------------------------------------
    // Position bookkeeping
    // --------------------------------------------------------------------------------------------

    fn clear_position(&mut self) {
        if let Some(p) = self.pos.take() {
            p.bin.cursor_depart();
            if let Some(d) = &p.dup {
                d.dbin.cursor_depart();
            }
        }
    }

    fn adopt_position(&mut self, p: Position) {
        p.bin.cursor_arrive();
        if let Some(d) = &p.dup {
            d.dbin.cursor_arrive();
        }
        self.clear_position();
        self.pos = Some(p);
    }

    /// Non-transactional lockers hold only their current position's lock;
    /// each operation starts by releasing the previous one.
    fn begin_op(&mut self) -> Result<()> {
        self.core.check_valid()?;
        if self.closed {
            return Err(Error::IllegalState("cursor is closed".into()));
        }
        if self.txn.is_none() {
            self.core.locks.release_all(self.locker);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only || self.core.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn lock_record(&self, record: u64, mode: LockMode) -> Result<()> {
        if self.dirty_read && !mode.is_write() {
            return Ok(());
        }
        let timeout = crate::db::op_lock_timeout(&self.core, self.txn.as_ref())?;
        self.core.locks.lock(record, self.locker, mode, timeout)
    }

    fn holds_write(&self, record: u64) -> bool {
        self.core.locks.holds(record, self.locker, true)
    }

    fn txn_id(&self) -> u64 {
        self.txn.as_ref().map(|t| t.id).unwrap_or(0)
    }

    fn push_undo(&self, undo: UndoRecord) {
        if let Some(t) = &self.txn {
            t.push_undo(undo);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Re-latching by key
    // --------------------------------------------------------------------------------------------

    /// Re-latch the bottom node holding `key`, trusting `hint` when it
    /// still matches and re-searching otherwise. `None` when the key has
    /// no slot at all.
    fn latch_main(
        &self,
        key: &[u8],
        hint: Option<(&Arc<NodeCell>, usize)>,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let tree = &self.db.tree;
        if let Some((bin, index)) = hint {
            if tree.get(bin.id).is_some() {
                let guard = bin.write(tree.ctx.next_generation());
                if index < guard.slots.len()
                    && (tree.key_cmp)(&guard.slots[index].key, key) == CmpOrdering::Equal
                {
                    return Ok(Some((guard, index)));
                }
                if let SlotSearch::Exact(i) = guard.find_slot(key, &tree.key_cmp) {
                    return Ok(Some((guard, i)));
                }
                drop(guard);
            }
        }
        match tree.search_position(key)? {
            Some((guard, SlotSearch::Exact(i))) => Ok(Some((guard, i))),
            _ => Ok(None),
        }
    }

    /// Is `bin.slots[idx]` the root of a duplicate subtree?  Resolves a
    /// non-resident child by peeking at the record type behind its LSN.
    fn dup_root_of(
        &self,
        bin: &mut NodeWriteGuard,
        idx: usize,
    ) -> Result<Option<Arc<NodeCell>>> {
        let tree = &self.db.tree;
        match &bin.slots[idx].child {
            Child::Ln(_) => Ok(None),
            Child::Node(_) => Ok(Some(tree.fetch_child(bin, idx)?)),
            Child::None => {
                let Some(lsn) = bin.slots[idx].lsn else {
                    return Ok(None);
                };
                let header = tree.ctx.log.read_header(lsn)?;
                if header.ty.is_node_image() || header.ty == crate::log::LogEntryType::BinDelta {
                    Ok(Some(tree.fetch_child(bin, idx)?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Read finishing: lock, verify, fetch, adopt
    // --------------------------------------------------------------------------------------------

    fn finish_read(&mut self, target: RawTarget) -> Result<Option<Record>> {
        match target {
            RawTarget::Main {
                bin,
                index,
                key,
                mut record,
            } => {
                bin.pin();
                let out = loop {
                    if let Err(e) = self.lock_record(record, LockMode::Read) {
                        bin.unpin();
                        return Err(e);
                    }
                    let Some((mut guard, idx)) = self.latch_main(&key, Some((&bin, index)))? else {
                        break None;
                    };
                    if guard.slots[idx].known_deleted {
                        break None;
                    }
                    if guard.slots[idx].child_id != record {
                        record = guard.slots[idx].child_id;
                        continue;
                    }
                    let value = self.db.tree.fetch_ln(&mut guard, idx)?;
                    let cell = Arc::clone(guard.cell());
                    drop(guard);
                    self.adopt_position(Position {
                        bin: cell,
                        index: idx,
                        key: key.clone(),
                        dup: None,
                    });
                    break Some(Record { key, value });
                };
                bin.unpin();
                Ok(out)
            }
            RawTarget::Dup {
                bin,
                bin_index,
                key,
                din,
                dbin,
                index,
                dup_key,
                mut record,
            } => {
                dbin.pin();
                let out = loop {
                    if let Err(e) = self.lock_record(record, LockMode::Read) {
                        dbin.unpin();
                        return Err(e);
                    }
                    // Re-verify down the duplicate path.
                    let Some((mut bg, bidx)) = self.latch_main(&key, Some((&bin, bin_index)))?
                    else {
                        break None;
                    };
                    let Some(din_now) = self.dup_root_of(&mut bg, bidx)? else {
                        break None;
                    };
                    let bin_cell = Arc::clone(bg.cell());
                    drop(bg);
                    let (mut dg, dpos) = self.db.tree.dup_search_position(&din_now, &dup_key)?;
                    let SlotSearch::Exact(didx) = dpos else {
                        break None;
                    };
                    if dg.slots[didx].known_deleted {
                        break None;
                    }
                    if dg.slots[didx].child_id != record {
                        record = dg.slots[didx].child_id;
                        continue;
                    }
                    let value = self.db.tree.fetch_ln(&mut dg, didx)?;
                    let dbin_cell = Arc::clone(dg.cell());
                    drop(dg);
                    self.adopt_position(Position {
                        bin: bin_cell,
                        index: bidx,
                        key: key.clone(),
                        dup: Some(DupPos {
                            din: din_now,
                            dbin: dbin_cell,
                            index: didx,
                            dup_key: dup_key.clone(),
                        }),
                    });
                    break Some(Record { key, value });
                };
                dbin.unpin();
                Ok(out)
            }
        }
    }

    /// Build a main-slot target; descends into a duplicate subtree's edge
    /// when the slot is a duplicate root. `None` when the slot (or its
    /// whole duplicate set) is deleted.
    fn target_for_slot(
        &self,
        guard: &mut NodeWriteGuard,
        idx: usize,
        forward: bool,
    ) -> Result<Option<RawTarget>> {
        let key = guard.slots[idx].key.clone();
        if let Some(din) = self.dup_root_of(guard, idx)? {
            let Some((dg, didx)) = self.dup_edge_live(&din, forward)? else {
                return Ok(None);
            };
            let dup_key = dg.slots[didx].key.clone();
            let record = dg.slots[didx].child_id;
            let dbin = Arc::clone(dg.cell());
            drop(dg);
            return Ok(Some(RawTarget::Dup {
                bin: Arc::clone(guard.cell()),
                bin_index: idx,
                key,
                din,
                dbin,
                index: didx,
                dup_key,
                record,
            }));
        }
        Ok(Some(RawTarget::Main {
            bin: Arc::clone(guard.cell()),
            index: idx,
            key,
            record: guard.slots[idx].child_id,
        }))
    }

    /// First (or last) live slot of a duplicate subtree.
    fn dup_edge_live(
        &self,
        din: &Arc<NodeCell>,
        first: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let tree = &self.db.tree;
        let Some((guard, idx)) = tree.dup_edge(din, first)? else {
            return Ok(None);
        };
        if !guard.slots[idx].known_deleted {
            return Ok(Some((guard, idx)));
        }
        let anchor = guard.slots[idx].key.clone();
        drop(guard);
        self.dup_neighbor_live(din, &anchor, first, false)
    }

    /// Next (or previous) live duplicate strictly beyond `dup_key` unless
    /// `include_equal`.
    fn dup_neighbor_live(
        &self,
        din: &Arc<NodeCell>,
        dup_key: &[u8],
        forward: bool,
        include_equal: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let tree = &self.db.tree;
        let mut anchor = dup_key.to_vec();
        let mut include = include_equal;
        loop {
            let hit = if forward {
                tree.dup_next_position(din, &anchor, include)?
            } else {
                tree.dup_prev_position(din, &anchor, include)?
            };
            let Some((guard, idx)) = hit else {
                return Ok(None);
            };
            if !guard.slots[idx].known_deleted {
                return Ok(Some((guard, idx)));
            }
            anchor = guard.slots[idx].key.clone();
            include = false;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Navigation
    // --------------------------------------------------------------------------------------------

    /// Move to the first record.
    pub fn first(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        self.edge(true)
    }

    /// Move to the last record.
    pub fn last(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        self.edge(false)
    }

    fn edge(&mut self, forward: bool) -> Result<Option<Record>> {
        let tree = &self.db.tree;
        let hit = if forward {
            tree.first_position()?
        } else {
            tree.last_position()?
        };
        let Some((mut guard, idx)) = hit else {
            return Ok(None);
        };
        if guard.slots[idx].known_deleted {
            let anchor = guard.slots[idx].key.clone();
            drop(guard);
            return self.advance_main(&anchor, forward, false);
        }
        match self.target_for_slot(&mut guard, idx, forward)? {
            Some(t) => {
                drop(guard);
                self.finish_read(t)
            }
            None => {
                let anchor = guard.slots[idx].key.clone();
                drop(guard);
                self.advance_main(&anchor, forward, false)
            }
        }
    }

    /// Move to the next record (entering and leaving duplicate sets).
    pub fn next(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return self.edge(true);
        };
        if let Some(d) = &pos.dup {
            if let Some(r) = self.step_dup(&pos, d, true, false)? {
                return Ok(Some(r));
            }
        }
        self.advance_main(&pos.key, true, false)
    }

    /// Move to the previous record.
    pub fn prev(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return self.edge(false);
        };
        if let Some(d) = &pos.dup {
            if let Some(r) = self.step_dup(&pos, d, false, false)? {
                return Ok(Some(r));
            }
        }
        self.advance_main(&pos.key, false, false)
    }

    /// Next duplicate of the current key, or `None` at the end of the set.
    pub fn next_dup(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return Err(Error::IllegalState("cursor not positioned".into()));
        };
        let Some(d) = &pos.dup else {
            return Ok(None);
        };
        self.step_dup(&pos, d, true, false)
    }

    /// Previous duplicate of the current key.
    pub fn prev_dup(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return Err(Error::IllegalState("cursor not positioned".into()));
        };
        let Some(d) = &pos.dup else {
            return Ok(None);
        };
        self.step_dup(&pos, d, false, false)
    }

    /// Next record with a different key.
    pub fn next_no_dup(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return self.edge(true);
        };
        self.advance_main(&pos.key, true, false)
    }

    /// Previous record with a different key.
    pub fn prev_no_dup(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return self.edge(false);
        };
        self.advance_main(&pos.key, false, false)
    }

    fn step_dup(
        &mut self,
        pos: &Position,
        d: &DupPos,
        forward: bool,
        include_equal: bool,
    ) -> Result<Option<Record>> {
        // Re-resolve the duplicate root through the main slot; the cached
        // `din` may have been re-rooted by a subtree split.
        let Some((mut bg, bidx)) = self.latch_main(&pos.key, Some((&pos.bin, pos.index)))? else {
            return Ok(None);
        };
        let Some(din) = self.dup_root_of(&mut bg, bidx)? else {
            return Ok(None);
        };
        let key = bg.slots[bidx].key.clone();
        let bin = Arc::clone(bg.cell());
        drop(bg);
        let Some((dg, didx)) = self.dup_neighbor_live(&din, &d.dup_key, forward, include_equal)?
        else {
            return Ok(None);
        };
        let dup_key = dg.slots[didx].key.clone();
        let record = dg.slots[didx].child_id;
        let dbin = Arc::clone(dg.cell());
        drop(dg);
        self.finish_read(RawTarget::Dup {
            bin,
            bin_index: bidx,
            key,
            din,
            dbin,
            index: didx,
            dup_key,
            record,
        })
    }

    /// Advance to the nearest live main slot beyond `anchor`, skipping
    /// deleted slots and empty duplicate sets. A concurrent insertion
    /// between latch drops is safe: each round re-descends from the
    /// logical key, so anything inserted beyond it is found.
    fn advance_main(
        &mut self,
        anchor: &[u8],
        forward: bool,
        include_equal: bool,
    ) -> Result<Option<Record>> {
        let tree = &self.db.tree;
        let mut anchor = anchor.to_vec();
        let mut include = include_equal;
        loop {
            let hit = if forward {
                tree.next_position(&anchor, include)?
            } else {
                tree.prev_position(&anchor, include)?
            };
            let Some((mut guard, idx)) = hit else {
                return Ok(None);
            };
            let slot_key = guard.slots[idx].key.clone();
            if guard.slots[idx].known_deleted {
                drop(guard);
                anchor = slot_key;
                include = false;
                continue;
            }
            match self.target_for_slot(&mut guard, idx, forward)? {
                Some(t) => {
                    drop(guard);
                    return self.finish_read(t);
                }
                None => {
                    drop(guard);
                    anchor = slot_key;
                    include = false;
                }
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Searches
    // --------------------------------------------------------------------------------------------

    /// Exact-key search (`SET`).
    pub fn search(&mut self, key: &[u8]) -> Result<Option<Record>> {
        self.begin_op()?;
        let tree = &self.db.tree;
        let Some((mut guard, pos)) = tree.search_position(key)? else {
            return Ok(None);
        };
        let SlotSearch::Exact(idx) = pos else {
            return Ok(None);
        };
        if guard.slots[idx].known_deleted {
            return Ok(None);
        }
        match self.target_for_slot(&mut guard, idx, true)? {
            Some(t) => {
                drop(guard);
                self.finish_read(t)
            }
            None => Ok(None),
        }
    }

    /// First record with key ≥ `key` (`SET_RANGE`).
    pub fn search_range(&mut self, key: &[u8]) -> Result<Option<Record>> {
        self.begin_op()?;
        self.advance_main(key, true, true)
    }

    /// Exact key and exact value (`BOTH`).
    pub fn search_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Record>> {
        self.begin_op()?;
        let tree = &self.db.tree;
        let Some((mut guard, pos)) = tree.search_position(key)? else {
            return Ok(None);
        };
        let SlotSearch::Exact(idx) = pos else {
            return Ok(None);
        };
        if guard.slots[idx].known_deleted {
            return Ok(None);
        }
        if let Some(din) = self.dup_root_of(&mut guard, idx)? {
            let key = guard.slots[idx].key.clone();
            let bin = Arc::clone(guard.cell());
            let bin_index = idx;
            drop(guard);
            let (dg, dpos) = tree.dup_search_position(&din, value)?;
            let SlotSearch::Exact(didx) = dpos else {
                return Ok(None);
            };
            if dg.slots[didx].known_deleted {
                return Ok(None);
            }
            let record = dg.slots[didx].child_id;
            let dup_key = dg.slots[didx].key.clone();
            let dbin = Arc::clone(dg.cell());
            drop(dg);
            return self.finish_read(RawTarget::Dup {
                bin,
                bin_index,
                key,
                din,
                dbin,
                index: didx,
                dup_key,
                record,
            });
        }
        // Single record: the stored value must match.
        let existing = tree.fetch_ln(&mut guard, idx)?;
        if (tree.dup_cmp)(&existing, value) != CmpOrdering::Equal {
            return Ok(None);
        }
        let t = RawTarget::Main {
            bin: Arc::clone(guard.cell()),
            index: idx,
            key: guard.slots[idx].key.clone(),
            record: guard.slots[idx].child_id,
        };
        drop(guard);
        self.finish_read(t)
    }

    /// Exact key, first value ≥ `value` (`BOTH_RANGE`). With no duplicate
    /// subtree the single record is returned as-is (get-current fallback).
    pub fn search_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Record>> {
        self.begin_op()?;
        let tree = &self.db.tree;
        let Some((mut guard, pos)) = tree.search_position(key)? else {
            return Ok(None);
        };
        let SlotSearch::Exact(idx) = pos else {
            return Ok(None);
        };
        if guard.slots[idx].known_deleted {
            return Ok(None);
        }
        if let Some(din) = self.dup_root_of(&mut guard, idx)? {
            let key = guard.slots[idx].key.clone();
            let bin = Arc::clone(guard.cell());
            let bin_index = idx;
            drop(guard);
            let Some((dg, didx)) = self.dup_neighbor_live(&din, value, true, true)? else {
                return Ok(None);
            };
            let record = dg.slots[didx].child_id;
            let dup_key = dg.slots[didx].key.clone();
            let dbin = Arc::clone(dg.cell());
            drop(dg);
            return self.finish_read(RawTarget::Dup {
                bin,
                bin_index,
                key,
                din,
                dbin,
                index: didx,
                dup_key,
                record,
            });
        }
        let t = RawTarget::Main {
            bin: Arc::clone(guard.cell()),
            index: idx,
            key: guard.slots[idx].key.clone(),
            record: guard.slots[idx].child_id,
        };
        drop(guard);
        self.finish_read(t)
    }

    /// Re-read the record at the current position; `None` when it was
    /// deleted out from under the cursor.
    pub fn current(&mut self) -> Result<Option<Record>> {
        self.begin_op()?;
        let Some(pos) = self.pos.clone() else {
            return Err(Error::IllegalState("cursor not positioned".into()));
        };
        match &pos.dup {
            None => {
                let Some((guard, idx)) = self.latch_main(&pos.key, Some((&pos.bin, pos.index)))?
                else {
                    return Ok(None);
                };
                if guard.slots[idx].known_deleted {
                    return Ok(None);
                }
                let t = RawTarget::Main {
                    bin: Arc::clone(guard.cell()),
                    index: idx,
                    key: pos.key.clone(),
                    record: guard.slots[idx].child_id,
                };
                drop(guard);
                self.finish_read(t)
            }
            Some(d) => self.step_dup(&pos, d, true, true),
        }
    }

    /// Number of values for the current key, read from the duplicate
    /// count — individual duplicates are not locked.
    pub fn count(&mut self) -> Result<u32> {
        self.core.check_valid()?;
        let Some(pos) = self.pos.clone() else {
            return Err(Error::IllegalState("cursor not positioned".into()));
        };
        let Some((mut guard, idx)) = self.latch_main(&pos.key, Some((&pos.bin, pos.index)))?
        else {
            return Ok(0);
        };
        if let Some(din) = self.dup_root_of(&mut guard, idx)? {
            drop(guard);
            let dg = din.read();
            return Ok(dg.dup_count.map(|d| d.count).unwrap_or(0));
        }
        Ok(if guard.slots[idx].known_deleted { 0 } else { 1 })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Insert or update (`put`). On a duplicate database this inserts
    /// another value under the key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<OpStatus> {
        self.put_internal(key, value, PutMode::Overwrite)
    }

    /// Insert only if the key is absent.
    pub fn put_no_overwrite(&mut self, key: &[u8], value: &[u8]) -> Result<OpStatus> {
        self.put_internal(key, value, PutMode::NoOverwrite)
    }

    /// Insert only if the (key, value) pair is absent.
    pub fn put_no_dup_data(&mut self, key: &[u8], value: &[u8]) -> Result<OpStatus> {
        if !self.db.sorted_duplicates {
            return Err(Error::InvalidConfig(
                "putNoDupData requires sorted duplicates".into(),
            ));
        }
        self.put_internal(key, value, PutMode::NoDupData)
    }

    fn put_internal(&mut self, key: &[u8], value: &[u8], mode: PutMode) -> Result<OpStatus> {
        self.begin_op()?;
        self.check_writable()?;
        let tree = Arc::clone(&self.db.tree);
        loop {
            let (mut bin, pos) = tree.insert_position(key)?;
            match pos {
                SlotSearch::Exact(idx) if !bin.slots[idx].known_deleted => {
                    if self.db.sorted_duplicates {
                        match self.put_dup(&mut bin, idx, key, value, mode)? {
                            PutOutcome::Done(status) => return Ok(status),
                            PutOutcome::NeedLock(record) => {
                                drop(bin);
                                self.lock_record(record, LockMode::Write)?;
                                continue;
                            }
                        }
                    }
                    if mode == PutMode::NoOverwrite {
                        return Ok(OpStatus::KeyExist);
                    }
                    let record = bin.slots[idx].child_id;
                    if !self.holds_write(record) {
                        drop(bin);
                        self.lock_record(record, LockMode::Write)?;
                        continue;
                    }
                    return self.overwrite_slot(&mut bin, idx, key, value);
                }
                SlotSearch::Exact(idx) => {
                    // Resurrect a known-deleted slot.
                    let record = bin.slots[idx].child_id;
                    if !self.holds_write(record) {
                        drop(bin);
                        self.lock_record(record, LockMode::Write)?;
                        continue;
                    }
                    return self.insert_slot_at(&mut bin, idx, key, value, true);
                }
                SlotSearch::Insert(idx) => {
                    // Fresh record id: the lock cannot be contended, so it
                    // is taken while latched.
                    return self.insert_slot_at(&mut bin, idx, key, value, false);
                }
            }
        }
    }

    /// Overwrite the live record at `bin.slots[idx]`; write lock already
    /// held.
    fn overwrite_slot(
        &mut self,
        bin: &mut NodeWriteGuard,
        idx: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<OpStatus> {
        let tree = &self.db.tree;
        let record = bin.slots[idx].child_id;
        let old_value = if self.db.read_triggers().is_empty() {
            None
        } else {
            Some(tree.fetch_ln(bin, idx)?)
        };
        let abort_lsn = bin.slots[idx].lsn;
        let abort_kd = bin.slots[idx].known_deleted;
        let lsn = tree.ctx.log.append(
            &LogEntry::Ln(LnEntry {
                db_id: self.db.id,
                node_id: record,
                key: key.to_vec(),
                value: value.to_vec(),
                deleted: false,
                abort_lsn,
                abort_known_deleted: abort_kd,
            }),
            false,
            self.txn_id(),
        )?;
        if let Some(old) = abort_lsn {
            tree.ctx.tracker.note_obsolete_ln(old.file);
        }
        let slot = &mut bin.slots[idx];
        slot.lsn = Some(lsn);
        slot.known_deleted = false;
        slot.child = Child::Ln(value.to_vec());
        slot.dirty = true;
        bin.dirty = true;
        tree.recharge(bin);
        self.push_undo(UndoRecord {
            db_id: self.db.id,
            key: key.to_vec(),
            dup_key: None,
            ln_node_id: record,
            pre_lsn: abort_lsn,
            pre_known_deleted: abort_kd,
            inserted: false,
            dup_count_undo: None,
        });
        let cell = Arc::clone(bin.cell());
        let index = idx;
        // Position adopted after latches drop; the guard is the caller's.
        self.adopt_after(cell, index, key.to_vec(), None);
        trace!(db = self.db.id, record, %lsn, "record overwritten");
        self.fire_triggers(key, old_value.as_deref(), Some(value))?;
        Ok(OpStatus::Success)
    }

    /// Insert into `bin` at `idx` (new slot, or resurrect a deleted one).
    fn insert_slot_at(
        &mut self,
        bin: &mut NodeWriteGuard,
        idx: usize,
        key: &[u8],
        value: &[u8],
        resurrect: bool,
    ) -> Result<OpStatus> {
        let tree = &self.db.tree;
        let (record, abort_lsn, abort_kd) = if resurrect {
            (bin.slots[idx].child_id, bin.slots[idx].lsn, true)
        } else {
            (tree.ctx.next_node_id(), None, false)
        };
        if !resurrect {
            self.lock_record(record, LockMode::Write)?;
        }
        let lsn = tree.ctx.log.append(
            &LogEntry::Ln(LnEntry {
                db_id: self.db.id,
                node_id: record,
                key: key.to_vec(),
                value: value.to_vec(),
                deleted: false,
                abort_lsn,
                abort_known_deleted: abort_kd,
            }),
            false,
            self.txn_id(),
        )?;
        if let Some(old) = abort_lsn {
            tree.ctx.tracker.note_obsolete_ln(old.file);
        }
        if resurrect {
            let slot = &mut bin.slots[idx];
            slot.lsn = Some(lsn);
            slot.known_deleted = false;
            slot.child = Child::Ln(value.to_vec());
            slot.dirty = true;
        } else {
            bin.insert_slot(
                idx,
                crate::tree::node::Slot {
                    key: key.to_vec(),
                    child_id: record,
                    lsn: Some(lsn),
                    child: Child::Ln(value.to_vec()),
                    known_deleted: false,
                    dirty: true,
                },
            );
        }
        bin.dirty = true;
        tree.recharge(bin);
        self.push_undo(UndoRecord {
            db_id: self.db.id,
            key: key.to_vec(),
            dup_key: None,
            ln_node_id: record,
            pre_lsn: abort_lsn,
            pre_known_deleted: abort_kd,
            inserted: !resurrect,
            dup_count_undo: None,
        });
        let cell = Arc::clone(bin.cell());
        self.adopt_after(cell, idx, key.to_vec(), None);
        trace!(db = self.db.id, record, %lsn, resurrect, "record inserted");
        self.fire_triggers(key, None, Some(value))?;
        Ok(OpStatus::Success)
    }

    fn adopt_after(
        &mut self,
        bin: Arc<NodeCell>,
        index: usize,
        key: Vec<u8>,
        dup: Option<DupPos>,
    ) {
        self.adopt_position(Position {
            bin,
            index,
            key,
            dup,
        });
    }

    fn fire_triggers(
        &self,
        key: &[u8],
        old_value: Option<&[u8]>,
        new_value: Option<&[u8]>,
    ) -> Result<()> {
        secondary::apply_triggers(&self.core, &self.db, self.txn.as_ref(), key, old_value, new_value)
    }

    // --------------------------------------------------------------------------------------------
    // Duplicate writes
    // --------------------------------------------------------------------------------------------

    fn put_dup(
        &mut self,
        bin: &mut NodeWriteGuard,
        idx: usize,
        key: &[u8],
        value: &[u8],
        mode: PutMode,
    ) -> Result<PutOutcome> {
        let tree = Arc::clone(&self.db.tree);
        match self.dup_root_of(bin, idx)? {
            None => {
                // Single record so far.
                let existing = tree.fetch_ln(bin, idx)?;
                if (tree.dup_cmp)(&existing, value) == CmpOrdering::Equal {
                    if mode == PutMode::NoDupData || mode == PutMode::NoOverwrite {
                        return Ok(PutOutcome::Done(OpStatus::KeyExist));
                    }
                    let record = bin.slots[idx].child_id;
                    if !self.holds_write(record) {
                        return Ok(PutOutcome::NeedLock(record));
                    }
                    return Ok(PutOutcome::Done(self.overwrite_slot(bin, idx, key, value)?));
                }
                if mode == PutMode::NoOverwrite {
                    return Ok(PutOutcome::Done(OpStatus::KeyExist));
                }
                // Materialize the duplicate subtree and add the new value.
                let dc_id = tree.ctx.next_node_id();
                let ln_id = tree.ctx.next_node_id();
                self.lock_record(dc_id, LockMode::Write)?;
                self.lock_record(ln_id, LockMode::Write)?;
                let din = tree.create_dup_tree(bin, idx, existing, dc_id)?;
                let (mut dg, dpos) = tree.dup_insert_position(bin, idx, value)?;
                let SlotSearch::Insert(didx) = dpos else {
                    return Err(Error::Internal(
                        "fresh duplicate subtree already contains the new value".into(),
                    ));
                };
                let lsn = tree.ctx.log.append(
                    &LogEntry::Ln(LnEntry {
                        db_id: self.db.id,
                        node_id: ln_id,
                        key: key.to_vec(),
                        value: value.to_vec(),
                        deleted: false,
                        abort_lsn: None,
                        abort_known_deleted: false,
                    }),
                    false,
                    self.txn_id(),
                )?;
                dg.insert_slot(
                    didx,
                    crate::tree::node::Slot {
                        key: value.to_vec(),
                        child_id: ln_id,
                        lsn: Some(lsn),
                        child: Child::Ln(value.to_vec()),
                        known_deleted: false,
                        dirty: true,
                    },
                );
                tree.recharge(&dg);
                let dbin = Arc::clone(dg.cell());
                drop(dg);
                self.bump_dup_count(&din, key, 2, None, dc_id)?;
                self.push_undo(UndoRecord {
                    db_id: self.db.id,
                    key: key.to_vec(),
                    dup_key: Some(value.to_vec()),
                    ln_node_id: ln_id,
                    pre_lsn: None,
                    pre_known_deleted: false,
                    inserted: true,
                    dup_count_undo: Some(DupCountUndo {
                        node_id: dc_id,
                        pre_count: 1,
                        pre_lsn: None,
                    }),
                });
                self.adopt_after(
                    Arc::clone(bin.cell()),
                    idx,
                    key.to_vec(),
                    Some(DupPos {
                        din,
                        dbin,
                        index: didx,
                        dup_key: value.to_vec(),
                    }),
                );
                self.fire_triggers(key, None, Some(value))?;
                Ok(PutOutcome::Done(OpStatus::Success))
            }
            Some(din) => {
                if mode == PutMode::NoOverwrite {
                    return Ok(PutOutcome::Done(OpStatus::KeyExist));
                }
                let (dc_id, old_count, old_dc_lsn) = {
                    let dg = din.read();
                    let Some(dc) = dg.dup_count else {
                        return Err(Error::Corruption(format!(
                            "duplicate root {} without count slot",
                            din.id
                        )));
                    };
                    (dc.node_id, dc.count, dc.lsn)
                };
                if !self.holds_write(dc_id) {
                    return Ok(PutOutcome::NeedLock(dc_id));
                }
                let (mut dg, dpos) = tree.dup_insert_position(bin, idx, value)?;
                match dpos {
                    SlotSearch::Exact(didx) if !dg.slots[didx].known_deleted => {
                        if mode == PutMode::NoDupData {
                            return Ok(PutOutcome::Done(OpStatus::KeyExist));
                        }
                        // Same pair: refresh the stored bytes in place.
                        let record = dg.slots[didx].child_id;
                        if !self.holds_write(record) {
                            return Ok(PutOutcome::NeedLock(record));
                        }
                        let abort_lsn = dg.slots[didx].lsn;
                        let lsn = tree.ctx.log.append(
                            &LogEntry::Ln(LnEntry {
                                db_id: self.db.id,
                                node_id: record,
                                key: key.to_vec(),
                                value: value.to_vec(),
                                deleted: false,
                                abort_lsn,
                                abort_known_deleted: false,
                            }),
                            false,
                            self.txn_id(),
                        )?;
                        if let Some(old) = abort_lsn {
                            tree.ctx.tracker.note_obsolete_ln(old.file);
                        }
                        let slot = &mut dg.slots[didx];
                        slot.lsn = Some(lsn);
                        slot.child = Child::Ln(value.to_vec());
                        slot.dirty = true;
                        dg.dirty = true;
                        tree.recharge(&dg);
                        let dbin = Arc::clone(dg.cell());
                        drop(dg);
                        self.push_undo(UndoRecord {
                            db_id: self.db.id,
                            key: key.to_vec(),
                            dup_key: Some(value.to_vec()),
                            ln_node_id: record,
                            pre_lsn: abort_lsn,
                            pre_known_deleted: false,
                            inserted: false,
                            dup_count_undo: None,
                        });
                        self.adopt_after(
                            Arc::clone(bin.cell()),
                            idx,
                            key.to_vec(),
                            Some(DupPos {
                                din,
                                dbin,
                                index: didx,
                                dup_key: value.to_vec(),
                            }),
                        );
                        self.fire_triggers(key, Some(value), Some(value))?;
                        Ok(PutOutcome::Done(OpStatus::Success))
                    }
                    SlotSearch::Exact(didx) => {
                        // Resurrect a deleted duplicate.
                        let record = dg.slots[didx].child_id;
                        if !self.holds_write(record) {
                            return Ok(PutOutcome::NeedLock(record));
                        }
                        let abort_lsn = dg.slots[didx].lsn;
                        let lsn = tree.ctx.log.append(
                            &LogEntry::Ln(LnEntry {
                                db_id: self.db.id,
                                node_id: record,
                                key: key.to_vec(),
                                value: value.to_vec(),
                                deleted: false,
                                abort_lsn,
                                abort_known_deleted: true,
                            }),
                            false,
                            self.txn_id(),
                        )?;
                        if let Some(old) = abort_lsn {
                            tree.ctx.tracker.note_obsolete_ln(old.file);
                        }
                        let slot = &mut dg.slots[didx];
                        slot.lsn = Some(lsn);
                        slot.known_deleted = false;
                        slot.child = Child::Ln(value.to_vec());
                        slot.dirty = true;
                        dg.dirty = true;
                        tree.recharge(&dg);
                        let dbin = Arc::clone(dg.cell());
                        drop(dg);
                        self.bump_dup_count(&din, key, old_count + 1, old_dc_lsn, dc_id)?;
                        self.push_undo(UndoRecord {
                            db_id: self.db.id,
                            key: key.to_vec(),
                            dup_key: Some(value.to_vec()),
                            ln_node_id: record,
                            pre_lsn: abort_lsn,
                            pre_known_deleted: true,
                            inserted: false,
                            dup_count_undo: Some(DupCountUndo {
                                node_id: dc_id,
                                pre_count: old_count,
                                pre_lsn: old_dc_lsn,
                            }),
                        });
                        self.adopt_after(
                            Arc::clone(bin.cell()),
                            idx,
                            key.to_vec(),
                            Some(DupPos {
                                din,
                                dbin,
                                index: didx,
                                dup_key: value.to_vec(),
                            }),
                        );
                        self.fire_triggers(key, None, Some(value))?;
                        Ok(PutOutcome::Done(OpStatus::Success))
                    }
                    SlotSearch::Insert(didx) => {
                        let ln_id = tree.ctx.next_node_id();
                        self.lock_record(ln_id, LockMode::Write)?;
                        let lsn = tree.ctx.log.append(
                            &LogEntry::Ln(LnEntry {
                                db_id: self.db.id,
                                node_id: ln_id,
                                key: key.to_vec(),
                                value: value.to_vec(),
                                deleted: false,
                                abort_lsn: None,
                                abort_known_deleted: false,
                            }),
                            false,
                            self.txn_id(),
                        )?;
                        dg.insert_slot(
                            didx,
                            crate::tree::node::Slot {
                                key: value.to_vec(),
                                child_id: ln_id,
                                lsn: Some(lsn),
                                child: Child::Ln(value.to_vec()),
                                known_deleted: false,
                                dirty: true,
                            },
                        );
                        tree.recharge(&dg);
                        let dbin = Arc::clone(dg.cell());
                        drop(dg);
                        self.bump_dup_count(&din, key, old_count + 1, old_dc_lsn, dc_id)?;
                        self.push_undo(UndoRecord {
                            db_id: self.db.id,
                            key: key.to_vec(),
                            dup_key: Some(value.to_vec()),
                            ln_node_id: ln_id,
                            pre_lsn: None,
                            pre_known_deleted: false,
                            inserted: true,
                            dup_count_undo: Some(DupCountUndo {
                                node_id: dc_id,
                                pre_count: old_count,
                                pre_lsn: old_dc_lsn,
                            }),
                        });
                        self.adopt_after(
                            Arc::clone(bin.cell()),
                            idx,
                            key.to_vec(),
                            Some(DupPos {
                                din,
                                dbin,
                                index: didx,
                                dup_key: value.to_vec(),
                            }),
                        );
                        self.fire_triggers(key, None, Some(value))?;
                        Ok(PutOutcome::Done(OpStatus::Success))
                    }
                }
            }
        }
    }

    /// Log the new duplicate count and install it on the subtree root.
    fn bump_dup_count(
        &self,
        din: &Arc<NodeCell>,
        key: &[u8],
        count: u32,
        old_lsn: Option<Lsn>,
        dc_id: u64,
    ) -> Result<()> {
        let tree = &self.db.tree;
        let lsn = tree.ctx.log.append(
            &LogEntry::DupCount(DupCountEntry {
                db_id: self.db.id,
                node_id: dc_id,
                key: key.to_vec(),
                count,
                abort_lsn: old_lsn,
            }),
            false,
            self.txn_id(),
        )?;
        if let Some(old) = old_lsn {
            tree.ctx.tracker.note_obsolete_ln(old.file);
        }
        let mut dg = din.write(tree.ctx.next_generation());
        dg.dup_count = Some(crate::tree::node::DupCount {
            node_id: dc_id,
            count,
            lsn: Some(lsn),
        });
        dg.dirty = true;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Delete
    // --------------------------------------------------------------------------------------------

    /// Logically delete the record at the cursor position.
    ///
    /// The slot is marked known-deleted and queued for the compressor;
    /// physical removal happens there.
    pub fn delete(&mut self) -> Result<OpStatus> {
        self.core.check_valid()?;
        self.check_writable()?;
        let Some(pos) = self.pos.clone() else {
            return Err(Error::IllegalState("cursor not positioned".into()));
        };
        loop {
            match &pos.dup {
                None => {
                    let Some((mut guard, idx)) =
                        self.latch_main(&pos.key, Some((&pos.bin, pos.index)))?
                    else {
                        return Ok(OpStatus::KeyEmpty);
                    };
                    if guard.slots[idx].known_deleted {
                        return Ok(OpStatus::KeyEmpty);
                    }
                    let record = guard.slots[idx].child_id;
                    if !self.holds_write(record) {
                        drop(guard);
                        self.lock_record(record, LockMode::Write)?;
                        continue;
                    }
                    secondary::check_foreign_delete(&self.core, &self.db, self.txn.as_ref(), &pos.key)?;
                    let old_value = if self.db.read_triggers().is_empty() {
                        None
                    } else {
                        Some(self.db.tree.fetch_ln(&mut guard, idx)?)
                    };
                    self.delete_slot(&mut guard, idx, &pos.key, None, record)?;
                    let bin_id = guard.id;
                    drop(guard);
                    self.core.compressor_queue.add(self.db.id, bin_id, pos.key.clone());
                    self.fire_triggers(&pos.key, old_value.as_deref(), None)?;
                    return Ok(OpStatus::Success);
                }
                Some(d) => {
                    let Some((mut bg, bidx)) =
                        self.latch_main(&pos.key, Some((&pos.bin, pos.index)))?
                    else {
                        return Ok(OpStatus::KeyEmpty);
                    };
                    let Some(din) = self.dup_root_of(&mut bg, bidx)? else {
                        return Ok(OpStatus::KeyEmpty);
                    };
                    let (dc_id, old_count, old_dc_lsn) = {
                        let dg = din.read();
                        let Some(dc) = dg.dup_count else {
                            return Err(Error::Corruption(format!(
                                "duplicate root {} without count slot",
                                din.id
                            )));
                        };
                        (dc.node_id, dc.count, dc.lsn)
                    };
                    if !self.holds_write(dc_id) {
                        drop(bg);
                        self.lock_record(dc_id, LockMode::Write)?;
                        continue;
                    }
                    drop(bg);
                    let (mut dg, dsearch) = self.db.tree.dup_search_position(&din, &d.dup_key)?;
                    let SlotSearch::Exact(didx) = dsearch else {
                        return Ok(OpStatus::KeyEmpty);
                    };
                    if dg.slots[didx].known_deleted {
                        return Ok(OpStatus::KeyEmpty);
                    }
                    let record = dg.slots[didx].child_id;
                    if !self.holds_write(record) {
                        drop(dg);
                        self.lock_record(record, LockMode::Write)?;
                        continue;
                    }
                    secondary::check_foreign_delete(&self.core, &self.db, self.txn.as_ref(), &pos.key)?;
                    let old_value = if self.db.read_triggers().is_empty() {
                        None
                    } else {
                        Some(self.db.tree.fetch_ln(&mut dg, didx)?)
                    };
                    self.delete_slot(&mut dg, didx, &pos.key, Some(&d.dup_key), record)?;
                    let dbin_id = dg.id;
                    drop(dg);
                    self.bump_dup_count(&din, &pos.key, old_count.saturating_sub(1), old_dc_lsn, dc_id)?;
                    if let Some(u) = self.last_undo_dup_count(dc_id, old_count, old_dc_lsn) {
                        self.push_undo(u);
                    }
                    self.core
                        .compressor_queue
                        .add(self.db.id, dbin_id, d.dup_key.clone());
                    self.fire_triggers(&pos.key, old_value.as_deref(), None)?;
                    return Ok(OpStatus::Success);
                }
            }
        }
    }

    /// The duplicate-count part of a delete's undo.
    fn last_undo_dup_count(
        &self,
        dc_id: u64,
        pre_count: u32,
        pre_lsn: Option<Lsn>,
    ) -> Option<UndoRecord> {
        self.txn.as_ref()?;
        Some(UndoRecord {
            db_id: self.db.id,
            key: Vec::new(),
            dup_key: None,
            ln_node_id: 0,
            pre_lsn: None,
            pre_known_deleted: false,
            inserted: false,
            dup_count_undo: Some(DupCountUndo {
                node_id: dc_id,
                pre_count,
                pre_lsn,
            }),
        })
    }

    fn delete_slot(
        &mut self,
        bottom: &mut NodeWriteGuard,
        idx: usize,
        key: &[u8],
        dup_key: Option<&[u8]>,
        record: u64,
    ) -> Result<()> {
        let tree = &self.db.tree;
        let abort_lsn = bottom.slots[idx].lsn;
        let lsn = tree.ctx.log.append(
            &LogEntry::Ln(LnEntry {
                db_id: self.db.id,
                node_id: record,
                key: key.to_vec(),
                value: dup_key.map(|d| d.to_vec()).unwrap_or_default(),
                deleted: true,
                abort_lsn,
                abort_known_deleted: false,
            }),
            false,
            self.txn_id(),
        )?;
        if let Some(old) = abort_lsn {
            tree.ctx.tracker.note_obsolete_ln(old.file);
        }
        let slot = &mut bottom.slots[idx];
        slot.lsn = Some(lsn);
        slot.known_deleted = true;
        slot.child = Child::None;
        slot.dirty = true;
        bottom.dirty = true;
        tree.recharge(bottom);
        self.push_undo(UndoRecord {
            db_id: self.db.id,
            key: key.to_vec(),
            dup_key: dup_key.map(|d| d.to_vec()),
            ln_node_id: record,
            pre_lsn: abort_lsn,
            pre_known_deleted: false,
            inserted: false,
            dup_count_undo: None,
        });
        trace!(db = self.db.id, record, %lsn, "record deleted");
        Ok(())
    }
}

enum PutOutcome {
    Done(OpStatus),
    /// A contended lock is needed; the caller drops latches, acquires it
    /// and retries the descent.
    NeedLock(u64),
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close_inner();
    }
}
