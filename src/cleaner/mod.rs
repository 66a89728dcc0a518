//! Log cleaning: migrate live records forward, delete reclaimed segments.
//!
//! The cleaner wakes after enough bytes have been appended (or on demand),
//! folds the utilization tracker's deltas into the durable profile, picks
//! the segment with the lowest estimated utilization (or rotates through
//! old segments), and walks it record by record:
//!
//! - a leaf record still referenced by the tree at this exact LSN is
//!   **migrated** — re-logged at the end of the log and the slot updated;
//!   a superseded or unreachable one is obsolete;
//! - a leaf record locked by an active transaction is **pending**; the
//!   file is retried on a later cycle;
//! - a node image or BIN-delta that is still current is made resident and
//!   dirty, so the next checkpoint rewrites it past this segment;
//! - name records, summary records, roots, transaction markers and
//!   checkpoints are superseded by the re-publication that runs before
//!   every cleaning pass.
//!
//! A fully processed file joins the to-delete set; after a **full**
//! checkpoint (no deltas, flushed to the roots) the files are deleted or
//! renamed per configuration. A file that keeps failing is retried
//! `retries` times, then parked for `restart_retries` cycles; a failure on
//! a different file resets the retry context.

pub mod profile;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use crate::checkpoint::{CheckpointConfig, run_checkpoint};
use crate::env::EnvCore;
use crate::error::{Error, Result};
use crate::log::{
    BinDeltaEntry, DupCountEntry, FileSummaryEntry, ImageKind, LnEntry, LogEntry, Lsn, NameEntry,
    NodeImage,
};
use crate::tree::node::{NodeWriteGuard, SlotSearch};
use crate::tree::{Located, Tree};

/// How the cleaner picks its next file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanStrategy {
    /// Lowest estimated utilization first (default).
    Utilization,
    /// Oldest-first rotation through eligible files.
    Rotation,
}

/// Cleaner tunables.
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Clean when average utilization (live/total) drops below this
    /// percentage.
    pub min_utilization: u32,
    /// A file must be at least this many files behind the first-active
    /// LSN.
    pub min_age: u64,
    /// Age (in files) past which internal-node bytes are assumed
    /// obsolete.
    pub obsolete_age: u64,
    /// Bytes appended between cleaner wakeups.
    pub bytes_interval: u64,
    /// Consecutive retries on an un-cleanable file.
    pub retries: u32,
    /// Cycles to park a file after its retries are exhausted.
    pub restart_retries: u32,
    /// Delete reclaimed files (`true`) or rename them to `.del`.
    pub remove: bool,
    /// File-selection strategy.
    pub strategy: CleanStrategy,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            min_utilization: 50,
            min_age: 2,
            obsolete_age: 16,
            // A quarter of the default segment size.
            bytes_interval: (10 * 1024 * 1024) / 4,
            retries: 3,
            restart_retries: 5,
            remove: true,
            strategy: CleanStrategy::Utilization,
        }
    }
}

/// Counters reported by [`Cleaner::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanerStats {
    /// Cleaning passes that processed a file.
    pub n_runs: u64,
    /// Files fully processed.
    pub n_files_cleaned: u64,
    /// Files deleted or renamed.
    pub n_files_deleted: u64,
    /// Leaf records migrated forward.
    pub n_lns_migrated: u64,
    /// Leaf records found obsolete.
    pub n_lns_obsolete: u64,
    /// Leaf records deferred because of active locks.
    pub n_lns_pending: u64,
    /// Node images re-dirtied for the next checkpoint.
    pub n_ins_dirtied: u64,
}

/// Estimate `(live, total)` bytes of a file from its summary.
///
/// Measured obsolete-LN bytes combine with age-scaled internal-node
/// obsolescence: past `obsolete_age` files, a file's IN bytes are assumed
/// fully obsolete (checkpoints rewrite internal nodes far more often than
/// leaves survive).
pub(crate) fn estimate_live(
    s: &crate::log::FileSummary,
    age: u64,
    obsolete_age: u64,
) -> (u64, u64) {
    let total = u64::from(s.total_size);
    let avg_ln = if s.ln_count > 0 {
        u64::from(s.ln_size) / u64::from(s.ln_count)
    } else {
        0
    };
    let obsolete_ln = (avg_ln * u64::from(s.obsolete_ln_count)).min(u64::from(s.ln_size));
    let in_obsolete = if age >= obsolete_age {
        u64::from(s.in_size)
    } else if obsolete_age > 0 {
        u64::from(s.in_size) * age / obsolete_age
    } else {
        0
    };
    let live = total.saturating_sub(obsolete_ln + in_obsolete);
    (live, total)
}

#[derive(Debug, Default)]
struct RetryState {
    file: u64,
    attempts: u32,
    parked_cycles: u32,
}

#[derive(Debug, Default)]
struct CleanerState {
    to_delete: HashSet<u64>,
    retry: Option<RetryState>,
    rotation_cursor: u64,
}

/// The cleaning worker.
pub struct Cleaner {
    core: Arc<EnvCore>,
    cfg: CleanerConfig,
    state: Mutex<CleanerState>,
    n_runs: AtomicU64,
    n_cleaned: AtomicU64,
    n_deleted: AtomicU64,
    n_migrated: AtomicU64,
    n_obsolete: AtomicU64,
    n_pending: AtomicU64,
    n_dirtied: AtomicU64,
}

impl Cleaner {
    /// Build the worker.
    pub(crate) fn new(core: Arc<EnvCore>, cfg: CleanerConfig) -> Self {
        Self {
            core,
            cfg,
            state: Mutex::new(CleanerState::default()),
            n_runs: AtomicU64::new(0),
            n_cleaned: AtomicU64::new(0),
            n_deleted: AtomicU64::new(0),
            n_migrated: AtomicU64::new(0),
            n_obsolete: AtomicU64::new(0),
            n_pending: AtomicU64::new(0),
            n_dirtied: AtomicU64::new(0),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CleanerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CleanerStats {
        CleanerStats {
            n_runs: self.n_runs.load(Ordering::Relaxed),
            n_files_cleaned: self.n_cleaned.load(Ordering::Relaxed),
            n_files_deleted: self.n_deleted.load(Ordering::Relaxed),
            n_lns_migrated: self.n_migrated.load(Ordering::Relaxed),
            n_lns_obsolete: self.n_obsolete.load(Ordering::Relaxed),
            n_lns_pending: self.n_pending.load(Ordering::Relaxed),
            n_ins_dirtied: self.n_dirtied.load(Ordering::Relaxed),
        }
    }

    /// Files waiting for the post-checkpoint deletion step.
    pub fn backlog(&self) -> usize {
        self.lock_state().to_delete.len()
    }

    /// One cleaning cycle. Returns `true` when any file was processed or
    /// deleted.
    pub fn run_once(&self, force: bool) -> Result<bool> {
        if self.core.read_only {
            return Ok(false);
        }
        let tracker = &self.core.ctx.tracker;
        if !force && self.cfg.bytes_interval > 0 && tracker.bytes_since_clean() < self.cfg.bytes_interval
        {
            return Ok(false);
        }
        tracker.reset_bytes_since_clean();

        // Re-publish durable metadata so every older copy in candidate
        // files is superseded before processing begins.
        self.persist_profile()?;
        self.persist_names()?;

        let mut did_work = false;
        if let Some(file) = self.select_file(force)? {
            self.n_runs.fetch_add(1, Ordering::Relaxed);
            info!(file, "cleaning segment");
            match self.clean_file(file) {
                Ok(true) => {
                    self.n_cleaned.fetch_add(1, Ordering::Relaxed);
                    let mut st = self.lock_state();
                    st.to_delete.insert(file);
                    st.retry = None;
                    did_work = true;
                }
                Ok(false) => {
                    self.note_retry(file);
                }
                Err(e) => return Err(e),
            }
        }

        if self.delete_reclaimed()? {
            did_work = true;
        }
        Ok(did_work)
    }

    fn note_retry(&self, file: u64) {
        let mut st = self.lock_state();
        match &mut st.retry {
            Some(r) if r.file == file => {
                r.attempts += 1;
                if r.attempts > self.cfg.retries {
                    r.parked_cycles = self.cfg.restart_retries;
                    r.attempts = 0;
                    warn!(file, parked = r.parked_cycles, "cleaning parked");
                }
            }
            // A failure on a different file resets the retry context.
            _ => {
                st.retry = Some(RetryState {
                    file,
                    attempts: 1,
                    parked_cycles: 0,
                });
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Metadata re-publication
    // --------------------------------------------------------------------------------------------

    /// Fold tracker deltas into the durable profile.
    fn persist_profile(&self) -> Result<()> {
        let tracker = &self.core.ctx.tracker;
        let deltas = tracker.take_deltas();
        for (file, delta) in deltas {
            let mut merged = tracker.summary_for(file);
            merged.add(&delta);
            self.core.ctx.log.append(
                &LogEntry::FileSummary(FileSummaryEntry {
                    file_num: file,
                    summary: merged,
                }),
                false,
                0,
            )?;
            tracker.install(file, merged);
        }
        Ok(())
    }

    /// Re-log the live name map plus retirement tombstones.
    fn persist_names(&self) -> Result<()> {
        for db in self.core.registry.all() {
            let name = db
                .name
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            self.core.ctx.log.append(
                &LogEntry::Name(NameEntry {
                    db_id: db.id,
                    name,
                    deleted: false,
                    sorted_duplicates: db.sorted_duplicates,
                }),
                false,
                0,
            )?;
        }
        let retired: Vec<(String, u64)> = self
            .core
            .retired_names
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(n, id)| (n.clone(), *id))
            .collect();
        for (name, old_id) in retired {
            self.core.ctx.log.append(
                &LogEntry::Name(NameEntry {
                    db_id: old_id,
                    name,
                    deleted: true,
                    sorted_duplicates: false,
                }),
                false,
                0,
            )?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // File selection
    // --------------------------------------------------------------------------------------------

    /// Estimated (live, total) bytes of one file.
    fn estimate(&self, file: u64, current: u64) -> (u64, u64) {
        let s = self.core.ctx.tracker.summary_for(file);
        estimate_live(&s, current.saturating_sub(file), self.cfg.obsolete_age)
    }

    fn select_file(&self, force: bool) -> Result<Option<u64>> {
        let current = self.core.ctx.log.current_file();
        let first_active_file = self
            .core
            .txns
            .first_active_lsn()
            .map(|l| l.file)
            .unwrap_or(current);

        let mut st = self.lock_state();
        if let Some(r) = &mut st.retry {
            if r.parked_cycles > 0 {
                r.parked_cycles -= 1;
            }
        }
        let parked = st
            .retry
            .as_ref()
            .filter(|r| r.parked_cycles > 0)
            .map(|r| r.file);
        let to_delete = st.to_delete.clone();
        let rotation_cursor = st.rotation_cursor;
        drop(st);

        let eligible: Vec<u64> = self
            .core
            .ctx
            .log
            .files()
            .list_segments()?
            .into_iter()
            .filter(|&f| f < current)
            .filter(|&f| f + self.cfg.min_age <= first_active_file)
            .filter(|f| !to_delete.contains(f))
            .filter(|&f| Some(f) != parked)
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        // Average utilization across the whole log gates cleaning.
        let mut live_sum = 0u64;
        let mut total_sum = 0u64;
        for &f in &eligible {
            let (live, total) = self.estimate(f, current);
            live_sum += live;
            total_sum += total;
        }
        if !force
            && total_sum > 0
            && live_sum * 100 >= total_sum * u64::from(self.cfg.min_utilization)
        {
            trace!(
                live = live_sum,
                total = total_sum,
                "utilization above threshold, not cleaning"
            );
            return Ok(None);
        }

        let chosen = match self.cfg.strategy {
            CleanStrategy::Utilization => eligible.into_iter().min_by_key(|&f| {
                let (live, total) = self.estimate(f, current);
                if total == 0 { u64::MAX } else { live * 1000 / total }
            }),
            CleanStrategy::Rotation => {
                let next = eligible
                    .iter()
                    .copied()
                    .find(|&f| f > rotation_cursor)
                    .or_else(|| eligible.first().copied());
                if let Some(f) = next {
                    self.lock_state().rotation_cursor = f;
                }
                next
            }
        };
        Ok(chosen)
    }

    // --------------------------------------------------------------------------------------------
    // Per-file processing
    // --------------------------------------------------------------------------------------------

    /// Process every record of `file`; `Ok(true)` when nothing is pending.
    fn clean_file(&self, file: u64) -> Result<bool> {
        let mut pending = 0u64;
        let iter = self.core.ctx.log.iter_from(Some(Lsn::new(file, 0)))?;
        for item in iter {
            let (lsn, header, payload) = item?;
            if lsn.file != file {
                break;
            }
            let entry = LogEntry::decode_payload(header.ty, &payload)
                .map_err(|e| Error::Corruption(format!("cleaner decode at {lsn}: {e}")))?;
            match entry {
                LogEntry::Ln(ln) => {
                    if !self.process_ln(file, lsn, &ln)? {
                        pending += 1;
                    }
                }
                LogEntry::DupCount(dc) => {
                    if !self.process_dup_count(lsn, &dc)? {
                        pending += 1;
                    }
                }
                LogEntry::Node(image) => self.process_node(lsn, &image)?,
                LogEntry::BinDelta(delta) => self.process_delta(lsn, &delta)?,
                // Superseded by the re-publication step or by checkpoints.
                LogEntry::Name(_)
                | LogEntry::FileSummary(_)
                | LogEntry::Root(_)
                | LogEntry::TxnBegin(_)
                | LogEntry::TxnCommit(_)
                | LogEntry::TxnAbort(_)
                | LogEntry::TxnPrepare(_)
                | LogEntry::CheckpointStart(_)
                | LogEntry::CheckpointEnd(_) => {}
            }
        }
        if pending > 0 {
            self.n_pending.fetch_add(pending, Ordering::Relaxed);
            debug!(file, pending, "file has pending records");
        }
        Ok(pending == 0)
    }

    /// Find the bottom-node slot currently owning leaf `node_id` under
    /// `key` (descending into a duplicate subtree by `dup_value`).
    fn find_leaf_slot(
        &self,
        tree: &Arc<Tree>,
        key: &[u8],
        dup_value: &[u8],
        node_id: u64,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let Some((mut bin, pos)) = tree.search_position(key)? else {
            return Ok(None);
        };
        let SlotSearch::Exact(idx) = pos else {
            return Ok(None);
        };
        if bin.slots[idx].child_id == node_id {
            return Ok(Some((bin, idx)));
        }
        // Possibly inside a duplicate subtree under this slot.
        let Some(lsn) = bin.slots[idx].lsn else {
            if !matches!(bin.slots[idx].child, crate::tree::node::Child::Node(_)) {
                return Ok(None);
            }
            let din = tree.fetch_child(&mut bin, idx)?;
            drop(bin);
            let (dg, dpos) = tree.dup_search_position(&din, dup_value)?;
            let SlotSearch::Exact(didx) = dpos else {
                return Ok(None);
            };
            if dg.slots[didx].child_id != node_id {
                return Ok(None);
            }
            return Ok(Some((dg, didx)));
        };
        let header = self.core.ctx.log.read_header(lsn)?;
        if !header.ty.is_node_image() && header.ty != crate::log::LogEntryType::BinDelta {
            return Ok(None);
        }
        let din = tree.fetch_child(&mut bin, idx)?;
        drop(bin);
        let (dg, dpos) = tree.dup_search_position(&din, dup_value)?;
        let SlotSearch::Exact(didx) = dpos else {
            return Ok(None);
        };
        if dg.slots[didx].child_id != node_id {
            return Ok(None);
        }
        Ok(Some((dg, didx)))
    }

    /// Returns `false` when the record is pending (locked).
    fn process_ln(&self, file: u64, lsn: Lsn, ln: &LnEntry) -> Result<bool> {
        let Some(tree) = self.core.registry.tree(ln.db_id) else {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        };
        let found = self.find_leaf_slot(&tree, &ln.key, &ln.value, ln.node_id)?;
        let Some((mut bottom, idx)) = found else {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        };
        if bottom.slots[idx].lsn != Some(lsn) {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        // Live and current. A record locked by an active transaction is
        // left for a later cycle.
        if self.core.locks.locked_by_other(ln.node_id, 0) {
            return Ok(false);
        }
        let new_lsn = self.core.ctx.log.append(
            &LogEntry::Ln(LnEntry {
                db_id: ln.db_id,
                node_id: ln.node_id,
                key: ln.key.clone(),
                value: ln.value.clone(),
                deleted: ln.deleted,
                abort_lsn: None,
                abort_known_deleted: false,
            }),
            false,
            0,
        )?;
        bottom.slots[idx].lsn = Some(new_lsn);
        bottom.slots[idx].dirty = true;
        bottom.dirty = true;
        self.core.ctx.tracker.note_obsolete_ln(file);
        self.n_migrated.fetch_add(1, Ordering::Relaxed);
        trace!(%lsn, %new_lsn, "leaf record migrated");
        Ok(true)
    }

    fn process_dup_count(&self, lsn: Lsn, dc: &DupCountEntry) -> Result<bool> {
        let Some(tree) = self.core.registry.tree(dc.db_id) else {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        };
        let Some((mut bin, pos)) = tree.search_position(&dc.key)? else {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        };
        let SlotSearch::Exact(idx) = pos else {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        };
        let din = match tree.fetch_child(&mut bin, idx) {
            Ok(cell) => cell,
            Err(_) => {
                self.n_obsolete.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }
        };
        drop(bin);
        let current = {
            let guard = din.read();
            guard.dup_count
        };
        let Some(current) = current else {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        };
        if current.node_id != dc.node_id || current.lsn != Some(lsn) {
            self.n_obsolete.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        if self.core.locks.locked_by_other(dc.node_id, 0) {
            return Ok(false);
        }
        let new_lsn = self.core.ctx.log.append(
            &LogEntry::DupCount(DupCountEntry {
                db_id: dc.db_id,
                node_id: dc.node_id,
                key: dc.key.clone(),
                count: current.count,
                abort_lsn: None,
            }),
            false,
            0,
        )?;
        let mut guard = din.write(tree.ctx.next_generation());
        if let Some(dcref) = &mut guard.dup_count {
            dcref.lsn = Some(new_lsn);
        }
        guard.dirty = true;
        self.n_migrated.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn process_node(&self, lsn: Lsn, image: &NodeImage) -> Result<()> {
        let Some(tree) = self.core.registry.tree(image.db_id) else {
            return Ok(());
        };
        if tree.root_lsn() == Some(lsn) {
            if let Some(root) = tree.root_cell()? {
                let mut guard = root.write(tree.ctx.next_generation());
                guard.dirty = true;
                self.n_dirtied.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }
        let is_dup = matches!(image.kind, ImageKind::Din | ImageKind::Dbin);
        match tree.locate(
            image.node_id,
            image.level,
            &image.owner_key,
            &image.identifier_key,
            is_dup,
        )? {
            Located::Parent(mut parent, idx) => {
                if parent.slots[idx].lsn == Some(lsn) {
                    let child = tree.fetch_child(&mut parent, idx)?;
                    drop(parent);
                    let mut guard = child.write(tree.ctx.next_generation());
                    guard.dirty = true;
                    self.n_dirtied.fetch_add(1, Ordering::Relaxed);
                }
            }
            Located::Root | Located::Gone => {}
        }
        Ok(())
    }

    fn process_delta(&self, lsn: Lsn, delta: &BinDeltaEntry) -> Result<()> {
        let Some(tree) = self.core.registry.tree(delta.db_id) else {
            return Ok(());
        };
        // Resident: the next checkpoint will write a fresh image anyway.
        if let Some(cell) = tree.get(delta.node_id) {
            let mut guard = cell.write(tree.ctx.next_generation());
            guard.dirty = true;
            self.n_dirtied.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        // Not resident: rebuild it to learn its keys, then check whether
        // this delta is still the current image.
        let cell = tree.materialize(lsn)?;
        let (level, owner_key, identifier_key) = {
            let guard = cell.read();
            (guard.level, guard.owner_key.clone(), guard.identifier_key.clone())
        };
        match tree.locate(delta.node_id, level, &owner_key, &identifier_key, false)? {
            Located::Parent(mut parent, idx) => {
                if parent.slots[idx].lsn == Some(lsn) {
                    let child = tree.fetch_child(&mut parent, idx)?;
                    drop(parent);
                    let mut guard = child.write(tree.ctx.next_generation());
                    guard.dirty = true;
                    self.n_dirtied.fetch_add(1, Ordering::Relaxed);
                } else {
                    tree.remove_cell(delta.node_id);
                }
            }
            Located::Root => {}
            Located::Gone => tree.remove_cell(delta.node_id),
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Deletion
    // --------------------------------------------------------------------------------------------

    /// Delete fully cleaned files after a full checkpoint.
    fn delete_reclaimed(&self) -> Result<bool> {
        let files: Vec<u64> = {
            let mut st = self.lock_state();
            st.to_delete.drain().collect()
        };
        if files.is_empty() {
            return Ok(false);
        }
        run_checkpoint(
            &self.core,
            &CheckpointConfig {
                force: true,
                full: true,
                invoker: "cleaner".to_string(),
            },
        )?;
        for file in files {
            self.core.ctx.log.files().retire_segment(file, self.cfg.remove)?;
            self.core.ctx.tracker.drop_file(file);
            self.n_deleted.fetch_add(1, Ordering::Relaxed);
        }
        self.core.ctx.log.files().sync_dir()?;
        Ok(true)
    }
}
