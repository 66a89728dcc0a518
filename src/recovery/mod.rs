//! Crash recovery: rebuild trees and committed state from the log.
//!
//! Recovery runs in passes:
//!
//! 1. **Checkpoint location** — a reverse walk from the end of the log
//!    finds the newest checkpoint-end record, which seeds the id
//!    allocators and bounds the redo work.
//! 2. **Registry pass** — one forward header scan of the whole log picks
//!    up the latest name record per database, the latest durable file
//!    summary per segment, the latest root record per database, and every
//!    transaction outcome. (The cleaner keeps this scan bounded by
//!    re-publishing live metadata ahead of each reclaimed file.)
//! 3. **Redo pass** — forward from the checkpoint start: committed leaf
//!    records are installed through ordinary tree descents; newer
//!    non-provisional node images update their parent slots; provisional
//!    records are skipped — they are reachable only through a later
//!    non-provisional referrer, which is what makes structural groups
//!    atomic. Root records switch a database to a new tree generation and
//!    the already-redone leaf records of that database are replayed into
//!    it.
//! 4. **Rollback pass** — records of transactions with no commit are
//!    walked newest-first and their pre-images (the `abort_lsn` linkage
//!    embedded in every transactional record) are reinstated.
//!
//! The IN-list and cache accounting rebuild themselves as nodes
//! materialize.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::env::EnvCore;
use crate::error::{Error, Result};
use crate::log::{
    CheckpointEndEntry, DupCountEntry, LnEntry, LogEntry, LogEntryType, Lsn, NodeImage,
};
use crate::tree::node::{Child, DupCount, Slot, SlotSearch};
use crate::tree::{Located, Tree};

/// What recovery found; reported through environment open logging.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// LSN of the checkpoint recovery started from, if any.
    pub checkpoint_end: Option<Lsn>,
    /// Databases known at the end of recovery.
    pub n_databases: usize,
    /// Committed leaf records redone.
    pub n_redone: u64,
    /// Records rolled back for unresolved transactions.
    pub n_rolled_back: u64,
}

struct RegistryScan {
    names: HashMap<String, (u64, bool, bool)>, // name -> (db_id, deleted, sorted_dups)
    roots: HashMap<u64, (u64, Option<Lsn>)>,   // db_id -> (root node, root lsn)
    committed: HashSet<u64>,
    aborted: HashSet<u64>,
    max_entry_id: u64,
    checkpoint: Option<(Lsn, CheckpointEndEntry)>,
}

/// Run all passes. Returns a summary for logging.
pub(crate) fn run_recovery(core: &Arc<EnvCore>) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();

    let scan = registry_scan(core)?;
    summary.checkpoint_end = scan.checkpoint.as_ref().map(|(lsn, _)| *lsn);

    // Seed allocators from the checkpoint; the redo pass raises them past
    // anything allocated afterwards.
    if let Some((_, end)) = &scan.checkpoint {
        core.ctx
            .node_ids
            .store(end.last_node_id.max(1), Ordering::SeqCst);
        core.db_ids
            .store(end.last_db_id.max(crate::env::FIRST_USER_DB_ID), Ordering::SeqCst);
        core.txn_ids.store(end.last_txn_id.max(1), Ordering::SeqCst);
        core.ckpt_ids.store(end.id + 1, Ordering::SeqCst);
    }
    core.ctx.log.set_next_entry_id(scan.max_entry_id + 1);

    // Rebuild the database registry from the newest name records.
    for (name, (db_id, deleted, sorted_dups)) in &scan.names {
        if *deleted {
            core.retired_names
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(name.clone(), *db_id);
            continue;
        }
        let db = core.build_db(*db_id, name.clone(), *sorted_dups);
        if let Some((root_node, root_lsn)) = scan.roots.get(db_id) {
            if *root_node != 0 {
                db.tree.set_root(Some(*root_node), *root_lsn);
            }
        }
        core.registry.insert(db);
        bump(&core.db_ids, *db_id + 1);
    }
    summary.n_databases = core.registry.all().len();

    // Redo + rollback.
    let start = scan.checkpoint.as_ref().map(|(_, end)| end.start_lsn);
    let (n_redone, n_rolled_back) = redo_pass(core, start, &scan)?;
    summary.n_redone = n_redone;
    summary.n_rolled_back = n_rolled_back;

    info!(
        checkpoint = ?summary.checkpoint_end,
        databases = summary.n_databases,
        redone = summary.n_redone,
        rolled_back = summary.n_rolled_back,
        "recovery complete"
    );
    Ok(summary)
}

fn bump(target: &std::sync::atomic::AtomicU64, at_least: u64) {
    let mut cur = target.load(Ordering::SeqCst);
    while cur < at_least {
        match target.compare_exchange(cur, at_least, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(now) => cur = now,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Pass 1+2: checkpoint location and registry scan
// ------------------------------------------------------------------------------------------------

fn registry_scan(core: &Arc<EnvCore>) -> Result<RegistryScan> {
    let mut scan = RegistryScan {
        names: HashMap::new(),
        roots: HashMap::new(),
        committed: HashSet::new(),
        aborted: HashSet::new(),
        max_entry_id: 0,
        checkpoint: None,
    };

    // Newest checkpoint-end first, walking back from the end of the log.
    for item in core.ctx.log.iter_reverse()? {
        let (lsn, header, payload) = item?;
        if header.ty == LogEntryType::CheckpointEnd {
            let LogEntry::CheckpointEnd(end) = LogEntry::decode_payload(header.ty, &payload)?
            else {
                return Err(Error::Corruption(format!("bad checkpoint end at {lsn}")));
            };
            scan.checkpoint = Some((lsn, end));
            break;
        }
    }

    // One forward pass for names, summaries, roots and txn outcomes.
    for item in core.ctx.log.iter_from(None)? {
        let (_lsn, header, payload) = item?;
        scan.max_entry_id = scan.max_entry_id.max(header.entry_id);
        match header.ty {
            LogEntryType::NameLn => {
                let LogEntry::Name(name) = LogEntry::decode_payload(header.ty, &payload)? else {
                    continue;
                };
                scan.names.insert(
                    name.name.clone(),
                    (name.db_id, name.deleted, name.sorted_duplicates),
                );
            }
            LogEntryType::FileSummaryLn => {
                let LogEntry::FileSummary(fs) = LogEntry::decode_payload(header.ty, &payload)?
                else {
                    continue;
                };
                core.ctx.tracker.load_baseline(fs.file_num, fs.summary);
            }
            LogEntryType::Root => {
                let LogEntry::Root(root) = LogEntry::decode_payload(header.ty, &payload)? else {
                    continue;
                };
                scan.roots.insert(root.db_id, (root.node_id, root.lsn));
            }
            LogEntryType::TxnCommit => {
                scan.committed.insert(header.txn_id);
            }
            LogEntryType::TxnAbort => {
                scan.aborted.insert(header.txn_id);
            }
            _ => {}
        }
    }
    Ok(scan)
}

// ------------------------------------------------------------------------------------------------
// Pass 3: redo
// ------------------------------------------------------------------------------------------------

fn redo_pass(
    core: &Arc<EnvCore>,
    start: Option<Lsn>,
    scan: &RegistryScan,
) -> Result<(u64, u64)> {
    let mut n_redone = 0u64;
    // Leaf records applied per database since the redo started, for replay
    // after a root-generation switch.
    let mut applied: HashMap<u64, Vec<(Lsn, LnEntry)>> = HashMap::new();
    // Records of unresolved transactions, rolled back afterwards.
    let mut unresolved: Vec<(Lsn, LogEntry)> = Vec::new();

    for item in core.ctx.log.iter_from(start)? {
        let (lsn, header, payload) = item?;
        if header.provisional {
            // Reachable only through a later non-provisional referrer.
            continue;
        }
        match header.ty {
            LogEntryType::Ln => {
                let LogEntry::Ln(ln) = LogEntry::decode_payload(header.ty, &payload)? else {
                    continue;
                };
                bump(&core.ctx.node_ids, ln.node_id + 1);
                let resolved = header.txn_id == 0 || scan.committed.contains(&header.txn_id);
                if resolved {
                    if redo_ln(core, &ln, lsn)? {
                        n_redone += 1;
                        applied.entry(ln.db_id).or_default().push((lsn, ln));
                    }
                } else {
                    unresolved.push((lsn, LogEntry::Ln(ln)));
                }
            }
            LogEntryType::DupCountLn => {
                let LogEntry::DupCount(dc) = LogEntry::decode_payload(header.ty, &payload)?
                else {
                    continue;
                };
                bump(&core.ctx.node_ids, dc.node_id + 1);
                let resolved = header.txn_id == 0 || scan.committed.contains(&header.txn_id);
                if resolved {
                    redo_dup_count(core, &dc, lsn)?;
                } else {
                    unresolved.push((lsn, LogEntry::DupCount(dc)));
                }
            }
            LogEntryType::Bin | LogEntryType::In | LogEntryType::Dbin | LogEntryType::Din => {
                let LogEntry::Node(image) = LogEntry::decode_payload(header.ty, &payload)? else {
                    continue;
                };
                bump(&core.ctx.node_ids, image.node_id + 1);
                attach_image(core, &image, lsn)?;
            }
            LogEntryType::BinDelta => {
                let LogEntry::BinDelta(delta) = LogEntry::decode_payload(header.ty, &payload)?
                else {
                    continue;
                };
                attach_delta(core, delta.db_id, delta.node_id, lsn)?;
            }
            LogEntryType::Root => {
                let LogEntry::Root(root) = LogEntry::decode_payload(header.ty, &payload)? else {
                    continue;
                };
                let Some(tree) = core.registry.tree(root.db_id) else {
                    continue;
                };
                let new_root = (root.node_id != 0).then_some(root.node_id);
                if tree.root_id() == new_root {
                    tree.set_root_lsn(root.lsn);
                } else if new_root.is_none() {
                    // Truncate: the old generation is dead, nothing gets
                    // replayed into the empty tree.
                    tree.clear();
                    applied.remove(&root.db_id);
                } else {
                    // New tree generation (root replaced mid-checkpoint):
                    // drop the resident state and replay this database's
                    // already-redone records into it.
                    tree.clear();
                    tree.set_root(new_root, root.lsn);
                    if let Some(lns) = applied.get(&root.db_id) {
                        let lns = lns.clone();
                        for (ln_lsn, ln) in &lns {
                            redo_ln(core, ln, *ln_lsn)?;
                        }
                    }
                }
            }
            LogEntryType::TxnBegin => {
                bump(&core.txn_ids, header.txn_id + 1);
            }
            _ => {}
        }
    }

    // Pass 4: rollback, newest first.
    let mut n_rolled_back = 0u64;
    for (lsn, entry) in unresolved.iter().rev() {
        match entry {
            LogEntry::Ln(ln) => {
                if rollback_ln(core, ln, *lsn)? {
                    n_rolled_back += 1;
                }
            }
            LogEntry::DupCount(dc) => {
                rollback_dup_count(core, dc, *lsn)?;
            }
            _ => {}
        }
    }
    if n_rolled_back > 0 {
        debug!(n_rolled_back, "unresolved transactions rolled back");
    }
    Ok((n_redone, n_rolled_back))
}

/// Install one committed leaf record; `true` when it changed the tree.
fn redo_ln(core: &Arc<EnvCore>, ln: &LnEntry, lsn: Lsn) -> Result<bool> {
    let Some(db) = core.registry.by_id(ln.db_id) else {
        return Ok(false);
    };
    let tree = &db.tree;
    let (mut bin, pos) = tree.insert_position(&ln.key)?;
    match pos {
        SlotSearch::Exact(idx) => {
            if bin.slots[idx].child_id == ln.node_id {
                if newer(bin.slots[idx].lsn, lsn) {
                    install(&mut bin.slots[idx], ln, lsn);
                    bin.dirty = true;
                }
                return Ok(true);
            }
            if !db.sorted_duplicates {
                // The slot was superseded by a different leaf id; apply
                // only if this record is newer.
                if newer(bin.slots[idx].lsn, lsn) {
                    bin.slots[idx].child_id = ln.node_id;
                    install(&mut bin.slots[idx], ln, lsn);
                    bin.dirty = true;
                }
                return Ok(true);
            }
            // Duplicate database: the record lives inside (or creates)
            // the duplicate subtree.
            redo_dup_ln(core, tree, &mut bin, idx, ln, lsn)?;
            Ok(true)
        }
        SlotSearch::Insert(idx) => {
            bin.insert_slot(
                idx,
                Slot {
                    key: ln.key.clone(),
                    child_id: ln.node_id,
                    lsn: Some(lsn),
                    child: Child::None,
                    known_deleted: ln.deleted,
                    dirty: true,
                },
            );
            tree.recharge(&bin);
            Ok(true)
        }
    }
}

fn newer(current: Option<Lsn>, candidate: Lsn) -> bool {
    match current {
        None => true,
        Some(cur) => candidate > cur,
    }
}

fn install(slot: &mut Slot, ln: &LnEntry, lsn: Lsn) {
    slot.lsn = Some(lsn);
    slot.known_deleted = ln.deleted;
    slot.child = Child::None;
    slot.dirty = true;
}

fn redo_dup_ln(
    core: &Arc<EnvCore>,
    tree: &Arc<Tree>,
    bin: &mut crate::tree::node::NodeWriteGuard,
    idx: usize,
    ln: &LnEntry,
    lsn: Lsn,
) -> Result<()> {
    let _ = core;
    // Is the slot already a duplicate subtree?
    let is_dup_root = match &bin.slots[idx].child {
        Child::Node(_) => true,
        Child::Ln(_) => false,
        Child::None => match bin.slots[idx].lsn {
            Some(slot_lsn) => {
                let header = tree.ctx.log.read_header(slot_lsn)?;
                header.ty.is_node_image() || header.ty == LogEntryType::BinDelta
            }
            None => false,
        },
    };
    if !is_dup_root {
        // Single record under the key; a second value materializes the
        // subtree.
        let existing = tree.fetch_ln(bin, idx)?;
        if (tree.dup_cmp)(&existing, &ln.value) == std::cmp::Ordering::Equal {
            if newer(bin.slots[idx].lsn, lsn) {
                bin.slots[idx].child_id = ln.node_id;
                install(&mut bin.slots[idx], ln, lsn);
                bin.dirty = true;
            }
            return Ok(());
        }
        let din = tree.create_dup_tree(bin, idx, existing, 0)?;
        let (mut dg, dpos) = tree.dup_insert_position(bin, idx, &ln.value)?;
        if let SlotSearch::Insert(didx) = dpos {
            dg.insert_slot(
                didx,
                Slot {
                    key: ln.value.clone(),
                    child_id: ln.node_id,
                    lsn: Some(lsn),
                    child: Child::None,
                    known_deleted: ln.deleted,
                    dirty: true,
                },
            );
            tree.recharge(&dg);
        }
        drop(dg);
        let mut din_guard = din.write(tree.ctx.next_generation());
        if let Some(dc) = &mut din_guard.dup_count {
            dc.count = 2;
        }
        return Ok(());
    }
    let (mut dg, dpos) = tree.dup_insert_position(bin, idx, &ln.value)?;
    match dpos {
        SlotSearch::Exact(didx) => {
            if dg.slots[didx].child_id == ln.node_id || newer(dg.slots[didx].lsn, lsn) {
                if newer(dg.slots[didx].lsn, lsn) {
                    dg.slots[didx].child_id = ln.node_id;
                    install(&mut dg.slots[didx], ln, lsn);
                    dg.dirty = true;
                }
            }
        }
        SlotSearch::Insert(didx) => {
            dg.insert_slot(
                didx,
                Slot {
                    key: ln.value.clone(),
                    child_id: ln.node_id,
                    lsn: Some(lsn),
                    child: Child::None,
                    known_deleted: ln.deleted,
                    dirty: true,
                },
            );
            tree.recharge(&dg);
        }
    }
    Ok(())
}

fn redo_dup_count(core: &Arc<EnvCore>, dc: &DupCountEntry, lsn: Lsn) -> Result<()> {
    let Some(tree) = core.registry.tree(dc.db_id) else {
        return Ok(());
    };
    let Some((mut bin, pos)) = tree.search_position(&dc.key)? else {
        return Ok(());
    };
    let SlotSearch::Exact(idx) = pos else {
        return Ok(());
    };
    if !matches!(bin.slots[idx].child, Child::Node(_)) && bin.slots[idx].lsn.is_none() {
        return Ok(());
    }
    let Ok(din) = tree.fetch_child(&mut bin, idx) else {
        return Ok(());
    };
    drop(bin);
    let mut guard = din.write(tree.ctx.next_generation());
    if !guard.kind.is_dup() {
        return Ok(());
    }
    let apply = match guard.dup_count {
        None => true,
        Some(existing) => newer(existing.lsn, lsn),
    };
    if apply {
        guard.dup_count = Some(DupCount {
            node_id: dc.node_id,
            count: dc.count,
            lsn: Some(lsn),
        });
        guard.dirty = true;
    }
    Ok(())
}

/// Apply a newer non-provisional node image: update the parent slot (or
/// root) LSN, dropping any stale resident child.
fn attach_image(core: &Arc<EnvCore>, image: &NodeImage, lsn: Lsn) -> Result<()> {
    let Some(tree) = core.registry.tree(image.db_id) else {
        return Ok(());
    };
    if tree.root_id() == Some(image.node_id) {
        if newer(tree.root_lsn(), lsn) {
            tree.remove_cell(image.node_id);
            tree.set_root_lsn(Some(lsn));
        }
        return Ok(());
    }
    let is_dup = image.kind == crate::log::ImageKind::Din || image.kind == crate::log::ImageKind::Dbin;
    match tree.locate(
        image.node_id,
        image.level,
        &image.owner_key,
        &image.identifier_key,
        is_dup,
    ) {
        Ok(Located::Parent(mut parent, idx)) => {
            if parent.slots[idx].child_id == image.node_id && newer(parent.slots[idx].lsn, lsn) {
                parent.slots[idx].lsn = Some(lsn);
                parent.slots[idx].child = Child::None;
                parent.slots[idx].dirty = true;
                parent.dirty = true;
                tree.remove_cell(image.node_id);
            }
            Ok(())
        }
        Ok(Located::Root) | Ok(Located::Gone) => Ok(()),
        Err(e) => {
            // A dangling reference mid-redo is healed by later records.
            warn!(node = image.node_id, %lsn, error = %e, "image attach skipped");
            Ok(())
        }
    }
}

fn attach_delta(core: &Arc<EnvCore>, db_id: u64, node_id: u64, lsn: Lsn) -> Result<()> {
    let Some(tree) = core.registry.tree(db_id) else {
        return Ok(());
    };
    let cell = match tree.get(node_id) {
        Some(c) => c,
        None => match tree.materialize(lsn) {
            Ok(c) => c,
            Err(_) => return Ok(()),
        },
    };
    let (level, owner_key, identifier_key) = {
        let guard = cell.read();
        (guard.level, guard.owner_key.clone(), guard.identifier_key.clone())
    };
    if tree.root_id() == Some(node_id) {
        if newer(tree.root_lsn(), lsn) {
            tree.remove_cell(node_id);
            tree.set_root(Some(node_id), Some(lsn));
        }
        return Ok(());
    }
    if let Located::Parent(mut parent, idx) =
        tree.locate(node_id, level, &owner_key, &identifier_key, false)?
    {
        if parent.slots[idx].child_id == node_id && newer(parent.slots[idx].lsn, lsn) {
            parent.slots[idx].lsn = Some(lsn);
            parent.slots[idx].child = Child::None;
            parent.slots[idx].dirty = true;
            parent.dirty = true;
            tree.remove_cell(node_id);
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Rollback
// ------------------------------------------------------------------------------------------------

/// Reinstate the pre-image of one unresolved leaf record.
fn rollback_ln(core: &Arc<EnvCore>, ln: &LnEntry, lsn: Lsn) -> Result<bool> {
    let Some(db) = core.registry.by_id(ln.db_id) else {
        return Ok(false);
    };
    let tree = &db.tree;
    let Some((mut bin, pos)) = tree.search_position(&ln.key)? else {
        return Ok(false);
    };
    let SlotSearch::Exact(idx) = pos else {
        return Ok(false);
    };
    if bin.slots[idx].child_id == ln.node_id {
        if bin.slots[idx].lsn != Some(lsn) {
            return Ok(false);
        }
        rollback_slot(&mut bin.slots[idx], ln);
        bin.dirty = true;
        return Ok(true);
    }
    if !db.sorted_duplicates {
        return Ok(false);
    }
    let Ok(din) = tree.fetch_child(&mut bin, idx) else {
        return Ok(false);
    };
    {
        let guard = din.read();
        if !guard.kind.is_dup() {
            return Ok(false);
        }
    }
    drop(bin);
    let (mut dg, dpos) = tree.dup_search_position(&din, &ln.value)?;
    let SlotSearch::Exact(didx) = dpos else {
        return Ok(false);
    };
    if dg.slots[didx].child_id != ln.node_id || dg.slots[didx].lsn != Some(lsn) {
        return Ok(false);
    }
    rollback_slot(&mut dg.slots[didx], ln);
    dg.dirty = true;
    Ok(true)
}

fn rollback_slot(slot: &mut Slot, ln: &LnEntry) {
    match ln.abort_lsn {
        None => {
            slot.known_deleted = true;
            slot.lsn = None;
        }
        Some(pre) => {
            slot.lsn = Some(pre);
            slot.known_deleted = ln.abort_known_deleted;
        }
    }
    slot.child = Child::None;
    slot.dirty = true;
}

fn rollback_dup_count(core: &Arc<EnvCore>, dc: &DupCountEntry, lsn: Lsn) -> Result<()> {
    let Some(tree) = core.registry.tree(dc.db_id) else {
        return Ok(());
    };
    let Some((mut bin, pos)) = tree.search_position(&dc.key)? else {
        return Ok(());
    };
    let SlotSearch::Exact(idx) = pos else {
        return Ok(());
    };
    let Ok(din) = tree.fetch_child(&mut bin, idx) else {
        return Ok(());
    };
    drop(bin);
    let mut guard = din.write(tree.ctx.next_generation());
    let Some(current) = guard.dup_count else {
        return Ok(());
    };
    if current.node_id != dc.node_id || current.lsn != Some(lsn) {
        return Ok(());
    }
    // Re-read the pre-image count through the abort chain.
    let pre = match dc.abort_lsn {
        None => None,
        Some(pre_lsn) => {
            let (_, entry) = tree.ctx.log.read_entry(pre_lsn)?;
            match entry {
                LogEntry::DupCount(prev) => Some((prev.count, pre_lsn)),
                _ => None,
            }
        }
    };
    match pre {
        Some((count, pre_lsn)) => {
            guard.dup_count = Some(DupCount {
                node_id: dc.node_id,
                count,
                lsn: Some(pre_lsn),
            });
        }
        None => {
            guard.dup_count = Some(DupCount {
                node_id: dc.node_id,
                count: current.count,
                lsn: None,
            });
        }
    }
    guard.dirty = true;
    Ok(())
}
