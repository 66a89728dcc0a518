//! Checkpoints: bound recovery work and unblock the cleaner.
//!
//! A checkpoint writes a start marker, flushes every dirty resident node
//! **leaves-up** (duplicate subtrees before the BINs that reference them,
//! bottom levels before the internal levels above), republishes each
//! database's root record, and seals the group with a checkpoint-end record
//! carrying the allocator high-water marks and the first-active LSN.
//!
//! Flushed images are provisional except tree roots: everything below a
//! root is reachable through the freshly updated parent slots and the root
//! record, which is exactly the group semantics recovery expects. A BIN
//! whose dirty-slot count is small is written as a **BIN-delta** against
//! its last full image; a *full* checkpoint (demanded by the cleaner before
//! it deletes files) forbids deltas and rewrites whole images to the root.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::env::EnvCore;
use crate::error::Result;
use crate::log::{
    BinDeltaEntry, CheckpointEndEntry, CheckpointStartEntry, LogEntry, Lsn, RootEntry, SlotImage,
};
use crate::tree::node::NodeKind;
use crate::tree::{Located, Tree};

/// Options for one checkpoint run.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Run even when nothing is dirty.
    pub force: bool,
    /// Forbid BIN-deltas and rewrite to the root (cleaner prerequisite).
    pub full: bool,
    /// Recorded in the start/end records.
    pub invoker: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            force: false,
            full: false,
            invoker: "api".to_string(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Run one checkpoint; returns the LSN of the checkpoint-end record.
pub(crate) fn run_checkpoint(core: &Arc<EnvCore>, config: &CheckpointConfig) -> Result<Lsn> {
    let _serial = core
        .ckpt_mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    if !config.force && !anything_dirty(core) {
        // Nothing to do; report the current end of log.
        return Ok(core.ctx.log.end_of_log());
    }

    let id = core.ckpt_ids.fetch_add(1, Ordering::SeqCst);
    let start_lsn = core.ctx.log.append(
        &LogEntry::CheckpointStart(CheckpointStartEntry {
            id,
            invoker: config.invoker.clone(),
            time: now_millis(),
        }),
        false,
        0,
    )?;
    debug!(ckpt = id, invoker = %config.invoker, %start_lsn, "checkpoint started");

    let mut last_root_lsn = None;
    for db in core.registry.all() {
        flush_tree(&db.tree, config.full)?;
        let root_lsn = core.ctx.log.append(
            &LogEntry::Root(RootEntry {
                db_id: db.id,
                node_id: db.tree.root_id().unwrap_or(0),
                lsn: db.tree.root_lsn(),
            }),
            false,
            0,
        )?;
        last_root_lsn = Some(root_lsn);
    }

    let end = CheckpointEndEntry {
        invoker: config.invoker.clone(),
        time: now_millis(),
        start_lsn,
        root_lsn: last_root_lsn,
        first_active_lsn: core.txns.first_active_lsn(),
        last_node_id: core.ctx.node_ids.load(Ordering::SeqCst),
        last_db_id: core.db_ids.load(Ordering::SeqCst),
        last_txn_id: core.txn_ids.load(Ordering::SeqCst),
        id,
    };
    let end_lsn = core.ctx.log.append(&LogEntry::CheckpointEnd(end), false, 0)?;
    core.ctx.log.sync()?;

    *core
        .last_ckpt_end
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(end_lsn);
    core.n_checkpoints.fetch_add(1, Ordering::Relaxed);
    info!(ckpt = id, %end_lsn, full = config.full, "checkpoint complete");
    Ok(end_lsn)
}

fn anything_dirty(core: &Arc<EnvCore>) -> bool {
    for db in core.registry.all() {
        for cell in db.tree.resident_cells() {
            let guard = cell.read();
            if guard.dirty {
                return true;
            }
        }
    }
    false
}

/// Flush one tree's dirty nodes, duplicate subtrees first, bottom levels
/// first, fixing parent slot LSNs as it climbs.
fn flush_tree(tree: &Arc<Tree>, full: bool) -> Result<()> {
    let mut cells = tree.resident_cells();
    cells.sort_by_key(|cell| {
        let guard = cell.read();
        // Duplicate nodes first so owning BINs embed fresh LSNs.
        (!guard.kind.is_dup(), guard.level)
    });

    for cell in cells {
        let (logged, level, owner_key, identifier_key, is_dup) = {
            let mut guard = cell.write(tree.ctx.next_generation());
            if !guard.dirty {
                continue;
            }
            let is_root = tree.root_id() == Some(guard.id);
            let delta_base = if full || guard.kind != NodeKind::Bin {
                None
            } else {
                guard.last_full_lsn
            };
            let lsn = if let Some(base) = delta_base.filter(|_| {
                guard.dirty_slots() > 0 && guard.dirty_slots() * 4 < guard.slots.len()
            }) {
                let delta = BinDeltaEntry {
                    db_id: guard.db_id,
                    node_id: guard.id,
                    last_full_lsn: base,
                    slots: guard
                        .slots
                        .iter()
                        .filter(|s| s.dirty)
                        .map(|s| SlotImage {
                            key: s.key.clone(),
                            child_id: s.child_id,
                            lsn: s.lsn,
                            known_deleted: s.known_deleted,
                        })
                        .collect(),
                };
                let lsn = tree.ctx.log.append(&LogEntry::BinDelta(delta), !is_root, 0)?;
                // Slot dirty flags survive a delta: the next delta must
                // still cover everything since the last full image.
                guard.dirty = false;
                lsn
            } else {
                tree.append_image(&mut guard, !is_root)?
            };
            if is_root {
                tree.set_root_lsn(Some(lsn));
                continue;
            }
            (
                lsn,
                guard.level,
                guard.owner_key.clone(),
                guard.identifier_key.clone(),
                guard.kind.is_dup(),
            )
        };
        // Fix the parent slot outside the child's latch (top-down order).
        if let Located::Parent(mut parent, idx) =
            tree.locate(cell.id, level, &owner_key, &identifier_key, is_dup)?
        {
            if parent.slots[idx].child_id == cell.id {
                parent.slots[idx].lsn = Some(logged);
                parent.slots[idx].dirty = true;
                parent.dirty = true;
            }
        }
    }
    Ok(())
}
