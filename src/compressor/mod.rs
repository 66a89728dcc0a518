//! Physical removal of logically deleted slots.
//!
//! Deletes only mark slots known-deleted; the compressor makes them
//! physically disappear. Every delete queues a reference — (database,
//! bottom-node id, slot key) — on the [`BinRefQueue`]. The worker drains a
//! snapshot of the queue (producers keep appending to a fresh one), then
//! per referenced node:
//!
//! 1. Re-resolves the node. A reference whose node vanished (split moved
//!    the slots, eviction dropped it) is discarded — the next delete on
//!    the new node queues it again.
//! 2. Skips nodes with parked cursors or contended latches, re-queueing
//!    the reference for the next cycle.
//! 3. Physically removes the named slots when still known-deleted.
//! 4. Removes a node that became empty from its parent, cascading upward;
//!    an empty root marks the tree empty, and a single-child root IN is
//!    collapsed into its child.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::db::DbRegistry;
use crate::error::Result;
use crate::tree::node::{NodeId, NodeKind, SlotSearch};
use crate::tree::{Located, Tree};

/// One queued reference: the keys known deleted inside one bottom node.
type QueueMap = HashMap<(u64, NodeId), HashSet<Vec<u8>>>;

/// Work queue feeding the compressor, with swap-snapshot semantics.
#[derive(Debug, Default)]
pub struct BinRefQueue {
    entries: Mutex<QueueMap>,
}

impl BinRefQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueMap> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue `key` of `node` for physical removal.
    pub fn add(&self, db_id: u64, node: NodeId, key: Vec<u8>) {
        self.lock().entry((db_id, node)).or_default().insert(key);
    }

    /// Swap the queue with an empty one and return the snapshot.
    pub fn take(&self) -> QueueMap {
        std::mem::take(&mut *self.lock())
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// `true` when no work is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counters reported by [`Compressor::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CompressorStats {
    /// References processed.
    pub n_processed: u64,
    /// Slots physically removed.
    pub n_slots_removed: u64,
    /// Empty nodes removed from their parents.
    pub n_nodes_removed: u64,
    /// References pushed back for a later cycle.
    pub n_requeued: u64,
}

/// The compression worker.
pub struct Compressor {
    registry: Arc<DbRegistry>,
    queue: Arc<BinRefQueue>,
    n_processed: AtomicU64,
    n_slots: AtomicU64,
    n_nodes: AtomicU64,
    n_requeued: AtomicU64,
}

impl Compressor {
    /// Build the worker over the shared queue.
    pub fn new(registry: Arc<DbRegistry>, queue: Arc<BinRefQueue>) -> Self {
        Self {
            registry,
            queue,
            n_processed: AtomicU64::new(0),
            n_slots: AtomicU64::new(0),
            n_nodes: AtomicU64::new(0),
            n_requeued: AtomicU64::new(0),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CompressorStats {
        CompressorStats {
            n_processed: self.n_processed.load(Ordering::Relaxed),
            n_slots_removed: self.n_slots.load(Ordering::Relaxed),
            n_nodes_removed: self.n_nodes.load(Ordering::Relaxed),
            n_requeued: self.n_requeued.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue snapshot once. Returns the number of slots removed.
    pub fn run_once(&self) -> Result<u64> {
        let snapshot = self.queue.take();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let mut removed = 0u64;
        for ((db_id, node_id), keys) in snapshot {
            self.n_processed.fetch_add(1, Ordering::Relaxed);
            let Some(tree) = self.registry.tree(db_id) else {
                continue;
            };
            removed += self.process_node(&tree, db_id, node_id, keys)?;
        }
        Ok(removed)
    }

    fn process_node(
        &self,
        tree: &Arc<Tree>,
        db_id: u64,
        node_id: NodeId,
        keys: HashSet<Vec<u8>>,
    ) -> Result<u64> {
        let Some(cell) = tree.get(node_id) else {
            // Evicted or re-rooted under us; the next delete re-queues.
            return Ok(0);
        };
        if cell.cursor_count() > 0 {
            self.requeue(db_id, node_id, keys);
            return Ok(0);
        }
        let Some(mut guard) = cell.try_write(tree.ctx.next_generation()) else {
            self.requeue(db_id, node_id, keys);
            return Ok(0);
        };
        if !guard.kind.is_bottom() {
            return Ok(0);
        }
        let cmp = if guard.kind == NodeKind::Dbin {
            Arc::clone(&tree.dup_cmp)
        } else {
            Arc::clone(&tree.key_cmp)
        };
        let mut removed = 0u64;
        for key in keys {
            if let SlotSearch::Exact(idx) = guard.find_slot(&key, &cmp) {
                if guard.slots[idx].known_deleted {
                    guard.remove_slot(idx);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tree.recharge(&guard);
            self.n_slots.fetch_add(removed, Ordering::Relaxed);
            trace!(db = db_id, node = node_id, removed, "slots compressed");
        }
        // An empty duplicate root still carrying its count slot is removed
        // too: with zero live duplicates the key itself is gone.
        let empty = guard.slots.is_empty();
        drop(guard);
        if empty {
            self.remove_empty_chain(tree, node_id)?;
        }
        Ok(removed)
    }

    fn requeue(&self, db_id: u64, node_id: NodeId, keys: HashSet<Vec<u8>>) {
        self.n_requeued.fetch_add(1, Ordering::Relaxed);
        for key in keys {
            self.queue.add(db_id, node_id, key);
        }
    }

    /// Remove an empty node from its parent, cascading while parents
    /// empty out; handles root re-rooting.
    fn remove_empty_chain(&self, tree: &Arc<Tree>, mut node_id: NodeId) -> Result<()> {
        loop {
            let Some(cell) = tree.get(node_id) else {
                return Ok(());
            };
            let (level, owner_key, identifier_key, is_dup, still_empty) = {
                let Some(guard) = cell.try_write(tree.ctx.next_generation()) else {
                    return Ok(());
                };
                (
                    guard.level,
                    guard.owner_key.clone(),
                    guard.identifier_key.clone(),
                    guard.kind.is_dup(),
                    guard.slots.is_empty(),
                )
            };
            if !still_empty {
                return Ok(());
            }
            if tree.root_id() == Some(node_id) {
                debug!(db = tree.db_id, node = node_id, "tree is now empty");
                tree.set_root(None, None);
                tree.remove_cell(node_id);
                self.n_nodes.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            match tree.locate(node_id, level, &owner_key, &identifier_key, is_dup)? {
                Located::Parent(mut parent, idx) => {
                    if parent.slots[idx].child_id != node_id {
                        return Ok(());
                    }
                    parent.remove_slot(idx);
                    parent.dirty = true;
                    tree.recharge(&parent);
                    tree.remove_cell(node_id);
                    self.n_nodes.fetch_add(1, Ordering::Relaxed);
                    trace!(db = tree.db_id, node = node_id, parent = parent.id, "empty node removed");

                    // Root IN left with a single child collapses into it.
                    if tree.root_id() == Some(parent.id)
                        && parent.slots.len() == 1
                        && parent.kind == NodeKind::In
                    {
                        let child_id = parent.slots[0].child_id;
                        let child_lsn = parent.slots[0].lsn;
                        let old_root = parent.id;
                        drop(parent);
                        tree.set_root(Some(child_id), child_lsn);
                        tree.remove_cell(old_root);
                        self.n_nodes.fetch_add(1, Ordering::Relaxed);
                        debug!(db = tree.db_id, new_root = child_id, "root collapsed");
                        return Ok(());
                    }
                    if parent.slots.is_empty() {
                        let parent_id = parent.id;
                        drop(parent);
                        node_id = parent_id;
                        continue;
                    }
                    return Ok(());
                }
                Located::Root => return Ok(()),
                Located::Gone => {
                    tree.remove_cell(node_id);
                    return Ok(());
                }
            }
        }
    }
}
