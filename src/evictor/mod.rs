//! Cache budget accounting and the evictor.
//!
//! Every resident node charges its in-memory size to the [`CacheBudget`];
//! the global [`InList`] records which nodes are resident. When usage rises
//! above the configured floor, the evictor scans a fraction of the IN-list
//! from a round-robin cursor, picks the coldest candidates by access
//! generation, and frees memory in two escalating steps:
//!
//! 1. **Strip resident leaf values** from BINs/DBINs — the slot keeps its
//!    LSN, so the value re-fetches on demand. This often covers the deficit
//!    without touching tree structure.
//! 2. **Evict whole nodes**, leaves-up: a dirty node is logged first (when
//!    the environment is writable), then the parent's child pointer is
//!    nulled while its slot keeps the LSN for later re-fetch.
//!
//! A node is skipped while it is the tree root, latched, pinned by a worker
//! that intends to re-latch it, has a cursor parked on it, or still has
//! resident children (eviction is strictly leaves-up).

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, trace, warn};

use crate::db::DbRegistry;
use crate::error::Result;
use crate::tree::Located;
use crate::tree::node::{Child, NodeId};

// ------------------------------------------------------------------------------------------------
// Cache budget
// ------------------------------------------------------------------------------------------------

/// Environment-wide cache accounting.
#[derive(Debug)]
pub struct CacheBudget {
    max: u64,
    used: AtomicU64,
}

impl CacheBudget {
    /// Budget of `max` bytes.
    pub fn new(max: u64) -> Self {
        Self {
            max,
            used: AtomicU64::new(0),
        }
    }

    /// Configured maximum.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Bytes currently charged.
    pub fn usage(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Charge bytes.
    pub fn add(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Refund bytes.
    pub fn sub(&self, bytes: u64) {
        let mut cur = self.used.load(Ordering::SeqCst);
        loop {
            let next = cur.saturating_sub(bytes);
            match self
                .used
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(now) => cur = now,
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// IN-list
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InListState {
    items: Vec<(u64, NodeId)>,
    cursor: usize,
}

/// Global list of resident nodes, scanned round-robin by the evictor.
#[derive(Debug, Default)]
pub struct InList {
    state: Mutex<InListState>,
}

impl InList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InListState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a resident node.
    pub fn add(&self, db_id: u64, node: NodeId) {
        self.lock().items.push((db_id, node));
    }

    /// Remove a node (evicted or deleted).
    pub fn remove(&self, db_id: u64, node: NodeId) {
        let mut st = self.lock();
        if let Some(pos) = st.items.iter().position(|e| *e == (db_id, node)) {
            st.items.swap_remove(pos);
            if st.cursor > st.items.len() {
                st.cursor = 0;
            }
        }
    }

    /// Number of resident nodes.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// `true` when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next `fraction` of the list from the round-robin cursor.
    pub fn scan_batch(&self, fraction: f64) -> Vec<(u64, NodeId)> {
        let mut st = self.lock();
        let len = st.items.len();
        if len == 0 {
            return Vec::new();
        }
        let take = ((len as f64 * fraction).ceil() as usize).clamp(1, len);
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            out.push(st.items[(st.cursor + i) % len]);
        }
        st.cursor = (st.cursor + take) % len;
        out
    }

    /// Full snapshot (verify, stats).
    pub fn snapshot(&self) -> Vec<(u64, NodeId)> {
        self.lock().items.clone()
    }
}

// ------------------------------------------------------------------------------------------------
// Evictor
// ------------------------------------------------------------------------------------------------

/// Counters reported by [`Evictor::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictorStats {
    /// Eviction passes that found work.
    pub n_passes: u64,
    /// Nodes removed from the cache.
    pub n_nodes_evicted: u64,
    /// BINs that had leaf values stripped.
    pub n_bins_stripped: u64,
    /// Bytes freed in total.
    pub bytes_freed: u64,
}

/// The eviction worker. Runs on the daemon thread and on demand via
/// `Environment::evict_memory`.
pub struct Evictor {
    cache: Arc<CacheBudget>,
    inlist: Arc<InList>,
    registry: Arc<DbRegistry>,
    /// Stop evicting once usage falls below `max × floor% / 100`.
    floor_percent: u32,
    /// Fraction of the IN-list examined per pass.
    scan_fraction: f64,
    read_only: bool,
    n_passes: AtomicU64,
    n_nodes: AtomicU64,
    n_strips: AtomicU64,
    bytes_freed: AtomicU64,
}

impl Evictor {
    /// Build the evictor.
    pub fn new(
        cache: Arc<CacheBudget>,
        inlist: Arc<InList>,
        registry: Arc<DbRegistry>,
        floor_percent: u32,
        scan_fraction: f64,
        read_only: bool,
    ) -> Self {
        Self {
            cache,
            inlist,
            registry,
            floor_percent,
            scan_fraction,
            read_only,
            n_passes: AtomicU64::new(0),
            n_nodes: AtomicU64::new(0),
            n_strips: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EvictorStats {
        EvictorStats {
            n_passes: self.n_passes.load(Ordering::Relaxed),
            n_nodes_evicted: self.n_nodes.load(Ordering::Relaxed),
            n_bins_stripped: self.n_strips.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
        }
    }

    /// One eviction pass. Returns bytes freed.
    pub fn run_once(&self) -> Result<u64> {
        let usage = self.cache.usage();
        let floor = self.cache.max() / 100 * u64::from(self.floor_percent);
        if usage <= floor {
            return Ok(0);
        }
        let mut required = usage - floor;
        self.n_passes.fetch_add(1, Ordering::Relaxed);
        debug!(usage, floor, required, "eviction pass starting");

        let mut batch = self.inlist.scan_batch(self.scan_fraction);
        // Coldest first; ties broken arbitrarily.
        batch.sort_by_key(|(db_id, node)| {
            self.registry
                .tree(*db_id)
                .and_then(|t| t.get(*node))
                .map(|c| c.generation())
                .unwrap_or(0)
        });

        let mut freed_total = 0u64;

        // Step 1: strip resident leaf values.
        for (db_id, node_id) in &batch {
            if required == 0 {
                break;
            }
            let freed = self.strip_leaves(*db_id, *node_id)?;
            required = required.saturating_sub(freed);
            freed_total += freed;
        }

        // Step 2: evict whole nodes, lowest level first.
        if required > 0 {
            let mut by_level: Vec<(u8, u64, NodeId)> = Vec::new();
            for (db_id, node_id) in &batch {
                if let Some(tree) = self.registry.tree(*db_id) {
                    if let Some(cell) = tree.get(*node_id) {
                        let level = {
                            let guard = cell.read();
                            guard.level
                        };
                        by_level.push((level, *db_id, *node_id));
                    }
                }
            }
            by_level.sort_by_key(|(level, _, _)| *level);
            for (_, db_id, node_id) in by_level {
                if required == 0 {
                    break;
                }
                let freed = self.evict_node(db_id, node_id)?;
                required = required.saturating_sub(freed);
                freed_total += freed;
            }
        }

        self.bytes_freed.fetch_add(freed_total, Ordering::Relaxed);
        debug!(freed = freed_total, remaining = required, "eviction pass done");
        Ok(freed_total)
    }

    /// Strip resident leaf values out of a bottom node.
    fn strip_leaves(&self, db_id: u64, node_id: NodeId) -> Result<u64> {
        let Some(tree) = self.registry.tree(db_id) else {
            return Ok(0);
        };
        let Some(cell) = tree.get(node_id) else {
            return Ok(0);
        };
        if cell.is_pinned() || cell.cursor_count() > 0 {
            return Ok(0);
        }
        let Some(mut guard) = cell.try_write(tree.ctx.next_generation()) else {
            return Ok(0);
        };
        if !guard.kind.is_bottom() {
            return Ok(0);
        }
        let before = guard.cell().charged();
        let mut stripped = false;
        for slot in guard.slots.iter_mut() {
            if matches!(slot.child, Child::Ln(_)) && slot.lsn.is_some() {
                slot.child = Child::None;
                stripped = true;
            }
        }
        if !stripped {
            return Ok(0);
        }
        tree.recharge(&guard);
        let freed = before.saturating_sub(guard.cell().charged());
        self.n_strips.fetch_add(1, Ordering::Relaxed);
        trace!(db = db_id, node = node_id, freed, "leaf values stripped");
        Ok(freed)
    }

    /// Evict one node if it qualifies. Returns bytes freed.
    fn evict_node(&self, db_id: u64, node_id: NodeId) -> Result<u64> {
        let Some(tree) = self.registry.tree(db_id) else {
            return Ok(0);
        };
        let Some(cell) = tree.get(node_id) else {
            return Ok(0);
        };
        if cell.is_pinned() || cell.cursor_count() > 0 {
            return Ok(0);
        }
        if tree.root_id() == Some(node_id) {
            return Ok(0);
        }

        // Phase A: under the latch, verify evictability and log if dirty.
        let (level, owner_key, identifier_key, is_dup, logged_lsn) = {
            let Some(mut guard) = cell.try_write(tree.ctx.next_generation()) else {
                return Ok(0);
            };
            let has_resident_child = guard.slots.iter().any(|s| {
                matches!(s.child, Child::Node(id) if tree.get(id).is_some())
            });
            if has_resident_child {
                return Ok(0);
            }
            let lsn = if guard.dirty {
                if self.read_only {
                    warn!(db = db_id, node = node_id, "dirty node not evictable read-only");
                    return Ok(0);
                }
                Some(tree.append_image(&mut guard, false)?)
            } else {
                guard.last_full_lsn
            };
            if lsn.is_none() {
                return Ok(0);
            }
            (
                guard.level,
                guard.owner_key.clone(),
                guard.identifier_key.clone(),
                guard.kind.is_dup(),
                lsn,
            )
        };

        // Phase B: latch-free gap, then fix the parent slot top-down.
        match tree.locate(node_id, level, &owner_key, &identifier_key, is_dup)? {
            Located::Parent(mut parent, idx) => {
                if parent.slots[idx].child_id != node_id {
                    return Ok(0);
                }
                parent.slots[idx].lsn = logged_lsn;
                parent.slots[idx].child = Child::None;
                let freed = cell.charged();
                tree.remove_cell(node_id);
                self.n_nodes.fetch_add(1, Ordering::Relaxed);
                trace!(db = db_id, node = node_id, freed, "node evicted");
                Ok(freed)
            }
            Located::Root => Ok(0),
            Located::Gone => {
                // Unreachable from the live tree (already detached).
                let freed = cell.charged();
                tree.remove_cell(node_id);
                Ok(freed)
            }
        }
    }
}

impl std::fmt::Debug for Evictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evictor")
            .field("floor_percent", &self.floor_percent)
            .field("scan_fraction", &self.scan_fraction)
            .finish_non_exhaustive()
    }
}
