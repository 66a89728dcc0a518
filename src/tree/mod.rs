//! The per-database B-tree: arena, search, insert, split, duplicates.
//!
//! Nodes live in an **arena** keyed by node id; slots reference children by
//! `(node id, LSN)` pairs, so evicting a child is a store of
//! [`Child::None`](node::Child) in the parent and re-fetching is a log read.
//! There are no parent back-pointers: a node's parent is re-located by
//! descending with its identifier key, which is also how the compressor,
//! evictor and cleaner find their way back to nodes they queued without
//! holding latches.
//!
//! ## Latching discipline
//!
//! Descents couple **exclusive** node latches top-down: the parent is
//! released only after the child is latched. Structural modification keeps
//! the parent latched across the child split. Sibling traversal
//! (`next_position` / `prev_position`) holds the path top-down while
//! backtracking, which is compatible with the same top-down order used
//! everywhere else. No node latch is ever held across a record-lock wait —
//! that protocol lives in the cursor layer.
//!
//! ## Structural modification protocol
//!
//! A split logs both halves **provisionally** and then the parent
//! non-provisionally; recovery applies the group all-or-nothing (the
//! provisional halves are only reachable through the parent image). Split
//! points follow the insertion hint: an extreme-left or extreme-right
//! insert splits at 1 or N−1 so monotonic loads stay packed.
//!
//! ## Duplicate subtrees
//!
//! A BIN slot whose key has more than one value points at a DIN/DBIN
//! subtree ordered by the duplicate comparator; the subtree root carries a
//! [`DupCount`](node::DupCount) slot. The same descent/split machinery runs
//! inside duplicate subtrees with the duplicate comparator; the subtree
//! root is re-rooted through the owning BIN slot.

pub mod node;

#[cfg(test)]
mod tests;

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::cleaner::profile::UtilizationTracker;
use crate::error::{Error, Result};
use crate::evictor::{CacheBudget, InList};
use crate::log::{LogEntry, LogManager, Lsn};
use node::{Child, DupCount, Node, NodeCell, NodeId, NodeKind, NodeWriteGuard, Slot, SlotSearch};

/// Pluggable key-ordering callback; the default is lexicographic bytes.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> CmpOrdering + Send + Sync>;

/// Lexicographic byte comparison, the default order for keys and
/// duplicates.
pub fn default_comparator() -> Comparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

// ------------------------------------------------------------------------------------------------
// TreeContext
// ------------------------------------------------------------------------------------------------

/// Shared services every tree operates against.
#[derive(Clone)]
pub struct TreeContext {
    /// The environment log.
    pub log: Arc<LogManager>,
    /// Utilization tracker for obsolete-record accounting.
    pub tracker: Arc<UtilizationTracker>,
    /// Cache budget the arena charges into.
    pub cache: Arc<CacheBudget>,
    /// Global IN-list for the evictor.
    pub inlist: Arc<InList>,
    /// Node-id allocator (shared with leaf records).
    pub node_ids: Arc<AtomicU64>,
    /// Global access-generation counter (LRU proxy).
    pub generation: Arc<AtomicU64>,
}

impl TreeContext {
    /// Allocate a node id.
    pub fn next_node_id(&self) -> NodeId {
        self.node_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Next access generation.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RootInfo {
    id: Option<NodeId>,
    lsn: Option<Lsn>,
}

/// Outcome of locating a node by its keys (cleaner, evictor, recovery).
pub enum Located {
    /// Found: the latched parent and the slot index referencing the node.
    Parent(NodeWriteGuard, usize),
    /// The node is the tree (or duplicate-subtree) root.
    Root,
    /// Not reachable from the live tree.
    Gone,
}

/// One per-database B-tree.
pub struct Tree {
    /// Owning database id.
    pub db_id: u64,
    /// Shared services.
    pub ctx: TreeContext,
    /// Fanout limit per node.
    pub max_entries: usize,
    /// Main key comparator.
    pub key_cmp: Comparator,
    /// Duplicate (value) comparator.
    pub dup_cmp: Comparator,
    arena: RwLock<HashMap<NodeId, Arc<NodeCell>>>,
    root: Mutex<RootInfo>,
}

impl Tree {
    /// Create an empty tree.
    pub fn new(
        db_id: u64,
        ctx: TreeContext,
        max_entries: usize,
        key_cmp: Comparator,
        dup_cmp: Comparator,
    ) -> Self {
        Self {
            db_id,
            ctx,
            max_entries,
            key_cmp,
            dup_cmp,
            arena: RwLock::new(HashMap::new()),
            root: Mutex::new(RootInfo::default()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Arena and root plumbing
    // --------------------------------------------------------------------------------------------

    fn arena_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<NodeId, Arc<NodeCell>>> {
        self.arena
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn arena_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeId, Arc<NodeCell>>> {
        self.arena
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn root_lock(&self) -> std::sync::MutexGuard<'_, RootInfo> {
        self.root
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Resident cell by id.
    pub fn get(&self, id: NodeId) -> Option<Arc<NodeCell>> {
        self.arena_read().get(&id).cloned()
    }

    /// All resident cells (checkpoint and verify walks).
    pub fn resident_cells(&self) -> Vec<Arc<NodeCell>> {
        self.arena_read().values().cloned().collect()
    }

    /// Number of resident nodes.
    pub fn resident_count(&self) -> usize {
        self.arena_read().len()
    }

    /// Current root node id.
    pub fn root_id(&self) -> Option<NodeId> {
        self.root_lock().id
    }

    /// LSN of the newest root image.
    pub fn root_lsn(&self) -> Option<Lsn> {
        self.root_lock().lsn
    }

    /// Point the tree at a (possibly non-resident) root.
    pub fn set_root(&self, id: Option<NodeId>, lsn: Option<Lsn>) {
        let mut info = self.root_lock();
        info.id = id;
        info.lsn = lsn;
    }

    /// Update only the root image LSN.
    pub fn set_root_lsn(&self, lsn: Option<Lsn>) {
        self.root_lock().lsn = lsn;
    }

    /// The resident root cell, materializing it from the log if needed.
    pub fn root_cell(&self) -> Result<Option<Arc<NodeCell>>> {
        let info = *self.root_lock();
        let Some(id) = info.id else { return Ok(None) };
        if let Some(cell) = self.get(id) {
            return Ok(Some(cell));
        }
        let lsn = info
            .lsn
            .ok_or_else(|| Error::Internal("non-resident root without LSN".into()))?;
        Ok(Some(self.materialize(lsn)?))
    }

    /// Register a freshly built node.
    fn adopt(&self, node: Node) -> Arc<NodeCell> {
        let size = node.memory_size() as u64;
        let db_id = node.db_id;
        let cell = NodeCell::new(node);
        cell.set_charged(size);
        self.ctx.cache.add(size);
        self.ctx.inlist.add(db_id, cell.id);
        self.arena_write().insert(cell.id, Arc::clone(&cell));
        cell
    }

    /// Create a fresh empty node in the arena.
    pub fn make_node(
        &self,
        kind: NodeKind,
        level: u8,
        owner_key: Vec<u8>,
        identifier_key: Vec<u8>,
    ) -> Arc<NodeCell> {
        let id = self.ctx.next_node_id();
        self.adopt(Node::new(id, self.db_id, kind, level, owner_key, identifier_key))
    }

    /// Drop a node from the arena, refunding its cache charge.
    pub fn remove_cell(&self, id: NodeId) {
        if let Some(cell) = self.arena_write().remove(&id) {
            self.ctx.cache.sub(cell.charged());
            self.ctx.inlist.remove(self.db_id, id);
        }
    }

    /// Drop the whole resident tree (truncate / remove / close).
    pub fn clear(&self) {
        let mut arena = self.arena_write();
        for (id, cell) in arena.drain() {
            self.ctx.cache.sub(cell.charged());
            self.ctx.inlist.remove(self.db_id, id);
        }
        let mut info = self.root_lock();
        info.id = None;
        info.lsn = None;
    }

    /// Re-sync a node's cache charge after mutation.
    pub fn recharge(&self, guard: &NodeWriteGuard) {
        let size = guard.memory_size() as u64;
        let old = guard.cell().set_charged(size);
        if size >= old {
            self.ctx.cache.add(size - old);
        } else {
            self.ctx.cache.sub(old - size);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Materialization
    // --------------------------------------------------------------------------------------------

    /// Rebuild a node from its newest logged image (full image, or a
    /// BIN-delta applied over the last full image).
    pub fn materialize(&self, lsn: Lsn) -> Result<Arc<NodeCell>> {
        let (_, entry) = self.ctx.log.read_entry(lsn)?;
        let mut node = match entry {
            LogEntry::Node(image) => {
                let mut n = Node::from_image(&image);
                n.last_full_lsn = Some(lsn);
                n
            }
            LogEntry::BinDelta(delta) => {
                let (_, base) = self.ctx.log.read_entry(delta.last_full_lsn)?;
                let LogEntry::Node(image) = base else {
                    return Err(Error::Corruption(format!(
                        "BIN-delta at {lsn} references non-node record at {}",
                        delta.last_full_lsn
                    )));
                };
                let mut n = Node::from_image(&image);
                n.last_full_lsn = Some(delta.last_full_lsn);
                for ds in &delta.slots {
                    match n.find_slot(&ds.key, &self.key_cmp) {
                        SlotSearch::Exact(i) => {
                            let slot = &mut n.slots[i];
                            slot.child_id = ds.child_id;
                            slot.lsn = ds.lsn;
                            slot.known_deleted = ds.known_deleted;
                            slot.child = Child::None;
                        }
                        SlotSearch::Insert(i) => n.slots.insert(
                            i,
                            Slot {
                                key: ds.key.clone(),
                                child_id: ds.child_id,
                                lsn: ds.lsn,
                                child: Child::None,
                                known_deleted: ds.known_deleted,
                                dirty: false,
                            },
                        ),
                    }
                }
                n
            }
            other => {
                return Err(Error::Corruption(format!(
                    "expected node image at {lsn}, found {:?}",
                    other.entry_type()
                )));
            }
        };
        node.dirty = false;
        if let Some(existing) = self.get(node.id) {
            return Ok(existing);
        }
        trace!(db = self.db_id, node = node.id, %lsn, "node materialized");
        Ok(self.adopt(node))
    }

    /// Make the child behind `parent.slots[idx]` resident and return it.
    pub fn fetch_child(&self, parent: &mut NodeWriteGuard, idx: usize) -> Result<Arc<NodeCell>> {
        if let Child::Node(id) = parent.slots[idx].child {
            if let Some(cell) = self.get(id) {
                return Ok(cell);
            }
        }
        let lsn = parent.slots[idx].lsn.ok_or_else(|| {
            Error::Internal(format!(
                "non-resident child without LSN in node {}",
                parent.id
            ))
        })?;
        let cell = self.materialize(lsn)?;
        let slot = &mut parent.slots[idx];
        slot.child = Child::Node(cell.id);
        slot.child_id = cell.id;
        Ok(cell)
    }

    /// Make the leaf value behind `bin.slots[idx]` resident and return it.
    pub fn fetch_ln(&self, bin: &mut NodeWriteGuard, idx: usize) -> Result<Vec<u8>> {
        if let Child::Ln(v) = &bin.slots[idx].child {
            return Ok(v.clone());
        }
        let lsn = bin.slots[idx].lsn.ok_or_else(|| {
            Error::Internal(format!("non-resident leaf without LSN in node {}", bin.id))
        })?;
        let (_, entry) = self.ctx.log.read_entry(lsn)?;
        let LogEntry::Ln(ln) = entry else {
            return Err(Error::Corruption(format!(
                "expected leaf record at {lsn}"
            )));
        };
        bin.slots[idx].child = Child::Ln(ln.value.clone());
        self.recharge(bin);
        Ok(ln.value)
    }

    // --------------------------------------------------------------------------------------------
    // Search
    // --------------------------------------------------------------------------------------------

    /// Exclusive latch-coupled descent to the BIN covering `key`.
    ///
    /// Returns `None` for an empty tree; otherwise the latched BIN and the
    /// slot search outcome (which may be an insertion point).
    pub fn search_position(&self, key: &[u8]) -> Result<Option<(NodeWriteGuard, SlotSearch)>> {
        let Some(root) = self.root_cell()? else {
            return Ok(None);
        };
        let mut guard = root.write(self.ctx.next_generation());
        loop {
            if guard.kind.is_bottom() {
                let pos = guard.find_slot(key, &self.key_cmp);
                return Ok(Some((guard, pos)));
            }
            if guard.slots.is_empty() {
                // Transient: the compressor is about to remove this node.
                return Ok(None);
            }
            let idx = guard.find_child(key, &self.key_cmp);
            let child = self.fetch_child(&mut guard, idx)?;
            let child_guard = child.write(self.ctx.next_generation());
            guard = child_guard;
        }
    }

    /// Descent within a duplicate subtree rooted at `din` using the
    /// duplicate comparator.
    pub fn dup_search_position(
        &self,
        din: &Arc<NodeCell>,
        dup_key: &[u8],
    ) -> Result<(NodeWriteGuard, SlotSearch)> {
        let mut guard = din.write(self.ctx.next_generation());
        loop {
            if guard.kind.is_bottom() {
                let pos = guard.find_slot(dup_key, &self.dup_cmp);
                return Ok((guard, pos));
            }
            if guard.slots.is_empty() {
                return Err(Error::Internal(format!(
                    "empty duplicate subtree node {} mid-descent",
                    guard.id
                )));
            }
            let idx = guard.find_child(dup_key, &self.dup_cmp);
            let child = self.fetch_child(&mut guard, idx)?;
            let child_guard = child.write(self.ctx.next_generation());
            guard = child_guard;
        }
    }

    // --------------------------------------------------------------------------------------------
    // Insert descent with preemptive splits
    // --------------------------------------------------------------------------------------------

    /// Descend to the BIN covering `key`, creating the root when the tree
    /// is empty and splitting every full node on the way down.
    pub fn insert_position(&self, key: &[u8]) -> Result<(NodeWriteGuard, SlotSearch)> {
        let root = match self.root_cell()? {
            Some(cell) => cell,
            None => {
                let cell = self.make_node(NodeKind::Bin, 1, Vec::new(), key.to_vec());
                self.set_root(Some(cell.id), None);
                cell
            }
        };
        let key_cmp = Arc::clone(&self.key_cmp);
        self.insert_descend(root, key, &key_cmp, &mut |tree: &Tree, new_root: &Arc<NodeCell>| {
            tree.set_root(Some(new_root.id), None);
        })
    }

    /// Descend within the duplicate subtree under `bin.slots[bin_idx]`,
    /// splitting full nodes; a subtree-root split re-roots through the BIN
    /// slot.
    pub fn dup_insert_position(
        &self,
        bin: &mut NodeWriteGuard,
        bin_idx: usize,
        dup_key: &[u8],
    ) -> Result<(NodeWriteGuard, SlotSearch)> {
        let din = self.fetch_child(bin, bin_idx)?;
        let dup_cmp = Arc::clone(&self.dup_cmp);
        let result = self.insert_descend(din, dup_key, &dup_cmp, &mut |_tree, new_root| {
            let slot = &mut bin.slots[bin_idx];
            slot.child_id = new_root.id;
            slot.child = Child::Node(new_root.id);
            slot.lsn = None;
            slot.dirty = true;
        });
        bin.dirty = true;
        result
    }

    fn insert_descend(
        &self,
        root: Arc<NodeCell>,
        key: &[u8],
        cmp: &Comparator,
        set_root: &mut dyn FnMut(&Tree, &Arc<NodeCell>),
    ) -> Result<(NodeWriteGuard, SlotSearch)> {
        let mut guard = {
            let mut root_guard = root.write(self.ctx.next_generation());
            if root_guard.is_full(self.max_entries) {
                // Grow the tree: a new root adopts the old one as its only
                // child, then the old root splits as a normal child.
                let upper_kind = match root_guard.kind {
                    NodeKind::Bin | NodeKind::In => NodeKind::In,
                    NodeKind::Dbin | NodeKind::Din => NodeKind::Din,
                };
                let new_root = self.make_node(
                    upper_kind,
                    root_guard.level + 1,
                    root_guard.owner_key.clone(),
                    root_guard.identifier_key.clone(),
                );
                let mut nr = new_root.write(self.ctx.next_generation());
                // A duplicate count always lives on the subtree root.
                nr.dup_count = root_guard.dup_count.take();
                nr.slots.push(Slot {
                    key: root_guard.identifier_key.clone(),
                    child_id: root_guard.id,
                    lsn: None,
                    child: Child::Node(root_guard.id),
                    known_deleted: false,
                    dirty: true,
                });
                set_root(self, &new_root);
                self.split_child(&mut nr, 0, root_guard, key, cmp)?;
                self.recharge(&nr);
                nr
            } else {
                root_guard
            }
        };

        loop {
            if guard.kind.is_bottom() {
                let pos = guard.find_slot(key, cmp);
                return Ok((guard, pos));
            }
            if guard.slots.is_empty() {
                return Err(Error::Internal(format!(
                    "empty internal node {} mid-insert",
                    guard.id
                )));
            }
            let mut idx = guard.find_child(key, cmp);
            let mut child_cell = self.fetch_child(&mut guard, idx)?;
            let mut child_guard = child_cell.write(self.ctx.next_generation());
            if child_guard.is_full(self.max_entries) {
                self.split_child(&mut guard, idx, child_guard, key, cmp)?;
                idx = guard.find_child(key, cmp);
                child_cell = self.fetch_child(&mut guard, idx)?;
                child_guard = child_cell.write(self.ctx.next_generation());
            }
            // Latch coupling: the parent is released only now.
            guard = child_guard;
        }
    }

    /// Split a full, latched child of a latched parent.
    ///
    /// Logs both halves provisionally, then the parent non-provisionally
    /// (the structural modification group), and fixes parent keys with
    /// compare-and-lower.
    fn split_child(
        &self,
        parent: &mut NodeWriteGuard,
        idx: usize,
        mut child: NodeWriteGuard,
        search_key: &[u8],
        cmp: &Comparator,
    ) -> Result<()> {
        let n = child.slots.len();
        debug_assert!(n >= 2, "splitting a node with fewer than two slots");
        let split_at = if cmp(search_key, &child.slots[n - 1].key) == CmpOrdering::Greater {
            // Ascending insertion: keep the new key's side light.
            n - 1
        } else if cmp(search_key, &child.slots[0].key) == CmpOrdering::Less {
            1
        } else {
            n / 2
        };

        let sibling = self.make_node(
            child.kind,
            child.level,
            child.owner_key.clone(),
            child.slots[split_at].key.clone(),
        );
        let mut sib = sibling.write(self.ctx.next_generation());
        sib.slots = child.slots.split_off(split_at);
        sib.dirty = true;
        child.dirty = true;

        // Structural modification group: children provisional, parent not.
        let lsn_c = self.append_image(&mut child, true)?;
        let lsn_s = self.append_image(&mut sib, true)?;

        {
            let slot = &mut parent.slots[idx];
            slot.lsn = Some(lsn_c);
            slot.dirty = true;
            // Compare-and-lower: never raise a parent key, it would shadow
            // keys already in the subtree.
            if cmp(&child.slots[0].key, &slot.key) == CmpOrdering::Less {
                slot.key = child.slots[0].key.clone();
            }
        }
        parent.insert_slot(
            idx + 1,
            Slot {
                key: sib.identifier_key.clone(),
                child_id: sib.id,
                lsn: Some(lsn_s),
                child: Child::Node(sib.id),
                known_deleted: false,
                dirty: true,
            },
        );
        let lsn_p = self.append_image_keep_dirty(parent)?;
        if self.root_id() == Some(parent.id) {
            self.set_root_lsn(Some(lsn_p));
        }

        self.recharge(&child);
        self.recharge(&sib);
        self.recharge(parent);
        trace!(
            db = self.db_id,
            node = child.id,
            sibling = sib.id,
            split_at,
            "node split"
        );
        Ok(())
    }

    /// Log a full image and mark the node clean.
    pub fn append_image(&self, guard: &mut NodeWriteGuard, provisional: bool) -> Result<Lsn> {
        let image = guard.to_image();
        let lsn = self
            .ctx
            .log
            .append(&LogEntry::Node(image), provisional, 0)?;
        guard.last_full_lsn = Some(lsn);
        guard.dirty = false;
        for slot in &mut guard.slots {
            slot.dirty = false;
        }
        Ok(lsn)
    }

    /// Log a full image but keep the node dirty (its own parent slot still
    /// holds a stale LSN until the next checkpoint or eviction).
    fn append_image_keep_dirty(&self, guard: &mut NodeWriteGuard) -> Result<Lsn> {
        let lsn = self.append_image(guard, false)?;
        guard.dirty = true;
        Ok(lsn)
    }

    // --------------------------------------------------------------------------------------------
    // Ordered traversal
    // --------------------------------------------------------------------------------------------

    /// Position on the first slot of the tree (raw; may be known-deleted).
    pub fn first_position(&self) -> Result<Option<(NodeWriteGuard, usize)>> {
        let Some(root) = self.root_cell()? else {
            return Ok(None);
        };
        self.edge_from(&root, true)
    }

    /// Position on the last slot of the tree (raw; may be known-deleted).
    pub fn last_position(&self) -> Result<Option<(NodeWriteGuard, usize)>> {
        let Some(root) = self.root_cell()? else {
            return Ok(None);
        };
        self.edge_from(&root, false)
    }

    /// First/last slot of a duplicate subtree.
    pub fn dup_edge(
        &self,
        din: &Arc<NodeCell>,
        first: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        self.edge_from(din, first)
    }

    fn edge_from(
        &self,
        cell: &Arc<NodeCell>,
        first: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let mut guard = cell.write(self.ctx.next_generation());
        loop {
            if guard.slots.is_empty() {
                return Ok(None);
            }
            let idx = if first { 0 } else { guard.slots.len() - 1 };
            if guard.kind.is_bottom() {
                return Ok(Some((guard, idx)));
            }
            let child = self.fetch_child(&mut guard, idx)?;
            let child_guard = child.write(self.ctx.next_generation());
            guard = child_guard;
        }
    }

    /// Position on the first slot with key greater than `key` (or equal,
    /// when `include_equal`). Backtracks across sibling subtrees.
    pub fn next_position(
        &self,
        key: &[u8],
        include_equal: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let Some(root) = self.root_cell()? else {
            return Ok(None);
        };
        self.next_from(&root, key, include_equal, &Arc::clone(&self.key_cmp))
    }

    /// Position on the last slot with key less than `key` (or equal, when
    /// `include_equal`).
    pub fn prev_position(
        &self,
        key: &[u8],
        include_equal: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let Some(root) = self.root_cell()? else {
            return Ok(None);
        };
        self.prev_from(&root, key, include_equal, &Arc::clone(&self.key_cmp))
    }

    /// Duplicate-subtree variant of [`Tree::next_position`].
    pub fn dup_next_position(
        &self,
        din: &Arc<NodeCell>,
        dup_key: &[u8],
        include_equal: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        self.next_from(din, dup_key, include_equal, &Arc::clone(&self.dup_cmp))
    }

    /// Duplicate-subtree variant of [`Tree::prev_position`].
    pub fn dup_prev_position(
        &self,
        din: &Arc<NodeCell>,
        dup_key: &[u8],
        include_equal: bool,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        self.prev_from(din, dup_key, include_equal, &Arc::clone(&self.dup_cmp))
    }

    fn next_from(
        &self,
        cell: &Arc<NodeCell>,
        key: &[u8],
        include_equal: bool,
        cmp: &Comparator,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let mut guard = cell.write(self.ctx.next_generation());
        if guard.kind.is_bottom() {
            let idx = match guard.find_slot(key, cmp) {
                SlotSearch::Exact(i) => {
                    if include_equal {
                        i
                    } else {
                        i + 1
                    }
                }
                SlotSearch::Insert(i) => i,
            };
            if idx < guard.slots.len() {
                return Ok(Some((guard, idx)));
            }
            return Ok(None);
        }
        if guard.slots.is_empty() {
            return Ok(None);
        }
        let start = guard.find_child(key, cmp);
        for i in start..guard.slots.len() {
            let child = self.fetch_child(&mut guard, i)?;
            if let Some(hit) = self.next_from(&child, key, include_equal, cmp)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    fn prev_from(
        &self,
        cell: &Arc<NodeCell>,
        key: &[u8],
        include_equal: bool,
        cmp: &Comparator,
    ) -> Result<Option<(NodeWriteGuard, usize)>> {
        let mut guard = cell.write(self.ctx.next_generation());
        if guard.kind.is_bottom() {
            let idx = match guard.find_slot(key, cmp) {
                SlotSearch::Exact(i) => {
                    if include_equal {
                        Some(i)
                    } else {
                        i.checked_sub(1)
                    }
                }
                SlotSearch::Insert(i) => i.checked_sub(1),
            };
            return Ok(idx.map(|i| (guard, i)));
        }
        if guard.slots.is_empty() {
            return Ok(None);
        }
        let start = guard.find_child(key, cmp);
        for i in (0..=start).rev() {
            let child = self.fetch_child(&mut guard, i)?;
            if let Some(hit) = self.prev_from(&child, key, include_equal, cmp)? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Duplicate subtree construction
    // --------------------------------------------------------------------------------------------

    /// Turn a single-LN slot into a duplicate subtree (DIN root + DBIN)
    /// holding the existing record, and return the DIN cell.
    ///
    /// The caller logs the DupCount record and installs its LSN.
    pub fn create_dup_tree(
        &self,
        bin: &mut NodeWriteGuard,
        idx: usize,
        existing_value: Vec<u8>,
        dup_count_node_id: NodeId,
    ) -> Result<Arc<NodeCell>> {
        let key = bin.slots[idx].key.clone();
        let old_child_id = bin.slots[idx].child_id;
        let old_lsn = bin.slots[idx].lsn;

        let dbin = self.make_node(NodeKind::Dbin, 1, key.clone(), existing_value.clone());
        {
            let mut dbin_guard = dbin.write(self.ctx.next_generation());
            dbin_guard.slots.push(Slot {
                key: existing_value.clone(),
                child_id: old_child_id,
                lsn: old_lsn,
                child: Child::Ln(existing_value),
                known_deleted: bin.slots[idx].known_deleted,
                dirty: true,
            });
            self.recharge(&dbin_guard);
        }

        let din = self.make_node(NodeKind::Din, 2, key.clone(), key.clone());
        {
            let mut din_guard = din.write(self.ctx.next_generation());
            let dbin_key = {
                let dbin_guard = dbin.read();
                dbin_guard.identifier_key.clone()
            };
            din_guard.slots.push(Slot {
                key: dbin_key,
                child_id: dbin.id,
                lsn: None,
                child: Child::Node(dbin.id),
                known_deleted: false,
                dirty: true,
            });
            din_guard.dup_count = Some(DupCount {
                node_id: dup_count_node_id,
                count: 1,
                lsn: None,
            });
            self.recharge(&din_guard);
        }

        let slot = &mut bin.slots[idx];
        slot.child_id = din.id;
        slot.child = Child::Node(din.id);
        slot.lsn = None;
        slot.known_deleted = false;
        slot.dirty = true;
        bin.dirty = true;
        self.recharge(bin);
        Ok(din)
    }

    // --------------------------------------------------------------------------------------------
    // Locating nodes without back-pointers
    // --------------------------------------------------------------------------------------------

    /// Re-locate a node by its keys and verify the parent slot still points
    /// at it. Used by the compressor, evictor, cleaner and recovery.
    pub fn locate(
        &self,
        node_id: NodeId,
        level: u8,
        owner_key: &[u8],
        identifier_key: &[u8],
        is_dup: bool,
    ) -> Result<Located> {
        if self.root_id() == Some(node_id) {
            return Ok(Located::Root);
        }
        let Some(root) = self.root_cell()? else {
            return Ok(Located::Gone);
        };

        if !is_dup {
            return self.locate_in(&root, node_id, level, identifier_key, &Arc::clone(&self.key_cmp));
        }

        // Duplicate-subtree node: walk the main tree to the owning BIN,
        // then the duplicate subtree by the duplicate key.
        let mut guard = root.write(self.ctx.next_generation());
        loop {
            if guard.kind == NodeKind::Bin {
                break;
            }
            if guard.slots.is_empty() {
                return Ok(Located::Gone);
            }
            let idx = guard.find_child(owner_key, &self.key_cmp);
            let child = self.fetch_child(&mut guard, idx)?;
            let child_guard = child.write(self.ctx.next_generation());
            guard = child_guard;
        }
        let SlotSearch::Exact(idx) = guard.find_slot(owner_key, &self.key_cmp) else {
            return Ok(Located::Gone);
        };
        if guard.slots[idx].child_id == node_id {
            // The node is the duplicate-subtree root itself.
            return Ok(Located::Parent(guard, idx));
        }
        let din = self.fetch_child(&mut guard, idx)?;
        {
            let din_guard = din.read();
            if din_guard.kind != NodeKind::Din && din_guard.kind != NodeKind::Dbin {
                return Ok(Located::Gone);
            }
        }
        drop(guard);
        self.locate_in(&din, node_id, level, identifier_key, &Arc::clone(&self.dup_cmp))
    }

    fn locate_in(
        &self,
        from: &Arc<NodeCell>,
        node_id: NodeId,
        level: u8,
        identifier_key: &[u8],
        cmp: &Comparator,
    ) -> Result<Located> {
        if from.id == node_id {
            return Ok(Located::Root);
        }
        let mut guard = from.write(self.ctx.next_generation());
        loop {
            if guard.kind.is_bottom() || guard.level <= level {
                return Ok(Located::Gone);
            }
            if guard.slots.is_empty() {
                return Ok(Located::Gone);
            }
            let idx = guard.find_child(identifier_key, cmp);
            if guard.level == level + 1 {
                if guard.slots[idx].child_id == node_id {
                    return Ok(Located::Parent(guard, idx));
                }
                return Ok(Located::Gone);
            }
            let child = self.fetch_child(&mut guard, idx)?;
            let child_guard = child.write(self.ctx.next_generation());
            guard = child_guard;
        }
    }
}
