//! In-memory B-tree nodes.
//!
//! One tagged [`Node`] type covers all four internal-node kinds; the kinds
//! differ only in whether slots reference child nodes or leaf records,
//! whether the slot-0 sentinel rule applies (internal levels), and whether a
//! duplicate count is present (duplicate subtree roots). Leaf records (LNs)
//! are not nodes of their own in memory: a BIN/DBIN slot *is* the leaf —
//! it carries the record key, the leaf's node id (the lock-table key), the
//! last logged LSN and, when resident, the value bytes.
//!
//! [`NodeCell`] pairs a node with its latch, an eviction pin counter and a
//! parked-cursor counter, behind guards that own the `Arc` — so latch
//! coupling ("release the parent only after the child is latched") is a
//! plain sequence of guard drops at the call site.

use std::cell::UnsafeCell;
use std::cmp::Ordering as CmpOrdering;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::latch::Latch;
use crate::log::entry::{DupCountRef, ImageKind, Lsn, NodeImage, SlotImage};
use crate::tree::Comparator;

/// Unique 64-bit node identifier; also the lock-table key for leaf records.
pub type NodeId = u64;

/// Fixed per-node memory overhead charged to the cache budget.
pub const NODE_OVERHEAD: usize = 160;

/// Fixed per-slot memory overhead charged to the cache budget.
pub const SLOT_OVERHEAD: usize = 72;

// ------------------------------------------------------------------------------------------------
// Node kinds and children
// ------------------------------------------------------------------------------------------------

/// The four internal-node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Internal node: children are INs or BINs.
    In,
    /// Bottom internal node: slots are leaf records or duplicate roots.
    Bin,
    /// Duplicate internal node: children are DINs or DBINs.
    Din,
    /// Duplicate bottom internal node: slots are leaf records.
    Dbin,
}

impl NodeKind {
    /// Bottom nodes hold leaf records directly.
    pub fn is_bottom(self) -> bool {
        matches!(self, NodeKind::Bin | NodeKind::Dbin)
    }

    /// Kinds living inside a duplicate subtree.
    pub fn is_dup(self) -> bool {
        matches!(self, NodeKind::Din | NodeKind::Dbin)
    }

    /// The slot-0 sentinel rule applies above the bottom level.
    pub fn has_sentinel(self) -> bool {
        !self.is_bottom()
    }

    /// Persistent image kind.
    pub fn image_kind(self) -> ImageKind {
        match self {
            NodeKind::In => ImageKind::In,
            NodeKind::Bin => ImageKind::Bin,
            NodeKind::Din => ImageKind::Din,
            NodeKind::Dbin => ImageKind::Dbin,
        }
    }

    /// Inverse of [`NodeKind::image_kind`].
    pub fn from_image(kind: ImageKind) -> Self {
        match kind {
            ImageKind::In => NodeKind::In,
            ImageKind::Bin => NodeKind::Bin,
            ImageKind::Din => NodeKind::Din,
            ImageKind::Dbin => NodeKind::Dbin,
        }
    }
}

/// What a slot currently references in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    /// Not resident; re-fetch through the slot's LSN.
    None,
    /// Resident child node (or duplicate-subtree root under a BIN slot).
    Node(NodeId),
    /// Resident leaf value.
    Ln(Vec<u8>),
}

/// One slot of a node.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Slot key: record key in a BIN, duplicate value in a DBIN, subtree
    /// bound in internal levels.
    pub key: Vec<u8>,
    /// Child id: the leaf's node id for leaf slots, the child node id
    /// otherwise.
    pub child_id: NodeId,
    /// Last logged LSN of the child (or leaf record).
    pub lsn: Option<Lsn>,
    /// Resident state.
    pub child: Child,
    /// Logically deleted, awaiting physical compression.
    pub known_deleted: bool,
    /// Changed since the node's last full image (drives BIN-deltas).
    pub dirty: bool,
}

impl Slot {
    /// Bytes this slot charges to the cache budget.
    pub fn memory_size(&self) -> usize {
        let resident = match &self.child {
            Child::Ln(v) => v.len(),
            _ => 0,
        };
        SLOT_OVERHEAD + self.key.len() + resident
    }
}

/// Duplicate-count slot held by a duplicate subtree root.
#[derive(Debug, Clone, Copy)]
pub struct DupCount {
    /// Node id of the count record — the lock key for the whole set.
    pub node_id: NodeId,
    /// Live duplicates under this root.
    pub count: u32,
    /// LSN of the newest count record.
    pub lsn: Option<Lsn>,
}

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

/// An in-memory internal node (any of the four kinds).
#[derive(Debug, Clone)]
pub struct Node {
    /// Node id.
    pub id: NodeId,
    /// Owning database.
    pub db_id: u64,
    /// Kind tag.
    pub kind: NodeKind,
    /// Tree level; 1 at the bottom of either the main or a duplicate tree.
    pub level: u8,
    /// Needs logging before it can be evicted or checkpointed away.
    pub dirty: bool,
    /// For duplicate-subtree nodes, the primary key owning the subtree;
    /// empty for main-tree nodes.
    pub owner_key: Vec<u8>,
    /// Key used to re-locate this node's parent slot (a duplicate value
    /// inside a duplicate subtree).
    pub identifier_key: Vec<u8>,
    /// Slots in key order (slot 0 of an internal level is the sentinel).
    pub slots: Vec<Slot>,
    /// Duplicate count; only on a duplicate subtree root.
    pub dup_count: Option<DupCount>,
    /// LSN of the last *full* image, for delta eligibility.
    pub last_full_lsn: Option<Lsn>,
}

/// Outcome of a bottom-node slot search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSearch {
    /// Exact key at this index.
    Exact(usize),
    /// Key absent; this is its insertion index.
    Insert(usize),
}

impl SlotSearch {
    /// Index regardless of exactness.
    pub fn index(self) -> usize {
        match self {
            SlotSearch::Exact(i) | SlotSearch::Insert(i) => i,
        }
    }

    /// `true` for an exact hit.
    pub fn is_exact(self) -> bool {
        matches!(self, SlotSearch::Exact(_))
    }
}

impl Node {
    /// Fresh empty node.
    pub fn new(
        id: NodeId,
        db_id: u64,
        kind: NodeKind,
        level: u8,
        owner_key: Vec<u8>,
        identifier_key: Vec<u8>,
    ) -> Self {
        Self {
            id,
            db_id,
            kind,
            level,
            dirty: true,
            owner_key,
            identifier_key,
            slots: Vec::new(),
            dup_count: None,
            last_full_lsn: None,
        }
    }

    /// Bytes this node charges to the cache budget.
    pub fn memory_size(&self) -> usize {
        NODE_OVERHEAD
            + self.owner_key.len()
            + self.identifier_key.len()
            + self.slots.iter().map(Slot::memory_size).sum::<usize>()
    }

    /// Binary-search a bottom node for `key`.
    pub fn find_slot(&self, key: &[u8], cmp: &Comparator) -> SlotSearch {
        debug_assert!(self.kind.is_bottom());
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(&self.slots[mid].key, key) {
                CmpOrdering::Less => lo = mid + 1,
                CmpOrdering::Greater => hi = mid,
                CmpOrdering::Equal => return SlotSearch::Exact(mid),
            }
        }
        SlotSearch::Insert(lo)
    }

    /// Pick the child of an internal node for a descent towards `key`.
    ///
    /// Slot 0 is the sentinel: it compares lower than any real key, so the
    /// result is the last index whose key is ≤ `key`, defaulting to 0.
    pub fn find_child(&self, key: &[u8], cmp: &Comparator) -> usize {
        debug_assert!(self.kind.has_sentinel());
        debug_assert!(!self.slots.is_empty());
        let mut lo = 1usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(&self.slots[mid].key, key) {
                CmpOrdering::Less | CmpOrdering::Equal => lo = mid + 1,
                CmpOrdering::Greater => hi = mid,
            }
        }
        lo - 1
    }

    /// Insert a slot, shifting the tail right.
    pub fn insert_slot(&mut self, index: usize, slot: Slot) {
        self.slots.insert(index, slot);
        self.dirty = true;
    }

    /// Physically remove a slot.
    pub fn remove_slot(&mut self, index: usize) -> Slot {
        self.dirty = true;
        self.slots.remove(index)
    }

    /// `true` once the node has no room for another slot.
    pub fn is_full(&self, max_entries: usize) -> bool {
        self.slots.len() >= max_entries
    }

    /// Count of slots not marked known-deleted.
    pub fn live_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.known_deleted).count()
    }

    /// Slots dirtied since the last full image.
    pub fn dirty_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.dirty).count()
    }

    /// Persistent image of this node.
    pub fn to_image(&self) -> NodeImage {
        NodeImage {
            db_id: self.db_id,
            node_id: self.id,
            kind: self.kind.image_kind(),
            level: self.level,
            owner_key: self.owner_key.clone(),
            identifier_key: self.identifier_key.clone(),
            slots: self
                .slots
                .iter()
                .map(|s| SlotImage {
                    key: s.key.clone(),
                    child_id: s.child_id,
                    lsn: s.lsn,
                    known_deleted: s.known_deleted,
                })
                .collect(),
            dup_count: self.dup_count.map(|d| DupCountRef {
                node_id: d.node_id,
                count: d.count,
                lsn: d.lsn,
            }),
        }
    }

    /// Rebuild a node from a logged image. All children come back
    /// non-resident; the slot LSNs re-materialize them on demand.
    pub fn from_image(image: &NodeImage) -> Self {
        Self {
            id: image.node_id,
            db_id: image.db_id,
            kind: NodeKind::from_image(image.kind),
            level: image.level,
            dirty: false,
            owner_key: image.owner_key.clone(),
            identifier_key: image.identifier_key.clone(),
            slots: image
                .slots
                .iter()
                .map(|s| Slot {
                    key: s.key.clone(),
                    child_id: s.child_id,
                    lsn: s.lsn,
                    child: Child::None,
                    known_deleted: s.known_deleted,
                    dirty: false,
                })
                .collect(),
            dup_count: image.dup_count.map(|d| DupCount {
                node_id: d.node_id,
                count: d.count,
                lsn: d.lsn,
            }),
            last_full_lsn: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// NodeCell and guards
// ------------------------------------------------------------------------------------------------

/// A node paired with its latch, generation counter, eviction pin and
/// parked-cursor count.
///
/// Node latches are **exclusive-only** in practice (every tree descent
/// mutates generations, residency or slots); the shared mode of the
/// underlying [`Latch`] is still exercised by read-only walks (verify,
/// stats).
#[derive(Debug)]
pub struct NodeCell {
    /// Node id, readable without the latch.
    pub id: NodeId,
    latch: Latch,
    node: UnsafeCell<Node>,
    /// LRU proxy: bumped on every latched access.
    generation: AtomicU64,
    /// Eviction prohibited while non-zero.
    pins: AtomicU32,
    /// Cursors parked on this node; compression defers while non-zero.
    cursors: AtomicU32,
    /// Bytes currently charged to the cache budget for this node.
    charged: AtomicU64,
}

// The UnsafeCell is only dereferenced while the latch grants access, which
// is what makes these implementations sound.
unsafe impl Send for NodeCell {}
unsafe impl Sync for NodeCell {}

impl NodeCell {
    /// Wrap a node.
    pub fn new(node: Node) -> Arc<Self> {
        Arc::new(Self {
            id: node.id,
            latch: Latch::new(),
            node: UnsafeCell::new(node),
            generation: AtomicU64::new(0),
            pins: AtomicU32::new(0),
            cursors: AtomicU32::new(0),
            charged: AtomicU64::new(0),
        })
    }

    /// Swap the recorded cache charge, returning the previous value.
    pub fn set_charged(&self, bytes: u64) -> u64 {
        self.charged.swap(bytes, Ordering::SeqCst)
    }

    /// Bytes currently charged to the cache for this node.
    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::SeqCst)
    }

    /// Latch exclusively and bump the generation.
    pub fn write(self: &Arc<Self>, generation: u64) -> NodeWriteGuard {
        self.latch.acquire_exclusive();
        self.generation.store(generation, Ordering::Relaxed);
        NodeWriteGuard {
            cell: Arc::clone(self),
        }
    }

    /// Latch exclusively only if immediately available.
    pub fn try_write(self: &Arc<Self>, generation: u64) -> Option<NodeWriteGuard> {
        if self.latch.try_acquire_exclusive() {
            self.generation.store(generation, Ordering::Relaxed);
            Some(NodeWriteGuard {
                cell: Arc::clone(self),
            })
        } else {
            None
        }
    }

    /// Latch shared (read-only walks; does not bump the generation).
    pub fn read(self: &Arc<Self>) -> NodeReadGuard {
        self.latch.acquire_shared();
        NodeReadGuard {
            cell: Arc::clone(self),
        }
    }

    /// Last access generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Prohibit eviction (transient reference without the latch).
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    /// Release an eviction pin.
    pub fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }

    /// `true` while any worker holds an eviction pin.
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    /// A cursor parked on this node.
    pub fn cursor_arrive(&self) {
        self.cursors.fetch_add(1, Ordering::SeqCst);
    }

    /// A cursor left this node.
    pub fn cursor_depart(&self) {
        self.cursors.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of cursors currently parked here.
    pub fn cursor_count(&self) -> u32 {
        self.cursors.load(Ordering::SeqCst)
    }
}

/// Exclusive guard over a node; owns the `Arc`, so it has no lifetime tie
/// to the arena.
pub struct NodeWriteGuard {
    cell: Arc<NodeCell>,
}

impl NodeWriteGuard {
    /// The underlying cell.
    pub fn cell(&self) -> &Arc<NodeCell> {
        &self.cell
    }
}

impl Deref for NodeWriteGuard {
    type Target = Node;
    fn deref(&self) -> &Node {
        // Latch held exclusively for the guard's lifetime.
        unsafe { &*self.cell.node.get() }
    }
}

impl DerefMut for NodeWriteGuard {
    fn deref_mut(&mut self) -> &mut Node {
        unsafe { &mut *self.cell.node.get() }
    }
}

impl Drop for NodeWriteGuard {
    fn drop(&mut self) {
        self.cell.latch.release_exclusive();
    }
}

/// Shared guard over a node.
pub struct NodeReadGuard {
    cell: Arc<NodeCell>,
}

impl NodeReadGuard {
    /// The underlying cell.
    pub fn cell(&self) -> &Arc<NodeCell> {
        &self.cell
    }
}

impl Deref for NodeReadGuard {
    type Target = Node;
    fn deref(&self) -> &Node {
        unsafe { &*self.cell.node.get() }
    }
}

impl Drop for NodeReadGuard {
    fn drop(&mut self) {
        self.cell.latch.release_shared();
    }
}
