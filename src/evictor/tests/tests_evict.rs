use crate::evictor::tests::helpers::{evictor, harness, put, resident_values};
use crate::evictor::{CacheBudget, InList};
use crate::log::LogEntry;
use crate::tree::node::{Child, NodeKind, SlotSearch};

fn key(n: u32) -> Vec<u8> {
    format!("k{n:03}").into_bytes()
}

#[test]
fn cache_budget_charges_and_refunds() {
    let budget = CacheBudget::new(100);
    assert_eq!(budget.max(), 100);
    budget.add(60);
    assert_eq!(budget.usage(), 60);
    budget.sub(20);
    assert_eq!(budget.usage(), 40);
    // Refunding more than is charged clamps at zero.
    budget.sub(1000);
    assert_eq!(budget.usage(), 0);
}

#[test]
fn inlist_scan_is_round_robin() {
    let list = InList::new();
    for n in 0..4 {
        list.add(1, n);
    }
    let first = list.scan_batch(0.5);
    let second = list.scan_batch(0.5);
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    let mut all: Vec<u64> = first.iter().chain(&second).map(|(_, n)| *n).collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3]);

    list.remove(1, 2);
    assert_eq!(list.len(), 3);
}

#[test]
fn no_eviction_below_the_floor() {
    let h = harness(16, 64 * 1024 * 1024);
    for n in 0..10 {
        put(&h.tree, &key(n), b"small");
    }
    let ev = evictor(&h, 80);
    assert_eq!(ev.run_once().unwrap(), 0);
    assert_eq!(ev.stats().n_passes, 0);
}

#[test]
fn leaf_values_are_stripped_before_nodes_go() {
    // A single-BIN tree over a budget far below its resident size: the
    // value bytes go, the node (the root) stays.
    let h = harness(64, 1024);
    for n in 0..20 {
        put(&h.tree, &key(n), &[0xAB; 200]);
    }
    let root_id = h.tree.root_id().unwrap();
    assert_eq!(resident_values(&h.tree, root_id), 20);

    let ev = evictor(&h, 80);
    let freed = ev.run_once().unwrap();
    assert!(freed > 0);
    assert!(ev.stats().n_bins_stripped >= 1);
    assert_eq!(resident_values(&h.tree, root_id), 0);
    // The slots kept their LSNs; values re-fetch on demand.
    let (mut bin, pos) = h.tree.search_position(&key(3)).unwrap().unwrap();
    let SlotSearch::Exact(idx) = pos else {
        panic!("key lost by stripping");
    };
    assert!(bin.slots[idx].lsn.is_some());
    assert_eq!(h.tree.fetch_ln(&mut bin, idx).unwrap(), vec![0xAB; 200]);
}

#[test]
fn a_pinned_node_is_not_touched() {
    let h = harness(64, 1024);
    for n in 0..20 {
        put(&h.tree, &key(n), &[0xAB; 200]);
    }
    let root_id = h.tree.root_id().unwrap();
    let cell = h.tree.get(root_id).unwrap();

    cell.pin();
    let ev = evictor(&h, 80);
    ev.run_once().unwrap();
    assert_eq!(resident_values(&h.tree, root_id), 20);

    cell.unpin();
    ev.run_once().unwrap();
    assert_eq!(resident_values(&h.tree, root_id), 0);
}

#[test]
fn a_parked_cursor_blocks_eviction_of_its_node() {
    let h = harness(64, 1024);
    for n in 0..20 {
        put(&h.tree, &key(n), &[0xAB; 200]);
    }
    let root_id = h.tree.root_id().unwrap();
    let cell = h.tree.get(root_id).unwrap();

    cell.cursor_arrive();
    let ev = evictor(&h, 80);
    ev.run_once().unwrap();
    assert_eq!(resident_values(&h.tree, root_id), 20);

    cell.cursor_depart();
    ev.run_once().unwrap();
    assert_eq!(resident_values(&h.tree, root_id), 0);
}

#[test]
fn whole_nodes_are_evicted_leaves_up_and_logged() {
    // Tiny values make stripping worthless, so the pass must evict whole
    // BINs: each dirty BIN is logged non-provisionally, the parent slot
    // keeps the LSN, and only the root stays resident.
    let h = harness(4, 1);
    for n in 0..12 {
        put(&h.tree, &key(n), b"");
    }
    let root_id = h.tree.root_id().unwrap();
    assert!(h.tree.resident_count() > 1);
    let log_end_before = h.tree.ctx.log.end_of_log();

    let ev = evictor(&h, 0);
    ev.run_once().unwrap();

    assert!(ev.stats().n_nodes_evicted >= 1);
    assert_eq!(h.tree.resident_count(), 1, "only the root may remain");
    assert!(h.tree.get(root_id).is_some());
    {
        let root = h.tree.get(root_id).unwrap();
        let guard = root.read();
        assert_eq!(guard.kind, NodeKind::In);
        for slot in &guard.slots {
            assert!(matches!(slot.child, Child::None));
            assert!(slot.lsn.is_some(), "evicted child lost its LSN");
        }
    }

    // The eviction pass logged the dirty BINs as non-provisional images.
    let evicted_images = h
        .tree
        .ctx
        .log
        .iter_from(Some(log_end_before))
        .unwrap()
        .filter(|item| {
            let Ok((_, header, payload)) = item.as_ref() else {
                return false;
            };
            if header.provisional || !header.ty.is_node_image() {
                return false;
            }
            matches!(
                LogEntry::decode_payload(header.ty, payload),
                Ok(LogEntry::Node(image)) if image.node_id != root_id
            )
        })
        .count();
    assert!(evicted_images >= 1);

    // Evicted subtrees re-materialize through the parent slots.
    for n in (0..12).step_by(5) {
        let (guard, pos) = h.tree.search_position(&key(n)).unwrap().unwrap();
        assert!(pos.is_exact(), "key {n} lost by eviction");
        drop(guard);
    }
}

#[test]
fn the_root_is_never_evicted() {
    let h = harness(64, 1);
    for n in 0..5 {
        put(&h.tree, &key(n), b"");
    }
    let root_id = h.tree.root_id().unwrap();
    let ev = evictor(&h, 0);
    ev.run_once().unwrap();
    assert!(h.tree.get(root_id).is_some());
    assert_eq!(h.tree.resident_count(), 1);
}

#[test]
fn eviction_keeps_the_cache_accounting_consistent() {
    let h = harness(4, 1);
    for n in 0..12 {
        put(&h.tree, &key(n), &[0xCD; 64]);
    }
    let ev = evictor(&h, 0);
    ev.run_once().unwrap();

    // Whatever remains resident is exactly what the budget reports.
    let mut charged = 0u64;
    for cell in h.tree.resident_cells() {
        charged += cell.charged();
    }
    assert_eq!(charged, h.cache.usage());
}
