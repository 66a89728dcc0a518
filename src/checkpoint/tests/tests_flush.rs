use crate::checkpoint::tests::helpers::{harness, put, records, records_after};
use crate::checkpoint::{CheckpointConfig, run_checkpoint};
use crate::log::{LogEntry, LogEntryType, Lsn};

fn cfg(force: bool, full: bool) -> CheckpointConfig {
    CheckpointConfig {
        force,
        full,
        invoker: "test".to_string(),
    }
}

fn key(n: u32) -> Vec<u8> {
    format!("{n:04}").into_bytes()
}

/// Where the newest checkpoint-start record sits.
fn last_start(recs: &[(Lsn, crate::log::RecordHeader, LogEntry)]) -> Lsn {
    recs.iter()
        .rev()
        .find(|(_, h, _)| h.ty == LogEntryType::CheckpointStart)
        .map(|(l, _, _)| *l)
        .unwrap()
}

#[test]
fn checkpoint_writes_start_root_and_end() {
    let h = harness(128);
    for n in 0..10 {
        put(&h.db.tree, &key(n), b"v");
    }
    let end_lsn = run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    let recs = records(&h.core.ctx.log);
    let starts: Vec<Lsn> = recs
        .iter()
        .filter(|(_, h, _)| h.ty == LogEntryType::CheckpointStart)
        .map(|(l, _, _)| *l)
        .collect();
    assert_eq!(starts.len(), 1);

    let (lsn, _, entry) = recs.last().unwrap();
    assert_eq!(*lsn, end_lsn);
    let LogEntry::CheckpointEnd(end) = entry else {
        panic!("last record is not a checkpoint end");
    };
    assert_eq!(end.start_lsn, starts[0]);
    assert_eq!(end.invoker, "test");
    assert!(end.last_node_id > 1);
    assert!(end.first_active_lsn.is_none());

    // One root record for the registered database, pointing at its root.
    let root = recs
        .iter()
        .find_map(|(_, _, e)| match e {
            LogEntry::Root(r) if r.db_id == h.db.id => Some(*r),
            _ => None,
        })
        .unwrap();
    assert_eq!(Some(root.node_id), h.db.tree.root_id());
    assert_eq!(root.lsn, h.db.tree.root_lsn());
}

#[test]
fn images_flush_leaves_up_and_only_the_root_is_non_provisional() {
    let h = harness(4);
    for n in 0..20 {
        put(&h.db.tree, &key(n), b"v");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    let recs = records(&h.core.ctx.log);
    let start = last_start(&recs);
    let root_id = h.db.tree.root_id().unwrap();

    let mut seen_root_image = false;
    for (_, header, entry) in records_after(&h.core.ctx.log, start) {
        let LogEntry::Node(image) = entry else { continue };
        if image.node_id == root_id {
            assert!(!header.provisional, "root image must anchor the group");
            seen_root_image = true;
        } else {
            assert!(header.provisional, "non-root image {} not provisional", image.node_id);
            // Leaves-up: nothing below the root comes after it.
            assert!(!seen_root_image, "image {} logged after the root", image.node_id);
        }
    }
    assert!(seen_root_image);
}

#[test]
fn small_dirty_fraction_writes_a_bin_delta() {
    let h = harness(128);
    for n in 0..40 {
        put(&h.db.tree, &key(n), b"first");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();
    let full_image_lsn = h.db.tree.root_lsn().unwrap();

    // One slot out of forty dirtied: well under the delta threshold.
    put(&h.db.tree, &key(7), b"second");
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    let recs = records(&h.core.ctx.log);
    let start = last_start(&recs);
    let tail = records_after(&h.core.ctx.log, start);
    let deltas: Vec<_> = tail
        .iter()
        .filter_map(|(_, _, e)| match e {
            LogEntry::BinDelta(d) => Some(d.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].slots.len(), 1);
    assert_eq!(deltas[0].slots[0].key, key(7));
    assert_eq!(deltas[0].last_full_lsn, full_image_lsn);
    assert!(
        !tail.iter().any(|(_, h, _)| h.ty == LogEntryType::Bin),
        "a delta-eligible checkpoint must not rewrite the full image"
    );
}

#[test]
fn full_checkpoint_forbids_deltas() {
    let h = harness(128);
    for n in 0..40 {
        put(&h.db.tree, &key(n), b"first");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();
    put(&h.db.tree, &key(7), b"second");
    run_checkpoint(&h.core, &cfg(true, true)).unwrap();

    let recs = records(&h.core.ctx.log);
    let start = last_start(&recs);
    let tail = records_after(&h.core.ctx.log, start);
    assert!(!tail.iter().any(|(_, h, _)| h.ty == LogEntryType::BinDelta));
    assert!(tail.iter().any(|(_, h, _)| h.ty == LogEntryType::Bin));
}

#[test]
fn wide_dirty_fraction_writes_a_full_image() {
    let h = harness(128);
    for n in 0..40 {
        put(&h.db.tree, &key(n), b"first");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    // 15 of 40 slots dirty: 15 × 4 ≥ 40, past the delta threshold.
    for n in 0..15 {
        put(&h.db.tree, &key(n), b"second");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    let recs = records(&h.core.ctx.log);
    let start = last_start(&recs);
    let tail = records_after(&h.core.ctx.log, start);
    assert!(!tail.iter().any(|(_, h, _)| h.ty == LogEntryType::BinDelta));
    assert!(tail.iter().any(|(_, h, _)| h.ty == LogEntryType::Bin));
}

#[test]
fn clean_tree_skips_without_force() {
    let h = harness(128);
    for n in 0..10 {
        put(&h.db.tree, &key(n), b"v");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    let before = records(&h.core.ctx.log).len();
    let returned = run_checkpoint(&h.core, &cfg(false, false)).unwrap();
    assert_eq!(records(&h.core.ctx.log).len(), before);
    assert_eq!(returned, h.core.ctx.log.end_of_log());
}

#[test]
fn a_delta_materializes_back_into_the_updated_node() {
    // The slot LSN the checkpoint leaves behind may point at a delta;
    // re-materializing through it must reproduce the overwrite.
    let h = harness(128);
    for n in 0..40 {
        put(&h.db.tree, &key(n), b"first");
    }
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();
    put(&h.db.tree, &key(7), b"second");
    run_checkpoint(&h.core, &cfg(true, false)).unwrap();

    let root_lsn = h.db.tree.root_lsn().unwrap();
    let root_id = h.db.tree.root_id();
    h.db.tree.clear();
    h.db.tree.set_root(root_id, Some(root_lsn));

    let (mut bin, pos) = h.db.tree.search_position(&key(7)).unwrap().unwrap();
    let crate::tree::node::SlotSearch::Exact(idx) = pos else {
        panic!("key lost across materialization");
    };
    let value = h.db.tree.fetch_ln(&mut bin, idx).unwrap();
    assert_eq!(value, b"second".to_vec());
}
