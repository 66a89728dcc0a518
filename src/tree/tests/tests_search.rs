use crate::tree::node::SlotSearch;
use crate::tree::tests::helpers::{collect_keys, harness, put};

#[test]
fn empty_tree_has_no_positions() {
    let h = harness(16);
    assert!(h.tree.search_position(b"anything").unwrap().is_none());
    assert!(h.tree.first_position().unwrap().is_none());
    assert!(h.tree.last_position().unwrap().is_none());
}

#[test]
fn inserts_come_back_in_key_order() {
    let h = harness(16);
    for key in [&b"b"[..], b"a", b"c", b"aa"] {
        put(&h.tree, key, key);
    }
    let keys = collect_keys(&h.tree);
    assert_eq!(
        keys,
        vec![b"a".to_vec(), b"aa".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[test]
fn exact_search_distinguishes_hit_and_insertion_point() {
    let h = harness(16);
    put(&h.tree, b"m", b"1");
    put(&h.tree, b"t", b"2");

    let (guard, pos) = h.tree.search_position(b"m").unwrap().unwrap();
    assert!(matches!(pos, SlotSearch::Exact(0)));
    drop(guard);

    let (guard, pos) = h.tree.search_position(b"p").unwrap().unwrap();
    assert!(matches!(pos, SlotSearch::Insert(1)));
    drop(guard);
}

#[test]
fn next_position_lands_on_the_successor() {
    let h = harness(16);
    for key in [&b"a"[..], b"b", b"c"] {
        put(&h.tree, key, key);
    }
    // Absent anchor between a and b.
    let (guard, idx) = h.tree.next_position(b"ab", true).unwrap().unwrap();
    assert_eq!(guard.slots[idx].key, b"b".to_vec());
    drop(guard);
    // Inclusive search on an existing key stays there.
    let (guard, idx) = h.tree.next_position(b"b", true).unwrap().unwrap();
    assert_eq!(guard.slots[idx].key, b"b".to_vec());
    drop(guard);
    // Exclusive moves past it.
    let (guard, idx) = h.tree.next_position(b"b", false).unwrap().unwrap();
    assert_eq!(guard.slots[idx].key, b"c".to_vec());
    drop(guard);
    // Nothing after the last key.
    assert!(h.tree.next_position(b"c", false).unwrap().is_none());
}

#[test]
fn prev_position_lands_on_the_predecessor() {
    let h = harness(16);
    for key in [&b"a"[..], b"b", b"c"] {
        put(&h.tree, key, key);
    }
    let (guard, idx) = h.tree.prev_position(b"bz", true).unwrap().unwrap();
    assert_eq!(guard.slots[idx].key, b"b".to_vec());
    drop(guard);
    // Nothing before the first key.
    assert!(h.tree.prev_position(b"a", false).unwrap().is_none());
}

#[test]
fn fetch_ln_rematerializes_a_stripped_value() {
    let h = harness(16);
    put(&h.tree, b"k", b"hello");
    // Strip the resident value, keeping the LSN.
    let (mut bin, pos) = h.tree.search_position(b"k").unwrap().unwrap();
    let crate::tree::node::SlotSearch::Exact(idx) = pos else {
        panic!("expected exact hit");
    };
    bin.slots[idx].child = crate::tree::node::Child::None;
    let value = h.tree.fetch_ln(&mut bin, idx).unwrap();
    assert_eq!(value, b"hello".to_vec());
}
