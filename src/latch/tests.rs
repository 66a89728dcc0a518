use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::latch::{Latch, LatchError};

#[test]
fn shared_grants_coexist() {
    let latch = Latch::new();
    latch.acquire_shared();
    latch.acquire_shared();
    assert_eq!(latch.holders(), (2, false));
    latch.release_shared();
    latch.release_shared();
    assert_eq!(latch.holders(), (0, false));
}

#[test]
fn exclusive_excludes_everything() {
    let latch = Arc::new(Latch::new());
    latch.acquire_exclusive();
    let peer = Arc::clone(&latch);
    let grabbed = thread::spawn(move || peer.try_acquire_exclusive())
        .join()
        .unwrap();
    assert!(!grabbed);
    assert_eq!(latch.holders(), (0, true));
    latch.release_exclusive();
}

#[test]
fn exclusive_nests_for_the_owner() {
    let latch = Latch::new();
    latch.acquire_exclusive();
    latch.acquire_exclusive();
    assert!(latch.is_exclusive_owner());
    latch.release_exclusive();
    assert!(latch.is_exclusive_owner());
    latch.release_exclusive();
    assert!(!latch.is_exclusive_owner());
}

#[test]
fn try_exclusive_fails_under_shared() {
    let latch = Arc::new(Latch::new());
    latch.acquire_shared();
    let peer = Arc::clone(&latch);
    let grabbed = thread::spawn(move || peer.try_acquire_exclusive())
        .join()
        .unwrap();
    assert!(!grabbed);
    latch.release_shared();
}

#[test]
fn upgrade_succeeds_as_sole_holder() {
    let latch = Latch::new();
    latch.acquire_shared();
    latch.upgrade().unwrap();
    assert!(latch.is_exclusive_owner());
    latch.release_exclusive();
}

#[test]
fn upgrade_fails_fast_with_other_holders() {
    let latch = Arc::new(Latch::new());
    latch.acquire_shared();
    let peer = Arc::clone(&latch);
    let handle = thread::spawn(move || {
        peer.acquire_shared();
        thread::sleep(Duration::from_millis(100));
        peer.release_shared();
    });
    // Give the peer time to take its shared grant.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(latch.upgrade(), Err(LatchError::UpgradeConflict));
    latch.release_shared();
    handle.join().unwrap();
}

#[test]
fn upgrade_by_non_holder_is_rejected() {
    let latch = Latch::new();
    assert_eq!(latch.upgrade(), Err(LatchError::NotOwner));
}

#[test]
fn writer_blocks_until_readers_leave() {
    let latch = Arc::new(Latch::new());
    latch.acquire_shared();
    let peer = Arc::clone(&latch);
    let writer = thread::spawn(move || {
        peer.acquire_exclusive();
        peer.release_exclusive();
    });
    thread::sleep(Duration::from_millis(50));
    assert!(!writer.is_finished());
    latch.release_shared();
    writer.join().unwrap();
}
