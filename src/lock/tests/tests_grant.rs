use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Error;
use crate::lock::{LockMode, LockTable};

const T: Duration = Duration::from_millis(100);

#[test]
fn readers_share_a_record() {
    let table = LockTable::new();
    table.lock(10, 1, LockMode::Read, T).unwrap();
    table.lock(10, 2, LockMode::Read, T).unwrap();
    let stats = table.stats();
    assert_eq!(stats.n_owned, 2);
    assert_eq!(stats.n_waits, 0);
}

#[test]
fn writer_excludes_readers() {
    let table = LockTable::new();
    table.lock(10, 1, LockMode::Write, T).unwrap();
    let err = table.lock(10, 2, LockMode::Read, T).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { record: 10, .. }));
}

#[test]
fn release_unblocks_the_waiter() {
    let table = Arc::new(LockTable::new());
    table.lock(10, 1, LockMode::Write, T).unwrap();
    let peer = Arc::clone(&table);
    let waiter = thread::spawn(move || {
        peer.lock(10, 2, LockMode::Write, Duration::from_secs(5))
    });
    thread::sleep(Duration::from_millis(30));
    table.release(10, 1);
    waiter.join().unwrap().unwrap();
    assert!(table.holds(10, 2, true));
}

#[test]
fn waiting_writer_blocks_new_readers() {
    // FIFO fairness: a reader arriving behind a queued writer waits.
    let table = Arc::new(LockTable::new());
    table.lock(10, 1, LockMode::Read, T).unwrap();
    let peer = Arc::clone(&table);
    let writer = thread::spawn(move || {
        peer.lock(10, 2, LockMode::Write, Duration::from_secs(5))
    });
    thread::sleep(Duration::from_millis(30));
    let err = table.lock(10, 3, LockMode::Read, T).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    table.release(10, 1);
    writer.join().unwrap().unwrap();
}

#[test]
fn re_request_of_a_held_lock_is_granted() {
    let table = LockTable::new();
    table.lock(10, 1, LockMode::Write, T).unwrap();
    table.lock(10, 1, LockMode::Read, T).unwrap();
    table.lock(10, 1, LockMode::Write, T).unwrap();
    assert!(table.holds(10, 1, true));
}

#[test]
fn sole_reader_upgrades_in_place() {
    let table = LockTable::new();
    table.lock(10, 1, LockMode::Read, T).unwrap();
    table.lock(10, 1, LockMode::Write, T).unwrap();
    assert!(table.holds(10, 1, true));
}

#[test]
fn release_all_frees_every_record() {
    let table = LockTable::new();
    table.lock(1, 7, LockMode::Write, T).unwrap();
    table.lock(2, 7, LockMode::Write, T).unwrap();
    table.lock(3, 7, LockMode::Read, T).unwrap();
    table.release_all(7);
    assert_eq!(table.stats().n_owned, 0);
    table.lock(1, 8, LockMode::Write, T).unwrap();
}

#[test]
fn transfer_moves_ownership() {
    let table = LockTable::new();
    table.lock(42, 1, LockMode::Read, T).unwrap();
    table.transfer(42, 1, 2);
    assert!(!table.holds(42, 1, false));
    assert!(table.holds(42, 2, false));
}

#[test]
fn locked_by_other_sees_any_owner() {
    let table = LockTable::new();
    assert!(!table.locked_by_other(5, 0));
    table.lock(5, 3, LockMode::Read, T).unwrap();
    assert!(table.locked_by_other(5, 0));
    assert!(!table.locked_by_other(5, 3));
}

#[test]
fn range_modes_conflict_like_writes() {
    let table = LockTable::new();
    table.lock(9, 1, LockMode::RangeWrite, T).unwrap();
    let err = table.lock(9, 2, LockMode::RangeRead, T).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
}
