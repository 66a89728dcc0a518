use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::Error;
use crate::lock::{LockMode, LockTable};

const LONG: Duration = Duration::from_secs(10);

#[test]
fn two_transaction_cycle_picks_the_youngest_victim() {
    let table = Arc::new(LockTable::new());
    table.lock(1, 100, LockMode::Write, LONG).unwrap();
    table.lock(2, 200, LockMode::Write, LONG).unwrap();

    // The older locker blocks first: 100 waits for record 2.
    let peer = Arc::clone(&table);
    let older = thread::spawn(move || peer.lock(2, 100, LockMode::Write, LONG));
    thread::sleep(Duration::from_millis(50));

    // Closing the cycle from the younger locker makes it the victim.
    let err = table.lock(1, 200, LockMode::Write, LONG).unwrap_err();
    assert!(matches!(err, Error::Deadlock { locker: 200 }));

    // The victim backs off; the survivor proceeds.
    table.release_all(200);
    older.join().unwrap().unwrap();
    assert!(table.holds(2, 100, true));
}

#[test]
fn victim_retry_succeeds_after_backoff() {
    let table = Arc::new(LockTable::new());
    table.lock(1, 100, LockMode::Write, LONG).unwrap();
    table.lock(2, 200, LockMode::Write, LONG).unwrap();

    let peer = Arc::clone(&table);
    let older = thread::spawn(move || {
        let r = peer.lock(2, 100, LockMode::Write, LONG);
        peer.release_all(100);
        r
    });
    thread::sleep(Duration::from_millis(50));

    let err = table.lock(1, 200, LockMode::Write, LONG).unwrap_err();
    assert!(err.is_retryable());
    table.release_all(200);
    older.join().unwrap().unwrap();

    // Retry of the loser finds both records free.
    table.lock(2, 201, LockMode::Write, LONG).unwrap();
    table.lock(1, 201, LockMode::Write, LONG).unwrap();
}

#[test]
fn competing_upgraders_deadlock_immediately() {
    let table = Arc::new(LockTable::new());
    table.lock(7, 1, LockMode::Read, LONG).unwrap();
    table.lock(7, 2, LockMode::Read, LONG).unwrap();

    // The first upgrader queues and waits for the other share to drop.
    let peer = Arc::clone(&table);
    let first = thread::spawn(move || {
        let r = peer.lock(7, 1, LockMode::Write, LONG);
        peer.release_all(1);
        r
    });
    thread::sleep(Duration::from_millis(50));

    // The second upgrader cannot ever be granted: deadlock, reported
    // without waiting for a timeout.
    let err = table.lock(7, 2, LockMode::Write, LONG).unwrap_err();
    assert!(matches!(err, Error::Deadlock { .. }));

    table.release_all(2);
    first.join().unwrap().unwrap();
}

#[test]
fn deadlock_counters_are_reported() {
    let table = Arc::new(LockTable::new());
    table.lock(7, 1, LockMode::Read, LONG).unwrap();
    table.lock(7, 2, LockMode::Read, LONG).unwrap();
    let peer = Arc::clone(&table);
    let first = thread::spawn(move || {
        let _ = peer.lock(7, 1, LockMode::Write, LONG);
        peer.release_all(1);
    });
    thread::sleep(Duration::from_millis(50));
    let _ = table.lock(7, 2, LockMode::Write, LONG);
    table.release_all(2);
    first.join().unwrap();
    assert!(table.stats().n_deadlocks >= 1);
}
