use std::time::Duration;

use crate::error::Error;
use crate::lock::LockMode;
use crate::log::LogEntryType;
use crate::txn::tests::helpers::{harness, record_types};

#[test]
fn begin_logs_a_marker_and_registers() {
    let h = harness();
    let txn = h.begin();
    assert_eq!(h.txns.active_count(), 1);
    assert_eq!(h.txns.first_active_lsn(), Some(txn.begin_lsn));
    let types = record_types(&h.log);
    assert_eq!(types, vec![LogEntryType::TxnBegin]);
}

#[test]
fn commit_logs_a_marker_and_releases_locks() {
    let h = harness();
    let txn = h.begin();
    h.locks
        .lock(42, txn.id, LockMode::Write, Duration::from_millis(100))
        .unwrap();

    h.txns.commit(&txn, &h.log, &h.locks, None).unwrap();

    assert!(!h.locks.holds(42, txn.id, true));
    assert_eq!(h.txns.active_count(), 0);
    assert!(h.txns.first_active_lsn().is_none());
    let types = record_types(&h.log);
    assert_eq!(types, vec![LogEntryType::TxnBegin, LogEntryType::TxnCommit]);
    assert_eq!(h.txns.stats().n_committed, 1);
}

#[test]
fn abort_logs_a_marker_and_releases_locks() {
    let h = harness();
    let txn = h.begin();
    h.locks
        .lock(42, txn.id, LockMode::Write, Duration::from_millis(100))
        .unwrap();

    h.txns.abort(&txn, &h.log, &h.locks, &h.registry).unwrap();

    assert!(!h.locks.holds(42, txn.id, true));
    assert_eq!(h.txns.active_count(), 0);
    let types = record_types(&h.log);
    assert_eq!(types, vec![LogEntryType::TxnBegin, LogEntryType::TxnAbort]);
    assert_eq!(h.txns.stats().n_aborted, 1);
}

#[test]
fn finishing_twice_is_rejected() {
    let h = harness();
    let txn = h.begin();
    h.txns.commit(&txn, &h.log, &h.locks, None).unwrap();
    let err = h.txns.commit(&txn, &h.log, &h.locks, None).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    let err = h.txns.abort(&txn, &h.log, &h.locks, &h.registry).unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[test]
fn first_active_lsn_tracks_the_oldest_transaction() {
    let h = harness();
    let older = h.begin();
    let younger = h.begin();
    assert!(older.begin_lsn < younger.begin_lsn);
    assert_eq!(h.txns.first_active_lsn(), Some(older.begin_lsn));

    h.txns.commit(&older, &h.log, &h.locks, None).unwrap();
    assert_eq!(h.txns.first_active_lsn(), Some(younger.begin_lsn));

    h.txns.commit(&younger, &h.log, &h.locks, None).unwrap();
    assert!(h.txns.first_active_lsn().is_none());
}

#[test]
fn an_expired_transaction_deadline_fails_the_next_lock_wait() {
    let h = harness();
    let txn = h.begin();
    txn.lock_state().txn_timeout = Some(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(20));
    let err = txn.remaining_lock_timeout().unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
}
