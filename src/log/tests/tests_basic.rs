use tempfile::TempDir;

use crate::log::tests::helpers::{ln, open_log};
use crate::log::{LogEntry, LogEntryType, Lsn, NULL_PREV};

#[test]
fn append_then_read_round_trips() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);

    let entry = ln(1);
    let lsn = log.append(&entry, false, 9).unwrap();
    assert_eq!(lsn, Lsn::new(0, 0));

    let (header, decoded) = log.read_entry(lsn).unwrap();
    assert_eq!(header.ty, LogEntryType::Ln);
    assert_eq!(header.txn_id, 9);
    assert!(!header.provisional);
    assert_eq!(decoded, entry);
}

#[test]
fn reads_are_served_from_the_write_buffer() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);

    // No flush or sync: the record exists only in the buffer.
    let lsn = log.append(&ln(7), false, 0).unwrap();
    let (_, decoded) = log.read_entry(lsn).unwrap();
    assert_eq!(decoded, ln(7));
}

#[test]
fn entry_ids_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);
    let a = log.append(&ln(1), false, 0).unwrap();
    let b = log.append(&ln(2), false, 0).unwrap();
    let (ha, _) = log.read(a).unwrap();
    let (hb, _) = log.read(b).unwrap();
    assert!(hb.entry_id > ha.entry_id);
}

#[test]
fn previous_offset_chains_within_a_file() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);
    let a = log.append(&ln(1), false, 0).unwrap();
    let b = log.append(&ln(2), false, 0).unwrap();
    let c = log.append(&ln(3), false, 0).unwrap();

    let (hc, _) = log.read(c).unwrap();
    assert_eq!(hc.prev_offset, b.offset);
    let (hb, _) = log.read(b).unwrap();
    assert_eq!(hb.prev_offset, a.offset);
    let (ha, _) = log.read(a).unwrap();
    assert_eq!(ha.prev_offset, NULL_PREV);
}

#[test]
fn provisional_flag_survives_framing() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);
    let lsn = log.append(&ln(1), true, 0).unwrap();
    let (header, _) = log.read(lsn).unwrap();
    assert!(header.provisional);
    assert_eq!(header.ty, LogEntryType::Ln);
}

#[test]
fn forward_iteration_yields_appended_order() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);
    let mut expect = Vec::new();
    for n in 0..20 {
        log.append(&ln(n), false, 0).unwrap();
        expect.push(ln(n));
    }
    let seen: Vec<LogEntry> = log
        .iter_from(None)
        .unwrap()
        .map(|item| {
            let (_, header, payload) = item.unwrap();
            LogEntry::decode_payload(header.ty, &payload).unwrap()
        })
        .collect();
    assert_eq!(seen, expect);
}

#[test]
fn iteration_is_restartable_from_an_lsn() {
    let dir = TempDir::new().unwrap();
    let log = open_log(dir.path(), 10 * 1024 * 1024);
    let mut lsns = Vec::new();
    for n in 0..10 {
        lsns.push(log.append(&ln(n), false, 0).unwrap());
    }
    let seen: Vec<Lsn> = log
        .iter_from(Some(lsns[4]))
        .unwrap()
        .map(|item| item.unwrap().0)
        .collect();
    assert_eq!(seen, lsns[4..].to_vec());
}

#[test]
fn reopen_continues_at_end_of_log() {
    let dir = TempDir::new().unwrap();
    let first;
    {
        let log = open_log(dir.path(), 10 * 1024 * 1024);
        first = log.append(&ln(1), false, 0).unwrap();
        log.sync().unwrap();
    }
    let log = open_log(dir.path(), 10 * 1024 * 1024);
    let second = log.append(&ln(2), false, 0).unwrap();
    assert_eq!(second.file, first.file);
    assert!(second.offset > first.offset);
    // Both records are intact.
    assert_eq!(log.read_entry(first).unwrap().1, ln(1));
    assert_eq!(log.read_entry(second).unwrap().1, ln(2));
}
