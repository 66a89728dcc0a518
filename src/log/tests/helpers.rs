use std::path::Path;
use std::sync::Arc;

use crate::cleaner::profile::UtilizationTracker;
use crate::log::{FileManager, LnEntry, LogConfig, LogEntry, LogManager};

/// Open a writable log over `dir` with the given segment size.
pub fn open_log(dir: &Path, file_max: u64) -> LogManager {
    let files = FileManager::open(dir, false, true).unwrap();
    LogManager::open(
        files,
        LogConfig {
            file_max,
            ..LogConfig::default()
        },
        Arc::new(UtilizationTracker::new()),
        false,
    )
    .unwrap()
}

/// A leaf record with recognizable contents.
pub fn ln(n: u64) -> LogEntry {
    LogEntry::Ln(LnEntry {
        db_id: 2,
        node_id: 100 + n,
        key: format!("key-{n:04}").into_bytes(),
        value: format!("value-{n:04}").into_bytes(),
        deleted: false,
        abort_lsn: None,
        abort_known_deleted: false,
    })
}
