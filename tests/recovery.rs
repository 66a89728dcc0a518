//! Crash and reopen scenarios.
//!
//! "Crash" here means `close_no_checkpoint`: daemons stop and the log
//! buffer is flushed, but no checkpoint, no clean shutdown markers, and —
//! for in-flight transactions — no abort records. Recovery has to rebuild
//! everything from raw log records.

use tempfile::TempDir;

use arbordb::{
    DatabaseConfig, Environment, EnvironmentConfig, LogConfig, TransactionConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn txn_env(dir: &TempDir) -> Environment {
    init_tracing();
    Environment::open(
        dir.path(),
        EnvironmentConfig {
            transactional: true,
            ..EnvironmentConfig::default()
        },
    )
    .unwrap()
}

fn create_config() -> DatabaseConfig {
    DatabaseConfig {
        allow_create: true,
        ..DatabaseConfig::default()
    }
}

/// # Scenario
/// Committed writes survive a crash (commit durability, spec property 7).
#[test]
fn committed_writes_survive_crash() {
    let dir = TempDir::new().unwrap();
    let env = txn_env(&dir);
    let db = env.open_database(None, "d", &create_config()).unwrap();
    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&txn), b"k", b"a").unwrap();
    txn.commit().unwrap();
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = txn_env(&dir);
    let db = env
        .open_database(None, "d", &DatabaseConfig::default())
        .unwrap();
    assert_eq!(db.get(None, b"k", false).unwrap().unwrap().value, b"a");
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// A crash between a transaction's last write and its abort rolls the
/// transaction back (spec scenario S3, crash half).
#[test]
fn in_flight_transaction_rolls_back_on_recovery() {
    let dir = TempDir::new().unwrap();
    let env = txn_env(&dir);
    let db = env.open_database(None, "d", &create_config()).unwrap();

    let t1 = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&t1), b"k", b"a").unwrap();
    t1.commit().unwrap();

    let t2 = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&t2), b"k", b"b").unwrap();
    // Crash with t2 unresolved: forget the handle so no abort is logged.
    std::mem::forget(t2);
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = txn_env(&dir);
    let db = env
        .open_database(None, "d", &DatabaseConfig::default())
        .unwrap();
    assert_eq!(db.get(None, b"k", false).unwrap().unwrap().value, b"a");
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// An uncommitted insert disappears at recovery.
#[test]
fn in_flight_insert_vanishes_on_recovery() {
    let dir = TempDir::new().unwrap();
    let env = txn_env(&dir);
    let db = env.open_database(None, "d", &create_config()).unwrap();
    let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
    db.put(Some(&txn), b"ghost", b"boo").unwrap();
    std::mem::forget(txn);
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = txn_env(&dir);
    let db = env
        .open_database(None, "d", &DatabaseConfig::default())
        .unwrap();
    assert!(db.get(None, b"ghost", false).unwrap().is_none());
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// A crash with no checkpoint at all replays every record, including the
/// structural groups written by splits.
#[test]
fn redo_rebuilds_a_split_tree_without_checkpoints() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            node_max_entries: 8,
            ..EnvironmentConfig::default()
        },
    )
    .unwrap();
    let db = env.open_database(None, "many", &create_config()).unwrap();
    for n in 0..500u32 {
        db.put(None, format!("k{n:05}").as_bytes(), format!("v{n}").as_bytes())
            .unwrap();
    }
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env
        .open_database(None, "many", &DatabaseConfig::default())
        .unwrap();
    for n in (0..500u32).step_by(41) {
        let got = db
            .get(None, format!("k{n:05}").as_bytes(), false)
            .unwrap()
            .unwrap();
        assert_eq!(got.value, format!("v{n}").into_bytes());
    }
    let mut cursor = db.open_cursor(None).unwrap();
    let mut count = 0;
    let mut item = cursor.first().unwrap();
    while let Some(_) = item {
        count += 1;
        item = cursor.next().unwrap();
    }
    assert_eq!(count, 500);
    cursor.close().unwrap();
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// Duplicate sets and their counts survive a crash.
#[test]
fn duplicates_survive_crash() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env
        .open_database(
            None,
            "dups",
            &DatabaseConfig {
                allow_create: true,
                sorted_duplicates: true,
                ..DatabaseConfig::default()
            },
        )
        .unwrap();
    for value in [&b"v1"[..], b"v2", b"v3"] {
        db.put(None, b"k", value).unwrap();
    }
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env
        .open_database(
            None,
            "dups",
            &DatabaseConfig {
                sorted_duplicates: true,
                ..DatabaseConfig::default()
            },
        )
        .unwrap();
    let mut cursor = db.open_cursor(None).unwrap();
    let first = cursor.search(b"k").unwrap().unwrap();
    assert_eq!(first.value, b"v1".to_vec());
    assert_eq!(cursor.next_dup().unwrap().unwrap().value, b"v2".to_vec());
    assert_eq!(cursor.next_dup().unwrap().unwrap().value, b"v3".to_vec());
    cursor.close().unwrap();
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// Deletions survive a crash: recovery must not resurrect them.
#[test]
fn deletes_survive_crash() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env.open_database(None, "del", &create_config()).unwrap();
    db.put(None, b"keep", b"1").unwrap();
    db.put(None, b"drop", b"2").unwrap();
    db.delete(None, b"drop").unwrap();
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env
        .open_database(None, "del", &DatabaseConfig::default())
        .unwrap();
    assert!(db.get(None, b"keep", false).unwrap().is_some());
    assert!(db.get(None, b"drop", false).unwrap().is_none());
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// Truncate is a generation switch: after a crash, pre-truncate records
/// must not come back.
#[test]
fn truncate_survives_crash() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env.open_database(None, "t", &create_config()).unwrap();
    for n in 0..50u32 {
        db.put(None, format!("old-{n}").as_bytes(), b"x").unwrap();
    }
    db.truncate(false).unwrap();
    db.put(None, b"new", b"y").unwrap();
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env
        .open_database(None, "t", &DatabaseConfig::default())
        .unwrap();
    assert!(db.get(None, b"old-0", false).unwrap().is_none());
    assert_eq!(db.get(None, b"new", false).unwrap().unwrap().value, b"y");
    let mut cursor = db.open_cursor(None).unwrap();
    let only = cursor.first().unwrap().unwrap();
    assert_eq!(only.key, b"new".to_vec());
    assert!(cursor.next().unwrap().is_none());
    cursor.close().unwrap();
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// Recovery is idempotent: opening twice in a row yields the same
/// contents (spec property 10).
#[test]
fn recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env.open_database(None, "idem", &create_config()).unwrap();
    for n in 0..100u32 {
        db.put(None, format!("k{n:03}").as_bytes(), format!("v{n}").as_bytes())
            .unwrap();
    }
    db.delete(None, b"k050").unwrap();
    drop(db);
    env.close_no_checkpoint().unwrap();

    let collect = || -> Vec<(Vec<u8>, Vec<u8>)> {
        let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
        let db = env
            .open_database(None, "idem", &DatabaseConfig::default())
            .unwrap();
        let mut cursor = db.open_cursor(None).unwrap();
        let mut out = Vec::new();
        let mut item = cursor.first().unwrap();
        while let Some(record) = item {
            out.push((record.key, record.value));
            item = cursor.next().unwrap();
        }
        cursor.close().unwrap();
        drop(db);
        env.close_no_checkpoint().unwrap();
        out
    };
    let first = collect();
    let second = collect();
    assert_eq!(first.len(), 99);
    assert_eq!(first, second);
}

/// # Scenario
/// A checkpoint bounds redo but changes nothing observable.
#[test]
fn checkpointed_and_post_checkpoint_writes_coexist() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(
        dir.path(),
        EnvironmentConfig {
            log: LogConfig {
                file_max: 32 * 1024,
                ..LogConfig::default()
            },
            ..EnvironmentConfig::default()
        },
    )
    .unwrap();
    let db = env.open_database(None, "ckpt", &create_config()).unwrap();
    for n in 0..100u32 {
        db.put(None, format!("pre-{n:03}").as_bytes(), b"1").unwrap();
    }
    env.checkpoint(&arbordb::CheckpointConfig {
        force: true,
        full: false,
        invoker: "api".into(),
    })
    .unwrap();
    for n in 0..100u32 {
        db.put(None, format!("post-{n:03}").as_bytes(), b"2").unwrap();
    }
    drop(db);
    env.close_no_checkpoint().unwrap();

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let db = env
        .open_database(None, "ckpt", &DatabaseConfig::default())
        .unwrap();
    for n in (0..100u32).step_by(13) {
        assert!(db.get(None, format!("pre-{n:03}").as_bytes(), false).unwrap().is_some());
        assert!(db.get(None, format!("post-{n:03}").as_bytes(), false).unwrap().is_some());
    }
    drop(db);
    env.close().unwrap();
}

/// # Scenario
/// The environment directory is exclusive per process.
#[test]
fn second_open_of_a_locked_directory_fails() {
    let dir = TempDir::new().unwrap();
    init_tracing();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let err = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap_err();
    assert!(matches!(err, arbordb::Error::EnvironmentLocked));
    env.close().unwrap();
}
