//! # ArborDB
//!
//! An embeddable, transactional key-value storage engine built on a
//! **log-structured B-tree**. All durable state lives in a single
//! append-only log; the B-tree is an in-memory structure rebuilt from the
//! log at open and kept bounded by background eviction.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Environment                            │
//! │   ┌───────────┐   ┌────────────┐   ┌───────────────────────┐  │
//! │   │ Databases │──▶│  B-trees   │──▶│  Append-only log      │  │
//! │   │ (handles) │   │ (in cache) │   │  (segment files)      │  │
//! │   └─────┬─────┘   └─────┬──────┘   └──────────┬────────────┘  │
//! │         │ cursors       │ latches             │ LSNs          │
//! │   ┌─────▼─────┐   ┌─────▼──────┐   ┌──────────▼────────────┐  │
//! │   │ Lock table│   │  Evictor   │   │ Cleaner + Checkpointer│  │
//! │   │ (records) │   │ Compressor │   │ (space reclamation)   │  │
//! │   └───────────┘   └────────────┘   └───────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`env`] | Environment lifecycle, configuration, daemons, stats, verify |
//! | [`db`] | Database handles, secondary indexes, joins |
//! | [`cursor`] | Positional cursors with dup-and-swap navigation |
//! | [`tree`] | B-tree nodes, arena, search/insert/split, duplicate subtrees |
//! | [`txn`] | Transactions, undo records, durability policies |
//! | [`lock`] | Record locks, timeouts, deadlock detection |
//! | [`log`] | Append-only log: framing, segments, iteration |
//! | [`latch`] | Shared/exclusive latches with owner tracking |
//! | [`evictor`] | Cache budget and cold-node eviction |
//! | [`compressor`] | Physical removal of deleted slots |
//! | [`cleaner`] | Utilization tracking and log-file reclamation |
//! | [`checkpoint`] | Dirty-tree flushes bounding recovery |
//! | [`recovery`] | Log replay at environment open |
//! | [`encoding`] | Byte-stable wire encoding for everything persisted |
//!
//! ## Key properties
//!
//! - **Single durable medium** — every node image, record version and
//!   transaction marker is one checksummed record in the log; there is no
//!   separate heap or page file to keep consistent.
//! - **ACID transactions** — record-level two-phase locking with deadlock
//!   detection, undo-linked rollback, and configurable commit durability.
//! - **Ordered access** — cursors iterate keys (and duplicate values) in
//!   comparator order, with range searches and equality joins.
//! - **Online reclamation** — the cleaner migrates live records out of
//!   under-utilized segments and deletes them after a checkpoint, so disk
//!   use tracks live data.
//! - **Bounded memory** — the evictor keeps the resident tree within a
//!   configured cache budget, stripping leaf values before whole nodes.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use arbordb::{Database, DatabaseConfig, Environment, EnvironmentConfig};
//!
//! let env = Environment::open("/tmp/arbor".as_ref(), EnvironmentConfig {
//!     transactional: true,
//!     ..EnvironmentConfig::default()
//! })?;
//!
//! let db: Database = env.open_database(None, "people", &DatabaseConfig {
//!     allow_create: true,
//!     ..DatabaseConfig::default()
//! })?;
//!
//! let txn = env.begin_transaction(None, Default::default())?;
//! db.put(Some(&txn), b"ada", b"lovelace")?;
//! txn.commit()?;
//!
//! assert_eq!(
//!     db.get(None, b"ada", false)?.map(|r| r.value),
//!     Some(b"lovelace".to_vec())
//! );
//!
//! let mut cursor = db.open_cursor(None)?;
//! while let Some(record) = cursor.next()? {
//!     println!("{:?} = {:?}", record.key, record.value);
//! }
//! cursor.close()?;
//! env.close()?;
//! # Ok::<(), arbordb::Error>(())
//! ```

pub mod checkpoint;
pub mod cleaner;
pub mod compressor;
pub mod cursor;
pub mod db;
pub mod encoding;
pub mod env;
pub mod error;
pub mod evictor;
pub mod latch;
pub mod lock;
pub mod log;
pub mod recovery;
pub mod tree;
pub mod txn;

pub use checkpoint::CheckpointConfig;
pub use cleaner::{CleanStrategy, CleanerConfig};
pub use cursor::Cursor;
pub use db::secondary::{
    ForeignConstraint, ForeignKeyAction, KeyCreator, Nullifier, SecondaryConfig,
    SecondaryDatabase,
};
pub use db::{Database, DatabaseConfig, DatabaseStats, JoinCursor, Record};
pub use env::{
    Environment, EnvironmentConfig, EnvironmentStats, Transaction, TransactionConfig,
    VerifyReport,
};
pub use error::{Error, OpStatus, Result};
pub use lock::LockMode;
pub use log::{LogConfig, Lsn};
pub use tree::{Comparator, default_comparator};
pub use txn::Durability;
