//! Crate-level error and result-code types.
//!
//! Expected outcomes of data operations (`NotFound`, `KeyExist`, `KeyEmpty`)
//! are **result codes**, not errors — they travel in [`OpStatus`]. Everything
//! that can actually fail surfaces as [`Error`].
//!
//! ## Propagation policy
//!
//! - Structural failures (log corruption, I/O on the log) are fatal: the
//!   environment is marked invalid and every further call fails with
//!   [`Error::RunRecovery`] until the environment is reopened.
//! - Lock-related failures ([`Error::Deadlock`], [`Error::LockTimeout`]) are
//!   local; the caller may retry the enclosing transaction.
//! - Background threads never propagate errors across their thread boundary:
//!   non-fatal errors are logged and the loop continues, fatal ones
//!   invalidate the environment.

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::latch::LatchError;
use crate::log::LogError;

/// Result code of a data operation.
///
/// Returned alongside `Ok` from put/get/delete/cursor calls; none of these
/// represent a failure of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation did what was asked.
    Success,

    /// No matching record exists.
    NotFound,

    /// An overwrite-forbidding put found the key (or key/data pair) present.
    KeyExist,

    /// The record at the cursor position was deleted out from under it.
    KeyEmpty,
}

impl OpStatus {
    /// `true` for [`OpStatus::Success`].
    pub fn is_success(self) -> bool {
        matches!(self, OpStatus::Success)
    }
}

/// All failure modes of the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Underlying file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log record failed its checksum, was truncated, or had a bad header.
    #[error("log corruption: {0}")]
    Corruption(String),

    /// Wire encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Latch misuse (upgrade conflict, release by non-owner).
    #[error("latch error: {0}")]
    Latch(#[from] LatchError),

    /// This locker was chosen as the deadlock victim; retry the transaction.
    #[error("deadlock: locker {locker} selected as victim")]
    Deadlock {
        /// The victim locker id.
        locker: u64,
    },

    /// A lock request exceeded its configured wait.
    #[error("lock timeout after {millis} ms waiting for record {record}")]
    LockTimeout {
        /// Lock-table key (node id) that was being waited on.
        record: u64,
        /// Configured wait in milliseconds.
        millis: u64,
    },

    /// A secondary index entry points at a missing primary record.
    #[error("secondary index corrupt: {0}")]
    SecondaryCorrupt(String),

    /// Database open without `allow_create`, or operation on a removed name.
    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    /// Database create with `exclusive_create` found the name present.
    #[error("database already exists: {0}")]
    DatabaseExists(String),

    /// Mutually exclusive or out-of-range configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Write attempted against a read-only environment or database handle.
    #[error("write attempted on a read-only environment or database")]
    ReadOnly,

    /// A fatal inconsistency was observed; reopen the environment.
    #[error("environment invalid, reopen required: {0}")]
    RunRecovery(String),

    /// The environment directory is exclusively locked by another process.
    #[error("environment directory is locked by another process")]
    EnvironmentLocked,

    /// A blocking wait was cancelled.
    #[error("operation interrupted")]
    Interrupted,

    /// A foreign-key constraint rejected a delete on the foreign database.
    #[error("foreign key constraint: {0}")]
    ForeignConflict(String),

    /// API misuse (operation on an unpositioned cursor, finished
    /// transaction, closed handle).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LogError> for Error {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Io(io) => Error::Io(io),
            LogError::Encoding(enc) => Error::Encoding(enc),
            LogError::Locked => Error::EnvironmentLocked,
            other => Error::Corruption(other.to_string()),
        }
    }
}

impl Error {
    /// `true` when retrying the whole transaction is a sensible response.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Deadlock { .. } | Error::LockTimeout { .. })
    }

    /// `true` for failures that must invalidate the environment.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Corruption(_) | Error::RunRecovery(_)
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
