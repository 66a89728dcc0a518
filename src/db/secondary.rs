//! Secondary databases: derived indexes maintained under the primary's
//! transaction.
//!
//! A secondary database stores `(secondary key → primary key)` pairs with
//! duplicates enabled; the secondary key is produced by the user's
//! key-creator callback from each primary record. Every write to the
//! primary runs the trigger list registered on its
//! [`DatabaseImpl`](super::DatabaseImpl): stale index entries are removed
//! and fresh ones inserted, inside the same transaction.
//!
//! Foreign-key constraints watch deletes on a "foreign" database F: when a
//! key of F is deleted while index entries reference it, the configured
//! action runs — `Abort` fails the delete, `Cascade` deletes the
//! referencing primary records, `Nullify` rewrites them through the user's
//! nullifier callback.

use std::sync::Arc;

use tracing::debug;

use crate::cursor::Cursor;
use crate::db::{Database, DatabaseImpl, Record};
use crate::env::EnvCore;
use crate::error::{Error, OpStatus, Result};
use crate::txn::Txn;

/// Derives the secondary key from a primary `(key, value)`; `None` means
/// the record has no entry in this index.
pub type KeyCreator = Arc<dyn Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Rewrites a primary value so it no longer references the foreign key;
/// `None` means the record cannot be nullified (the delete fails).
pub type Nullifier = Arc<dyn Fn(&[u8], &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// What a delete on the foreign database does to referencing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyAction {
    /// Fail the delete while references exist.
    Abort,
    /// Delete the referencing primary records.
    Cascade,
    /// Rewrite the referencing primary records via the nullifier.
    Nullify,
}

/// Configuration for `Environment::open_secondary_database`.
#[derive(Clone)]
pub struct SecondaryConfig {
    /// Create the secondary when absent.
    pub allow_create: bool,
    /// Derives index keys from primary records.
    pub key_creator: KeyCreator,
    /// Optional foreign-key constraint.
    pub foreign: Option<ForeignConstraint>,
}

/// A foreign-key constraint: index keys of the secondary reference keys of
/// the foreign database.
#[derive(Clone)]
pub struct ForeignConstraint {
    pub(crate) foreign: Arc<DatabaseImpl>,
    pub(crate) action: ForeignKeyAction,
    pub(crate) nullifier: Option<Nullifier>,
}

impl ForeignConstraint {
    /// Constrain against the database behind `foreign`.
    pub fn new(
        foreign: &Database,
        action: ForeignKeyAction,
        nullifier: Option<Nullifier>,
    ) -> Self {
        Self {
            foreign: Arc::clone(&foreign.imp),
            action,
            nullifier,
        }
    }
}

/// Trigger registered on a primary: mirrors its writes into one secondary.
pub struct SecondaryTrigger {
    /// The secondary database.
    pub(crate) secondary: Arc<DatabaseImpl>,
    /// Index-key derivation.
    pub(crate) key_creator: KeyCreator,
}

/// Installed on the foreign database; fired by deletes there.
pub struct ForeignLink {
    /// The secondary holding the references.
    pub(crate) secondary: Arc<DatabaseImpl>,
    /// The primary indexed by that secondary.
    pub(crate) primary: Arc<DatabaseImpl>,
    pub(crate) action: ForeignKeyAction,
    pub(crate) nullifier: Option<Nullifier>,
}

// ------------------------------------------------------------------------------------------------
// Trigger application
// ------------------------------------------------------------------------------------------------

/// Mirror one primary write into every registered secondary.
pub(crate) fn apply_triggers(
    core: &Arc<EnvCore>,
    db: &Arc<DatabaseImpl>,
    txn: Option<&Arc<Txn>>,
    key: &[u8],
    old_value: Option<&[u8]>,
    new_value: Option<&[u8]>,
) -> Result<()> {
    let triggers = db.read_triggers();
    if triggers.is_empty() {
        return Ok(());
    }
    for trigger in triggers {
        let old_sec = old_value.and_then(|v| (trigger.key_creator)(key, v));
        let new_sec = new_value.and_then(|v| (trigger.key_creator)(key, v));
        if old_sec == new_sec {
            continue;
        }
        let mut cursor = Cursor::open(
            Arc::clone(core),
            Arc::clone(&trigger.secondary),
            txn.cloned(),
            false,
        )?;
        if let Some(os) = &old_sec {
            if cursor.search_both(os, key)?.is_some() {
                cursor.delete()?;
            }
        }
        if let Some(ns) = &new_sec {
            match cursor.put_no_dup_data(ns, key)? {
                OpStatus::Success | OpStatus::KeyExist => {}
                other => {
                    return Err(Error::Internal(format!(
                        "secondary insert returned {other:?}"
                    )));
                }
            }
        }
        cursor.close()?;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Foreign-key enforcement
// ------------------------------------------------------------------------------------------------

/// Enforce foreign-key constraints before `key` is deleted from `db`.
pub(crate) fn check_foreign_delete(
    core: &Arc<EnvCore>,
    db: &Arc<DatabaseImpl>,
    txn: Option<&Arc<Txn>>,
    key: &[u8],
) -> Result<()> {
    let links = db.read_foreign_links();
    if links.is_empty() {
        return Ok(());
    }
    for link in links {
        let referencing = collect_referencing(core, &link.secondary, txn, key)?;
        if referencing.is_empty() {
            continue;
        }
        match link.action {
            ForeignKeyAction::Abort => {
                return Err(Error::ForeignConflict(format!(
                    "{} record(s) still reference the deleted key",
                    referencing.len()
                )));
            }
            ForeignKeyAction::Cascade => {
                debug!(count = referencing.len(), "cascading foreign delete");
                for pk in referencing {
                    delete_all_values(core, &link.primary, txn, &pk)?;
                }
            }
            ForeignKeyAction::Nullify => {
                let Some(nullifier) = &link.nullifier else {
                    return Err(Error::InvalidConfig(
                        "NULLIFY foreign action without a nullifier".into(),
                    ));
                };
                for pk in referencing {
                    let mut cursor = Cursor::open(
                        Arc::clone(core),
                        Arc::clone(&link.primary),
                        txn.cloned(),
                        false,
                    )?;
                    if let Some(record) = cursor.search(&pk)? {
                        let Some(updated) = nullifier(&record.key, &record.value) else {
                            return Err(Error::ForeignConflict(
                                "record cannot be nullified".into(),
                            ));
                        };
                        cursor.put(&pk, &updated)?;
                    }
                    cursor.close()?;
                }
            }
        }
    }
    Ok(())
}

/// Primary keys referenced under secondary key `sec_key`.
fn collect_referencing(
    core: &Arc<EnvCore>,
    secondary: &Arc<DatabaseImpl>,
    txn: Option<&Arc<Txn>>,
    sec_key: &[u8],
) -> Result<Vec<Vec<u8>>> {
    let mut cursor = Cursor::open(Arc::clone(core), Arc::clone(secondary), txn.cloned(), true)?;
    let mut out = Vec::new();
    if let Some(first) = cursor.search(sec_key)? {
        out.push(first.value);
        while let Some(next) = cursor.next_dup()? {
            out.push(next.value);
        }
    }
    cursor.close()?;
    Ok(out)
}

/// Delete every value under `key` in `db` (cascade helper).
fn delete_all_values(
    core: &Arc<EnvCore>,
    db: &Arc<DatabaseImpl>,
    txn: Option<&Arc<Txn>>,
    key: &[u8],
) -> Result<()> {
    let mut cursor = Cursor::open(Arc::clone(core), Arc::clone(db), txn.cloned(), false)?;
    if cursor.search(key)?.is_some() {
        loop {
            cursor.delete()?;
            if cursor.next_dup()?.is_none() {
                break;
            }
        }
    }
    cursor.close()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// SecondaryDatabase handle
// ------------------------------------------------------------------------------------------------

/// Handle to a secondary database.
///
/// Reads resolve through the primary: `get(sec_key)` returns the primary
/// record the index entry points at, and a dangling entry surfaces as
/// [`Error::SecondaryCorrupt`].
pub struct SecondaryDatabase {
    /// The secondary as an ordinary database handle.
    pub db: Database,
    pub(crate) primary: Arc<DatabaseImpl>,
}

impl SecondaryDatabase {
    /// Look up by secondary key; returns the primary record.
    pub fn get(
        &self,
        txn: Option<&crate::env::Transaction>,
        sec_key: &[u8],
    ) -> Result<Option<Record>> {
        let Some(index_entry) = self.db.get(txn, sec_key, false)? else {
            return Ok(None);
        };
        let primary_key = index_entry.value;
        let mut cursor = Cursor::open(
            Arc::clone(&self.db.core),
            Arc::clone(&self.primary),
            txn.map(|t| Arc::clone(&t.inner)),
            true,
        )?;
        let found = cursor.search(&primary_key)?;
        cursor.close()?;
        match found {
            Some(record) => Ok(Some(record)),
            None => Err(Error::SecondaryCorrupt(format!(
                "index entry for key {:?} references missing primary {:?}",
                sec_key, primary_key
            ))),
        }
    }

    /// Delete the primary records referenced under `sec_key` (the index
    /// entries follow through the primary's triggers).
    pub fn delete(
        &self,
        txn: Option<&crate::env::Transaction>,
        sec_key: &[u8],
    ) -> Result<OpStatus> {
        let txn_inner = txn.map(|t| Arc::clone(&t.inner));
        let referencing =
            collect_referencing(&self.db.core, &self.db.imp, txn_inner.as_ref(), sec_key)?;
        if referencing.is_empty() {
            return Ok(OpStatus::NotFound);
        }
        for pk in referencing {
            delete_all_values(&self.db.core, &self.primary, txn_inner.as_ref(), &pk)?;
        }
        Ok(OpStatus::Success)
    }

    /// Open a cursor over the raw index entries.
    pub fn open_cursor(&self, txn: Option<&crate::env::Transaction>) -> Result<Cursor> {
        self.db.open_cursor(txn)
    }
}
