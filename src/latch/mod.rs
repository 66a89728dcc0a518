//! Short-term shared/exclusive latches for tree nodes and engine state.
//!
//! A latch is **not** a record lock: it protects the in-memory image of a
//! node (or a small shared structure) for the duration of one traversal
//! step, never across a blocking lock request. The tree's latch-coupling
//! discipline — hold the parent until the child is latched — is built on
//! these primitives.
//!
//! ## Semantics
//!
//! - **Shared** grants coexist; an **exclusive** grant excludes everything.
//! - Writer preference: a shared request blocks while a writer is waiting,
//!   so a stream of readers cannot starve a split.
//! - **Same-owner nesting**: a thread holding the exclusive latch may
//!   re-acquire it; releases are counted.
//! - **Upgrade fails fast**: [`Latch::upgrade`] succeeds only when the
//!   caller is the sole shared holder, and otherwise returns
//!   [`LatchError::UpgradeConflict`] immediately instead of blocking. The
//!   tree relies on that to restart a descent rather than deadlock.
//! - Owner tracking (thread ids) is kept unconditionally; it is what makes
//!   nesting, upgrade and misuse detection possible, and it feeds
//!   [`Latch::holders`] for stats and debugging.
//!
//! Poisoning: a latch's internal mutex being poisoned means a thread
//! panicked while only *inspecting* latch state (the guarded data lives
//! elsewhere), so the state itself is still consistent — acquisition
//! recovers the guard instead of propagating the poison.

#[cfg(test)]
mod tests;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use thiserror::Error;

/// Latch misuse errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LatchError {
    /// Upgrade requested while other holders share the latch.
    #[error("latch upgrade conflict: other holders present")]
    UpgradeConflict,

    /// Release or upgrade by a thread that does not hold the latch.
    #[error("latch released by non-owner thread")]
    NotOwner,
}

#[derive(Debug, Default)]
struct LatchState {
    /// Exclusive owner, if any.
    exclusive: Option<ThreadId>,

    /// Nesting depth of the exclusive owner.
    exclusive_depth: u32,

    /// Thread ids of current shared holders.
    shared: Vec<ThreadId>,

    /// Writers blocked in `acquire_exclusive`; readers defer to them.
    waiting_writers: u32,
}

/// A shared/exclusive latch with owner tracking.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

fn recover<'a, T>(r: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    r.unwrap_or_else(PoisonError::into_inner)
}

impl Latch {
    /// Create an unheld latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a shared grant is available, then take it.
    pub fn acquire_shared(&self) {
        let me = thread::current().id();
        let mut st = recover(self.state.lock());
        loop {
            if st.exclusive.is_none() && st.waiting_writers == 0 {
                st.shared.push(me);
                return;
            }
            st = recover(self.cond.wait(st));
        }
    }

    /// Block until the exclusive grant is available, then take it.
    ///
    /// Re-entrant for the current exclusive owner.
    pub fn acquire_exclusive(&self) {
        let me = thread::current().id();
        let mut st = recover(self.state.lock());
        if st.exclusive == Some(me) {
            st.exclusive_depth += 1;
            return;
        }
        st.waiting_writers += 1;
        loop {
            if st.exclusive.is_none() && st.shared.is_empty() {
                st.waiting_writers -= 1;
                st.exclusive = Some(me);
                st.exclusive_depth = 1;
                return;
            }
            st = recover(self.cond.wait(st));
        }
    }

    /// Take the exclusive grant only if it is immediately available.
    pub fn try_acquire_exclusive(&self) -> bool {
        let me = thread::current().id();
        let mut st = recover(self.state.lock());
        if st.exclusive == Some(me) {
            st.exclusive_depth += 1;
            return true;
        }
        if st.exclusive.is_none() && st.shared.is_empty() {
            st.exclusive = Some(me);
            st.exclusive_depth = 1;
            return true;
        }
        false
    }

    /// Upgrade the caller's shared grant to exclusive.
    ///
    /// Fails fast with [`LatchError::UpgradeConflict`] when any other
    /// holder shares the latch; blocking here would deadlock against a
    /// symmetric upgrader.
    pub fn upgrade(&self) -> Result<(), LatchError> {
        let me = thread::current().id();
        let mut st = recover(self.state.lock());
        let Some(pos) = st.shared.iter().position(|t| *t == me) else {
            return Err(LatchError::NotOwner);
        };
        if st.shared.len() != 1 || st.exclusive.is_some() {
            return Err(LatchError::UpgradeConflict);
        }
        st.shared.remove(pos);
        st.exclusive = Some(me);
        st.exclusive_depth = 1;
        Ok(())
    }

    /// Release one shared grant held by the calling thread.
    pub fn release_shared(&self) {
        let me = thread::current().id();
        let mut st = recover(self.state.lock());
        if let Some(pos) = st.shared.iter().position(|t| *t == me) {
            st.shared.remove(pos);
            if st.shared.is_empty() {
                self.cond.notify_all();
            }
        } else {
            debug_assert!(false, "release_shared by non-owner");
        }
    }

    /// Release one level of the calling thread's exclusive grant.
    pub fn release_exclusive(&self) {
        let me = thread::current().id();
        let mut st = recover(self.state.lock());
        if st.exclusive != Some(me) {
            debug_assert!(false, "release_exclusive by non-owner");
            return;
        }
        st.exclusive_depth -= 1;
        if st.exclusive_depth == 0 {
            st.exclusive = None;
            self.cond.notify_all();
        }
    }

    /// `true` when the calling thread holds the exclusive grant.
    pub fn is_exclusive_owner(&self) -> bool {
        let st = recover(self.state.lock());
        st.exclusive == Some(thread::current().id())
    }

    /// `(shared holder count, exclusively held)` — stats and debugging.
    pub fn holders(&self) -> (usize, bool) {
        let st = recover(self.state.lock());
        (st.shared.len(), st.exclusive.is_some())
    }
}
