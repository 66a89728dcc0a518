//! In-memory utilization tracking and the durable per-file profile.
//!
//! Every append and every made-obsolete event lands in a per-file **delta**
//! here; the cleaner periodically folds deltas into the **baseline** and
//! writes one [`FileSummaryLn`](crate::log::LogEntryType::FileSummaryLn)
//! record per touched file, so utilization estimates survive restart.
//! Recovery seeds the baseline from the newest summary record per file and
//! replays the post-checkpoint tail into the delta.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::log::entry::{FileSummary, LogEntryType};

/// Tracks per-file utilization counters for the cleaner.
#[derive(Debug, Default)]
pub struct UtilizationTracker {
    /// Durable counters as of the last profile fold.
    baseline: Mutex<HashMap<u64, FileSummary>>,
    /// Counters accumulated since the last fold.
    deltas: Mutex<HashMap<u64, FileSummary>>,
    /// Bytes appended since the cleaner last ran; drives its wakeups.
    bytes_since_clean: AtomicU64,
}

impl UtilizationTracker {
    /// Fresh tracker with no history.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record one appended record.
    pub fn note_append(&self, file: u64, ty: LogEntryType, size: u64) {
        let mut deltas = Self::lock(&self.deltas);
        let s = deltas.entry(file).or_default();
        s.total_count = s.total_count.saturating_add(1);
        s.total_size = s.total_size.saturating_add(size as u32);
        if ty.is_node_image() || ty == LogEntryType::BinDelta {
            s.in_count = s.in_count.saturating_add(1);
            s.in_size = s.in_size.saturating_add(size as u32);
        } else if ty.is_ln() {
            s.ln_count = s.ln_count.saturating_add(1);
            s.ln_size = s.ln_size.saturating_add(size as u32);
        }
        drop(deltas);
        self.bytes_since_clean.fetch_add(size, Ordering::Relaxed);
    }

    /// Record that the leaf record at `file` is now superseded.
    pub fn note_obsolete_ln(&self, file: u64) {
        let mut deltas = Self::lock(&self.deltas);
        let s = deltas.entry(file).or_default();
        s.obsolete_ln_count = s.obsolete_ln_count.saturating_add(1);
    }

    /// Seed the baseline for one file (recovery, profile load).
    pub fn load_baseline(&self, file: u64, summary: FileSummary) {
        Self::lock(&self.baseline).insert(file, summary);
    }

    /// Swap the delta map out for folding; the caller persists the merged
    /// summaries and hands them back through [`UtilizationTracker::install`].
    pub fn take_deltas(&self) -> HashMap<u64, FileSummary> {
        std::mem::take(&mut *Self::lock(&self.deltas))
    }

    /// Install a folded summary as the new baseline for `file`.
    pub fn install(&self, file: u64, summary: FileSummary) {
        Self::lock(&self.baseline).insert(file, summary);
    }

    /// Merged view (baseline + pending delta) per file.
    pub fn snapshot(&self) -> HashMap<u64, FileSummary> {
        let mut out = Self::lock(&self.baseline).clone();
        for (file, delta) in Self::lock(&self.deltas).iter() {
            out.entry(*file).or_default().add(delta);
        }
        out
    }

    /// Merged view for a single file.
    pub fn summary_for(&self, file: u64) -> FileSummary {
        let mut s = Self::lock(&self.baseline)
            .get(&file)
            .copied()
            .unwrap_or_default();
        if let Some(d) = Self::lock(&self.deltas).get(&file) {
            s.add(d);
        }
        s
    }

    /// Forget a reclaimed file entirely.
    pub fn drop_file(&self, file: u64) {
        Self::lock(&self.baseline).remove(&file);
        Self::lock(&self.deltas).remove(&file);
    }

    /// Bytes appended since the last cleaner pass.
    pub fn bytes_since_clean(&self) -> u64 {
        self.bytes_since_clean.load(Ordering::Relaxed)
    }

    /// Reset the pacing counter after a cleaner pass.
    pub fn reset_bytes_since_clean(&self) {
        self.bytes_since_clean.store(0, Ordering::Relaxed);
    }
}
