//! Per-level merge statistics.
//!
//! Levels: 0 is the in-memory component, 1 the small on-disk run, 2 the
//! large one. The merge threads are the only writers of the in-progress
//! counters; the engine reads snapshots to size bloom filters, compute the
//! effective ratio, and decide whether a merge should cascade.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::tuple::Tuple;

/// Byte budget between rate-limiter charges inside the streaming merger.
pub const FORCE_INTERVAL: u64 = 1 << 20;

#[derive(Debug)]
pub struct MergeStats {
    merge_level: usize,
    active: AtomicBool,
    merge_count: AtomicU64,
    bytes_in_small: AtomicU64,
    tuples_in_small: AtomicU64,
    bytes_in_large: AtomicU64,
    tuples_in_large: AtomicU64,
    bytes_out: AtomicU64,
    tuples_out: AtomicU64,
    tuples_merged: AtomicU64,
    target_size: AtomicU64,
    base_size: AtomicU64,
    current_size: AtomicU64,
}

/// Point-in-time copy of one level's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStatsSnapshot {
    pub merge_level: usize,
    pub active: bool,
    pub merge_count: u64,
    pub bytes_in_small: u64,
    pub tuples_in_small: u64,
    pub bytes_in_large: u64,
    pub tuples_in_large: u64,
    pub bytes_out: u64,
    pub tuples_out: u64,
    pub tuples_merged: u64,
    pub target_size: u64,
    pub base_size: u64,
    pub current_size: u64,
}

impl MergeStats {
    fn new(merge_level: usize) -> Self {
        Self {
            merge_level,
            active: AtomicBool::new(false),
            merge_count: AtomicU64::new(0),
            bytes_in_small: AtomicU64::new(0),
            tuples_in_small: AtomicU64::new(0),
            bytes_in_large: AtomicU64::new(0),
            tuples_in_large: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            tuples_out: AtomicU64::new(0),
            tuples_merged: AtomicU64::new(0),
            target_size: AtomicU64::new(0),
            base_size: AtomicU64::new(0),
            current_size: AtomicU64::new(0),
        }
    }

    /// Clears the in-progress counters for a fresh merge. Durable fields
    /// (`merge_count`, `base_size`, `target_size`) survive.
    pub fn new_merge(&self) {
        self.bytes_in_small.store(0, Ordering::Relaxed);
        self.tuples_in_small.store(0, Ordering::Relaxed);
        self.bytes_in_large.store(0, Ordering::Relaxed);
        self.tuples_in_large.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
        self.tuples_out.store(0, Ordering::Relaxed);
        self.tuples_merged.store(0, Ordering::Relaxed);
    }

    pub fn starting_merge(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn read_tuple_from_small(&self, t: &Tuple) {
        self.bytes_in_small
            .fetch_add(t.byte_length(), Ordering::Relaxed);
        self.tuples_in_small.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_tuple_from_large(&self, t: &Tuple) {
        self.bytes_in_large
            .fetch_add(t.byte_length(), Ordering::Relaxed);
        self.tuples_in_large.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wrote_tuple(&self, t: &Tuple) {
        self.bytes_out.fetch_add(t.byte_length(), Ordering::Relaxed);
        self.tuples_out.fetch_add(1, Ordering::Relaxed);
        self.current_size
            .fetch_add(t.byte_length(), Ordering::Relaxed);
    }

    /// Two versions of one stripped key collapsed into `_merged`.
    pub fn merged_tuples(&self, _merged: &Tuple, _small: &Tuple, _large: &Tuple) {
        self.tuples_merged.fetch_add(1, Ordering::Relaxed);
    }

    /// The merge output became durable and was installed as a live
    /// component; its size is the next merge's base.
    pub fn handed_off_tree(&self) {
        self.base_size
            .store(self.bytes_out.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn finished_merge(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.merge_count.fetch_add(1, Ordering::Relaxed);
        self.current_size.store(0, Ordering::Relaxed);
    }

    pub fn set_target_size(&self, target: u64) {
        self.target_size.store(target, Ordering::Relaxed);
    }

    pub fn set_current_size(&self, size: u64) {
        self.current_size.store(size, Ordering::Relaxed);
    }

    pub fn target_size(&self) -> u64 {
        self.target_size.load(Ordering::Relaxed)
    }

    pub fn base_size(&self) -> u64 {
        self.base_size.load(Ordering::Relaxed)
    }

    pub fn bytes_in_small(&self) -> u64 {
        self.bytes_in_small.load(Ordering::Relaxed)
    }

    pub fn output_size(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn merge_count(&self) -> u64 {
        self.merge_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MergeStatsSnapshot {
        MergeStatsSnapshot {
            merge_level: self.merge_level,
            active: self.active.load(Ordering::Relaxed),
            merge_count: self.merge_count.load(Ordering::Relaxed),
            bytes_in_small: self.bytes_in_small.load(Ordering::Relaxed),
            tuples_in_small: self.tuples_in_small.load(Ordering::Relaxed),
            bytes_in_large: self.bytes_in_large.load(Ordering::Relaxed),
            tuples_in_large: self.tuples_in_large.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            tuples_out: self.tuples_out.load(Ordering::Relaxed),
            tuples_merged: self.tuples_merged.load(Ordering::Relaxed),
            target_size: self.target_size.load(Ordering::Relaxed),
            base_size: self.base_size.load(Ordering::Relaxed),
            current_size: self.current_size.load(Ordering::Relaxed),
        }
    }

    fn restore(&self, merge_count: u64, base_size: u64) {
        self.merge_count.store(merge_count, Ordering::Relaxed);
        self.base_size.store(base_size, Ordering::Relaxed);
    }
}

/// Owner of the three per-level stats records.
#[derive(Debug)]
pub struct MergeManager {
    levels: [Arc<MergeStats>; 3],
}

impl MergeManager {
    pub fn new() -> Self {
        Self {
            levels: [
                Arc::new(MergeStats::new(0)),
                Arc::new(MergeStats::new(1)),
                Arc::new(MergeStats::new(2)),
            ],
        }
    }

    pub fn get_merge_stats(&self, level: usize) -> &Arc<MergeStats> {
        &self.levels[level]
    }

    pub fn new_merge(&self, level: usize) {
        self.levels[level].new_merge();
    }

    pub fn read_tuple_from_small_component(&self, level: usize, t: &Tuple) {
        self.levels[level].read_tuple_from_small(t);
    }

    pub fn read_tuple_from_large_component(&self, level: usize, t: &Tuple) {
        self.levels[level].read_tuple_from_large(t);
    }

    pub fn wrote_tuple(&self, level: usize, t: &Tuple) {
        self.levels[level].wrote_tuple(t);
    }

    pub fn finished_merge(&self, level: usize) {
        self.levels[level].finished_merge();
    }

    /// Durable slice carried through the persistent header.
    pub fn durable_state(&self) -> [(u64, u64); 3] {
        [0usize, 1, 2].map(|i| {
            let s = &self.levels[i];
            (s.merge_count(), s.base_size())
        })
    }

    pub fn restore_durable_state(&self, state: [(u64, u64); 3]) {
        for (level, (merge_count, base_size)) in state.into_iter().enumerate() {
            self.levels[level].restore(merge_count, base_size);
        }
    }
}

impl Default for MergeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn tuple(key: &'static [u8], value: &'static [u8]) -> Tuple {
        Tuple::put(Bytes::from_static(key), Bytes::from_static(value), 1)
    }

    #[test]
    fn counters_accumulate_and_reset() {
        let mgr = MergeManager::new();
        let t = tuple(b"k", b"v");

        mgr.new_merge(1);
        mgr.get_merge_stats(1).starting_merge();
        mgr.read_tuple_from_small_component(1, &t);
        mgr.read_tuple_from_large_component(1, &t);
        mgr.wrote_tuple(1, &t);

        let snap = mgr.get_merge_stats(1).snapshot();
        assert!(snap.active);
        assert_eq!(snap.tuples_in_small, 1);
        assert_eq!(snap.tuples_in_large, 1);
        assert_eq!(snap.bytes_out, t.byte_length());

        mgr.finished_merge(1);
        let snap = mgr.get_merge_stats(1).snapshot();
        assert!(!snap.active);
        assert_eq!(snap.merge_count, 1);

        mgr.new_merge(1);
        let snap = mgr.get_merge_stats(1).snapshot();
        assert_eq!(snap.bytes_out, 0);
        assert_eq!(snap.merge_count, 1, "merge_count survives new_merge");
    }

    #[test]
    fn handed_off_tree_sets_base_size() {
        let mgr = MergeManager::new();
        let t = tuple(b"key", b"value");
        mgr.new_merge(2);
        mgr.wrote_tuple(2, &t);
        mgr.get_merge_stats(2).handed_off_tree();
        assert_eq!(mgr.get_merge_stats(2).base_size(), t.byte_length());
    }

    #[test]
    fn durable_state_roundtrip() {
        let a = MergeManager::new();
        a.new_merge(1);
        a.wrote_tuple(1, &tuple(b"k", b"v"));
        a.get_merge_stats(1).handed_off_tree();
        a.finished_merge(1);

        let b = MergeManager::new();
        b.restore_durable_state(a.durable_state());
        assert_eq!(b.get_merge_stats(1).merge_count(), 1);
        assert_eq!(
            b.get_merge_stats(1).base_size(),
            a.get_merge_stats(1).base_size()
        );
    }
}
