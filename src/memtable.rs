//! In-memory component (C0).
//!
//! An ordered map from stripped key to the newest tuple for that key. The
//! skiplist is safe to read without coordination; all mutation funnels
//! through the engine's `rb_mut` so that replace/remove pairs observe a
//! consistent entry.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::tuple::{Tuple, TupleSource};

#[derive(Debug)]
pub(crate) struct MemTable {
    map: SkipMap<Bytes, Tuple>,
    approximate_bytes: AtomicU64,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            approximate_bytes: AtomicU64::new(0),
        }
    }

    pub fn approximate_bytes(&self) -> u64 {
        self.approximate_bytes.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Inserts `t`, displacing any previous version of the stripped key.
    /// Returns the displaced tuple. Caller holds `rb_mut`.
    pub fn replace(&self, t: Tuple) -> Option<Tuple> {
        let key = t.stripped_key_bytes();
        let displaced = self.map.get(key.as_ref()).map(|e| e.value().clone());
        if let Some(old) = &displaced {
            self.approximate_bytes
                .fetch_sub(old.byte_length(), Ordering::Relaxed);
        }
        self.approximate_bytes
            .fetch_add(t.byte_length(), Ordering::Relaxed);
        self.map.insert(key, t);
        displaced
    }

    /// Merge garbage collection: removes the live entry for `t`'s stripped
    /// key only when it is payload-identical, so an update that raced with
    /// the merge is never lost. Caller holds `rb_mut`.
    pub fn remove_if_identical(&self, t: &Tuple) -> bool {
        match self.map.get(t.stripped_key()) {
            Some(entry) if entry.value().same_payload(t) => {
                let removed = entry.value().byte_length();
                entry.remove();
                self.approximate_bytes
                    .fetch_sub(removed, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Inserts `t` unless the live entry for its key is newer. Used when a
    /// failed merge hands its consumed tuples back. Caller holds `rb_mut`.
    pub fn insert_if_newer(&self, t: Tuple) -> bool {
        match self.map.get(t.stripped_key()) {
            Some(entry) if entry.value().timestamp() >= t.timestamp() => false,
            _ => {
                self.replace(t);
                true
            }
        }
    }

    pub fn get(&self, stripped_key: &[u8]) -> Option<Tuple> {
        self.map.get(stripped_key).map(|e| e.value().clone())
    }

    /// Copies up to `limit` tuples starting at `start`, ascending.
    pub fn batch_from(&self, start: Bound<&[u8]>, limit: usize) -> Vec<Tuple> {
        self.map
            .range::<[u8], _>((start, Bound::<&[u8]>::Unbounded))
            .take(limit)
            .map(|e| e.value().clone())
            .collect()
    }
}

/// Batched iterator over a memtable. Copies small batches so writers (and
/// the merge garbage collector) proceed between refills; each refill
/// repositions strictly after the last key handed out, so entries removed
/// or updated behind the cursor are never revisited.
pub(crate) struct BatchedRevalidatingIterator {
    table: Arc<MemTable>,
    batch: std::collections::VecDeque<Tuple>,
    /// Next refill starts here.
    position: Option<Bytes>,
    /// First refill is inclusive of `position`; later ones are exclusive.
    primed: bool,
    batch_size: usize,
    exhausted: bool,
}

impl BatchedRevalidatingIterator {
    pub fn new(table: Arc<MemTable>, batch_size: usize, start_key: Option<Bytes>) -> Self {
        Self {
            table,
            batch: std::collections::VecDeque::new(),
            position: start_key,
            primed: false,
            batch_size,
            exhausted: false,
        }
    }

    fn refill(&mut self) {
        let start = match (&self.position, self.primed) {
            (None, _) => Bound::Unbounded,
            (Some(key), false) => Bound::Included(key.as_ref()),
            (Some(key), true) => Bound::Excluded(key.as_ref()),
        };
        let tuples = self.table.batch_from(start, self.batch_size);
        self.primed = true;
        if tuples.is_empty() {
            self.exhausted = true;
            return;
        }
        self.position = tuples.last().map(|t| t.stripped_key_bytes());
        self.batch = tuples.into();
    }
}

impl TupleSource for BatchedRevalidatingIterator {
    fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        if self.batch.is_empty() {
            if self.exhausted {
                return Ok(None);
            }
            self.refill();
        }
        Ok(self.batch.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &str, ts: u64) -> Tuple {
        Tuple::put(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            ts,
        )
    }

    #[test]
    fn replace_displaces_and_tracks_bytes() {
        let table = MemTable::new();
        assert!(table.replace(put("a", "one", 1)).is_none());
        let displaced = table.replace(put("a", "two", 2)).unwrap();
        assert_eq!(displaced.value().unwrap().as_ref(), b"one");
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.approximate_bytes(),
            put("a", "two", 2).byte_length()
        );
    }

    #[test]
    fn remove_if_identical_spares_racing_update() {
        let table = MemTable::new();
        table.replace(put("k", "old", 1));
        let merged = put("k", "old", 1);

        // Update races in before the collector runs.
        table.replace(put("k", "new", 2));
        assert!(!table.remove_if_identical(&merged));
        assert_eq!(table.get(b"k").unwrap().value().unwrap().as_ref(), b"new");

        // Identical payload is collected.
        let merged = put("k", "new", 2);
        assert!(table.remove_if_identical(&merged));
        assert!(table.is_empty());
        assert_eq!(table.approximate_bytes(), 0);
    }

    #[test]
    fn batched_iterator_sees_consistent_ascending_keys() -> Result<()> {
        let table = Arc::new(MemTable::new());
        for i in 0..250 {
            table.replace(put(&format!("k{i:04}"), "v", i));
        }

        let mut iter = BatchedRevalidatingIterator::new(table.clone(), 100, None);
        let mut seen = Vec::new();
        while let Some(t) = iter.next_tuple()? {
            seen.push(t.stripped_key_bytes());
            // Mutate behind the cursor mid-iteration; the iterator only
            // moves forward, so this must not perturb it.
            if seen.len() == 120 {
                table.replace(put("k0000", "updated", 999));
            }
        }
        assert_eq!(seen.len(), 250);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[test]
    fn batched_iterator_start_key_is_inclusive() -> Result<()> {
        let table = Arc::new(MemTable::new());
        for key in ["a", "b", "c"] {
            table.replace(put(key, "v", 1));
        }
        let mut iter =
            BatchedRevalidatingIterator::new(table, 10, Some(Bytes::from_static(b"b")));
        assert_eq!(iter.next_tuple()?.unwrap().stripped_key(), b"b");
        assert_eq!(iter.next_tuple()?.unwrap().stripped_key(), b"c");
        assert!(iter.next_tuple()?.is_none());
        Ok(())
    }
}
