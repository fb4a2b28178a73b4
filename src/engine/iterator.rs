//! Snapshot iteration across every live component.
//!
//! A k-way streaming merge keeps one cursor per component, always emitting
//! the smallest not-yet-returned stripped key. When several components hold
//! the same key, the temporally newest wins and every shadowed cursor is
//! advanced past the key.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::memtable::BatchedRevalidatingIterator;
use crate::tuple::{Tuple, TupleSource};

use super::{Blsm, IterHandle};

const C0_BATCH: usize = 100;

/// K-way merge over ordered tuple sources, listed temporally newest first.
///
/// Ties on the stripped key resolve to the lowest-index source; all tied
/// sources are advanced past the key, so each stripped key is emitted at
/// most once.
// TODO: thread the tuple merger through so equal keys can be combined
// instead of shadowed; today iteration always runs without a merger.
pub(crate) struct MergeManyIterator {
    sources: Vec<Box<dyn TupleSource + Send>>,
    current: Vec<Option<Tuple>>,
    last_iter: Option<usize>,
}

impl MergeManyIterator {
    pub fn new(mut sources: Vec<Box<dyn TupleSource + Send>>) -> Result<Self> {
        let mut current = Vec::with_capacity(sources.len());
        for source in &mut sources {
            current.push(source.next_tuple()?);
        }
        Ok(Self {
            sources,
            current,
            last_iter: None,
        })
    }

    fn advance(&mut self, i: usize) -> Result<()> {
        self.current[i] = self.sources[i].next_tuple()?;
        Ok(())
    }

    /// Returns the tuple after the previously returned one without moving
    /// the winning cursor: the following [`MergeManyIterator::next_tuple`]
    /// returns the same tuple again.
    pub fn peek(&mut self) -> Result<Option<Tuple>> {
        let t = self.next_tuple()?;
        self.last_iter = None;
        Ok(t)
    }
}

impl TupleSource for MergeManyIterator {
    fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        // The winner of the previous call is consumed only now; a peek
        // clears `last_iter` to suppress exactly this advance.
        if let Some(i) = self.last_iter.take() {
            self.advance(i)?;
        }

        let mut min: Option<usize> = None;
        let mut dups = Vec::new();
        for i in 0..self.current.len() {
            let Some(t) = &self.current[i] else { continue };
            match min {
                None => min = Some(i),
                Some(m) => {
                    let m_key = self.current[m]
                        .as_ref()
                        .expect("min cursor holds a tuple")
                        .stripped_key();
                    match t.stripped_key().cmp(m_key) {
                        std::cmp::Ordering::Less => {
                            min = Some(i);
                            dups.clear();
                        }
                        std::cmp::Ordering::Equal => dups.push(i),
                        std::cmp::Ordering::Greater => {}
                    }
                }
            }
        }
        let Some(m) = min else { return Ok(None) };

        // Shadowed duplicates move past the key now.
        for d in dups {
            self.advance(d)?;
        }
        self.last_iter = Some(m);
        Ok(self.current[m].clone())
    }
}

/// Iterator over a consistent view of the store while merges run
/// concurrently.
///
/// The view is snapshot-ish: keys come back strictly ascending and no
/// stripped key is ever returned twice, but an update landing beyond the
/// cursor while iterating may or may not be seen. The iterator captures the
/// engine epoch at (re)build and probes it again before every tuple (the
/// probe is one atomic load; nothing is held between calls); on drift it
/// rebuilds its cursors just past the last returned key.
pub struct SnapshotIter {
    engine: Blsm,
    handle: std::sync::Arc<IterHandle>,
    start_key: Option<Bytes>,
    epoch: u64,
    merge_it: Option<MergeManyIterator>,
    last_returned: Option<Tuple>,
}

impl SnapshotIter {
    pub(crate) fn new(engine: Blsm, start_key: Option<Bytes>) -> Result<Self> {
        let handle = engine.register_iterator();
        let mut iter = Self {
            engine,
            handle,
            start_key,
            epoch: 0,
            merge_it: None,
            last_returned: None,
        };
        iter.validate()?;
        Ok(iter)
    }

    /// Next tuple with tombstones suppressed.
    pub fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            match self.getnext_helper()? {
                Some(t) if t.is_tombstone() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Next tuple, tombstones included.
    pub fn next_including_tombstones(&mut self) -> Result<Option<Tuple>> {
        self.getnext_helper()
    }

    /// Tears down the cursors; the next call rebuilds them at the current
    /// position.
    pub fn invalidate(&mut self) {
        self.merge_it = None;
    }

    fn getnext_helper(&mut self) -> Result<Option<Tuple>> {
        if self.handle.invalidated.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(Error::ShuttingDown);
        }
        self.revalidate()?;

        let merge_it = self
            .merge_it
            .as_mut()
            .expect("revalidate leaves a live merge iterator");
        let t = merge_it.next_tuple()?;

        if let (Some(last), Some(next)) = (&self.last_returned, &t) {
            if last.stripped_key() >= next.stripped_key() {
                debug_assert!(
                    false,
                    "out of order tuples: {:?} should precede {:?}",
                    last.stripped_key(),
                    next.stripped_key()
                );
                return Err(Error::Corrupt("iterator produced out-of-order tuples"));
            }
        }
        if t.is_some() {
            self.last_returned = t.clone();
        }
        Ok(t)
    }

    fn revalidate(&mut self) -> Result<()> {
        if self.merge_it.is_none() || self.engine.epoch() != self.epoch {
            return self.validate();
        }
        Ok(())
    }

    /// Rebuilds the sub-iterators at `max(last_returned, start_key)` and
    /// drops a leading duplicate of the last returned key.
    fn validate(&mut self) -> Result<()> {
        let snap = self.engine.slot_snapshot()?;
        self.epoch = snap.epoch;

        let pos: Option<Bytes> = match (&self.last_returned, &self.start_key) {
            (Some(last), Some(start)) => {
                Some(std::cmp::max(last.stripped_key_bytes(), start.clone()))
            }
            (Some(last), None) => Some(last.stripped_key_bytes()),
            (None, start) => start.clone(),
        };

        let mut sources: Vec<Box<dyn TupleSource + Send>> = Vec::with_capacity(6);
        sources.push(Box::new(BatchedRevalidatingIterator::new(
            snap.c0.clone(),
            C0_BATCH,
            pos.clone(),
        )));
        if let Some(c0m) = &snap.c0_mergeable {
            sources.push(Box::new(BatchedRevalidatingIterator::new(
                c0m.clone(),
                C0_BATCH,
                pos.clone(),
            )));
        }
        if let Some(c1p) = &snap.c1_prime {
            sources.push(Box::new(c1p.open_iterator(pos.as_deref())));
        }
        sources.push(Box::new(snap.c1.open_iterator(pos.as_deref())));
        if let Some(c1m) = &snap.c1_mergeable {
            sources.push(Box::new(c1m.open_iterator(pos.as_deref())));
        }
        sources.push(Box::new(snap.c2.open_iterator(pos.as_deref())));

        let mut merge_it = MergeManyIterator::new(sources)?;
        if let Some(last) = &self.last_returned {
            if let Some(head) = merge_it.peek()? {
                if head.stripped_key() == last.stripped_key() {
                    // Already returned before the rebuild.
                    let _ = merge_it.next_tuple()?;
                }
            }
        }
        self.merge_it = Some(merge_it);
        Ok(())
    }
}
