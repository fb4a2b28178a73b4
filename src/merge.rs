//! Background merge machinery.
//!
//! Two long-running threads move data down the levels. The mem-merge
//! shovels the live in-memory component into a fresh small on-disk run
//! (merging it with the current one) and garbage-collects what it consumed;
//! the disk-merge folds a frozen small run into the large one. Both drive
//! the same streaming two-pointer merger.
//!
//! Commit order: the scratch component is forced durable, then the header
//! record naming it is committed, and only then are the in-memory slots
//! swapped. A failed force or commit therefore leaves every slot pointer
//! unchanged, and the loop retries from the top.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;

use crate::component::DiskComponent;
use crate::engine::{Blsm, MIN_R};
use crate::error::{Error, Result};
use crate::memtable::MemTable;
use crate::stats::{MergeStats, FORCE_INTERVAL};
use crate::tuple::{Tuple, TupleSource};

/// Consumed C0 tuples buffered between garbage-collection sweeps.
const GC_BUFFER: usize = 100;
/// Tuples copied from C0 per shovel batch.
const SHOVEL_BATCH: usize = 100;
/// Pause before retrying a failed merge.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Owner of the two merge threads.
pub struct MergeScheduler {
    engine: Blsm,
    mem_thread: Option<JoinHandle<()>>,
    disk_thread: Option<JoinHandle<()>>,
}

impl MergeScheduler {
    pub fn start(engine: &Blsm) -> Result<Self> {
        let mem_thread = {
            let engine = engine.clone();
            std::thread::Builder::new()
                .name("blsm-mem-merge".to_string())
                .spawn(move || mem_merge_loop(engine))?
        };
        let disk_thread = {
            let engine = engine.clone();
            std::thread::Builder::new()
                .name("blsm-disk-merge".to_string())
                .spawn(move || disk_merge_loop(engine))?
        };
        Ok(Self {
            engine: engine.clone(),
            mem_thread: Some(mem_thread),
            disk_thread: Some(disk_thread),
        })
    }

    /// Stops the engine (draining C0 through one last mem-merge) and joins
    /// both threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<()> {
        self.engine.stop()?;
        if let Some(handle) = self.mem_thread.take() {
            handle
                .join()
                .map_err(|_| Error::Corrupt("mem-merge thread panicked"))?;
        }
        if let Some(handle) = self.disk_thread.take() {
            handle
                .join()
                .map_err(|_| Error::Corrupt("disk-merge thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            tracing::error!(error = %e, "merge scheduler shutdown failed");
        }
    }
}

/// Gated source over the live C0 for the mem-merge ("snowshoveling").
///
/// Blocks before the first batch until C0 is worth merging (full, or a
/// flush/shutdown asked for a drain). A run ends once it has consumed
/// `max_c0_size` bytes or caught up with the write frontier; under a flush
/// it drains whatever it can see regardless of the budget.
struct ShovelSource<'a> {
    engine: &'a Blsm,
    table: Arc<MemTable>,
    batch: VecDeque<Tuple>,
    last: Option<Bytes>,
    consumed_bytes: u64,
    started: bool,
    finished: bool,
}

impl<'a> ShovelSource<'a> {
    fn new(engine: &'a Blsm, table: Arc<MemTable>) -> Self {
        Self {
            engine,
            table,
            batch: VecDeque::new(),
            last: None,
            consumed_bytes: 0,
            started: false,
            finished: false,
        }
    }

    fn refill(&mut self) {
        let inner = &self.engine.inner;
        if !self.started {
            let mut h = inner.header.lock();
            while h.c0.approximate_bytes() < inner.opts.max_c0_size
                && !h.c0_flushing
                && !h.shutting_down
            {
                inner.c0_ready.wait(&mut h);
            }
            h.c0_is_merging = true;
            self.started = true;
        }

        if self.consumed_bytes >= inner.opts.max_c0_size {
            let h = inner.header.lock();
            if !h.c0_flushing && !h.shutting_down {
                self.finished = true;
                return;
            }
        }

        let start = match &self.last {
            Some(key) => Bound::Excluded(key.as_ref()),
            None => Bound::Unbounded,
        };
        let tuples = self.table.batch_from(start, SHOVEL_BATCH);
        if tuples.is_empty() {
            // Caught up with the write frontier; end the run.
            self.finished = true;
            return;
        }
        self.batch = tuples.into();
    }
}

impl TupleSource for ShovelSource<'_> {
    fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(t) = self.batch.pop_front() {
                self.consumed_bytes += t.byte_length();
                self.last = Some(t.stripped_key_bytes());
                return Ok(Some(t));
            }
            if self.finished {
                return Ok(None);
            }
            self.refill();
        }
    }
}

fn mem_merge_loop(engine: Blsm) {
    let inner = engine.inner.clone();
    let stats = inner.merge_mgr.get_merge_stats(1).clone();

    loop {
        let mut h = inner.header.lock();
        inner.merge_mgr.new_merge(1);
        if h.shutting_down && h.c0.is_empty() {
            // No run is coming; let the disk merger observe the shutdown.
            inner.c1_ready.notify_all();
            return;
        }
        stats.starting_merge();
        stats.set_target_size((h.r_val * h.mean_c0_run_length as f64) as u64);

        let merge_start = inner.wal.log_offset();
        let min_bloom_target = inner.opts.max_c0_size;
        let bloom_target = stats.target_size().max(min_bloom_target) / 100;
        let file_id = h.next_file_id;
        h.next_file_id += 1;
        let c1_prime = match DiskComponent::create(&inner.dir, file_id, &inner.opts, bloom_target)
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "mem-merge scratch component creation failed");
                drop(h);
                std::thread::sleep(RETRY_BACKOFF);
                continue;
            }
        };
        h.c1_prime = Some(c1_prime.clone());
        inner.bump_epoch();
        let c1 = h.c1.clone();
        let c0 = h.c0.clone();
        drop(h);

        tracing::debug!(log_offset = merge_start, "starting memory merge");

        let itr_a = c1.open_iterator(None);
        let itr_b = ShovelSource::new(&engine, c0.clone());
        let run = merge_iterators(&engine, itr_a, itr_b, &c1_prime, &stats, 1, false)
            .and_then(|_| c1_prime.force());
        if let Err(e) = run {
            tracing::error!(error = %e, "memory merge failed; retrying");
            abort_mem_merge(&engine, &c0, &c1_prime);
            inner.merge_mgr.finished_merge(1);
            std::thread::sleep(RETRY_BACKOFF);
            continue;
        }

        let mut h = inner.header.lock();
        // Commit the header naming the new component before swapping any
        // slot, so a failed commit leaves the previous state intact.
        let mut tbl = inner.make_header(&h);
        tbl.c1_file_id = c1_prime.file_id();
        tbl.log_trunc = merge_start;
        if let Err(e) = inner.header_store.commit(&tbl) {
            tracing::error!(error = %e, "mem-merge header commit failed; retrying");
            drop(h);
            abort_mem_merge(&engine, &c0, &c1_prime);
            inner.merge_mgr.finished_merge(1);
            std::thread::sleep(RETRY_BACKOFF);
            continue;
        }

        let old_c1 = std::mem::replace(&mut h.c1, c1_prime.clone());
        inner.bump_epoch();
        h.c1_prime = None;
        inner.bump_epoch();
        h.c0_is_merging = false;
        h.log_trunc = merge_start;
        let new_c1_size = stats.output_size() as f64;
        inner.c0_needed.notify_all();

        if let Err(e) = inner.wal.truncate(merge_start) {
            // Stale tail records only re-apply data the merge made durable.
            tracing::warn!(error = %e, "log truncation failed");
        }
        if let Err(e) = old_c1.dealloc() {
            tracing::warn!(error = %e, "old c1 dealloc failed");
        }

        // Track the effective C0 run length as a moving average.
        if stats.bytes_in_small() > 0 {
            h.num_c0_mergers += 1;
            let frac = 1.0 / h.num_c0_mergers as f64;
            h.mean_c0_run_length = (h.mean_c0_run_length as f64 * (1.0 - frac)
                + stats.bytes_in_small() as f64 * frac) as u64;
        }
        tracing::info!(
            r = h.r_val,
            mean_c0_run_length = h.mean_c0_run_length,
            run_bytes = stats.bytes_in_small(),
            c1_bytes = stats.output_size(),
            "memory merge done"
        );

        let signal_c2 =
            1.05 * new_c1_size / h.mean_c0_run_length.max(1) as f64 > h.r_val;
        if signal_c2 {
            while h.c1_mergeable.is_some() && !h.shutting_down {
                h.c1_flushing = true;
                inner.c1_needed.wait(&mut h);
                h.c1_flushing = false;
            }
            if h.c1_mergeable.is_none() {
                promote_c1(&engine, &mut h, &stats);
            }
        }
        drop(h);
        inner.merge_mgr.finished_merge(1);
    }
}

/// Hands the freshly installed C1 to the disk merger and starts an empty
/// one in its place.
fn promote_c1(
    engine: &Blsm,
    h: &mut parking_lot::MutexGuard<'_, crate::engine::HeaderState>,
    stats: &Arc<MergeStats>,
) {
    let inner = &engine.inner;
    let file_id = h.next_file_id;
    h.next_file_id += 1;
    let empty = match DiskComponent::create(&inner.dir, file_id, &inner.opts, 10) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "empty c1 creation failed; cascade skipped");
            return;
        }
    };
    if let Err(e) = empty.force() {
        tracing::error!(error = %e, "empty c1 force failed; cascade skipped");
        let _ = empty.dealloc();
        return;
    }

    let mut tbl = inner.make_header(h);
    tbl.c1_file_id = empty.file_id();
    tbl.c1_mergeable_file_id = Some(h.c1.file_id());
    if let Err(e) = inner.header_store.commit(&tbl) {
        tracing::error!(error = %e, "cascade header commit failed; cascade skipped");
        let _ = empty.dealloc();
        return;
    }

    h.c1_mergeable = Some(h.c1.clone());
    inner.bump_epoch();
    stats.handed_off_tree();
    h.c1 = empty;
    inner.bump_epoch();
    inner.c1_ready.notify_all();
    tracing::debug!("promoted c1 for disk merge");
}

/// Rolls the engine back after a failed mem-merge: the scratch component is
/// released and everything it consumed from C0 is put back, newer live
/// entries winning. With logging enabled the WAL tail also replays, which
/// restores tombstones the merge filter dropped.
fn abort_mem_merge(engine: &Blsm, c0: &Arc<MemTable>, scratch: &Arc<DiskComponent>) {
    let inner = &engine.inner;
    let log_trunc = inner.header.lock().log_trunc;
    {
        let _rb = inner.rb_mut.lock();
        let mut it = scratch.open_iterator(None);
        loop {
            match it.next_tuple() {
                Ok(Some(t)) => {
                    c0.insert_if_newer(t);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "scratch read-back failed during abort");
                    break;
                }
            }
        }
        if let Err(e) = inner.wal.replay(log_trunc, |_, t| {
            c0.insert_if_newer(t);
        }) {
            tracing::warn!(error = %e, "log replay failed during abort");
        }
    }
    let _ = scratch.dealloc();

    let mut h = inner.header.lock();
    h.c1_prime = None;
    inner.bump_epoch();
    h.c0_is_merging = false;
    inner.c0_needed.notify_all();
}

fn disk_merge_loop(engine: Blsm) {
    let inner = engine.inner.clone();
    let stats = inner.merge_mgr.get_merge_stats(2).clone();

    loop {
        let mut h = inner.header.lock();
        inner.merge_mgr.new_merge(2);
        while h.c1_mergeable.is_none() {
            inner.c1_needed.notify_all();
            if h.shutting_down {
                return;
            }
            inner.c1_ready.wait(&mut h);
        }
        stats.starting_merge();

        let c2 = h.c2.clone();
        let c1m = h
            .c1_mergeable
            .clone()
            .expect("checked non-empty under the header lock");
        let target =
            ((inner.opts.max_c0_size as f64 * h.r_val) as u64 + stats.base_size()) / 1000;
        stats.set_target_size(target);
        let file_id = h.next_file_id;
        h.next_file_id += 1;
        let c2_prime = match DiskComponent::create(&inner.dir, file_id, &inner.opts, target.max(1))
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "disk-merge scratch component creation failed");
                drop(h);
                std::thread::sleep(RETRY_BACKOFF);
                continue;
            }
        };
        drop(h);

        tracing::debug!("starting disk merge");

        let itr_a = c2.open_iterator(None);
        let itr_b = c1m.open_iterator(None);
        let run = merge_iterators(&engine, itr_a, itr_b, &c2_prime, &stats, 2, true)
            .and_then(|_| c2_prime.force());
        if let Err(e) = run {
            tracing::error!(error = %e, "disk merge failed; retrying");
            let _ = c2_prime.dealloc();
            inner.merge_mgr.finished_merge(2);
            std::thread::sleep(RETRY_BACKOFF);
            continue;
        }

        let mut h = inner.header.lock();
        let new_r = MIN_R.max(
            (stats.output_size() as f64 / h.mean_c0_run_length.max(1) as f64).sqrt(),
        );
        stats.handed_off_tree();
        let mut tbl = inner.make_header(&h);
        tbl.c2_file_id = c2_prime.file_id();
        tbl.c1_mergeable_file_id = None;
        tbl.r_val = new_r;
        if let Err(e) = inner.header_store.commit(&tbl) {
            tracing::error!(error = %e, "disk-merge header commit failed; retrying");
            drop(h);
            let _ = c2_prime.dealloc();
            inner.merge_mgr.finished_merge(2);
            std::thread::sleep(RETRY_BACKOFF);
            continue;
        }

        let old_c2 = std::mem::replace(&mut h.c2, c2_prime.clone());
        inner.bump_epoch();
        let old_c1m = h.c1_mergeable.take();
        inner.bump_epoch();
        h.r_val = new_r;
        if let Err(e) = old_c2.dealloc() {
            tracing::warn!(error = %e, "old c2 dealloc failed");
        }
        if let Some(c) = old_c1m {
            if let Err(e) = c.dealloc() {
                tracing::warn!(error = %e, "consumed c1-mergeable dealloc failed");
            }
        }
        inner.c1_needed.notify_all();
        tracing::info!(r = new_r, c2_bytes = stats.output_size(), "disk merge done");
        drop(h);
        inner.merge_mgr.finished_merge(2);
    }
}

/// Keep `t` in the merge output? Tombstones are dropped once nothing older
/// could hold the key (or always, at the bottom level); expired tuples are
/// dropped when an expiry is configured.
fn insert_filter(engine: &Blsm, t: &Tuple, drop_deletes: bool) -> bool {
    if t.is_tombstone()
        && (drop_deletes || !engine.might_be_after_mem_merge_now(t.stripped_key()))
    {
        return false;
    }
    if let Some(expiry) = engine.inner.opts.expiry {
        if t.timestamp() < engine.current_timestamp().saturating_sub(expiry) {
            return false;
        }
    }
    true
}

fn write_filtered(
    engine: &Blsm,
    scratch: &Arc<DiskComponent>,
    level: usize,
    t: &Tuple,
    drop_deletes: bool,
    pacing_bytes: &mut u64,
) -> Result<()> {
    if !insert_filter(engine, t, drop_deletes) {
        return Ok(());
    }
    scratch.insert_tuple(t)?;
    *pacing_bytes += t.byte_length();
    engine.inner.merge_mgr.wrote_tuple(level, t);

    if let Some(limiter) = &engine.inner.limiter {
        if *pacing_bytes > FORCE_INTERVAL {
            limiter.acquire(*pacing_bytes)?;
            *pacing_bytes = 0;
        }
    }
    Ok(())
}

/// Removes consumed C0 tuples that are still byte-identical in the live
/// tree, then wakes writers waiting for space.
fn collect_garbage(engine: &Blsm, c0: &Arc<MemTable>, garbage: &mut Vec<Tuple>) {
    if garbage.is_empty() {
        return;
    }
    {
        let _rb = engine.inner.rb_mut.lock();
        for t in garbage.drain(..) {
            c0.remove_if_identical(&t);
        }
    }
    engine
        .inner
        .merge_mgr
        .get_merge_stats(0)
        .set_current_size(c0.approximate_bytes());
    // Scans must notice that consumed tuples now live only in the scratch
    // output, and writers may be waiting for space.
    engine.inner.bump_epoch();
    let _h = engine.inner.header.lock();
    engine.inner.c0_needed.notify_all();
}

/// Streaming two-pointer merge of the ordered streams `itr_a` (older,
/// larger side) and `itr_b` (newer, smaller side) into `scratch`.
///
/// Both inputs must be ascending and duplicate-free on the stripped key.
/// Equal keys go through the tuple merger. At level 1 every consumed C0
/// tuple is buffered for garbage collection. Writes charge the rate
/// limiter every [`FORCE_INTERVAL`] bytes.
fn merge_iterators<A: TupleSource, B: TupleSource>(
    engine: &Blsm,
    mut itr_a: A,
    mut itr_b: B,
    scratch: &Arc<DiskComponent>,
    stats: &Arc<MergeStats>,
    level: usize,
    drop_deletes: bool,
) -> Result<()> {
    let inner = &engine.inner;
    let mgr = &inner.merge_mgr;
    let c0 = inner.header.lock().c0.clone();

    let mut t1 = itr_a.next_tuple()?;
    if let Some(t) = &t1 {
        mgr.read_tuple_from_large_component(level, t);
    }

    let mut garbage: Vec<Tuple> = Vec::with_capacity(GC_BUFFER);
    let mut pacing_bytes: u64 = 0;

    while let Some(t2) = itr_b.next_tuple()? {
        mgr.read_tuple_from_small_component(level, &t2);

        while t1
            .as_ref()
            .map_or(false, |c| c.stripped_key() < t2.stripped_key())
        {
            let cur = t1.take().expect("checked non-empty");
            write_filtered(engine, scratch, level, &cur, drop_deletes, &mut pacing_bytes)?;
            t1 = itr_a.next_tuple()?;
            if let Some(t) = &t1 {
                mgr.read_tuple_from_large_component(level, t);
            }
        }

        let equal = t1
            .as_ref()
            .map_or(false, |c| c.stripped_key() == t2.stripped_key());
        if equal {
            let cur = t1.take().expect("checked non-empty");
            let merged = inner.tmerger.merge(&cur, &t2);
            stats.merged_tuples(&merged, &t2, &cur);
            write_filtered(
                engine,
                scratch,
                level,
                &merged,
                drop_deletes,
                &mut pacing_bytes,
            )?;
            t1 = itr_a.next_tuple()?;
            if let Some(t) = &t1 {
                mgr.read_tuple_from_large_component(level, t);
            }
        } else {
            write_filtered(engine, scratch, level, &t2, drop_deletes, &mut pacing_bytes)?;
        }

        if level == 1 {
            // Consumed from C0; its stats and garbage collection are the
            // mem-merge's responsibility.
            mgr.wrote_tuple(0, &t2);
            if garbage.len() == GC_BUFFER {
                collect_garbage(engine, &c0, &mut garbage);
            }
            garbage.push(t2);
        }
    }

    // The small side is exhausted; drain the large side under the same
    // filter.
    while let Some(cur) = t1.take() {
        write_filtered(engine, scratch, level, &cur, drop_deletes, &mut pacing_bytes)?;
        t1 = itr_a.next_tuple()?;
        if let Some(t) = &t1 {
            mgr.read_tuple_from_large_component(level, t);
        }
    }

    if level == 1 {
        collect_garbage(engine, &c0, &mut garbage);
    }
    scratch.writes_done()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BlsmOptions;
    use crate::tuple::VecSource;
    use tempfile::TempDir;

    fn put(key: &str, value: &str, ts: u64) -> Tuple {
        Tuple::put(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            ts,
        )
    }

    fn tombstone(key: &str, ts: u64) -> Tuple {
        Tuple::tombstone(Bytes::copy_from_slice(key.as_bytes()), ts)
    }

    fn drain_component(comp: &Arc<DiskComponent>) -> Result<Vec<Tuple>> {
        let mut it = comp.open_iterator(None);
        let mut out = Vec::new();
        while let Some(t) = it.next_tuple()? {
            out.push(t);
        }
        Ok(out)
    }

    #[test]
    fn streaming_merge_prefers_small_side_on_ties() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let engine = Blsm::open(dir.path().join("db"), BlsmOptions::default())?;
        let stats = engine.inner.merge_mgr.get_merge_stats(2).clone();
        let scratch =
            DiskComponent::create(&engine.inner.dir, 99, &engine.inner.opts, 100)?;

        let large = VecSource::new(vec![put("a", "old", 1), put("c", "old", 1)]);
        let small = VecSource::new(vec![put("b", "new", 5), put("c", "new", 5)]);
        merge_iterators(&engine, large, small, &scratch, &stats, 2, true)?;

        let out = drain_component(&scratch)?;
        let keys: Vec<_> = out.iter().map(|t| t.stripped_key_bytes()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(out[2].value().unwrap().as_ref(), b"new");
        Ok(())
    }

    #[test]
    fn bottom_level_merge_drops_tombstones() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let engine = Blsm::open(dir.path().join("db"), BlsmOptions::default())?;
        let stats = engine.inner.merge_mgr.get_merge_stats(2).clone();
        let scratch =
            DiskComponent::create(&engine.inner.dir, 98, &engine.inner.opts, 100)?;

        let large = VecSource::new(vec![put("a", "1", 1), put("b", "1", 1)]);
        let small = VecSource::new(vec![tombstone("b", 5), put("c", "2", 5)]);
        merge_iterators(&engine, large, small, &scratch, &stats, 2, true)?;

        let out = drain_component(&scratch)?;
        let keys: Vec<_> = out.iter().map(|t| t.stripped_key_bytes()).collect();
        assert_eq!(keys, vec!["a", "c"]);
        Ok(())
    }

    #[test]
    fn mem_level_merge_drops_tombstones_with_nothing_to_shadow() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let engine = Blsm::open(dir.path().join("db"), BlsmOptions::default())?;
        let stats = engine.inner.merge_mgr.get_merge_stats(1).clone();
        let scratch =
            DiskComponent::create(&engine.inner.dir, 97, &engine.inner.opts, 100)?;

        // Nothing lives in C2, so the tombstone cannot shadow anything and
        // is dropped even at level 1.
        let large = VecSource::new(vec![put("a", "1", 1)]);
        let small = VecSource::new(vec![tombstone("b", 5)]);
        merge_iterators(&engine, large, small, &scratch, &stats, 1, false)?;

        let out = drain_component(&scratch)?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stripped_key(), b"a");
        Ok(())
    }

    #[test]
    fn expired_tuples_are_dropped() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let opts = BlsmOptions {
            expiry: Some(10),
            ..BlsmOptions::default()
        };
        let engine = Blsm::open(dir.path().join("db"), opts)?;
        // Advance the clock well past the expiry window.
        for i in 0..100 {
            engine.insert_tuple(put(&format!("tick{i:03}"), "x", 0))?;
        }

        let stats = engine.inner.merge_mgr.get_merge_stats(2).clone();
        let scratch =
            DiskComponent::create(&engine.inner.dir, 96, &engine.inner.opts, 100)?;
        let large = VecSource::new(vec![put("old", "v", 1)]);
        let small = VecSource::new(vec![put("zfresh", "v", 1_000_000)]);
        merge_iterators(&engine, large, small, &scratch, &stats, 2, true)?;

        let out = drain_component(&scratch)?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stripped_key(), b"zfresh");
        Ok(())
    }
}
