//! The bLSM engine: owner of the component slots and the write/read paths.
//!
//! Temporal order of the slots, newest first:
//! C0 > C0-mergeable > C1' > C1 > C1-mergeable > C2. A later tuple with the
//! same stripped key shadows an earlier one. Every slot mutation happens
//! under the header mutex and bumps the epoch; snapshot iterators use the
//! epoch to notice that their view went stale.
//!
//! Lock order: header mutex first, then `rb_mut`.

pub mod iterator;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::component::DiskComponent;
use crate::error::{Error, Result};
use crate::header::{HeaderStore, TableHeader};
use crate::memtable::MemTable;
use crate::options::BlsmOptions;
use crate::rate_limiter::RateLimiter;
use crate::stats::{MergeManager, MergeStatsSnapshot};
use crate::tuple::{LastWriterWins, Tuple, TupleMerger};
use crate::wal::Wal;

pub use iterator::SnapshotIter;

/// Floor of the size ratio between adjacent on-disk levels.
pub const MIN_R: f64 = 3.0;

/// Handle to an open store. Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct Blsm {
    pub(crate) inner: Arc<BlsmInner>,
}

pub(crate) struct BlsmInner {
    pub(crate) dir: PathBuf,
    pub(crate) opts: BlsmOptions,
    /// The header mutex: protects every slot and all merge handshake flags.
    pub(crate) header: Mutex<HeaderState>,
    /// Writers may resume: the mem-merge drained C0.
    pub(crate) c0_needed: Condvar,
    /// The mem-merge may start: C0 is full (or flushing).
    pub(crate) c0_ready: Condvar,
    /// The disk-merge consumed C1-mergeable; the mem-merge may promote.
    pub(crate) c1_needed: Condvar,
    /// The disk-merge may start: C1-mergeable is installed.
    pub(crate) c1_ready: Condvar,
    /// Serialises C0 mutations (writer inserts and merge GC removals).
    pub(crate) rb_mut: Mutex<()>,
    /// Timestamp counter.
    pub(crate) tick: Mutex<u64>,
    pub(crate) epoch: AtomicU64,
    pub(crate) wal: Wal,
    pub(crate) header_store: HeaderStore,
    pub(crate) merge_mgr: MergeManager,
    pub(crate) tmerger: Box<dyn TupleMerger>,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
    iters: Mutex<Vec<Weak<IterHandle>>>,
}

pub(crate) struct HeaderState {
    pub(crate) c0: Arc<MemTable>,
    pub(crate) c0_mergeable: Option<Arc<MemTable>>,
    pub(crate) c1: Arc<DiskComponent>,
    pub(crate) c1_prime: Option<Arc<DiskComponent>>,
    pub(crate) c1_mergeable: Option<Arc<DiskComponent>>,
    pub(crate) c2: Arc<DiskComponent>,
    /// True while a mem-merge run is actively consuming C0.
    pub(crate) c0_is_merging: bool,
    /// Asks the mem-merge to drain C0 without waiting for it to fill.
    pub(crate) c0_flushing: bool,
    /// Asks the disk-merge to hurry: the mem-merge is waiting to promote.
    pub(crate) c1_flushing: bool,
    pub(crate) shutting_down: bool,
    pub(crate) r_val: f64,
    pub(crate) mean_c0_run_length: u64,
    pub(crate) num_c0_mergers: u64,
    pub(crate) next_file_id: u64,
    pub(crate) log_trunc: u64,
}

/// Consistent copy of the slots, taken under the header mutex. Components
/// are refcounted and keep their file handles open, so the snapshot stays
/// readable even after a merge deallocates a component.
pub(crate) struct SlotSnapshot {
    pub(crate) c0: Arc<MemTable>,
    pub(crate) c0_mergeable: Option<Arc<MemTable>>,
    pub(crate) c1_prime: Option<Arc<DiskComponent>>,
    pub(crate) c1: Arc<DiskComponent>,
    pub(crate) c1_mergeable: Option<Arc<DiskComponent>>,
    pub(crate) c2: Arc<DiskComponent>,
    pub(crate) epoch: u64,
}

impl SlotSnapshot {
    /// False only when every bloom filter that could hold the key says no.
    pub(crate) fn might_be_on_disk(&self, stripped_key: &[u8]) -> bool {
        if self.c1.bloom_lookup(stripped_key) {
            return true;
        }
        if let Some(c1p) = &self.c1_prime {
            if c1p.bloom_lookup(stripped_key) {
                return true;
            }
        }
        self.might_be_after_mem_merge(stripped_key)
    }

    /// Could the key exist in a component older than the mem-merge output?
    /// A tombstone may be dropped during a mem-merge only when this is
    /// false.
    pub(crate) fn might_be_after_mem_merge(&self, stripped_key: &[u8]) -> bool {
        if let Some(c1m) = &self.c1_mergeable {
            if c1m.bloom_lookup(stripped_key) {
                return true;
            }
        }
        self.c2.bloom_lookup(stripped_key)
    }
}

pub(crate) struct IterHandle {
    pub(crate) invalidated: AtomicBool,
}

/// Point-in-time sizes and tuning state, mostly for tests and operators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMetrics {
    pub c0_bytes: u64,
    pub c1_bytes: u64,
    pub c1_mergeable_bytes: Option<u64>,
    pub c2_bytes: u64,
    pub r_val: f64,
    pub mean_c0_run_length: u64,
    pub epoch: u64,
}

impl Blsm {
    /// Opens (or creates) a store in `dir`. Loads the persistent header,
    /// opens the components it names, and replays the WAL tail past the
    /// truncation point into C0. Background merging is separate: see
    /// [`crate::merge::MergeScheduler`].
    pub fn open(dir: impl AsRef<Path>, opts: BlsmOptions) -> Result<Self> {
        opts.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let (header_store, existing) = HeaderStore::open(&dir)?;
        let wal = Wal::open(&dir, &opts)?;
        let merge_mgr = MergeManager::new();

        let state = match &existing {
            Some(tbl) => {
                let c1 = DiskComponent::open(&dir, tbl.c1_file_id)?;
                let c2 = DiskComponent::open(&dir, tbl.c2_file_id)?;
                let c1_mergeable = match tbl.c1_mergeable_file_id {
                    Some(id) => Some(DiskComponent::open(&dir, id)?),
                    None => None,
                };
                merge_mgr.restore_durable_state(tbl.merge_stats);
                HeaderState {
                    c0: Arc::new(MemTable::new()),
                    c0_mergeable: None,
                    c1,
                    c1_prime: None,
                    c1_mergeable,
                    c2,
                    c0_is_merging: false,
                    c0_flushing: false,
                    c1_flushing: false,
                    shutting_down: false,
                    r_val: tbl.r_val,
                    mean_c0_run_length: tbl.mean_c0_run_length,
                    num_c0_mergers: tbl.merge_stats[1].0,
                    next_file_id: tbl.next_file_id,
                    log_trunc: tbl.log_trunc,
                }
            }
            None => {
                let c1 = DiskComponent::create(&dir, 1, &opts, 10)?;
                c1.writes_done()?;
                c1.force()?;
                let c2 = DiskComponent::create(&dir, 2, &opts, 10)?;
                c2.writes_done()?;
                c2.force()?;
                let state = HeaderState {
                    c0: Arc::new(MemTable::new()),
                    c0_mergeable: None,
                    c1,
                    c1_prime: None,
                    c1_mergeable: None,
                    c2,
                    c0_is_merging: false,
                    c0_flushing: false,
                    c1_flushing: false,
                    shutting_down: false,
                    r_val: MIN_R,
                    mean_c0_run_length: 0,
                    num_c0_mergers: 0,
                    next_file_id: 3,
                    log_trunc: 0,
                };
                header_store.commit(&TableHeader {
                    c1_file_id: 1,
                    c2_file_id: 2,
                    c1_mergeable_file_id: None,
                    next_file_id: 3,
                    r_val: MIN_R,
                    mean_c0_run_length: 0,
                    merge_stats: merge_mgr.durable_state(),
                    log_trunc: 0,
                })?;
                state
            }
        };

        // Rebuild C0 from the surviving log tail. Records of racing writers
        // may appear out of stamping order; the newest timestamp wins.
        let mut max_ts = 0u64;
        wal.replay(state.log_trunc, |_, t| {
            max_ts = max_ts.max(t.timestamp());
            state.c0.insert_if_newer(t);
        })?;
        if !state.c0.is_empty() {
            tracing::info!(tuples = state.c0.len(), "replayed write-ahead log into c0");
        }

        let limiter = match opts.rate_limit {
            Some(rate) => Some(Arc::new(RateLimiter::new(rate, rate)?)),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(BlsmInner {
                dir,
                opts,
                header: Mutex::new(state),
                c0_needed: Condvar::new(),
                c0_ready: Condvar::new(),
                c1_needed: Condvar::new(),
                c1_ready: Condvar::new(),
                rb_mut: Mutex::new(()),
                tick: Mutex::new(max_ts + 1),
                epoch: AtomicU64::new(0),
                wal,
                header_store,
                merge_mgr,
                tmerger: Box::new(LastWriterWins),
                limiter,
                iters: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Inserts one tuple. Blocks while the in-memory component is over
    /// budget and a mem-merge run is still draining it; the merge garbage
    /// collector signals `c0_needed` as it frees space.
    pub fn insert_tuple(&self, tuple: Tuple) -> Result<()> {
        let t = self.stamp(tuple);
        let c0 = {
            let mut h = self.inner.header.lock();
            if h.shutting_down {
                return Err(Error::ShuttingDown);
            }
            while h.c0.approximate_bytes() > self.inner.opts.max_c0_size && h.c0_is_merging {
                self.inner.c0_ready.notify_all();
                self.inner.c0_needed.wait(&mut h);
                if h.shutting_down {
                    return Err(Error::ShuttingDown);
                }
            }
            h.c0.clone()
        };

        self.inner.wal.append(&t)?;
        {
            let _rb = self.inner.rb_mut.lock();
            c0.replace(t.clone());
        }
        let stats0 = self.inner.merge_mgr.get_merge_stats(0);
        stats0.read_tuple_from_small(&t);
        stats0.set_current_size(c0.approximate_bytes());

        if c0.approximate_bytes() >= self.inner.opts.max_c0_size {
            let _h = self.inner.header.lock();
            self.inner.c0_ready.notify_all();
        }
        Ok(())
    }

    pub fn insert_many_tuples(&self, tuples: Vec<Tuple>) -> Result<()> {
        for t in tuples {
            self.insert_tuple(t)?;
        }
        Ok(())
    }

    /// Writes a tombstone for `key`.
    pub fn delete(&self, key: impl Into<Bytes>) -> Result<()> {
        self.insert_tuple(Tuple::tombstone(key, 0))
    }

    /// Read-then-write without a barrier: inserts `tuple` only when the
    /// probed key currently has no live value. When `probe` is given, its
    /// key is consulted instead of `tuple`'s own, so one key can be set
    /// based on another's presence. Not atomic with respect to concurrent
    /// writers; callers needing atomicity must serialise externally.
    pub fn test_and_set_tuple(&self, tuple: Tuple, probe: Option<&[u8]>) -> Result<bool> {
        let absent = {
            let probe_key = probe.unwrap_or_else(|| tuple.stripped_key());
            match self.find_tuple_first(probe_key)? {
                Some(existing) => existing.is_tombstone(),
                None => true,
            }
        };
        if !absent {
            return Ok(false);
        }
        self.insert_tuple(tuple)?;
        Ok(true)
    }

    /// Point lookup. Consults C0 first, then each disk component in
    /// temporal order, stopping at the first hit; bloom filters gate the
    /// disk probes. A tombstone hit reads as absent.
    pub fn find_tuple(&self, stripped_key: &[u8]) -> Result<Option<Tuple>> {
        Ok(self
            .find_tuple_first(stripped_key)?
            .filter(|t| !t.is_tombstone()))
    }

    /// Like [`Blsm::find_tuple`] but returns the newest physical tuple,
    /// tombstone included. This is the probe the conditional write path
    /// uses.
    pub fn find_tuple_first(&self, stripped_key: &[u8]) -> Result<Option<Tuple>> {
        let snap = self.slot_snapshot()?;

        if let Some(t) = snap.c0.get(stripped_key) {
            return Ok(Some(t));
        }
        if let Some(c0m) = &snap.c0_mergeable {
            if let Some(t) = c0m.get(stripped_key) {
                return Ok(Some(t));
            }
        }
        if !snap.might_be_on_disk(stripped_key) {
            return Ok(None);
        }
        if let Some(c1p) = &snap.c1_prime {
            if let Some(t) = c1p.get(stripped_key)? {
                return Ok(Some(t));
            }
        }
        if let Some(t) = snap.c1.get(stripped_key)? {
            return Ok(Some(t));
        }
        if let Some(c1m) = &snap.c1_mergeable {
            if let Some(t) = c1m.get(stripped_key)? {
                return Ok(Some(t));
            }
        }
        snap.c2.get(stripped_key)
    }

    /// Snapshot iterator over every live component, positioned at
    /// `start_key` (or the smallest key).
    pub fn iterator(&self, start_key: Option<&[u8]>) -> Result<SnapshotIter> {
        SnapshotIter::new(self.clone(), start_key.map(Bytes::copy_from_slice))
    }

    /// Forces the current contents of C0 out through a mem-merge and waits
    /// for the drain. Requires a running merge scheduler.
    pub fn flush_table(&self) -> Result<()> {
        let mut h = self.inner.header.lock();
        if h.shutting_down {
            return Err(Error::ShuttingDown);
        }
        self.flush_locked(&mut h);
        Ok(())
    }

    fn flush_locked(&self, h: &mut parking_lot::MutexGuard<'_, HeaderState>) {
        if h.c0.is_empty() && !h.c0_is_merging {
            return;
        }
        h.c0_flushing = true;
        loop {
            self.inner.c0_ready.notify_all();
            if h.c0.is_empty() && !h.c0_is_merging {
                break;
            }
            self.inner.c0_needed.wait(h);
        }
        if !h.shutting_down {
            h.c0_flushing = false;
        }
    }

    /// Initiates shutdown: drains C0 through the mem-merge, leaves the
    /// flushing flags set so the merge threads run out, and wakes every
    /// waiter. The merge scheduler joins its threads after calling this.
    pub fn stop(&self) -> Result<()> {
        {
            let mut h = self.inner.header.lock();
            if !h.shutting_down {
                h.shutting_down = true;
                h.c0_flushing = true;
                h.c1_flushing = true;
                self.flush_locked(&mut h);
                self.inner.c0_needed.notify_all();
                self.inner.c0_ready.notify_all();
                self.inner.c1_needed.notify_all();
                self.inner.c1_ready.notify_all();
            }
        }
        for handle in self.inner.iters.lock().iter() {
            if let Some(h) = handle.upgrade() {
                h.invalidated.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn is_still_running(&self) -> bool {
        !self.inner.header.lock().shutting_down
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Effective size ratio between on-disk and in-memory data.
    pub fn r(&self) -> f64 {
        self.inner.header.lock().r_val
    }

    /// Moving average of bytes pushed through one mem-merge run.
    pub fn mean_c0_run_length(&self) -> u64 {
        self.inner.header.lock().mean_c0_run_length
    }

    pub fn merge_stats(&self, level: usize) -> MergeStatsSnapshot {
        self.inner.merge_mgr.get_merge_stats(level).snapshot()
    }

    pub fn metrics(&self) -> EngineMetrics {
        let h = self.inner.header.lock();
        EngineMetrics {
            c0_bytes: h.c0.approximate_bytes(),
            c1_bytes: h.c1.byte_count(),
            c1_mergeable_bytes: h.c1_mergeable.as_ref().map(|c| c.byte_count()),
            c2_bytes: h.c2.byte_count(),
            r_val: h.r_val,
            mean_c0_run_length: h.mean_c0_run_length,
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn stamp(&self, tuple: Tuple) -> Tuple {
        let mut tick = self.inner.tick.lock();
        if tuple.timestamp() == 0 {
            let ts = *tick;
            *tick += 1;
            tuple.stamped(ts)
        } else {
            *tick = (*tick).max(tuple.timestamp() + 1);
            tuple
        }
    }

    pub(crate) fn current_timestamp(&self) -> u64 {
        *self.inner.tick.lock()
    }

    pub(crate) fn slot_snapshot(&self) -> Result<SlotSnapshot> {
        let h = self.inner.header.lock();
        if h.shutting_down {
            return Err(Error::ShuttingDown);
        }
        Ok(SlotSnapshot {
            c0: h.c0.clone(),
            c0_mergeable: h.c0_mergeable.clone(),
            c1_prime: h.c1_prime.clone(),
            c1: h.c1.clone(),
            c1_mergeable: h.c1_mergeable.clone(),
            c2: h.c2.clone(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
        })
    }

    pub(crate) fn register_iterator(&self) -> Arc<IterHandle> {
        let handle = Arc::new(IterHandle {
            invalidated: AtomicBool::new(false),
        });
        let mut iters = self.inner.iters.lock();
        iters.retain(|w| w.strong_count() > 0);
        iters.push(Arc::downgrade(&handle));
        handle
    }

    /// Could the key exist below the mem-merge output, judged against the
    /// live slots? Used by the merge filter to decide tombstone fate.
    pub(crate) fn might_be_after_mem_merge_now(&self, stripped_key: &[u8]) -> bool {
        let h = self.inner.header.lock();
        if let Some(c1m) = &h.c1_mergeable {
            if c1m.bloom_lookup(stripped_key) {
                return true;
            }
        }
        h.c2.bloom_lookup(stripped_key)
    }
}

impl BlsmInner {
    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Builds the header record matching the current slot state.
    pub(crate) fn make_header(&self, h: &HeaderState) -> TableHeader {
        TableHeader {
            c1_file_id: h.c1.file_id(),
            c2_file_id: h.c2.file_id(),
            c1_mergeable_file_id: h.c1_mergeable.as_ref().map(|c| c.file_id()),
            next_file_id: h.next_file_id,
            r_val: h.r_val,
            mean_c0_run_length: h.mean_c0_run_length,
            merge_stats: self.merge_mgr.durable_state(),
            log_trunc: h.log_trunc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(key: &str, value: &str) -> Tuple {
        Tuple::put(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            0,
        )
    }

    #[test]
    fn insert_and_find_in_c0() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let db = Blsm::open(dir.path(), BlsmOptions::default())?;
        db.insert_tuple(put("a", "1"))?;
        db.insert_tuple(put("b", "2"))?;

        let hit = db.find_tuple(b"a")?.unwrap();
        assert_eq!(hit.value().unwrap().as_ref(), b"1");
        assert!(db.find_tuple(b"missing")?.is_none());
        Ok(())
    }

    #[test]
    fn tombstone_reads_as_absent() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let db = Blsm::open(dir.path(), BlsmOptions::default())?;
        db.insert_tuple(put("k", "v"))?;
        db.delete(&b"k"[..])?;

        assert!(db.find_tuple(b"k")?.is_none());
        let raw = db.find_tuple_first(b"k")?.unwrap();
        assert!(raw.is_tombstone());
        Ok(())
    }

    #[test]
    fn test_and_set_is_conditional() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let db = Blsm::open(dir.path(), BlsmOptions::default())?;

        assert!(db.test_and_set_tuple(put("k", "first"), None)?);
        assert!(!db.test_and_set_tuple(put("k", "second"), None)?);
        assert_eq!(
            db.find_tuple(b"k")?.unwrap().value().unwrap().as_ref(),
            b"first"
        );

        // Probing another key: "guard" exists, so the write is refused.
        assert!(!db.test_and_set_tuple(put("other", "x"), Some(&b"k"[..]))?);
        // A deleted probe key reads as absent.
        db.delete(&b"k"[..])?;
        assert!(db.test_and_set_tuple(put("other", "x"), Some(&b"k"[..]))?);
        Ok(())
    }

    #[test]
    fn operations_after_stop_are_refused() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let db = Blsm::open(dir.path(), BlsmOptions::default())?;
        // No scheduler running, but C0 is empty so stop does not wait.
        db.stop()?;
        assert!(matches!(
            db.insert_tuple(put("a", "1")),
            Err(Error::ShuttingDown)
        ));
        assert!(matches!(db.find_tuple(b"a"), Err(Error::ShuttingDown)));
        assert!(!db.is_still_running());
        Ok(())
    }

    #[test]
    fn timestamps_are_stamped_monotonically() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let db = Blsm::open(dir.path(), BlsmOptions::default())?;
        db.insert_tuple(put("a", "1"))?;
        db.insert_tuple(put("b", "2"))?;
        let a = db.find_tuple(b"a")?.unwrap();
        let b = db.find_tuple(b"b")?.unwrap();
        assert!(b.timestamp() > a.timestamp());
        assert!(a.timestamp() > 0);
        Ok(())
    }
}
