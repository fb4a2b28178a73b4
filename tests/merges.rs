//! Multi-level merge behavior: cascades, tombstones across levels, ratio
//! convergence, restart durability.

use std::time::{Duration, Instant};

use blsm::{Blsm, BlsmOptions, MergeScheduler, Tuple, MIN_R};
use bytes::Bytes;
use tempfile::TempDir;

fn put(key: &str, value: &str) -> Tuple {
    Tuple::put(
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
        0,
    )
}

fn small_options() -> BlsmOptions {
    BlsmOptions {
        max_c0_size: 8 * 1024,
        rate_limit: None,
        ..BlsmOptions::default()
    }
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

/// Pumps distinct keys through flushes until at least `count` disk merges
/// completed.
fn pump_until_disk_merges(
    db: &Blsm,
    prefix: &str,
    count: u64,
    keys_per_batch: usize,
) -> anyhow::Result<usize> {
    let mut written = 0usize;
    for batch in 0..200 {
        if db.merge_stats(2).merge_count >= count && !db.merge_stats(2).active {
            break;
        }
        for i in 0..keys_per_batch {
            db.insert_tuple(put(&format!("{prefix}{batch:03}{i:04}"), "fill"))?;
            written += 1;
        }
        db.flush_table()?;
    }
    assert!(
        wait_until(Duration::from_secs(30), || db.merge_stats(2).merge_count >= count
            && !db.merge_stats(2).active),
        "disk merge never completed"
    );
    Ok(written)
}

#[test]
fn tombstone_shadows_value_in_c2() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Blsm::open(dir.path(), small_options())?;
    let scheduler = MergeScheduler::start(&db)?;

    db.insert_tuple(put("x", "X"))?;
    db.flush_table()?;
    // Push enough unrelated data through to cascade "x" down into C2.
    pump_until_disk_merges(&db, "fill", 1, 80)?;

    assert_eq!(
        db.find_tuple(b"x")?.unwrap().value().unwrap().as_ref(),
        b"X"
    );

    db.delete(&b"x"[..])?;
    assert!(db.find_tuple(b"x")?.is_none());

    // The suppressing iterator skips "x"; the raw one returns the
    // tombstone.
    let mut iter = db.iterator(Some(&b"x"[..]))?;
    if let Some(t) = iter.next()? {
        assert_ne!(t.stripped_key(), b"x");
    }
    let mut iter = db.iterator(Some(&b"x"[..]))?;
    let t = iter.next_including_tombstones()?.unwrap();
    assert_eq!(t.stripped_key(), b"x");
    assert!(t.is_tombstone());

    scheduler.shutdown()?;
    Ok(())
}

#[test]
fn cascades_survive_restart() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let mut expected = Vec::new();
    {
        let opts = BlsmOptions {
            max_c0_size: 64 * 1024,
            rate_limit: None,
            ..BlsmOptions::default()
        };
        let db = Blsm::open(dir.path(), opts)?;
        let scheduler = MergeScheduler::start(&db)?;

        // ~1 MiB of distinct keys, enough for two cascades at 64 KiB runs.
        let mut batch = 0;
        while db.merge_stats(2).merge_count < 2 {
            assert!(batch < 100, "cascades never happened");
            for i in 0..500 {
                let key = format!("key{batch:03}{i:04}");
                db.insert_tuple(put(&key, &format!("val{batch:03}{i:04}")))?;
                expected.push(key);
            }
            db.flush_table()?;
            batch += 1;
        }
        scheduler.shutdown()?;
    }

    expected.sort();
    let db = Blsm::open(
        dir.path(),
        BlsmOptions {
            max_c0_size: 64 * 1024,
            ..BlsmOptions::default()
        },
    )?;
    let mut iter = db.iterator(None)?;
    let mut scanned = Vec::new();
    while let Some(t) = iter.next()? {
        let key = String::from_utf8(t.stripped_key().to_vec()).unwrap();
        let value = t.value().unwrap();
        assert_eq!(value.as_ref(), format!("val{}", &key[3..]).as_bytes());
        scanned.push(key);
    }
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn ratio_tracks_c2_growth() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Blsm::open(dir.path(), small_options())?;
    let scheduler = MergeScheduler::start(&db)?;

    assert_eq!(db.r(), MIN_R);
    pump_until_disk_merges(&db, "grow", 1, 80)?;

    let expected = MIN_R.max(
        (db.merge_stats(2).base_size as f64 / db.mean_c0_run_length().max(1) as f64).sqrt(),
    );
    let r = db.r();
    assert!(r >= MIN_R);
    assert!(
        (r - expected).abs() < 0.5,
        "r {r} diverged from expected {expected}"
    );

    scheduler.shutdown()?;
    Ok(())
}

#[test]
fn merge_outputs_do_not_shrink_below_inputs() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Blsm::open(dir.path(), small_options())?;
    let scheduler = MergeScheduler::start(&db)?;

    pump_until_disk_merges(&db, "size", 1, 80)?;
    let after_first = db.metrics();
    assert!(after_first.c2_bytes > 0);

    // No overwrites or deletes: the next disk merge can only grow C2.
    pump_until_disk_merges(&db, "tail", 2, 80)?;
    let after_second = db.metrics();
    assert!(
        after_second.c2_bytes >= after_first.c2_bytes,
        "c2 shrank from {} to {}",
        after_first.c2_bytes,
        after_second.c2_bytes
    );
    assert!(db.merge_stats(1).merge_count > 0);

    scheduler.shutdown()?;
    Ok(())
}
