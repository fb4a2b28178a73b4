use blsm::{Blsm, BlsmOptions, LogMode, MergeScheduler, Tuple};
use bytes::Bytes;
use tempfile::TempDir;

fn put(key: &str, value: &str) -> Tuple {
    Tuple::put(
        Bytes::copy_from_slice(key.as_bytes()),
        Bytes::copy_from_slice(value.as_bytes()),
        0,
    )
}

fn value_of(db: &Blsm, key: &[u8]) -> anyhow::Result<Option<Bytes>> {
    Ok(db.find_tuple(key)?.and_then(|t| t.value().cloned()))
}

#[test]
fn insert_and_lookup_single_level() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let opts = BlsmOptions {
        max_c0_size: 1024 * 1024,
        ..BlsmOptions::default()
    };
    let db = Blsm::open(dir.path(), opts)?;
    let scheduler = MergeScheduler::start(&db)?;

    let tuples: Vec<Tuple> = (0..1000)
        .map(|i| put(&format!("k{i:04}"), &format!("v{i:04}")))
        .collect();
    db.insert_many_tuples(tuples)?;

    assert_eq!(value_of(&db, b"k0500")?, Some(Bytes::from("v0500")));
    assert_eq!(value_of(&db, b"missing")?, None);

    scheduler.shutdown()?;
    Ok(())
}

#[test]
fn overwrite_survives_a_merge() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let opts = BlsmOptions {
        max_c0_size: 64 * 1024,
        ..BlsmOptions::default()
    };
    let db = Blsm::open(dir.path(), opts)?;
    let scheduler = MergeScheduler::start(&db)?;

    db.insert_tuple(put("a", "1"))?;
    db.flush_table()?;
    db.insert_tuple(put("a", "2"))?;

    assert_eq!(value_of(&db, b"a")?, Some(Bytes::from("2")));

    // Exactly one version of "a" comes back, and it is the newest.
    let mut iter = db.iterator(None)?;
    let mut versions = Vec::new();
    while let Some(t) = iter.next()? {
        if t.stripped_key() == b"a" {
            versions.push(t.value().unwrap().clone());
        }
    }
    assert_eq!(versions, vec![Bytes::from("2")]);

    scheduler.shutdown()?;
    Ok(())
}

#[test]
fn wal_replay_recovers_unmerged_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let opts = BlsmOptions {
        log_mode: LogMode::Sync,
        ..BlsmOptions::default()
    };
    {
        let db = Blsm::open(dir.path(), opts.clone())?;
        db.insert_tuple(put("a", "1"))?;
        db.insert_tuple(put("b", "2"))?;
        db.delete(&b"a"[..])?;
        // No scheduler, no flush: the writes only live in C0 and the log.
    }
    let db = Blsm::open(dir.path(), opts)?;
    assert_eq!(value_of(&db, b"a")?, None);
    assert_eq!(value_of(&db, b"b")?, Some(Bytes::from("2")));
    Ok(())
}

#[test]
fn clean_shutdown_flushes_c0() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let opts = BlsmOptions::default();
    {
        let db = Blsm::open(dir.path(), opts.clone())?;
        let scheduler = MergeScheduler::start(&db)?;
        for i in 0..100 {
            db.insert_tuple(put(&format!("k{i:03}"), "v"))?;
        }
        scheduler.shutdown()?;
    }
    // Nothing was logged; the data must have reached C1 at shutdown.
    let db = Blsm::open(dir.path(), opts)?;
    for i in 0..100 {
        assert_eq!(
            value_of(&db, format!("k{i:03}").as_bytes())?,
            Some(Bytes::from("v"))
        );
    }
    Ok(())
}

#[test]
fn randomized_overwrites_scan_sorted_with_latest_values() -> anyhow::Result<()> {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let dir = TempDir::new()?;
    let opts = BlsmOptions {
        max_c0_size: 16 * 1024,
        rate_limit: None,
        ..BlsmOptions::default()
    };
    let db = Blsm::open(dir.path(), opts)?;
    let scheduler = MergeScheduler::start(&db)?;

    // Random keys from a small space force heavy overwriting while merges
    // run underneath; the newest value per key must win everywhere.
    let mut rng = StdRng::seed_from_u64(7);
    let mut latest = std::collections::BTreeMap::new();
    for _ in 0..5_000 {
        let k: u32 = rng.gen_range(0..1_000);
        let v: u32 = rng.gen();
        let key = format!("k{k:04}");
        let value = format!("v{v:010}");
        db.insert_tuple(put(&key, &value))?;
        latest.insert(key, value);
    }
    db.flush_table()?;

    let mut iter = db.iterator(None)?;
    let mut scanned = Vec::new();
    while let Some(t) = iter.next()? {
        let key = String::from_utf8(t.stripped_key().to_vec()).unwrap();
        let value = String::from_utf8(t.value().unwrap().to_vec()).unwrap();
        scanned.push((key, value));
    }
    assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
    let expected: Vec<(String, String)> = latest.into_iter().collect();
    assert_eq!(scanned, expected);

    scheduler.shutdown()?;
    Ok(())
}

#[test]
fn flush_after_stop_is_refused() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Blsm::open(dir.path(), BlsmOptions::default())?;
    let scheduler = MergeScheduler::start(&db)?;
    scheduler.shutdown()?;
    assert!(matches!(db.flush_table(), Err(blsm::Error::ShuttingDown)));
    Ok(())
}
