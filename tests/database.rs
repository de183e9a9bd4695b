use bytes::Bytes;
use stratadb::{Db, Error, Options};
use tempfile::TempDir;

fn options() -> Options {
    Options {
        create_if_needed: true,
        disable_auto_merge: true,
        ..Options::default()
    }
}

fn count_segment_files(path: &std::path::Path) -> usize {
    std::fs::read_dir(path)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            name.starts_with("keys.") || name.starts_with("data.")
        })
        .count()
}

#[test]
fn put_get_remove() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    db.put("mykey", "myvalue")?;
    assert_eq!(db.get(b"mykey")?, Bytes::from("myvalue"));
    db.put("mykey2", "myvalue2")?;
    assert_eq!(db.get(b"mykey2")?, Bytes::from("myvalue2"));

    let large = vec![b'k'; 1025];
    assert!(matches!(db.put(large, "myvalue"), Err(Error::KeyTooLong)));
    assert!(matches!(db.put("", "myvalue"), Err(Error::EmptyKey)));
    assert!(matches!(db.get(b"missing"), Err(Error::KeyNotFound)));

    let previous = db.remove(b"mykey")?;
    assert_eq!(previous, Bytes::from("myvalue"));
    assert!(matches!(db.get(b"mykey"), Err(Error::KeyNotFound)));
    assert!(matches!(db.remove(b"mykey"), Err(Error::KeyNotFound)));

    db.close_with_merge(1)?;

    let db = Db::open(dir.path(), options())?;
    assert!(matches!(db.get(b"mykey"), Err(Error::KeyNotFound)));
    assert_eq!(db.get(b"mykey2")?, Bytes::from("myvalue2"));
    db.close()?;
    Ok(())
}

#[test]
fn operations_fail_after_close() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;
    db.put("k", "v")?;
    db.close()?;

    assert!(matches!(db.get(b"k"), Err(Error::DatabaseClosed)));
    assert!(matches!(db.put("k", "v"), Err(Error::DatabaseClosed)));
    assert!(matches!(db.close(), Err(Error::DatabaseClosed)));
    Ok(())
}

#[test]
fn range_iteration() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;
    db.put("mykey", "myvalue")?;
    db.put("mykey2", "myvalue2")?;
    db.put("mykey3", "myvalue3")?;

    let mut iter = db.lookup(Some(b"mykey2".as_slice()), None)?;
    let (key, value) = iter.next().unwrap()?;
    assert_eq!((key, value), (Bytes::from("mykey2"), Bytes::from("myvalue2")));
    let (key, value) = iter.next().unwrap()?;
    assert_eq!((key, value), (Bytes::from("mykey3"), Bytes::from("myvalue3")));
    assert!(iter.next().is_none());

    let below: Vec<_> = db
        .lookup(None, Some(b"mykey2".as_slice()))?
        .collect::<stratadb::Result<Vec<_>>>()?;
    assert_eq!(below.len(), 2);

    let exact: Vec<_> = db
        .lookup(Some(b"mykey2".as_slice()), Some(b"mykey2".as_slice()))?
        .collect::<stratadb::Result<Vec<_>>>()?;
    assert_eq!(exact, vec![(Bytes::from("mykey2"), Bytes::from("myvalue2"))]);

    let mut beyond = db.lookup(Some(b"mykey4".as_slice()), None)?;
    assert!(beyond.next().is_none());

    db.close()?;
    Ok(())
}

#[test]
fn persistence_across_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;
    db.put("mykey", "myvalue")?;
    db.close()?;

    let db = Db::open(dir.path(), options())?;
    assert_eq!(db.get(b"mykey")?, Bytes::from("myvalue"));
    db.close()?;
    Ok(())
}

#[test]
fn removed_keys_stay_removed_across_merges() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let db = Db::open(dir.path(), options())?;
    db.put("mykey", "myvalue")?;
    assert_eq!(db.get(b"mykey")?, Bytes::from("myvalue"));
    db.close_with_merge(1)?;

    let db = Db::open(dir.path(), options())?;
    db.remove(b"mykey")?;
    assert!(matches!(db.get(b"mykey"), Err(Error::KeyNotFound)));
    db.close_with_merge(1)?;

    let db = Db::open(dir.path(), options())?;
    assert!(matches!(db.get(b"mykey"), Err(Error::KeyNotFound)));
    let mut iter = db.lookup(None, None)?;
    assert!(iter.next().is_none(), "full scan must be empty");
    drop(iter);
    db.close_with_merge(1)?;
    Ok(())
}

#[test]
fn merge_bounds_segment_files() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let cycles = 100;

    for _ in 0..cycles {
        let db = Db::open(dir.path(), options())?;
        for i in 0..100 {
            db.put(format!("mykey{i}"), format!("myvalue{i}"))?;
        }
        db.close_with_merge(0)?;
    }
    assert_eq!(count_segment_files(dir.path()), cycles * 2);

    let db = Db::open(dir.path(), options())?;
    db.close_with_merge(1)?;
    assert_eq!(count_segment_files(dir.path()), 2);

    let db = Db::open(dir.path(), options())?;
    let count = db.lookup(None, None)?.count();
    assert_eq!(count, 100);
    db.close()?;
    Ok(())
}

#[test]
fn batches_are_applied_atomically() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;
    db.put("a", "1")?;

    let mut batch = stratadb::WriteBatch::new();
    batch.put("b", "2");
    batch.remove("a");
    db.write(batch)?;

    assert!(matches!(db.get(b"a"), Err(Error::KeyNotFound)));
    assert_eq!(db.get(b"b")?, Bytes::from("2"));

    // A batch with an invalid key is rejected before any entry applies.
    let mut bad = stratadb::WriteBatch::new();
    bad.put("c", "3");
    bad.put("", "oops");
    assert!(matches!(db.write(bad), Err(Error::EmptyKey)));
    assert!(matches!(db.get(b"c"), Err(Error::KeyNotFound)));

    db.close()?;
    Ok(())
}

#[test]
fn stats_reports_segment_count() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    for _ in 0..3 {
        let db = Db::open(dir.path(), options())?;
        db.put("k", "v")?;
        db.close_with_merge(0)?;
    }

    let db = Db::open(dir.path(), options())?;
    assert_eq!(db.stats()?.num_segments, 3);
    db.close()?;
    Ok(())
}

#[test]
fn foreground_merge_backpressure_bounds_the_stack() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    for _ in 0..40 {
        let db = Db::open(dir.path(), options())?;
        db.put("k", "v")?;
        db.close_with_merge(0)?;
    }

    // Auto-merge on: the first mutation sees > 2x the cap and pays for a
    // synchronous merge pass down to the cap.
    let db = Db::open(
        dir.path(),
        Options {
            create_if_needed: true,
            ..Options::default()
        },
    )?;
    db.put("trigger", "v")?;
    let stats = db.stats()?;
    assert!(
        stats.num_segments <= 16,
        "expected backpressure to bound segments, got {}",
        stats.num_segments
    );
    db.close()?;
    Ok(())
}

#[test]
fn open_validates_the_directory() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let missing = dir.path().join("nope");
    assert!(matches!(
        Db::open(&missing, Options::default()),
        Err(Error::NoDatabaseFound)
    ));

    let stray = dir.path().join("other");
    std::fs::create_dir(&stray)?;
    std::fs::write(stray.join("README"), b"not a database")?;
    assert!(matches!(
        Db::open(&stray, options()),
        Err(Error::NotValidDatabase)
    ));

    let file = dir.path().join("plain");
    std::fs::write(&file, b"x")?;
    assert!(matches!(
        stratadb::is_valid_database(&file),
        Err(Error::NotADirectory)
    ));
    Ok(())
}

#[test]
fn second_open_sees_database_in_use() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;
    assert!(matches!(
        Db::open(dir.path(), options()),
        Err(Error::DatabaseInUse)
    ));
    db.close()?;

    let db = Db::open(dir.path(), options())?;
    db.close()?;
    Ok(())
}

#[test]
fn destroy_removes_everything() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("db");
    let db = Db::open(&path, options())?;
    db.put("k", "v")?;
    db.close()?;

    Db::destroy(&path)?;
    assert!(matches!(
        stratadb::is_valid_database(&path),
        Err(Error::NoDatabaseFound)
    ));
    Ok(())
}

#[test]
fn custom_comparator_orders_the_database() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let reverse: stratadb::KeyCompare = std::sync::Arc::new(|a, b| b.cmp(a));
    let open = || {
        Db::open(
            dir.path(),
            Options {
                create_if_needed: true,
                disable_auto_merge: true,
                user_key_compare: Some(reverse.clone()),
                ..Options::default()
            },
        )
    };

    let db = open()?;
    db.put("a", "1")?;
    db.put("c", "3")?;
    db.put("b", "2")?;
    let keys: Vec<Bytes> = db
        .lookup(None, None)?
        .map(|r| r.map(|(k, _)| k))
        .collect::<stratadb::Result<_>>()?;
    assert_eq!(keys, ["c", "b", "a"]);
    db.close()?;

    // Same order after flushing to disk segments.
    let db = open()?;
    let keys: Vec<Bytes> = db
        .lookup(None, None)?
        .map(|r| r.map(|(k, _)| k))
        .collect::<stratadb::Result<_>>()?;
    assert_eq!(keys, ["c", "b", "a"]);
    assert_eq!(db.get(b"b")?, Bytes::from("2"));
    db.close()?;
    Ok(())
}
