use std::sync::Arc;

use bytes::Bytes;
use stratadb::{Db, Error, Options};
use tempfile::TempDir;

fn options() -> Options {
    Options {
        create_if_needed: true,
        ..Options::default()
    }
}

#[test]
fn concurrent_writers_and_readers() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let writers = 2usize;
    let per_writer = 500usize;

    {
        let db = Arc::new(Db::open(dir.path(), options())?);
        let mut threads = Vec::new();

        for writer in 0..writers {
            let db = Arc::clone(&db);
            threads.push(std::thread::spawn(move || -> stratadb::Result<()> {
                for i in 0..per_writer {
                    let key = format!("w{writer}_k{i:04}");
                    let value = format!("v{writer}_{i:04}");
                    db.put(key, value)?;
                }
                Ok(())
            }));
        }

        for reader in 0..2usize {
            let db = Arc::clone(&db);
            threads.push(std::thread::spawn(move || -> stratadb::Result<()> {
                for i in 0..per_writer {
                    let writer = (reader + i) % writers;
                    let key = format!("w{writer}_k{i:04}");
                    match db.get(key.as_bytes()) {
                        // A reader may run ahead of the writer.
                        Ok(value) => {
                            assert_eq!(value, Bytes::from(format!("v{writer}_{i:04}")));
                        }
                        Err(Error::KeyNotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }));
        }

        for thread in threads {
            thread.join().expect("thread panicked")?;
        }

        let records: Vec<(Bytes, Bytes)> = db
            .lookup(None, None)?
            .collect::<stratadb::Result<Vec<_>>>()?;
        assert_eq!(records.len(), writers * per_writer);
        for window in records.windows(2) {
            assert!(window[0].0 < window[1].0, "scan must be strictly ordered");
        }

        db.close()?;
    }

    let db = Db::open(dir.path(), options())?;
    for writer in 0..writers {
        for i in 0..per_writer {
            let key = format!("w{writer}_k{i:04}");
            assert_eq!(
                db.get(key.as_bytes())?,
                Bytes::from(format!("v{writer}_{i:04}"))
            );
        }
    }
    db.close()?;
    Ok(())
}

#[test]
fn readers_keep_a_consistent_view_across_rollover() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let db = Db::open(dir.path(), options())?;

    // Values sized so a few thousand puts cross the rollover threshold.
    let value = vec![b'v'; 1024];
    for i in 0..1500usize {
        db.put(format!("key{i:05}"), value.clone())?;
    }
    assert!(
        db.stats()?.num_segments >= 1,
        "memory segment should have rolled over"
    );

    let mut iter = db.lookup(Some(b"key00100".as_slice()), Some(b"key00199".as_slice()))?;
    let mut count = 0;
    while let Some(record) = iter.next() {
        record?;
        count += 1;
    }
    assert_eq!(count, 100);

    db.close()?;
    Ok(())
}
