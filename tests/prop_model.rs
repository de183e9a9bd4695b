//! Model-based check: a random op sequence applied to the store and to an
//! in-memory map must agree, including across a close/reopen.

use std::collections::BTreeMap;

use proptest::prelude::*;
use stratadb::{Db, Error, Options};
use tempfile::TempDir;

const KEY_SPACE: u8 = 8;

#[derive(Debug, Clone)]
enum MiniOp {
    Put { key: u8, value: u8 },
    Remove { key: u8 },
}

fn key_bytes(key: u8) -> Vec<u8> {
    vec![b'a' + key]
}

fn value_bytes(value: u8) -> Vec<u8> {
    vec![b'0' + (value % 10)]
}

fn options() -> Options {
    Options {
        create_if_needed: true,
        disable_auto_merge: true,
        ..Options::default()
    }
}

fn op_strategy() -> impl Strategy<Value = MiniOp> {
    prop_oneof![
        (0..KEY_SPACE, any::<u8>()).prop_map(|(key, value)| MiniOp::Put { key, value }),
        (0..KEY_SPACE).prop_map(|key| MiniOp::Remove { key }),
    ]
}

fn apply(db: &Db, model: &mut BTreeMap<Vec<u8>, Vec<u8>>, op: &MiniOp) {
    match op {
        MiniOp::Put { key, value } => {
            let key = key_bytes(*key);
            let value = value_bytes(*value);
            db.put(key.clone(), value.clone()).expect("put");
            model.insert(key, value);
        }
        MiniOp::Remove { key } => {
            let key = key_bytes(*key);
            match db.remove(&key) {
                Ok(previous) => {
                    let expected = model.remove(&key).expect("model had the key");
                    assert_eq!(previous.as_ref(), expected.as_slice());
                }
                Err(Error::KeyNotFound) => {
                    assert!(model.remove(&key).is_none());
                }
                Err(err) => panic!("remove failed: {err}"),
            }
        }
    }
}

fn check(db: &Db, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let scanned: Vec<(Vec<u8>, Vec<u8>)> = db
        .lookup(None, None)
        .expect("lookup")
        .map(|record| record.map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect::<stratadb::Result<_>>()
        .expect("scan");
    let expected: Vec<(Vec<u8>, Vec<u8>)> = model
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    assert_eq!(scanned, expected);

    for key in 0..KEY_SPACE {
        let key = key_bytes(key);
        match model.get(&key) {
            Some(value) => assert_eq!(db.get(&key).expect("get").as_ref(), value.as_slice()),
            None => assert!(matches!(db.get(&key), Err(Error::KeyNotFound))),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        ..ProptestConfig::default()
    })]

    #[test]
    fn store_matches_model(
        ops in proptest::collection::vec(op_strategy(), 1..60),
        reopen_at in 0usize..60,
    ) {
        let dir = TempDir::new().unwrap();
        let mut model = BTreeMap::new();

        let mut db = Db::open(dir.path(), options()).unwrap();
        for (index, op) in ops.iter().enumerate() {
            if index == reopen_at {
                check(&db, &model);
                db.close().unwrap();
                db = Db::open(dir.path(), options()).unwrap();
            }
            apply(&db, &mut model, op);
        }

        check(&db, &model);
        db.close_with_merge(1).unwrap();

        let db = Db::open(dir.path(), options()).unwrap();
        check(&db, &model);
        db.close().unwrap();
    }
}
