#[cfg(test)]
mod tests {
    use crate::engine::tests::helpers::{init_tracing, tiny_config};
    use crate::engine::Db;
    use rand::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Randomized workload checked against a BTreeMap model.
    #[test]
    fn test_random_ops_match_model() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0xB10C);

        for op in 0..5000u32 {
            let key = format!("key-{:03}", rng.random_range(0..300)).into_bytes();
            match rng.random_range(0..10) {
                0..=6 => {
                    let value = format!("value-{op}").into_bytes();
                    db.put(key.clone(), value.clone()).unwrap();
                    model.insert(key, value);
                }
                7..=8 => {
                    db.delete(key.clone()).unwrap();
                    model.remove(&key);
                }
                _ => {
                    assert_eq!(
                        db.get(&key).unwrap(),
                        model.get(&key).cloned(),
                        "model divergence at op {op}"
                    );
                }
            }

            if op % 1000 == 999 {
                db.flush().unwrap();
            }
            if op % 2500 == 2499 {
                db.compact().unwrap();
            }
        }

        // Full comparison at the end, both point reads and the scan.
        for (key, value) in &model {
            assert_eq!(db.get(key).unwrap().as_ref(), Some(value));
        }
        let scanned: Vec<(Vec<u8>, Vec<u8>)> = db.scan(None, None).unwrap().collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(scanned, expected);

        db.close().unwrap();
    }

    /// Model equivalence must also hold through a restart.
    #[test]
    fn test_random_ops_survive_restart() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        {
            let db = Db::open(tmp.path(), tiny_config()).unwrap();
            for op in 0..2000u32 {
                let key = format!("key-{:03}", rng.random_range(0..150)).into_bytes();
                if rng.random_range(0..5) < 4 {
                    let value = format!("value-{op}").into_bytes();
                    db.put(key.clone(), value.clone()).unwrap();
                    model.insert(key, value);
                } else {
                    db.delete(key.clone()).unwrap();
                    model.remove(&key);
                }
            }
            db.close().unwrap();
        }

        let db = Db::open(tmp.path(), tiny_config()).unwrap();
        let scanned: Vec<(Vec<u8>, Vec<u8>)> = db.scan(None, None).unwrap().collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(scanned, expected);
        db.close().unwrap();
    }

    /// Concurrent readers and one writer; smoke test for lock handling.
    #[test]
    fn test_concurrent_reads_during_writes() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        for i in 0..200u32 {
            db.put(format!("warm-{i:03}").into_bytes(), vec![b'v'; 16])
                .unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|t| {
                let db = db.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = format!("warm-{:03}", (i * 7 + t * 13) % 200);
                        let got = db.get(key.as_bytes()).unwrap();
                        assert!(got.is_some(), "{key} vanished during concurrent writes");
                    }
                })
            })
            .collect();

        for i in 0..500u32 {
            db.put(format!("new-{i:04}").into_bytes(), vec![b'w'; 16])
                .unwrap();
        }

        for handle in readers {
            handle.join().unwrap();
        }
        db.close().unwrap();
    }
}
