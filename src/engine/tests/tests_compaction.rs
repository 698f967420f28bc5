#[cfg(test)]
mod tests {
    use crate::engine::tests::helpers::{init_tracing, tiny_config};
    use crate::engine::Db;
    use crate::levels::group_by_level;
    use tempfile::TempDir;

    #[test]
    fn test_compaction_preserves_reads() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        for i in 0..1000u32 {
            db.put(format!("key-{i:06}").into_bytes(), format!("value-{i}").into_bytes())
                .unwrap();
            if i % 200 == 199 {
                db.flush().unwrap();
            }
        }
        db.flush().unwrap();
        db.compact().unwrap();

        for i in 0..1000u32 {
            assert_eq!(
                db.get(format!("key-{i:06}").as_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes()),
                "key-{i:06} lost by compaction"
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn test_compaction_drains_l0() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        // Build more L0 runs than the trigger allows.
        for round in 0..6u32 {
            for i in 0..50u32 {
                db.put(
                    format!("key-{:06}", round * 50 + i).into_bytes(),
                    vec![b'v'; 16],
                )
                .unwrap();
            }
            db.flush().unwrap();
        }
        db.compact().unwrap();

        let stats = db.stats().unwrap();
        assert!(
            stats.levels[0].runs < tiny_config().l0_compaction_trigger,
            "L0 still over trigger: {} runs",
            stats.levels[0].runs
        );
        db.close().unwrap();
    }

    #[test]
    fn test_deeper_levels_stay_disjoint() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        for i in 0..3000u32 {
            db.put(format!("key-{i:06}").into_bytes(), vec![b'v'; 48])
                .unwrap();
            if i % 300 == 299 {
                db.flush().unwrap();
                db.compact().unwrap();
            }
        }
        db.flush().unwrap();
        db.compact().unwrap();

        let runs = db.pinned_runs_for_test().unwrap();
        let levels = group_by_level(&runs);
        for (level, level_runs) in levels.iter().enumerate().skip(1) {
            for pair in level_runs.windows(2) {
                assert!(
                    pair[0].max_key() < pair[1].min_key(),
                    "L{level} runs overlap"
                );
            }
        }
        db.close().unwrap();
    }

    #[test]
    fn test_overwrites_collapse_during_compaction() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        for round in 0..5u32 {
            for i in 0..100u32 {
                db.put(
                    format!("key-{i:03}").into_bytes(),
                    format!("round-{round}").into_bytes(),
                )
                .unwrap();
            }
            db.flush().unwrap();
        }
        db.compact().unwrap();

        for i in 0..100u32 {
            assert_eq!(
                db.get(format!("key-{i:03}").as_bytes()).unwrap(),
                Some(b"round-4".to_vec())
            );
        }
        db.close().unwrap();
    }

    #[test]
    fn test_tombstones_vanish_at_bottom_level() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();

        for i in 0..500u32 {
            db.put(format!("key-{i:04}").into_bytes(), vec![b'v'; 32])
                .unwrap();
        }
        db.flush().unwrap();

        // Delete the even half.
        for i in (0..500u32).step_by(2) {
            db.delete(format!("key-{i:04}").into_bytes()).unwrap();
        }
        db.flush().unwrap();
        db.compact().unwrap();

        // Deleted keys stay dead, surviving keys stay live.
        for i in 0..500u32 {
            let got = db.get(format!("key-{i:04}").as_bytes()).unwrap();
            if i % 2 == 0 {
                assert_eq!(got, None);
            } else {
                assert!(got.is_some());
            }
        }

        // The bottom-level runs must hold no tombstones at all: entry
        // counts add up to exactly the live keys.
        let runs = db.pinned_runs_for_test().unwrap();
        let total: u64 = runs.iter().map(|r| r.entry_count()).sum();
        assert_eq!(total, 250, "tombstones survived the bottom level");
        db.close().unwrap();
    }

    #[test]
    fn test_compact_on_empty_store() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), tiny_config()).unwrap();
        db.compact().unwrap();
        db.close().unwrap();
    }
}
