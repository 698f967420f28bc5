#[cfg(test)]
mod tests {
    use crate::engine::{DbConfig, Entry};
    use crate::levels::{
        bottom_level, group_by_level, level_budget, pick_job, run_path,
    };
    use crate::sstable::{RunWriter, SortedRun};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Builds a run at `level` covering `[lo, hi]` with one entry per key.
    fn make_run(tmp: &TempDir, id: u64, level: u32, lo: u8, hi: u8) -> Arc<SortedRun> {
        let entries: Vec<Entry> = (lo..=hi)
            .map(|k| Entry::put(vec![k], vec![k, k], u64::from(k) + id * 1000))
            .collect();
        let count = entries.len();
        let path = run_path(tmp.path(), level, id);
        RunWriter::new(&path).build(entries.into_iter(), count).unwrap();
        Arc::new(SortedRun::open(&path, id, level).unwrap())
    }

    fn small_config() -> DbConfig {
        DbConfig {
            l0_compaction_trigger: 4,
            level_base_bytes: 1024,
            level_growth_factor: 10,
            target_run_bytes: 64 * 1024,
            ..DbConfig::default()
        }
    }

    #[test]
    fn test_group_by_level_orders_l0_newest_first() {
        let tmp = TempDir::new().unwrap();
        let runs = vec![
            make_run(&tmp, 1, 0, b'a', b'm'),
            make_run(&tmp, 3, 0, b'a', b'm'),
            make_run(&tmp, 2, 0, b'a', b'm'),
        ];

        let levels = group_by_level(&runs);
        let l0_ids: Vec<u64> = levels[0].iter().map(|r| r.id).collect();
        assert_eq!(l0_ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_group_by_level_orders_deep_levels_by_key() {
        let tmp = TempDir::new().unwrap();
        let runs = vec![
            make_run(&tmp, 2, 1, b'n', b'z'),
            make_run(&tmp, 1, 1, b'a', b'm'),
        ];

        let levels = group_by_level(&runs);
        assert!(levels[0].is_empty());
        let l1_ids: Vec<u64> = levels[1].iter().map(|r| r.id).collect();
        assert_eq!(l1_ids, vec![1, 2]);
    }

    #[test]
    fn test_no_job_below_thresholds() {
        let tmp = TempDir::new().unwrap();
        let runs = vec![
            make_run(&tmp, 1, 0, b'a', b'm'),
            make_run(&tmp, 2, 0, b'a', b'm'),
        ];

        assert!(pick_job(&runs, &small_config()).is_none());
    }

    #[test]
    fn test_l0_trigger_selects_all_l0_plus_overlapping_l1() {
        let tmp = TempDir::new().unwrap();
        let runs = vec![
            make_run(&tmp, 1, 0, b'a', b'm'),
            make_run(&tmp, 2, 0, b'c', b'p'),
            make_run(&tmp, 3, 0, b'a', b'f'),
            make_run(&tmp, 4, 0, b'k', b'z'),
            // Overlaps the combined [a, z] range.
            make_run(&tmp, 5, 1, b'h', b'j'),
        ];

        let job = pick_job(&runs, &small_config()).expect("L0 trigger should fire");
        assert_eq!(job.source_level, 0);
        assert_eq!(job.target_level, 1);
        let mut ids: Vec<u64> = job.inputs.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        // L1 is the deepest populated level and fully consumed: spent
        // tombstones may go.
        assert!(job.drop_tombstones);
    }

    #[test]
    fn test_l0_job_excludes_disjoint_l1_runs() {
        let tmp = TempDir::new().unwrap();
        let runs = vec![
            make_run(&tmp, 1, 0, b'a', b'c'),
            make_run(&tmp, 2, 0, b'a', b'c'),
            make_run(&tmp, 3, 0, b'a', b'c'),
            make_run(&tmp, 4, 0, b'a', b'c'),
            // Far to the right of every L0 run.
            make_run(&tmp, 5, 1, b'x', b'z'),
        ];

        let job = pick_job(&runs, &small_config()).unwrap();
        assert!(!job.inputs.iter().any(|r| r.id == 5));
    }

    #[test]
    fn test_tombstones_kept_when_deeper_data_exists() {
        let tmp = TempDir::new().unwrap();
        let runs = vec![
            make_run(&tmp, 1, 0, b'a', b'c'),
            make_run(&tmp, 2, 0, b'a', b'c'),
            make_run(&tmp, 3, 0, b'a', b'c'),
            make_run(&tmp, 4, 0, b'a', b'c'),
            // L2 data lies below the L0→L1 output.
            make_run(&tmp, 5, 2, b'a', b'c'),
        ];

        let job = pick_job(&runs, &small_config()).unwrap();
        assert_eq!(job.target_level, 1);
        assert!(!job.drop_tombstones);
    }

    #[test]
    fn test_over_budget_level_picks_oldest_run() {
        let tmp = TempDir::new().unwrap();
        // Budget of L1 is base · 10 = 320 bytes; two runs of ~hundreds
        // of bytes each exceed it.
        let config = DbConfig {
            level_base_bytes: 32,
            ..small_config()
        };
        let runs = vec![
            make_run(&tmp, 7, 1, b'a', b'm'),
            make_run(&tmp, 4, 1, b'n', b'z'),
            make_run(&tmp, 9, 2, b'a', b'z'),
        ];

        let job = pick_job(&runs, &config).expect("budget trigger should fire");
        assert_eq!(job.source_level, 1);
        assert_eq!(job.target_level, 2);
        // Oldest L1 run (lowest id) is the victim.
        assert!(job.inputs.iter().any(|r| r.id == 4));
        assert!(!job.inputs.iter().any(|r| r.id == 7));
        // The overlapping L2 run joins the merge.
        assert!(job.inputs.iter().any(|r| r.id == 9));
        assert!(job.drop_tombstones);
    }

    #[test]
    fn test_level_budget_growth() {
        let config = DbConfig {
            level_base_bytes: 1000,
            level_growth_factor: 10,
            ..DbConfig::default()
        };
        assert_eq!(level_budget(&config, 1), 10_000);
        assert_eq!(level_budget(&config, 2), 100_000);
        assert_eq!(level_budget(&config, 3), 1_000_000);
    }

    #[test]
    fn test_bottom_level_tracks_deepest_population() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(bottom_level(&[]), 0);

        let runs = vec![make_run(&tmp, 1, 0, b'a', b'b'), make_run(&tmp, 2, 3, b'a', b'b')];
        assert_eq!(bottom_level(&runs), 3);
    }
}
