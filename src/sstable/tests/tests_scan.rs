#[cfg(test)]
mod tests {
    use crate::engine::Entry;
    use crate::sstable::{RunWriter, SortedRun};
    use tempfile::TempDir;

    fn build_run(tmp: &TempDir, count: usize) -> SortedRun {
        let entries: Vec<Entry> = (0..count)
            .map(|i| Entry::put(format!("key-{i:05}"), format!("value-{i:05}"), i as u64 + 1))
            .collect();
        let path = tmp.path().join("L1-000002.sst");
        RunWriter::new(&path).build(entries.into_iter(), count).unwrap();
        SortedRun::open(&path, 2, 1).unwrap()
    }

    #[test]
    fn test_full_iteration_in_order() {
        let tmp = TempDir::new().unwrap();
        // Enough entries to span many blocks (16 entries per block).
        let run = build_run(&tmp, 1000);

        let keys: Vec<Vec<u8>> = run.iter().map(|e| e.key).collect();
        assert_eq!(keys.len(), 1000);
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "scan out of order");
    }

    #[test]
    fn test_bounded_scan_inclusive() {
        let tmp = TempDir::new().unwrap();
        let run = build_run(&tmp, 100);

        let keys: Vec<Vec<u8>> = run
            .scan(Some(b"key-00010"), Some(b"key-00020"))
            .map(|e| e.key)
            .collect();
        assert_eq!(keys.len(), 11);
        assert_eq!(keys.first().unwrap(), b"key-00010");
        assert_eq!(keys.last().unwrap(), b"key-00020");
    }

    #[test]
    fn test_scan_from_before_first_key() {
        let tmp = TempDir::new().unwrap();
        let run = build_run(&tmp, 20);

        let count = run.scan(Some(b"aaa"), None).count();
        assert_eq!(count, 20);
    }

    #[test]
    fn test_scan_past_last_key_is_empty() {
        let tmp = TempDir::new().unwrap();
        let run = build_run(&tmp, 20);

        assert_eq!(run.scan(Some(b"zzz"), None).count(), 0);
    }

    #[test]
    fn test_scan_is_restartable() {
        let tmp = TempDir::new().unwrap();
        let run = build_run(&tmp, 50);

        // Each call returns a fresh cursor over the same data.
        let first: Vec<Vec<u8>> = run.scan(None, None).map(|e| e.key).collect();
        let second: Vec<Vec<u8>> = run.scan(None, None).map(|e| e.key).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_scan_mid_block_start() {
        let tmp = TempDir::new().unwrap();
        let run = build_run(&tmp, 100);

        // key-00003 sits mid-block; the cursor must seek inside the
        // block, not start at its first key.
        let first = run.scan(Some(b"key-00003"), None).next().unwrap();
        assert_eq!(first.key, b"key-00003");
    }

    #[test]
    fn test_pinned_scan_survives_file_unlink() {
        use std::sync::Arc;

        let tmp = TempDir::new().unwrap();
        let run = Arc::new(build_run(&tmp, 200));
        let path = tmp.path().join("L1-000002.sst");

        let cursor = crate::sstable::RunScanIterator::new(Arc::clone(&run), None, None);

        // Retire the file mid-scan, as compaction would.
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cursor.count(), 200);
    }
}
