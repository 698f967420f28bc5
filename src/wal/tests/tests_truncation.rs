#[cfg(test)]
mod tests {
    use crate::wal::{Wal, WalHeader, segment_path};
    use tempfile::TempDir;

    type ByteWal = Wal<Vec<u8>>;

    #[test]
    fn test_truncate_leaves_only_header() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 0);
        let mut wal: ByteWal = Wal::open(&path, 0, None).unwrap();

        for _ in 0..4 {
            wal.append(&b"record".to_vec()).unwrap();
        }
        assert!(wal.file_size().unwrap() > WalHeader::DISK_SIZE as u64);

        wal.truncate().unwrap();

        assert_eq!(wal.file_size().unwrap(), WalHeader::DISK_SIZE as u64);
        assert_eq!(wal.replay_iter().unwrap().count(), 0);
    }

    #[test]
    fn test_append_after_truncate() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 0);
        let mut wal: ByteWal = Wal::open(&path, 0, None).unwrap();

        wal.append(&b"before".to_vec()).unwrap();
        wal.truncate().unwrap();
        wal.append(&b"after".to_vec()).unwrap();

        let records: Vec<Vec<u8>> = wal
            .replay_iter()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records, vec![b"after".to_vec()]);
    }

    #[test]
    fn test_truncated_wal_reopens_empty() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 0);

        {
            let mut wal: ByteWal = Wal::open(&path, 0, None).unwrap();
            wal.append(&b"gone".to_vec()).unwrap();
            wal.truncate().unwrap();
        }

        let wal: ByteWal = Wal::open(&path, 0, None).unwrap();
        assert_eq!(wal.replay_iter().unwrap().count(), 0);
    }
}
