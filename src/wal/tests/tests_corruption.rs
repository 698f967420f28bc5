#[cfg(test)]
mod tests {
    use crate::wal::{Wal, WalError, WalHeader, segment_path};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    type ByteWal = Wal<Vec<u8>>;

    fn filled_wal(dir: &std::path::Path, records: usize) -> std::path::PathBuf {
        let path = segment_path(dir, 0);
        let wal: ByteWal = Wal::open(&path, 0, None).unwrap();
        for i in 0..records {
            wal.append(&vec![i as u8; 16]).unwrap();
        }
        path
    }

    fn flip_byte_at(path: &std::path::Path, offset: u64) {
        let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        let mut byte = [0u8];
        use std::io::Read;
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&byte).unwrap();
    }

    #[test]
    fn test_payload_corruption_is_checksum_mismatch() {
        let tmp = TempDir::new().unwrap();
        let path = filled_wal(tmp.path(), 3);

        // Flip a byte inside the first record's payload.
        flip_byte_at(&path, (WalHeader::DISK_SIZE + 6) as u64);

        let wal: ByteWal = Wal::open(&path, 0, None).unwrap();
        let first = wal.replay_iter().unwrap().next().unwrap();
        assert!(matches!(first, Err(WalError::ChecksumMismatch)));
    }

    #[test]
    fn test_truncated_tail_is_detected() {
        let tmp = TempDir::new().unwrap();
        let path = filled_wal(tmp.path(), 2);

        // Chop off the last few bytes, simulating a torn write.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let wal: ByteWal = Wal::open(&path, 0, None).unwrap();
        let results: Vec<_> = wal.replay_iter().unwrap().collect();

        // First record intact, second surfaces the torn frame.
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(WalError::UnexpectedEof) | Err(WalError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_header_corruption_rejects_open() {
        let tmp = TempDir::new().unwrap();
        let path = filled_wal(tmp.path(), 1);

        // Flip a byte inside the header's magic.
        flip_byte_at(&path, 1);

        let err = ByteWal::open(&path, 0, None).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
    }

    #[test]
    fn test_clean_wal_replays_clean() {
        let tmp = TempDir::new().unwrap();
        let path = filled_wal(tmp.path(), 5);

        let wal: ByteWal = Wal::open(&path, 0, None).unwrap();
        let records: Vec<Vec<u8>> = wal
            .replay_iter()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 5);
    }
}
