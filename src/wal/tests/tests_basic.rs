#[cfg(test)]
mod tests {
    use crate::encoding::{Decode, Encode, EncodingError};
    use crate::wal::{Wal, WalError, parse_segment_seq, segment_path};
    use tempfile::TempDir;

    #[derive(Debug, PartialEq)]
    struct TestRecord {
        id: u64,
        payload: Vec<u8>,
    }

    impl Encode for TestRecord {
        fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
            self.id.encode_to(buf)?;
            self.payload.encode_to(buf)?;
            Ok(())
        }
    }

    impl Decode for TestRecord {
        fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
            let mut offset = 0;
            let (id, n) = u64::decode_from(&buf[offset..])?;
            offset += n;
            let (payload, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
            offset += n;
            Ok((Self { id, payload }, offset))
        }
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 0);
        let wal: Wal<TestRecord> = Wal::open(&path, 0, None).unwrap();

        for id in 0..10 {
            wal.append(&TestRecord {
                id,
                payload: format!("payload-{id}").into_bytes(),
            })
            .unwrap();
        }

        let records: Vec<TestRecord> = wal
            .replay_iter()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.id, i as u64);
            assert_eq!(record.payload, format!("payload-{i}").into_bytes());
        }
    }

    #[test]
    fn test_replay_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 3);

        {
            let wal: Wal<TestRecord> = Wal::open(&path, 3, None).unwrap();
            wal.append(&TestRecord {
                id: 1,
                payload: b"one".to_vec(),
            })
            .unwrap();
        }

        let wal: Wal<TestRecord> = Wal::open(&path, 3, None).unwrap();
        assert_eq!(wal.segment_seq(), 3);
        let records: Vec<TestRecord> = wal
            .replay_iter()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"one");
    }

    #[test]
    fn test_reopen_with_wrong_seq_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 5);

        {
            let _wal: Wal<TestRecord> = Wal::open(&path, 5, None).unwrap();
        }

        let err = Wal::<TestRecord>::open(&path, 6, None).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
    }

    #[test]
    fn test_empty_wal_replays_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 0);
        let wal: Wal<TestRecord> = Wal::open(&path, 0, None).unwrap();

        assert_eq!(wal.replay_iter().unwrap().count(), 0);
    }

    #[test]
    fn test_record_too_large_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 0);
        let wal: Wal<TestRecord> = Wal::open(&path, 0, Some(64)).unwrap();

        let err = wal
            .append(&TestRecord {
                id: 1,
                payload: vec![0u8; 1024],
            })
            .unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge(_)));

        // The oversized record must not have reached the file.
        assert_eq!(wal.replay_iter().unwrap().count(), 0);
    }

    #[test]
    fn test_segment_path_naming() {
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 42);
        assert!(path.to_str().unwrap().ends_with("wal-000042.log"));
        assert_eq!(parse_segment_seq(&path), Some(42));
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        use std::path::Path;
        assert_eq!(parse_segment_seq(Path::new("/x/MANIFEST")), None);
        assert_eq!(parse_segment_seq(Path::new("/x/L0-000001.sst")), None);
        assert_eq!(parse_segment_seq(Path::new("/x/wal-abc.log")), None);
    }
}
