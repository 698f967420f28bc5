//! # StratumDB
//!
//! An embeddable, persistent key-value storage engine built on a
//! **leveled Log-Structured Merge tree**, with an in-memory **B+ tree**
//! index and a thin typed-row layer on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Db                              │
//! │  ┌────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │   Active    │  │   Frozen     │  │  Sorted runs  │  │
//! │  │  Memtable   │  │  Memtables   │  │  L0 L1 L2 …   │  │
//! │  │  + WAL      │  │  + WALs      │  │  (on disk)    │  │
//! │  └─────┬───────┘  └──────┬───────┘  └──────┬────────┘  │
//! │        │   freeze        │   flush         │           │
//! │        └─────────►       └────────►        │           │
//! │                                            │           │
//! │  ┌─────────────────────────────────────────┘           │
//! │  │  Leveled compaction (background worker)             │
//! │  └─────────────────────────────────────────────────────│
//! │                                                        │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │            Manifest (WAL + snapshot)             │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────┘
//!            ▲
//!            │ put / get / delete / scan
//!  ┌─────────┴──────────┐
//!  │  Table (rows)      │──── B+ tree index (in memory)
//!  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | The store — open, put, get, delete, scan, flush, compact |
//! | [`memtable`] | In-memory write buffer, WAL-first, one latest entry per key |
//! | [`wal`] | Generic, CRC-protected write-ahead log |
//! | [`sstable`] | Immutable sorted runs with bloom filters and sparse indices |
//! | [`levels`] | Leveled compaction: triggers, job selection, merge, publication |
//! | [`manifest`] | Durable metadata (WAL + snapshot model) |
//! | [`btree`] | Main-memory B+ tree with linked leaves |
//! | [`table`] | Typed rows, constraints, primary-key index |
//! | [`encoding`] | Deterministic binary wire format for everything on disk |
//!
//! ## Key Properties
//!
//! - **Write-ahead logging** — every mutation is fsynced to a WAL before
//!   it is acknowledged.
//! - **Sequence-number recency** — newer writes shadow older ones; the
//!   counter is unique per store instance and survives restart.
//! - **Leveled shape** — L0 runs may overlap; every deeper level keeps
//!   pairwise-disjoint key ranges within a byte budget.
//! - **Bloom-guarded reads** — every run answers "definitely absent"
//!   before any block is touched.
//! - **Tombstone reclamation** — deletes are dropped once a compaction
//!   reaches the bottom of the tree.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratumdb::{Db, DbConfig};
//!
//! let db = Db::open("/tmp/my_db", DbConfig::default()).unwrap();
//!
//! db.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! db.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(db.get(b"hello").unwrap(), None);
//!
//! db.put(b"a".to_vec(), b"1".to_vec()).unwrap();
//! db.put(b"b".to_vec(), b"2".to_vec()).unwrap();
//! let pairs: Vec<_> = db.scan(None, None).unwrap().collect();
//!
//! db.close().unwrap();
//! ```

pub mod btree;
pub mod encoding;
pub mod engine;
pub mod levels;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod table;
pub mod wal;

pub use btree::BPlusTree;
pub use engine::{Db, DbConfig, DbStats, EngineError};
pub use table::{Column, ColumnType, Row, Schema, Table, TableError, Value};
