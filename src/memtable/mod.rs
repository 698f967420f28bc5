//! In-memory write buffer.
//!
//! ## Design Invariants
//!
//! - All writes are WAL-first and carry a sequence number assigned by the
//!   store before the WAL record is written.
//! - The memtable keeps exactly **one** entry per key — the most recent
//!   one. An overwrite replaces the slot in place; recency is decided by
//!   the sequence number.
//! - Deletes are represented as tombstone slots, not physical removal,
//!   so they shadow older on-disk versions until compaction reclaims them.
//!
//! ## Flush Semantics
//!
//! - `iter_for_flush` returns the buffered entries in key order, exactly
//!   the shape the sorted-run writer expects (strictly increasing keys).
//! - Flush iteration does not mutate in-memory state.
//!
//! ## Frozen Memtable
//!
//! - A [`FrozenMemtable`] is read-only and retains ownership of its WAL
//!   segment so the data stays durable until the L0 run is published.


use std::{
    collections::BTreeMap,
    ops::Bound,
    path::Path,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{error, info, trace};

use crate::encoding::{Decode, Encode};
use crate::engine::Entry;
use crate::wal::{Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Underlying WAL I/O failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Write buffer limit reached; a flush is required before further writes.
    #[error("Flush required")]
    FlushRequired,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// WAL record type
// ------------------------------------------------------------------------------------------------

/// A logical WAL record for one memtable mutation.
///
/// Appended to the WAL before the in-memory update, replayed during
/// recovery. Together the records of a segment reconstruct the memtable.
#[derive(Debug, PartialEq)]
pub enum MemtableRecord {
    /// Insert or overwrite a single key.
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        seq: u64,
    },

    /// Delete a single key (tombstone).
    Delete { key: Vec<u8>, seq: u64 },
}

impl crate::encoding::Encode for MemtableRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), crate::encoding::EncodingError> {
        match self {
            MemtableRecord::Put { key, value, seq } => {
                0u32.encode_to(buf)?;
                key.encode_to(buf)?;
                value.encode_to(buf)?;
                seq.encode_to(buf)?;
            }
            MemtableRecord::Delete { key, seq } => {
                1u32.encode_to(buf)?;
                key.encode_to(buf)?;
                seq.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl crate::encoding::Decode for MemtableRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), crate::encoding::EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                let (value, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                let (seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((MemtableRecord::Put { key, value, seq }, offset))
            }
            1 => {
                let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                offset += n;
                let (seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((MemtableRecord::Delete { key, seq }, offset))
            }
            _ => Err(crate::encoding::EncodingError::InvalidTag {
                tag,
                type_name: "MemtableRecord",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Lookup result
// ------------------------------------------------------------------------------------------------

/// Result of a `get` against a memtable.
#[derive(Debug, PartialEq)]
pub enum MemtableGetResult {
    /// Value found for the key.
    Put(Vec<u8>),

    /// Key was deleted by a tombstone.
    Delete,

    /// Key not present in this memtable.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// The latest buffered state of one key.
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    /// Stored value; `None` marks a tombstone.
    value: Option<Vec<u8>>,

    /// Sequence number of the mutation that produced this slot.
    seq: u64,
}

/// Internal shared state, protected by an `RwLock`.
#[derive(Debug)]
struct MemtableInner {
    /// Latest entry per key, ordered by key.
    tree: BTreeMap<Vec<u8>, Slot>,

    /// Approximate in-memory footprint in bytes.
    approximate_size: usize,

    /// Configured maximum buffer size before a flush is required.
    write_buffer_size: usize,
}

/// The mutable, in-memory write buffer of the storage engine.
///
/// The memtable accepts writes (`put`, `delete`), persists every mutation
/// to its WAL segment first, serves reads (`get`, `scan`), and is drained
/// through `iter_for_flush` when full.
///
/// # Concurrency
/// - Writers acquire an exclusive lock; readers proceed concurrently.
///
/// # Durability
/// - Every mutation is appended (and fsynced) to the WAL *before* being
///   applied in memory. A failed append leaves the memtable unchanged.
#[derive(Debug)]
pub struct Memtable {
    inner: Arc<RwLock<MemtableInner>>,

    /// Paired write-ahead log segment.
    pub wal: Wal<MemtableRecord>,

    /// Highest sequence number applied to this memtable.
    max_seq: AtomicU64,
}

impl Memtable {
    /// Creates a memtable backed by the WAL segment at `wal_path`.
    ///
    /// If the segment already exists it is replayed to reconstruct the
    /// in-memory state, and the highest observed sequence number is
    /// restored. Replay surfaces corruption as an error rather than
    /// silently dropping records.
    pub fn open<P: AsRef<Path>>(
        wal_path: P,
        segment_seq: u64,
        write_buffer_size: usize,
    ) -> Result<Self, MemtableError> {
        let wal = Wal::open(&wal_path, segment_seq, None)?;

        let mut inner = MemtableInner {
            tree: BTreeMap::new(),
            approximate_size: 0,
            write_buffer_size,
        };

        let mut max_seq_seen: u64 = 0;
        let mut replayed = 0usize;

        for record in wal.replay_iter()? {
            let record = record?;
            match record {
                MemtableRecord::Put { key, value, seq } => {
                    max_seq_seen = max_seq_seen.max(seq);
                    inner.apply_put(key, value, seq);
                }
                MemtableRecord::Delete { key, seq } => {
                    max_seq_seen = max_seq_seen.max(seq);
                    inner.apply_delete(key, seq);
                }
            }
            replayed += 1;
        }

        if replayed > 0 {
            info!(
                records = replayed,
                max_seq = max_seq_seen,
                "memtable reconstructed from WAL"
            );
        }

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            wal,
            max_seq: AtomicU64::new(max_seq_seen),
        })
    }

    /// Inserts or overwrites a key.
    ///
    /// WAL-first: the record is appended and fsynced, then the in-memory
    /// slot is replaced. Returns [`MemtableError::FlushRequired`] without
    /// touching the WAL when the buffer is full.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> Result<(), MemtableError> {
        trace!(key = ?HexKey(&key), seq, "memtable put");

        if key.is_empty() {
            return Err(MemtableError::Internal("key is empty".to_string()));
        }

        let record_size = Self::slot_size(&key, Some(&value));

        let mut guard = self.inner.write().map_err(|_| {
            error!("lock poisoned during put");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        if guard.approximate_size + record_size > guard.write_buffer_size {
            return Err(MemtableError::FlushRequired);
        }

        let record = MemtableRecord::Put {
            key: key.clone(),
            value: value.clone(),
            seq,
        };

        // 1. WAL first (crash safety).
        self.wal.append(&record)?;

        // 2. In-memory update.
        guard.apply_put(key, value, seq);
        self.note_seq(seq);

        Ok(())
    }

    /// Deletes a key by inserting a tombstone slot.
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> Result<(), MemtableError> {
        trace!(key = ?HexKey(&key), seq, "memtable delete");

        if key.is_empty() {
            return Err(MemtableError::Internal("key is empty".to_string()));
        }

        let record_size = Self::slot_size(&key, None);

        let mut guard = self.inner.write().map_err(|_| {
            error!("lock poisoned during delete");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        if guard.approximate_size + record_size > guard.write_buffer_size {
            return Err(MemtableError::FlushRequired);
        }

        let record = MemtableRecord::Delete {
            key: key.clone(),
            seq,
        };

        // 1. WAL first (crash safety).
        self.wal.append(&record)?;

        // 2. In-memory update.
        guard.apply_delete(key, seq);
        self.note_seq(seq);

        Ok(())
    }

    /// Looks up the buffered state of a key.
    pub fn get(&self, key: &[u8]) -> Result<MemtableGetResult, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("lock poisoned during get");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        match guard.tree.get(key) {
            None => Ok(MemtableGetResult::NotFound),
            Some(Slot { value: None, .. }) => Ok(MemtableGetResult::Delete),
            Some(Slot {
                value: Some(value), ..
            }) => Ok(MemtableGetResult::Put(value.clone())),
        }
    }

    /// Returns all buffered entries with keys in the inclusive range
    /// `[lo, hi]`, in key order. `None` bounds are open-ended.
    ///
    /// Tombstone entries are included — the caller's merge layer decides
    /// visibility across memtables and runs.
    pub fn scan(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<impl Iterator<Item = Entry>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("lock poisoned during scan");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        let lower = match lo {
            Some(k) => Bound::Included(k.to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match hi {
            Some(k) => Bound::Included(k.to_vec()),
            None => Bound::Unbounded,
        };

        let entries: Vec<Entry> = guard
            .tree
            .range((lower, upper))
            .map(|(key, slot)| Entry {
                key: key.clone(),
                value: slot.value.clone(),
                seq: slot.seq,
            })
            .collect();

        Ok(entries.into_iter())
    }

    /// Returns the buffered entries in key order for the run writer.
    ///
    /// The output has strictly increasing keys (one slot per key) and
    /// includes tombstones. Does not mutate in-memory state.
    pub fn iter_for_flush(&self) -> Result<impl Iterator<Item = Entry>, MemtableError> {
        let guard = self.inner.read().map_err(|_| {
            error!("lock poisoned during iter_for_flush");
            MemtableError::Internal("RwLock poisoned".into())
        })?;

        let entries: Vec<Entry> = guard
            .tree
            .iter()
            .map(|(key, slot)| Entry {
                key: key.clone(),
                value: slot.value.clone(),
                seq: slot.seq,
            })
            .collect();

        Ok(entries.into_iter())
    }

    /// Converts this memtable into an immutable [`FrozenMemtable`].
    pub fn freeze(self) -> FrozenMemtable {
        FrozenMemtable { memtable: self }
    }

    /// Number of buffered entries (tombstones included).
    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.tree.len()).unwrap_or(0)
    }

    /// Whether the buffer holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approximate_size(&self) -> usize {
        self.inner.read().map(|g| g.approximate_size).unwrap_or(0)
    }

    /// Highest sequence number applied to this memtable, 0 if none.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    fn note_seq(&self, seq: u64) {
        self.max_seq.fetch_max(seq, Ordering::SeqCst);
    }

    fn slot_size(key: &[u8], value: Option<&[u8]>) -> usize {
        std::mem::size_of::<Slot>() + key.len() + value.map_or(0, <[u8]>::len)
    }
}

impl MemtableInner {
    fn apply_put(&mut self, key: Vec<u8>, value: Vec<u8>, seq: u64) {
        self.approximate_size += Memtable::slot_size(&key, Some(&value));
        self.tree.insert(
            key,
            Slot {
                value: Some(value),
                seq,
            },
        );
    }

    fn apply_delete(&mut self, key: Vec<u8>, seq: u64) {
        self.approximate_size += Memtable::slot_size(&key, None);
        self.tree.insert(key, Slot { value: None, seq });
    }
}

// ------------------------------------------------------------------------------------------------
// Frozen Memtable
// ------------------------------------------------------------------------------------------------

/// An immutable, read-only view of a memtable awaiting flush.
///
/// Retains ownership of its WAL segment so the buffered mutations remain
/// durable until the corresponding L0 run has been published; prevents
/// further mutation by construction.
#[derive(Debug)]
pub struct FrozenMemtable {
    memtable: Memtable,
}

impl FrozenMemtable {
    /// Looks up the buffered state of a key.
    pub fn get(&self, key: &[u8]) -> Result<MemtableGetResult, MemtableError> {
        self.memtable.get(key)
    }

    /// Range scan over the frozen buffer; see [`Memtable::scan`].
    pub fn scan(
        &self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> Result<impl Iterator<Item = Entry>, MemtableError> {
        self.memtable.scan(lo, hi)
    }

    /// Entries in key order for the run writer; see
    /// [`Memtable::iter_for_flush`].
    pub fn iter_for_flush(&self) -> Result<impl Iterator<Item = Entry>, MemtableError> {
        self.memtable.iter_for_flush()
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.memtable.len()
    }

    /// Whether the frozen buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    /// Highest sequence number in the frozen buffer.
    pub fn max_seq(&self) -> u64 {
        self.memtable.max_seq()
    }

    /// Sequence number of the paired WAL segment.
    pub fn wal_segment_seq(&self) -> u64 {
        self.memtable.wal.segment_seq()
    }

    /// Path of the paired WAL segment file.
    pub fn wal_path(&self) -> std::path::PathBuf {
        self.memtable.wal.path().to_path_buf()
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing helper
// ------------------------------------------------------------------------------------------------

struct HexKey<'a>(&'a [u8]);

impl std::fmt::Debug for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(16)];
        for byte in shown {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 16 {
            write!(f, "..[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
