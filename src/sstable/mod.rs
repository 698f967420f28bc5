//! Sorted run files (SSTables).
//!
//! An immutable, disk-backed, sorted run of key-value entries — the
//! on-disk unit of the LSM tree. Each run carries a bloom filter for fast
//! negative point lookups and a sparse index that maps the first key of
//! every data block to its file offset.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES]                                   12 bytes, CRC inside
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][CRC32_LE]
//! ...
//! [BLOOM_LEN_LE][BLOOM_BYTES][CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][CRC32_LE]
//! [FOOTER_BYTES]
//! [FOOTER_LEN_LE (4)][MAGIC (4)]
//! ```
//!
//! - **Data blocks** — concatenated [`RunCell`] frames (cell header, key
//!   bytes, value bytes), closed every [`BLOCK_ENTRY_INTERVAL`] entries or
//!   [`BLOCK_BYTE_LIMIT`] bytes. Keys are strictly increasing across the
//!   whole file; duplicates are collapsed upstream.
//! - **Bloom block** — the serialized bloom filter over every key in the
//!   run (tombstone keys included).
//! - **Index block** — the sparse index: one `⟨first_key, handle⟩` anchor
//!   per data block, in key order.
//! - **Footer** — bloom/index handles, entry count, min/max key, format
//!   version, CRC32. Its encoded length and the magic trail the file so
//!   the reader can locate it without fixed-size assumptions.
//!
//! Readers refuse unknown format versions and surface checksum mismatches
//! as corruption.
//!
//! # Concurrency
//!
//! Runs are immutable after the atomic `.tmp` → rename publication, so
//! reads are lock-free; any number of readers may share one [`SortedRun`]
//! through an `Arc` while the compactor retires it — the pinned mmap keeps
//! the data readable after unlink.

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::{RunSummary, RunWriter};
pub use iterator::{BlockIterator, RunScanIterator};

use std::{fs::File, io, path::Path};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::Entry;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const RUN_MAGIC: [u8; 4] = *b"SRUN";
pub(crate) const RUN_FORMAT_VERSION: u32 = 1;

/// Target false-positive rate of the per-run bloom filter.
pub(crate) const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// A data block closes after this many entries…
pub(crate) const BLOCK_ENTRY_INTERVAL: usize = 16;

/// …or once it holds this many payload bytes, whichever comes first.
pub(crate) const BLOCK_BYTE_LIMIT: usize = 4096;

pub(crate) const HEADER_SIZE: usize = 12;
pub(crate) const BLOCK_LEN_SIZE: usize = 4;
pub(crate) const BLOCK_CRC_SIZE: usize = 4;

/// `[footer_len u32][magic 4]` at the very end of the file.
pub(crate) const TRAILER_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by sorted-run operations.
#[derive(Debug, Error)]
pub enum RunError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Checksum mismatch in a block, header, or footer.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// The file carries a format version this build does not understand.
    #[error("Unsupported run format version {0}")]
    UnsupportedVersion(u32),

    /// Malformed file structure (bad magic, truncated frame, handle out
    /// of bounds, …).
    #[error("Corrupt run file: {0}")]
    Corrupt(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// File header: magic, format version, CRC over both.
pub(crate) struct RunHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) version: u32,
    pub(crate) crc: u32,
}

impl encoding::Encode for RunHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.crc.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for RunHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                crc,
            },
            off,
        ))
    }
}

/// Location of a framed block within the run file.
///
/// `size` covers the whole frame: length prefix, payload, and CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl encoding::Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (size, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { offset, size }, off))
    }
}

/// Sparse-index anchor: the first key of a data block and where the block
/// lives in the file.
#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub(crate) first_key: Vec<u8>,
    pub(crate) handle: BlockHandle,
}

impl encoding::Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (first_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (handle, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { first_key, handle }, off))
    }
}

/// Fixed metadata header of one entry inside a data block, followed on
/// disk by the raw key and value bytes.
pub(crate) struct RunCell {
    pub(crate) key_len: u32,
    pub(crate) value_len: u32,
    pub(crate) seq: u64,
    pub(crate) tombstone: bool,
}

impl encoding::Encode for RunCell {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key_len.encode_to(buf)?;
        self.value_len.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.tombstone.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for RunCell {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key_len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (value_len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (seq, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (tombstone, n) = bool::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                key_len,
                value_len,
                seq,
                tombstone,
            },
            off,
        ))
    }
}

/// Run footer, written after all blocks.
///
/// Carries everything a reader needs to navigate the file plus the
/// metadata the manifest records about the run.
#[derive(Debug, Clone)]
pub(crate) struct RunFooter {
    pub(crate) bloom: BlockHandle,
    pub(crate) index: BlockHandle,
    pub(crate) entry_count: u64,
    pub(crate) min_key: Vec<u8>,
    pub(crate) max_key: Vec<u8>,
    pub(crate) version: u32,
    pub(crate) crc: u32,
}

impl encoding::Encode for RunFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.bloom.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.crc.encode_to(buf)?;
        Ok(())
    }
}

impl encoding::Decode for RunFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (bloom, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (index, n) = BlockHandle::decode_from(&buf[off..])?;
        off += n;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (crc, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                bloom,
                index,
                entry_count,
                min_key,
                max_key,
                version,
                crc,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SortedRun — immutable reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable sorted run.
#[derive(Debug)]
pub struct SortedRun {
    /// Unique run id allocated by the manifest.
    pub id: u64,

    /// LSM level this run belongs to.
    pub level: u32,

    /// Memory-mapped file contents.
    pub(crate) mmap: Mmap,

    /// Bloom filter over every key in the run.
    bloom: Bloom<[u8]>,

    /// Sparse index: one anchor per data block, key-ordered.
    pub(crate) index: Vec<IndexEntry>,

    /// Run metadata from the footer.
    footer: RunFooter,

    /// Total on-disk file size in bytes.
    file_size: u64,
}

impl SortedRun {
    /// Opens a run file, verifying header, footer, and bloom/index blocks.
    ///
    /// The load pipeline:
    ///
    /// 1. mmap the file (read-only; the file is immutable once published).
    /// 2. Validate the header: CRC, magic, format version.
    /// 3. Read the 8-byte trailer, locate and decode the footer, verify
    ///    its CRC and format version. Unknown versions are refused with
    ///    [`RunError::UnsupportedVersion`].
    /// 4. Load the bloom and sparse-index blocks (both CRC-framed).
    ///
    /// # Errors
    ///
    /// [`RunError::ChecksumMismatch`] on any CRC failure,
    /// [`RunError::Corrupt`] on structural damage, and
    /// [`RunError::UnsupportedVersion`] on a version this build does not
    /// understand.
    pub fn open(path: impl AsRef<Path>, id: u64, level: u32) -> Result<Self, RunError> {
        let file = File::open(path.as_ref())?;

        // Safety: the mapping is read-only and the file is never written
        // after the atomic rename that published it.
        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < HEADER_SIZE + TRAILER_SIZE {
            return Err(RunError::Corrupt("file too small".into()));
        }

        // Header.
        let (header, _) = encoding::decode_from_slice::<RunHeader>(&mmap[..HEADER_SIZE])?;
        let expected = {
            let probe = RunHeader {
                magic: header.magic,
                version: header.version,
                crc: 0,
            };
            let bytes = encoding::encode_to_vec(&probe)?;
            compute_crc(&bytes)
        };
        if header.crc != expected {
            return Err(RunError::ChecksumMismatch);
        }
        if header.magic != RUN_MAGIC {
            return Err(RunError::Corrupt("header magic mismatch".into()));
        }
        if header.version != RUN_FORMAT_VERSION {
            return Err(RunError::UnsupportedVersion(header.version));
        }

        // Trailer → footer.
        let trailer = &mmap[file_len - TRAILER_SIZE..];
        let footer_len = u32::from_le_bytes(
            trailer[..4]
                .try_into()
                .map_err(|_| RunError::Corrupt("short trailer".into()))?,
        ) as usize;
        let magic: [u8; 4] = trailer[4..]
            .try_into()
            .map_err(|_| RunError::Corrupt("short trailer".into()))?;
        if magic != RUN_MAGIC {
            return Err(RunError::Corrupt("trailer magic mismatch".into()));
        }

        let footer_start = file_len
            .checked_sub(TRAILER_SIZE + footer_len)
            .ok_or_else(|| RunError::Corrupt("footer length out of range".into()))?;
        if footer_start < HEADER_SIZE {
            return Err(RunError::Corrupt("footer overlaps header".into()));
        }

        let (mut footer, _) =
            encoding::decode_from_slice::<RunFooter>(&mmap[footer_start..file_len - TRAILER_SIZE])?;

        let stored_crc = footer.crc;
        footer.crc = 0;
        let footer_bytes = encoding::encode_to_vec(&footer)?;
        if compute_crc(&footer_bytes) != stored_crc {
            return Err(RunError::ChecksumMismatch);
        }
        footer.crc = stored_crc;

        if footer.version != RUN_FORMAT_VERSION {
            return Err(RunError::UnsupportedVersion(footer.version));
        }

        // Bloom block.
        let bloom_bytes = read_block_bytes(&mmap, &footer.bloom)?;
        let bloom =
            Bloom::from_slice(&bloom_bytes).map_err(|e| RunError::Corrupt(e.to_string()))?;

        // Sparse index block.
        let index_bytes = read_block_bytes(&mmap, &footer.index)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(&index_bytes)?;

        debug!(
            id,
            level,
            entries = footer.entry_count,
            blocks = index.len(),
            "sorted run opened"
        );

        Ok(Self {
            id,
            level,
            mmap,
            bloom,
            index,
            footer,
            file_size: file_len as u64,
        })
    }

    /// Smallest key stored in this run.
    pub fn min_key(&self) -> &[u8] {
        &self.footer.min_key
    }

    /// Largest key stored in this run.
    pub fn max_key(&self) -> &[u8] {
        &self.footer.max_key
    }

    /// Total number of entries (tombstones included).
    pub fn entry_count(&self) -> u64 {
        self.footer.entry_count
    }

    /// On-disk file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Whether `key` falls inside this run's `[min_key, max_key]` range.
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        key >= self.min_key() && key <= self.max_key()
    }

    /// Whether this run's key range intersects `[lo, hi]` (inclusive,
    /// `None` = open-ended).
    pub fn overlaps(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> bool {
        let above_lo = lo.is_none_or(|lo| self.max_key() >= lo);
        let below_hi = hi.is_none_or(|hi| self.min_key() <= hi);
        above_lo && below_hi
    }

    /// Bloom-filter membership probe.
    ///
    /// `false` means the key is definitely absent from this run; `true`
    /// means it may be present.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    /// Point lookup within this run alone.
    ///
    /// Pipeline: bloom check → sparse-index locate → linear scan of the
    /// one candidate block. Returns the entry (which may be a tombstone)
    /// or `None` when the run holds nothing for the key. Recency across
    /// runs is the engine's concern.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>, RunError> {
        if !self.key_in_range(key) || !self.might_contain(key) {
            return Ok(None);
        }

        let Some(block_idx) = self.locate_block(key) else {
            return Ok(None);
        };

        let block = self.load_block(block_idx)?;
        let mut iter = BlockIterator::new(block);
        iter.seek_to(key);

        match iter.next() {
            Some(entry) if entry.key == key => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    /// Range scan over `[lo, hi]` (inclusive, `None` = open-ended).
    ///
    /// Returns a fresh lazy cursor each call; blocks are decoded one at a
    /// time as the iterator advances. Tombstones are included — merge and
    /// visibility live above this layer.
    pub fn scan(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> RunScanIterator<&SortedRun> {
        RunScanIterator::new(self, lo.map(<[u8]>::to_vec), hi.map(<[u8]>::to_vec))
    }

    /// Full ordered iteration, used by the compactor.
    pub fn iter(&self) -> RunScanIterator<&SortedRun> {
        self.scan(None, None)
    }

    /// Sparse-index locate: index of the greatest anchor whose first key
    /// is ≤ `key`, or `None` when `key` precedes the whole run.
    pub(crate) fn locate_block(&self, key: &[u8]) -> Option<usize> {
        if self.index.is_empty() {
            return None;
        }
        match self
            .index
            .binary_search_by(|anchor| anchor.first_key.as_slice().cmp(key))
        {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Loads and CRC-verifies the data block at `block_idx`.
    pub(crate) fn load_block(&self, block_idx: usize) -> Result<Vec<u8>, RunError> {
        let anchor = self
            .index
            .get(block_idx)
            .ok_or_else(|| RunError::Internal(format!("block index {block_idx} out of range")))?;
        read_block_bytes(&self.mmap, &anchor.handle)
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Reads one framed block (`[len][bytes][crc]`) out of the mmap and
/// verifies its checksum.
pub(crate) fn read_block_bytes(mmap: &Mmap, handle: &BlockHandle) -> Result<Vec<u8>, RunError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| RunError::Corrupt("block offset exceeds addressable range".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| RunError::Corrupt("block size exceeds addressable range".into()))?;

    if size < BLOCK_LEN_SIZE + BLOCK_CRC_SIZE || start.checked_add(size).is_none_or(|end| end > mmap.len()) {
        return Err(RunError::Corrupt("block out of range".into()));
    }

    let mut cursor = start;

    let len_bytes: [u8; BLOCK_LEN_SIZE] = mmap[cursor..cursor + BLOCK_LEN_SIZE]
        .try_into()
        .map_err(|_| RunError::Corrupt("short block length".into()))?;
    let content_len = u32::from_le_bytes(len_bytes) as usize;
    cursor += BLOCK_LEN_SIZE;

    if content_len != size - BLOCK_LEN_SIZE - BLOCK_CRC_SIZE {
        return Err(RunError::Corrupt("block length disagrees with handle".into()));
    }

    let content = &mmap[cursor..cursor + content_len];
    cursor += content_len;

    let checksum_bytes: [u8; BLOCK_CRC_SIZE] = mmap[cursor..cursor + BLOCK_CRC_SIZE]
        .try_into()
        .map_err(|_| RunError::Corrupt("short block checksum".into()))?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    if compute_crc(content) != stored_checksum {
        return Err(RunError::ChecksumMismatch);
    }

    Ok(content.to_vec())
}

pub(crate) fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}
