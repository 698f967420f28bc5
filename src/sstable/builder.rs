//! Sorted-run writer — builds a complete run file from a sorted stream.
//!
//! [`RunWriter`] consumes a lazy iterator of [`Entry`] values with
//! **strictly increasing keys** (duplicates are collapsed upstream by the
//! memtable or the compaction merge) and writes header, data blocks,
//! bloom filter, sparse index, and footer.
//!
//! # Output guarantees
//!
//! - Entries are grouped into data blocks closed every
//!   [`BLOCK_ENTRY_INTERVAL`](super::BLOCK_ENTRY_INTERVAL) entries or
//!   [`BLOCK_BYTE_LIMIT`](super::BLOCK_BYTE_LIMIT) bytes; every block is
//!   written with a CRC32 frame.
//! - The bloom filter covers every key, tombstone keys included.
//! - The sparse index records the first key and file handle of each block.
//! - The footer captures entry count, min/max key, and format version.
//!
//! # Atomicity
//!
//! Everything is written to `path.tmp`, flushed, fsynced, then renamed to
//! `path`. A crash mid-build cannot leave a partially-written run behind.

use std::{
    fs::{OpenOptions, rename},
    io::{BufWriter, Seek, Write},
    mem,
    path::Path,
};

use bloomfilter::Bloom;
use tracing::debug;

use crate::encoding::{self, Encode};
use crate::engine::Entry;

use super::{
    BLOCK_BYTE_LIMIT, BLOCK_CRC_SIZE, BLOCK_ENTRY_INTERVAL, BLOCK_LEN_SIZE,
    BLOOM_FALSE_POSITIVE_RATE, BlockHandle, IndexEntry, RUN_FORMAT_VERSION, RUN_MAGIC, RunCell,
    RunError, RunFooter, RunHeader, compute_crc,
};

// ------------------------------------------------------------------------------------------------
// RunSummary
// ------------------------------------------------------------------------------------------------

/// Metadata describing a freshly-built run, in the shape the manifest
/// records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Total entries written (tombstones included).
    pub entry_count: u64,

    /// Smallest key in the run.
    pub min_key: Vec<u8>,

    /// Largest key in the run.
    pub max_key: Vec<u8>,

    /// Final file size in bytes.
    pub file_size: u64,
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes a checksummed frame `[len_le (4 B)][data][crc32_le (4 B)]` and
/// returns its [`BlockHandle`].
fn write_framed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, RunError> {
    let offset = writer.stream_position()?;
    let len = u32::try_from(data.len())
        .map_err(|_| RunError::Internal("block exceeds u32::MAX bytes".into()))?;
    let checksum = compute_crc(data);

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (BLOCK_LEN_SIZE + data.len() + BLOCK_CRC_SIZE) as u64,
    })
}

/// Writes the 12-byte run header with its embedded CRC.
fn write_run_header(writer: &mut impl Write) -> Result<(), RunError> {
    let mut header = RunHeader {
        magic: RUN_MAGIC,
        version: RUN_FORMAT_VERSION,
        crc: 0,
    };
    let zeroed = encoding::encode_to_vec(&header)?;
    header.crc = compute_crc(&zeroed);

    let bytes = encoding::encode_to_vec(&header)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Flushes the buffered data block to disk and records its index anchor.
fn flush_data_block(
    writer: &mut (impl Write + Seek),
    current_block: &mut Vec<u8>,
    block_first_key: &mut Option<Vec<u8>>,
    index: &mut Vec<IndexEntry>,
) -> Result<(), RunError> {
    let data = mem::take(current_block);
    let handle = write_framed_block(writer, &data)?;

    let first_key = block_first_key
        .take()
        .ok_or_else(|| RunError::Internal("data block without a first key".into()))?;

    index.push(IndexEntry { first_key, handle });
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// RunWriter — public entry point
// ------------------------------------------------------------------------------------------------

/// Builds a complete sorted-run file on disk.
///
/// ```rust,ignore
/// let summary = RunWriter::new(&path).build(entries, entry_count)?;
/// ```
pub struct RunWriter<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> RunWriter<P> {
    /// Creates a writer targeting the given output path.
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Consumes a sorted entry stream and writes a complete run.
    ///
    /// # Parameters
    ///
    /// - `entries` — lazy iterator with strictly increasing keys.
    /// - `entry_count` — expected entry count; sizes the bloom filter.
    ///
    /// # Errors
    ///
    /// - [`RunError::Internal`] when the stream is empty or out of order.
    /// - I/O and encoding errors from writing.
    pub fn build(
        self,
        entries: impl Iterator<Item = Entry>,
        entry_count: usize,
    ) -> Result<RunSummary, RunError> {
        let mut entries = entries.peekable();
        if entry_count == 0 && entries.peek().is_none() {
            return Err(RunError::Internal(
                "cannot build a run from an empty stream".into(),
            ));
        }

        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");

        match write_run(&tmp_path, entries, entry_count) {
            Ok(summary) => {
                rename(&tmp_path, final_path)?;
                debug!(
                    path = %final_path.display(),
                    entries = summary.entry_count,
                    bytes = summary.file_size,
                    "sorted run built"
                );
                Ok(summary)
            }
            Err(e) => {
                // A failed build must not leave a partial file behind.
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }
}

/// Writes the complete run to `tmp_path` and fsyncs it.
fn write_run(
    tmp_path: &Path,
    entries: impl Iterator<Item = Entry>,
    entry_count: usize,
) -> Result<RunSummary, RunError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)?;
    let mut writer = BufWriter::new(&mut file);

    // 1. Header.
    write_run_header(&mut writer)?;

    // 2. Data blocks + bloom + stats.
    let mut bloom: Bloom<[u8]> =
        Bloom::new_for_fp_rate(entry_count.max(1), BLOOM_FALSE_POSITIVE_RATE)
            .map_err(|e| RunError::Internal(e.to_string()))?;

    let mut index: Vec<IndexEntry> = Vec::new();
    let mut current_block: Vec<u8> = Vec::new();
    let mut block_first_key: Option<Vec<u8>> = None;
    let mut block_entries = 0usize;

    let mut written: u64 = 0;
    let mut min_key: Option<Vec<u8>> = None;
    let mut max_key: Option<Vec<u8>> = None;
    let mut last_key: Option<Vec<u8>> = None;

    for entry in entries {
        if let Some(prev) = &last_key
            && entry.key.as_slice() <= prev.as_slice()
        {
            return Err(RunError::Internal(
                "entry stream keys are not strictly increasing".into(),
            ));
        }
        last_key = Some(entry.key.clone());

        // Stream is sorted, so first key = min, last key = max.
        if min_key.is_none() {
            min_key = Some(entry.key.clone());
        }
        max_key = Some(entry.key.clone());

        if block_first_key.is_none() {
            block_first_key = Some(entry.key.clone());
        }
        bloom.set(entry.key.as_slice());
        written += 1;

        // Encode the cell header followed by raw key/value bytes.
        let cell = RunCell {
            key_len: entry.key.len() as u32,
            value_len: entry.value.as_ref().map_or(0, Vec::len) as u32,
            seq: entry.seq,
            tombstone: entry.value.is_none(),
        };
        cell.encode_to(&mut current_block)?;
        current_block.extend_from_slice(&entry.key);
        if let Some(value) = &entry.value {
            current_block.extend_from_slice(value);
        }
        block_entries += 1;

        if block_entries >= BLOCK_ENTRY_INTERVAL || current_block.len() >= BLOCK_BYTE_LIMIT {
            flush_data_block(&mut writer, &mut current_block, &mut block_first_key, &mut index)?;
            block_entries = 0;
        }
    }

    if written == 0 {
        return Err(RunError::Internal(
            "cannot build a run from an empty stream".into(),
        ));
    }

    // Flush the final partial block.
    if !current_block.is_empty() {
        flush_data_block(&mut writer, &mut current_block, &mut block_first_key, &mut index)?;
    }

    // 3. Bloom block.
    let bloom_handle = write_framed_block(&mut writer, bloom.as_slice())?;

    // 4. Sparse index block.
    let mut index_bytes = Vec::new();
    encoding::encode_vec(&index, &mut index_bytes)?;
    let index_handle = write_framed_block(&mut writer, &index_bytes)?;

    // 5. Footer with CRC, then the [len][magic] trailer.
    let min_key = min_key.unwrap_or_default();
    let max_key = max_key.unwrap_or_default();

    let mut footer = RunFooter {
        bloom: bloom_handle,
        index: index_handle,
        entry_count: written,
        min_key: min_key.clone(),
        max_key: max_key.clone(),
        version: RUN_FORMAT_VERSION,
        crc: 0,
    };
    let zeroed = encoding::encode_to_vec(&footer)?;
    footer.crc = compute_crc(&zeroed);
    let footer_bytes = encoding::encode_to_vec(&footer)?;

    let footer_len = u32::try_from(footer_bytes.len())
        .map_err(|_| RunError::Internal("footer exceeds u32::MAX bytes".into()))?;

    writer.write_all(&footer_bytes)?;
    writer.write_all(&footer_len.to_le_bytes())?;
    writer.write_all(&RUN_MAGIC)?;

    // 6. Flush and fsync; the caller renames into place.
    writer.flush()?;
    drop(writer);
    file.sync_all()?;
    let file_size = file.metadata()?.len();

    Ok(RunSummary {
        entry_count: written,
        min_key,
        max_key,
        file_size,
    })
}
