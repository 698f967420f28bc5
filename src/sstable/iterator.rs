//! Sorted-run iterators — block-level and multi-block scan.
//!
//! - [`BlockIterator`] decodes one data block and yields [`Entry`] values,
//!   with `seek_to(key)` positioning.
//! - [`RunScanIterator`] walks consecutive data blocks lazily, yielding
//!   the entries of one run whose keys fall inside an inclusive range.
//!
//! A data block is a concatenation of cell frames:
//!
//! ```text
//! [RunCell header][KEY_BYTES][VALUE_BYTES]
//! ```
//!
//! Seeking is linear within a block; blocks are small (16 entries /
//! ~4 KiB) so the scan cost is bounded. Blocks arrive CRC-verified, so a
//! decode failure inside one is treated as corruption-at-the-tail: the
//! iterator logs and stops rather than yielding garbage.
//!
//! [`RunScanIterator`] is generic over how it holds the run: borrow a
//! [`SortedRun`] for local scans, or hand it an `Arc<SortedRun>` to pin
//! the run for the lifetime of the cursor — the engine's scan path uses
//! the latter so a concurrent compaction can retire the file without
//! pulling it out from under the iterator.

use std::ops::Deref;

use tracing::warn;

use crate::encoding;
use crate::engine::Entry;

use super::{RunCell, SortedRun};

// ------------------------------------------------------------------------------------------------
// Block Iterator
// ------------------------------------------------------------------------------------------------

/// Iterator over the entries of a single data block.
pub struct BlockIterator {
    /// Raw block payload (cell frames only, CRC already stripped).
    data: Vec<u8>,

    /// Cursor into `data`, always at the next cell header.
    cursor: usize,
}

impl BlockIterator {
    /// Creates an iterator over already-verified block bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }

    /// Positions the cursor at the first entry whose key is ≥ `search_key`.
    ///
    /// Linear scan; leaves the cursor at end-of-block when no such entry
    /// exists.
    pub fn seek_to(&mut self, search_key: &[u8]) {
        self.cursor = 0;
        while self.cursor < self.data.len() {
            match encoding::decode_from_slice::<RunCell>(&self.data[self.cursor..]) {
                Ok((cell, cell_len)) => {
                    let pos = self.cursor + cell_len;
                    let key_len = cell.key_len as usize;
                    let value_len = cell.value_len as usize;

                    if pos + key_len + value_len > self.data.len() {
                        self.cursor = self.data.len();
                        return;
                    }

                    let key_bytes = &self.data[pos..pos + key_len];
                    if key_bytes >= search_key {
                        // Leave the cursor at the start of this cell.
                        return;
                    }

                    self.cursor = pos + key_len + value_len;
                }
                Err(e) => {
                    warn!(cursor = self.cursor, error = %e, "cell decode failed during seek");
                    self.cursor = self.data.len();
                    return;
                }
            }
        }
    }

    /// Decodes the next entry and advances the cursor.
    fn next_entry(&mut self) -> Option<Entry> {
        if self.cursor >= self.data.len() {
            return None;
        }

        match encoding::decode_from_slice::<RunCell>(&self.data[self.cursor..]) {
            Ok((cell, cell_len)) => {
                self.cursor += cell_len;

                let key_len = cell.key_len as usize;
                let value_len = cell.value_len as usize;

                if self.cursor + key_len + value_len > self.data.len() {
                    self.cursor = self.data.len();
                    return None;
                }

                let key = self.data[self.cursor..self.cursor + key_len].to_vec();
                self.cursor += key_len;
                let value = if cell.tombstone {
                    self.cursor += value_len;
                    None
                } else {
                    let v = self.data[self.cursor..self.cursor + value_len].to_vec();
                    self.cursor += value_len;
                    Some(v)
                };

                Some(Entry {
                    key,
                    value,
                    seq: cell.seq,
                })
            }
            Err(e) => {
                warn!(cursor = self.cursor, error = %e, "cell decode failed during iteration");
                self.cursor = self.data.len();
                None
            }
        }
    }
}

impl Iterator for BlockIterator {
    type Item = Entry;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

// ------------------------------------------------------------------------------------------------
// Run Scan Iterator
// ------------------------------------------------------------------------------------------------

/// Lazy forward scan over one sorted run, bounded by an inclusive key
/// range (`None` bounds are open-ended).
///
/// Blocks are loaded and decoded one at a time; when a block is
/// exhausted the iterator advances to the next. Tombstones are yielded —
/// visibility resolution belongs to the engine's merge layer.
///
/// The `S` parameter decides ownership: `&SortedRun` for borrowed scans,
/// `Arc<SortedRun>` for scans that pin the run.
pub struct RunScanIterator<S: Deref<Target = SortedRun> = &'static SortedRun> {
    run: S,

    /// Index of the block the current iterator was loaded from.
    current_block: usize,

    /// Iterator over the current block, `None` once the run is exhausted.
    block_iter: Option<BlockIterator>,

    /// Inclusive upper bound, if any.
    hi: Option<Vec<u8>>,
}

impl<S: Deref<Target = SortedRun>> RunScanIterator<S> {
    /// Creates a scan over `[lo, hi]` (inclusive; `None` = open-ended).
    pub fn new(run: S, lo: Option<Vec<u8>>, hi: Option<Vec<u8>>) -> Self {
        let (current_block, block_iter) = match &lo {
            Some(lo_key) => match run.locate_block(lo_key) {
                Some(idx) => (idx, Self::load(&run, idx, Some(lo_key))),
                // Scan starts before the first anchor: begin at block 0.
                None => (0, Self::load(&run, 0, None)),
            },
            None => (0, Self::load(&run, 0, None)),
        };

        Self {
            run,
            current_block,
            block_iter,
            hi,
        }
    }

    fn load(run: &SortedRun, block_idx: usize, seek_key: Option<&[u8]>) -> Option<BlockIterator> {
        if block_idx >= run.index.len() {
            return None;
        }
        match run.load_block(block_idx) {
            Ok(bytes) => {
                let mut iter = BlockIterator::new(bytes);
                if let Some(key) = seek_key {
                    iter.seek_to(key);
                }
                Some(iter)
            }
            Err(e) => {
                warn!(block_idx, error = %e, "failed to load data block during scan");
                None
            }
        }
    }

    fn advance_block(&mut self) -> bool {
        self.current_block += 1;
        self.block_iter = Self::load(&self.run, self.current_block, None);
        self.block_iter.is_some()
    }
}

impl<S: Deref<Target = SortedRun>> Iterator for RunScanIterator<S> {
    type Item = Entry;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let iter = self.block_iter.as_mut()?;

            if let Some(entry) = iter.next() {
                if let Some(hi) = &self.hi
                    && entry.key.as_slice() > hi.as_slice()
                {
                    self.block_iter = None;
                    return None;
                }
                return Some(entry);
            }

            if !self.advance_block() {
                return None;
            }
        }
    }
}
