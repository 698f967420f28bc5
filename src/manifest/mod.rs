//! Manifest — the durable metadata authority of the store.
//!
//! The manifest tracks the committed shape of the LSM tree:
//!
//! - every sorted run, with its level, key range, and entry count,
//! - the active WAL segment id and the frozen segments awaiting flush,
//! - the last durable sequence number,
//! - the monotonic run-id allocator.
//!
//! ## Durability model
//!
//! Metadata is persisted with a **WAL + snapshot** scheme, reusing the
//! same [`Wal`] machinery as the memtable:
//!
//! 1. `manifest.log` records every mutation as a [`ManifestEvent`].
//! 2. `MANIFEST` is a CRC-protected snapshot of the whole
//!    [`ManifestData`], written atomically (temp file + rename) by
//!    [`Manifest::checkpoint`], which then truncates the event log.
//! 3. On open: load the snapshot if present (corruption is surfaced, not
//!    skipped), then replay `manifest.log` over it.
//!
//! Compactions commit through a single [`ManifestEvent::Compaction`]
//! event carrying both the added and the removed runs, so a crash can
//! never observe a half-applied compaction.
//!
//! ## Thread safety
//!
//! The WAL is internally synchronized; [`ManifestData`] sits behind a
//! `Mutex`. The manifest can be used from any engine thread.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{Wal, WalError};

/// Manifest snapshot filename.
pub const SNAPSHOT_FILENAME: &str = "MANIFEST";

/// Manifest event-log filename. A fixed, single-segment WAL — truncated
/// to empty on every checkpoint, never rotated.
pub const LOG_FILENAME: &str = "manifest.log";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snapshot file is corrupted or its checksum mismatched.
    #[error("Snapshot checksum mismatch")]
    SnapshotChecksumMismatch,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Run entries
// ------------------------------------------------------------------------------------------------

/// Committed metadata for one sorted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRunEntry {
    /// Globally unique run id.
    pub id: u64,

    /// LSM level the run belongs to.
    pub level: u32,

    /// Smallest key in the run.
    pub min_key: Vec<u8>,

    /// Largest key in the run.
    pub max_key: Vec<u8>,

    /// Number of entries in the run (tombstones included).
    pub entry_count: u64,
}

impl ManifestRunEntry {
    /// On-disk file name of this run: `L<level>-<id>.sst`.
    pub fn file_name(&self) -> String {
        run_file_name(self.level, self.id)
    }
}

/// Builds the run file name for a `(level, id)` pair.
pub fn run_file_name(level: u32, id: u64) -> String {
    format!("L{level}-{id:06}.sst")
}

/// Parses `(level, id)` back out of a `L<level>-<id>.sst` file name.
pub fn parse_run_file_name(path: &Path) -> Option<(u32, u64)> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix('L')?.strip_suffix(".sst")?;
    let (level, id) = rest.split_once('-')?;
    Some((level.parse().ok()?, id.parse().ok()?))
}

impl Encode for ManifestRunEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ManifestRunEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (entry_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                level,
                min_key,
                max_key,
                entry_count,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest data
// ------------------------------------------------------------------------------------------------

/// In-memory image of the manifest's durable state.
///
/// Fields are private; all mutation flows through the event-logged
/// [`Manifest`] API so the on-disk log and the in-memory image cannot
/// diverge.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ManifestData {
    /// Snapshot generation, incremented on every checkpoint.
    version: u64,

    /// Last sequence number known durable.
    last_seq: u64,

    /// Id of the active memtable WAL segment.
    active_wal: u64,

    /// Frozen WAL segments whose memtables await flush, newest last.
    frozen_wals: Vec<u64>,

    /// All committed runs.
    runs: Vec<ManifestRunEntry>,

    /// Next run id to allocate.
    next_run_id: u64,

    /// Runtime-only: true when in-memory state diverges from the last
    /// snapshot. Never serialized.
    dirty: bool,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            version: 1,
            last_seq: 0,
            active_wal: 0,
            frozen_wals: Vec::new(),
            runs: Vec::new(),
            next_run_id: 1,
            dirty: false,
        }
    }
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.version.encode_to(buf)?;
        self.last_seq.encode_to(buf)?;
        self.active_wal.encode_to(buf)?;
        encoding::encode_vec(&self.frozen_wals, buf)?;
        encoding::encode_vec(&self.runs, buf)?;
        self.next_run_id.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ManifestData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (version, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (active_wal, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (frozen_wals, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        let (runs, n) = encoding::decode_vec::<ManifestRunEntry>(&buf[offset..])?;
        offset += n;
        let (next_run_id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                version,
                last_seq,
                active_wal,
                frozen_wals,
                runs,
                next_run_id,
                dirty: false,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest events
// ------------------------------------------------------------------------------------------------

/// One metadata mutation, as logged to `manifest.log`.
#[derive(Debug, PartialEq)]
pub enum ManifestEvent {
    /// A memtable freeze: `frozen` joins the frozen list and `active`
    /// becomes the new active segment, in one atomic event. Logging the
    /// two halves separately would open a crash window in which a
    /// segment is both active and frozen.
    Freeze { frozen: u64, active: u64 },

    /// Removes a frozen WAL after its memtable was flushed.
    RemoveFrozenWal { wal: u64 },

    /// Adds a freshly-flushed run.
    AddRun { entry: ManifestRunEntry },

    /// Updates the last durable sequence number.
    UpdateSeq { last_seq: u64 },

    /// Persists a run-id allocation.
    AllocateRunId { id: u64 },

    /// One atomic compaction: `added` runs replace the `removed` ids.
    Compaction {
        added: Vec<ManifestRunEntry>,
        removed: Vec<u64>,
    },
}

impl Encode for ManifestEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEvent::Freeze { frozen, active } => {
                0u32.encode_to(buf)?;
                frozen.encode_to(buf)?;
                active.encode_to(buf)?;
            }
            ManifestEvent::RemoveFrozenWal { wal } => {
                1u32.encode_to(buf)?;
                wal.encode_to(buf)?;
            }
            ManifestEvent::AddRun { entry } => {
                2u32.encode_to(buf)?;
                entry.encode_to(buf)?;
            }
            ManifestEvent::UpdateSeq { last_seq } => {
                3u32.encode_to(buf)?;
                last_seq.encode_to(buf)?;
            }
            ManifestEvent::AllocateRunId { id } => {
                4u32.encode_to(buf)?;
                id.encode_to(buf)?;
            }
            ManifestEvent::Compaction { added, removed } => {
                5u32.encode_to(buf)?;
                encoding::encode_vec(added, buf)?;
                encoding::encode_vec(removed, buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (frozen, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (active, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEvent::Freeze { frozen, active }, offset))
            }
            1 => {
                let (wal, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEvent::RemoveFrozenWal { wal }, offset))
            }
            2 => {
                let (entry, n) = ManifestRunEntry::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEvent::AddRun { entry }, offset))
            }
            3 => {
                let (last_seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEvent::UpdateSeq { last_seq }, offset))
            }
            4 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestEvent::AllocateRunId { id }, offset))
            }
            5 => {
                let (added, n) = encoding::decode_vec::<ManifestRunEntry>(&buf[offset..])?;
                offset += n;
                let (removed, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                Ok((ManifestEvent::Compaction { added, removed }, offset))
            }
            _ => Err(EncodingError::InvalidTag {
                tag,
                type_name: "ManifestEvent",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest
// ------------------------------------------------------------------------------------------------

/// The manifest handle: event log + mutex-protected in-memory image.
#[derive(Debug)]
pub struct Manifest {
    /// Event log; internally synchronized.
    wal: Wal<ManifestEvent>,

    /// Current metadata image.
    data: Mutex<ManifestData>,

    /// Directory holding `MANIFEST` and `manifest.log`.
    dir: PathBuf,
}

impl Manifest {
    /// Opens (or creates) the manifest rooted at `dir`.
    ///
    /// Loads the snapshot when one exists — a corrupt snapshot is an
    /// error, not a silent reset — then replays the event log over it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        let snapshot_path = dir.join(SNAPSHOT_FILENAME);
        let log_path = dir.join(LOG_FILENAME);

        let mut data = if snapshot_path.exists() {
            read_snapshot(&snapshot_path)?
        } else {
            ManifestData::default()
        };

        let wal = Wal::open(&log_path, 0, None)?;

        let mut replayed = 0usize;
        for event in wal.replay_iter()? {
            let event = event?;
            apply_event(&mut data, event);
            replayed += 1;
        }
        if replayed > 0 {
            data.dirty = true;
        }

        info!(
            dir = %dir.display(),
            version = data.version,
            runs = data.runs.len(),
            replayed_events = replayed,
            "manifest opened"
        );

        Ok(Self {
            wal,
            data: Mutex::new(data),
            dir,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Getters
    // --------------------------------------------------------------------------------------------

    /// Id of the active memtable WAL segment.
    pub fn active_wal(&self) -> Result<u64, ManifestError> {
        Ok(self.lock()?.active_wal)
    }

    /// Frozen WAL segment ids, in the order they were frozen.
    pub fn frozen_wals(&self) -> Result<Vec<u64>, ManifestError> {
        Ok(self.lock()?.frozen_wals.clone())
    }

    /// All committed run entries.
    pub fn runs(&self) -> Result<Vec<ManifestRunEntry>, ManifestError> {
        Ok(self.lock()?.runs.clone())
    }

    /// Last sequence number recorded durable.
    pub fn last_seq(&self) -> Result<u64, ManifestError> {
        Ok(self.lock()?.last_seq)
    }

    /// Whether in-memory state has diverged from the last snapshot.
    pub fn is_dirty(&self) -> Result<bool, ManifestError> {
        Ok(self.lock()?.dirty)
    }

    // --------------------------------------------------------------------------------------------
    // Mutators — each logs one event, then applies it
    // --------------------------------------------------------------------------------------------

    /// Records a memtable freeze: `frozen_id` joins the frozen list and
    /// `active_id` becomes the active segment, atomically.
    pub fn freeze_wal(&self, frozen_id: u64, active_id: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEvent::Freeze {
            frozen: frozen_id,
            active: active_id,
        })
    }

    /// Removes a frozen WAL segment after its flush completed.
    pub fn remove_frozen_wal(&self, wal_id: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEvent::RemoveFrozenWal { wal: wal_id })
    }

    /// Commits a freshly-flushed run.
    pub fn add_run(&self, entry: ManifestRunEntry) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEvent::AddRun { entry })
    }

    /// Records the last durable sequence number (monotonic).
    pub fn update_seq(&self, last_seq: u64) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEvent::UpdateSeq { last_seq })
    }

    /// Allocates and persists the next unique run id.
    ///
    /// The data lock is held across the WAL append so two concurrent
    /// allocations can never observe the same counter value.
    pub fn allocate_run_id(&self) -> Result<u64, ManifestError> {
        let mut guard = self.lock()?;
        let id = guard.next_run_id;
        let event = ManifestEvent::AllocateRunId { id };
        self.wal.append(&event)?;
        apply_event(&mut guard, event);
        guard.dirty = true;
        Ok(id)
    }

    /// Commits a compaction as one atomic event: `added` runs replace
    /// the runs named in `removed`.
    pub fn apply_compaction(
        &self,
        added: Vec<ManifestRunEntry>,
        removed: Vec<u64>,
    ) -> Result<(), ManifestError> {
        self.log_and_apply(ManifestEvent::Compaction { added, removed })
    }

    fn log_and_apply(&self, event: ManifestEvent) -> Result<(), ManifestError> {
        self.wal.append(&event)?;
        let mut guard = self.lock()?;
        apply_event(&mut guard, event);
        guard.dirty = true;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoint
    // --------------------------------------------------------------------------------------------

    /// Folds the event log into a fresh snapshot.
    ///
    /// Writes `MANIFEST` atomically (temp + rename + fsync), then
    /// truncates `manifest.log`. On a crash between the two steps the
    /// replayed events are idempotent over the new snapshot.
    pub fn checkpoint(&mut self) -> Result<(), ManifestError> {
        let image = {
            let mut guard = self.lock()?;
            guard.version += 1;
            guard.dirty = false;
            guard.clone()
        };

        let snapshot_path = self.dir.join(SNAPSHOT_FILENAME);
        write_snapshot(&snapshot_path, &image)?;

        self.wal.truncate()?;

        debug!(version = image.version, runs = image.runs.len(), "manifest checkpoint");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManifestData>, ManifestError> {
        self.data
            .lock()
            .map_err(|_| ManifestError::Internal("Mutex poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Event application
// ------------------------------------------------------------------------------------------------

fn apply_event(data: &mut ManifestData, event: ManifestEvent) {
    match event {
        ManifestEvent::Freeze { frozen, active } => {
            if !data.frozen_wals.contains(&frozen) {
                data.frozen_wals.push(frozen);
            }
            data.active_wal = active;
        }
        ManifestEvent::RemoveFrozenWal { wal } => {
            data.frozen_wals.retain(|w| *w != wal);
        }
        ManifestEvent::AddRun { entry } => {
            data.runs.retain(|r| r.id != entry.id);
            data.runs.push(entry);
        }
        ManifestEvent::UpdateSeq { last_seq } => {
            data.last_seq = data.last_seq.max(last_seq);
        }
        ManifestEvent::AllocateRunId { id } => {
            data.next_run_id = data.next_run_id.max(id + 1);
        }
        ManifestEvent::Compaction { added, removed } => {
            data.runs.retain(|r| !removed.contains(&r.id));
            for entry in added {
                data.runs.retain(|r| r.id != entry.id);
                data.runs.push(entry);
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot I/O
// ------------------------------------------------------------------------------------------------

/// Snapshot layout: `[encoded ManifestData][u32 crc32 LE]`.
fn write_snapshot(path: &Path, data: &ManifestData) -> Result<(), ManifestError> {
    let bytes = encoding::encode_to_vec(data)?;
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let checksum = hasher.finalize();

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    // Fsync the directory so the rename itself is durable.
    if let Some(dir) = path.parent()
        && let Ok(dir_file) = File::open(dir)
        && let Err(e) = dir_file.sync_all()
    {
        warn!(error = %e, "directory fsync failed after snapshot rename");
    }

    Ok(())
}

fn read_snapshot(path: &Path) -> Result<ManifestData, ManifestError> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    if bytes.len() < 4 {
        return Err(ManifestError::SnapshotChecksumMismatch);
    }

    let (payload, checksum_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(
        checksum_bytes
            .try_into()
            .map_err(|_| ManifestError::SnapshotChecksumMismatch)?,
    );

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored {
        return Err(ManifestError::SnapshotChecksumMismatch);
    }

    let (data, _) = encoding::decode_from_slice::<ManifestData>(payload)?;
    Ok(data)
}
