//! The storage engine — a leveled LSM tree.
//!
//! ## Design Overview
//!
//! Data lives in three layers, queried newest-first:
//!
//! 1. **Active memtable** — in-memory sorted buffer backed by a WAL
//!    segment.
//! 2. **Frozen memtables** — read-only snapshots of previously active
//!    memtables awaiting flush.
//! 3. **Sorted runs** — immutable on-disk files organised into levels:
//!    L0 runs may overlap and are probed newest-first; L≥1 runs are
//!    pairwise key-disjoint.
//!
//! Writes acquire a sequence number under the write lock, append to the
//! WAL (fsynced), then update the active memtable. When the memtable
//! exceeds [`DbConfig::write_buffer_size`] it is frozen and a fresh
//! memtable + WAL segment take its place; the background worker flushes
//! frozen memtables to L0 runs and keeps the level invariants by running
//! leveled compactions (see [`crate::levels`]).
//!
//! ## Concurrency Model
//!
//! - Engine state sits behind one `RwLock`; reads take the read lock,
//!   writes and state swaps take the write lock.
//! - The manifest has its own lock and is never held across a merge.
//! - One background worker thread consumes flush and compaction jobs
//!   from a crossbeam channel. Compaction merges run without the state
//!   lock — only the final run-set swap takes it.
//! - Scans pin the run set via `Arc` clones taken under the read lock,
//!   so one `scan` call observes a consistent snapshot even while
//!   compaction retires files underneath it.
//!
//! ## Guarantees
//!
//! - **Durability**: every write is in the WAL before acknowledgement.
//! - **Crash recovery**: `open` replays the manifest and WAL segments to
//!   the last acknowledged state; runs on disk are already durable.
//! - **Recency**: lookups return the highest-sequence version of a key,
//!   respecting tombstones.
//! - **Back-pressure**: when flushing falls behind, `put` blocks and
//!   flushes synchronously; writes are never dropped.

pub mod utils;
pub use utils::{Entry, MergeIterator, VisibilityFilter};

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::levels::{self, CompactionError};
use crate::manifest::{Manifest, ManifestError, ManifestRunEntry, parse_run_file_name};
use crate::memtable::{FrozenMemtable, Memtable, MemtableError, MemtableGetResult};
use crate::sstable::{RunError, RunScanIterator, RunWriter, SortedRun};
use crate::wal;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the manifest subsystem.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error originating from the memtable subsystem.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from a sorted run.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// Error originating from compaction.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state is inconsistent; operator intervention required.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The engine latched into a fatal state after repeated background
    /// failures and refuses further requests.
    #[error("engine is in a fatal state")]
    Fatal,

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Max memtable size in bytes before it is frozen for flush.
    pub write_buffer_size: usize,

    /// Frozen memtables allowed to queue before `put` flushes
    /// synchronously (back-pressure).
    pub max_frozen_memtables: usize,

    /// L0 run count that triggers compaction into L1.
    pub l0_compaction_trigger: usize,

    /// Base byte budget `B0`; level `L` gets `level_base_bytes ·
    /// level_growth_factor^L`.
    pub level_base_bytes: u64,

    /// Per-level size multiplier.
    pub level_growth_factor: u64,

    /// Upper bound on the size of a single compaction output run.
    pub target_run_bytes: usize,

    /// Base delay for compaction retry backoff.
    pub compaction_retry_base_ms: u64,

    /// Background failures tolerated before the engine latches fatal.
    pub compaction_max_retries: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            max_frozen_memtables: 2,
            l0_compaction_trigger: 4,
            level_base_bytes: 10 * 1024 * 1024,
            level_growth_factor: 10,
            target_run_bytes: 2 * 1024 * 1024,
            compaction_retry_base_ms: 50,
            compaction_max_retries: 5,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Per-level statistics returned by [`Db::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStats {
    /// Level number.
    pub level: u32,
    /// Number of runs at this level.
    pub runs: usize,
    /// Total bytes held by this level.
    pub bytes: u64,
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Frozen memtables pending flush.
    pub frozen_count: usize,
    /// Total number of runs on disk.
    pub run_count: usize,
    /// Per-level breakdown, shallowest first.
    pub levels: Vec<LevelStats>,
}

// ------------------------------------------------------------------------------------------------
// Background jobs
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
enum Job {
    /// Flush the oldest frozen memtable to an L0 run.
    Flush,
    /// Re-evaluate the compaction triggers and run any eligible jobs.
    CompactionCheck,
    /// Stop the worker thread.
    Shutdown,
}

// ------------------------------------------------------------------------------------------------
// Engine state
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct EngineState {
    /// Active memtable accepting writes.
    active: Memtable,

    /// Frozen memtables awaiting flush, newest first.
    frozen: Vec<FrozenMemtable>,

    /// All open runs, kept ordered: L0 newest-first, then each deeper
    /// level in key order. Probe order equals recency order.
    runs: Vec<Arc<SortedRun>>,

    /// Next sequence number to assign.
    next_seq: u64,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<EngineState>,

    /// Manifest; its own lock, never held across a merge.
    manifest: Mutex<Manifest>,

    /// Serializes compaction jobs: the background worker and the public
    /// [`Db::compact`] must never merge overlapping inputs concurrently.
    compaction: Mutex<()>,

    /// Background job queue.
    jobs: Sender<Job>,

    /// Latched after repeated background failures.
    fatal: AtomicBool,

    /// Worker handle, joined on close.
    worker: Mutex<Option<JoinHandle<()>>>,

    data_dir: PathBuf,

    config: DbConfig,
}

/// The storage engine handle.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Debug)]
pub struct Db {
    shared: Arc<Shared>,
}

impl Clone for Db {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Iterator returned by [`Db::scan`].
pub type ScanIter = VisibilityFilter<MergeIterator<'static>>;

impl Db {
    /// Opens (or creates) a store rooted at `path`.
    ///
    /// Recovery sequence: load the manifest (snapshot + event replay),
    /// open every run it references (a missing file is corruption),
    /// remove orphaned run and WAL files left by crashes, rebuild the
    /// active and frozen memtables from their WAL segments, and restore
    /// the sequence counter.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, EngineError> {
        let data_dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        // 1. Manifest.
        let manifest = Manifest::open(&data_dir)?;
        let run_entries = manifest.runs()?;
        let manifest_seq = manifest.last_seq()?;

        // 2. Open committed runs; a manifest entry without its file means
        //    the directory is damaged beyond WAL redo.
        let mut runs = Vec::with_capacity(run_entries.len());
        for entry in &run_entries {
            let run_path = data_dir.join(entry.file_name());
            if !run_path.exists() {
                return Err(EngineError::Corruption(format!(
                    "manifest references missing run file {}",
                    run_path.display()
                )));
            }
            let run = SortedRun::open(&run_path, entry.id, entry.level)?;
            runs.push(Arc::new(run));
        }
        sort_runs(&mut runs);

        // 3. Remove orphan run files (crash between build and commit).
        for dir_entry in fs::read_dir(&data_dir)? {
            let file_path = dir_entry?.path();
            if !file_path.is_file() {
                continue;
            }
            if let Some((_, id)) = parse_run_file_name(&file_path)
                && !run_entries.iter().any(|e| e.id == id)
            {
                warn!(path = %file_path.display(), "removing orphan run file");
                fs::remove_file(&file_path)?;
            }
        }

        // 4. Active + frozen memtables from their WAL segments.
        let active_wal = manifest.active_wal()?;
        let active = Memtable::open(
            wal::segment_path(&data_dir, active_wal),
            active_wal,
            config.write_buffer_size,
        )?;

        let frozen_ids = manifest.frozen_wals()?;
        let mut frozen = Vec::with_capacity(frozen_ids.len());
        for id in &frozen_ids {
            let table = Memtable::open(
                wal::segment_path(&data_dir, *id),
                *id,
                config.write_buffer_size,
            )?;
            frozen.push(table.freeze());
        }
        // Newest first, by segment id — flushes retire the oldest (last).
        frozen.sort_by(|a, b| b.wal_segment_seq().cmp(&a.wal_segment_seq()));

        // 5. Remove orphan WAL segments (neither active nor frozen).
        for dir_entry in fs::read_dir(&data_dir)? {
            let file_path = dir_entry?.path();
            if let Some(seq) = wal::parse_segment_seq(&file_path)
                && seq != active_wal
                && !frozen_ids.contains(&seq)
            {
                warn!(path = %file_path.display(), "removing orphan WAL segment");
                fs::remove_file(&file_path)?;
            }
        }

        // 6. Restore the sequence counter past everything recovered.
        let mut max_seq = manifest_seq.max(active.max_seq());
        for table in &frozen {
            max_seq = max_seq.max(table.max_seq());
        }

        info!(
            dir = %data_dir.display(),
            runs = runs.len(),
            frozen = frozen.len(),
            next_seq = max_seq + 1,
            "store opened"
        );

        let (tx, rx) = unbounded();

        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState {
                active,
                frozen,
                runs,
                next_seq: max_seq + 1,
            }),
            manifest: Mutex::new(manifest),
            compaction: Mutex::new(()),
            jobs: tx,
            fatal: AtomicBool::new(false),
            worker: Mutex::new(None),
            data_dir,
            config,
        });

        let worker = spawn_worker(Arc::downgrade(&shared), rx)?;
        *shared
            .worker
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))? = Some(worker);

        let db = Self { shared };

        // Recovery may leave frozen memtables or an over-full L0 behind.
        db.enqueue(Job::Flush);
        db.enqueue(Job::CompactionCheck);

        Ok(db)
    }

    /// Gracefully shuts down the engine.
    ///
    /// Stops the background worker, flushes all frozen memtables, records
    /// the final sequence number, and checkpoints the manifest.
    pub fn close(&self) -> Result<(), EngineError> {
        // Stop the worker first so it cannot race the final flush.
        self.enqueue(Job::Shutdown);
        let handle = {
            let mut guard = self
                .shared
                .worker
                .lock()
                .map_err(|_| EngineError::Internal("Mutex poisoned".into()))?;
            guard.take()
        };
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("background worker panicked");
        }

        let mut state = self.write_state()?;
        while !state.frozen.is_empty() {
            self.flush_oldest_frozen_locked(&mut state)?;
        }

        let last_seq = state.next_seq.saturating_sub(1);
        drop(state);

        {
            let mut manifest = self.lock_manifest()?;
            manifest.update_seq(last_seq)?;
            manifest.checkpoint()?;
        }

        // Fsync the data directory so file creations/unlinks are durable.
        if let Ok(dir) = fs::File::open(&self.shared.data_dir) {
            dir.sync_all()?;
        }

        info!(dir = %self.shared.data_dir.display(), "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Inserts or overwrites a key.
    ///
    /// The sequence number is assigned under the write lock, the WAL
    /// record is fsynced, then the memtable slot is updated. A WAL
    /// failure leaves the memtable untouched and surfaces as an error.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        self.check_fatal()?;
        let mut state = self.write_state()?;

        let seq = state.next_seq;
        match state.active.put(key.clone(), value.clone(), seq) {
            Ok(()) => {
                state.next_seq = seq + 1;
                Ok(())
            }
            Err(MemtableError::FlushRequired) => {
                self.freeze_active_locked(&mut state)?;
                state.active.put(key, value, seq)?;
                state.next_seq = seq + 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        self.check_fatal()?;
        let mut state = self.write_state()?;

        let seq = state.next_seq;
        match state.active.delete(key.clone(), seq) {
            Ok(()) => {
                state.next_seq = seq + 1;
                Ok(())
            }
            Err(MemtableError::FlushRequired) => {
                self.freeze_active_locked(&mut state)?;
                state.active.delete(key, seq)?;
                state.next_seq = seq + 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Looks up a single key.
    ///
    /// Probe order: active memtable → frozen memtables (newest first) →
    /// L0 runs (newest first) → L1, L2, … (at most one candidate run per
    /// disjoint level). Each run is bloom-checked before its blocks are
    /// touched. The first hit wins; a tombstone hit means not-found.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.check_fatal()?;
        let state = self.read_state()?;

        match state.active.get(key)? {
            MemtableGetResult::Put(value) => return Ok(Some(value)),
            MemtableGetResult::Delete => return Ok(None),
            MemtableGetResult::NotFound => {}
        }

        for frozen in &state.frozen {
            match frozen.get(key)? {
                MemtableGetResult::Put(value) => return Ok(Some(value)),
                MemtableGetResult::Delete => return Ok(None),
                MemtableGetResult::NotFound => {}
            }
        }

        // Runs are ordered shallowest-level first and, within L0, newest
        // first — the first definitive answer is the most recent one.
        for run in &state.runs {
            if !run.key_in_range(key) || !run.might_contain(key) {
                continue;
            }
            if let Some(entry) = run.get(key)? {
                return Ok(entry.value);
            }
        }

        Ok(None)
    }

    /// Scans all live key-value pairs with keys in `[lo, hi]` (inclusive;
    /// `None` bounds are open-ended), in strictly increasing key order.
    ///
    /// Each key appears at most once, carrying its newest value;
    /// tombstoned keys are omitted. The call observes a consistent
    /// snapshot: memtable contents are captured and run handles pinned
    /// under one read-lock acquisition.
    pub fn scan(&self, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<ScanIter, EngineError> {
        self.check_fatal()?;
        let state = self.read_state()?;

        let mut iters: Vec<Box<dyn Iterator<Item = Entry>>> = Vec::new();

        let active: Vec<Entry> = state.active.scan(lo, hi)?.collect();
        iters.push(Box::new(active.into_iter()));

        for frozen in &state.frozen {
            let entries: Vec<Entry> = frozen.scan(lo, hi)?.collect();
            iters.push(Box::new(entries.into_iter()));
        }

        // Pin each overlapping run with an Arc clone; the cursors stay
        // valid even if compaction retires the files mid-scan.
        for run in &state.runs {
            if !run.overlaps(lo, hi) {
                continue;
            }
            let cursor: RunScanIterator<Arc<SortedRun>> = RunScanIterator::new(
                Arc::clone(run),
                lo.map(<[u8]>::to_vec),
                hi.map(<[u8]>::to_vec),
            );
            iters.push(Box::new(cursor));
        }

        drop(state);

        Ok(VisibilityFilter::new(MergeIterator::new(iters)))
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<DbStats, EngineError> {
        let state = self.read_state()?;

        let grouped = levels::group_by_level(&state.runs);
        let levels = grouped
            .iter()
            .enumerate()
            .map(|(level, runs)| LevelStats {
                level: level as u32,
                runs: runs.len(),
                bytes: levels::level_bytes(runs),
            })
            .collect();

        Ok(DbStats {
            frozen_count: state.frozen.len(),
            run_count: state.runs.len(),
            levels,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Forces all buffered writes onto disk as L0 runs.
    ///
    /// Freezes the active memtable (if non-empty) and flushes every
    /// frozen memtable synchronously.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.check_fatal()?;
        let mut state = self.write_state()?;

        if !state.active.is_empty() {
            self.freeze_active_locked(&mut state)?;
        }
        while !state.frozen.is_empty() {
            self.flush_oldest_frozen_locked(&mut state)?;
        }
        drop(state);

        self.enqueue(Job::CompactionCheck);
        Ok(())
    }

    /// Runs a full compaction: every run merged into the bottom level,
    /// with all spent tombstones reclaimed.
    ///
    /// The background worker keeps the levels within policy on its own;
    /// this explicit entry point exists for operator tooling and for
    /// tests that need the tree fully collapsed.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.check_fatal()?;

        let _job_guard = self
            .shared
            .compaction
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))?;

        let snapshot: Vec<Arc<SortedRun>> = {
            let state = self.read_state()?;
            state.runs.clone()
        };

        if let Some(job) = levels::full_compaction_job(&snapshot) {
            self.apply_job(&job)?;
        }
        Ok(())
    }

    /// Swaps in a fresh memtable; the old one joins the frozen queue.
    ///
    /// Back-pressure: when too many frozen memtables are already waiting,
    /// the caller (holding the write lock) flushes the oldest one
    /// synchronously before continuing — writers block rather than drop.
    fn freeze_active_locked(&self, state: &mut EngineState) -> Result<(), EngineError> {
        let old_wal = state.active.wal.segment_seq();
        let new_wal = old_wal + 1;
        let last_seq = state.next_seq.saturating_sub(1);

        let new_active = Memtable::open(
            wal::segment_path(&self.shared.data_dir, new_wal),
            new_wal,
            self.shared.config.write_buffer_size,
        )?;

        let old_active = std::mem::replace(&mut state.active, new_active);
        state.frozen.insert(0, old_active.freeze());

        {
            let manifest = self.lock_manifest()?;
            manifest.freeze_wal(old_wal, new_wal)?;
            manifest.update_seq(last_seq)?;
        }

        debug!(frozen_wal = old_wal, new_wal, "active memtable frozen");

        if state.frozen.len() > self.shared.config.max_frozen_memtables {
            warn!(
                frozen = state.frozen.len(),
                "flush back-pressure: flushing synchronously"
            );
            self.flush_oldest_frozen_locked(state)?;
        } else {
            self.enqueue(Job::Flush);
        }

        Ok(())
    }

    /// Flushes the oldest frozen memtable into a new L0 run.
    ///
    /// The memtable stays in the frozen queue (readable) until the flush
    /// has fully committed — a failure leaves it in place for a retry.
    /// Commit order matters for recovery: record the sequence number,
    /// add the run, then drop the frozen WAL — a crash at any point
    /// leaves a state `open` can repair.
    fn flush_oldest_frozen_locked(&self, state: &mut EngineState) -> Result<(), EngineError> {
        // Oldest = last in the newest-first queue.
        let Some(frozen) = state.frozen.last() else {
            return Ok(());
        };
        let wal_id = frozen.wal_segment_seq();
        let wal_path = frozen.wal_path();

        if frozen.is_empty() {
            // Nothing buffered; just retire the segment.
            {
                let manifest = self.lock_manifest()?;
                manifest.remove_frozen_wal(wal_id)?;
            }
            drop(state.frozen.pop());
            remove_file_logged(&wal_path);
            return Ok(());
        }

        let entry_count = frozen.len();
        let max_seq = frozen.max_seq();
        let flush_stream = frozen.iter_for_flush()?;

        let run_id = {
            let manifest = self.lock_manifest()?;
            manifest.allocate_run_id()?
        };
        let run_path = levels::run_path(&self.shared.data_dir, 0, run_id);

        let summary = RunWriter::new(&run_path).build(flush_stream, entry_count)?;

        {
            let manifest = self.lock_manifest()?;
            manifest.update_seq(max_seq)?;
            manifest.add_run(ManifestRunEntry {
                id: run_id,
                level: 0,
                min_key: summary.min_key,
                max_key: summary.max_key,
                entry_count: summary.entry_count,
            })?;
            manifest.remove_frozen_wal(wal_id)?;
        }

        let run = SortedRun::open(&run_path, run_id, 0)?;
        state.runs.push(Arc::new(run));
        sort_runs(&mut state.runs);

        // The run is published and readable; now retire the memtable and
        // its WAL segment.
        drop(state.frozen.pop());
        remove_file_logged(&wal_path);

        info!(
            run_id,
            entries = entry_count,
            wal = wal_id,
            "memtable flushed to L0"
        );

        self.enqueue(Job::CompactionCheck);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Picks and executes at most one compaction job.
    ///
    /// The merge runs without the state lock: inputs are immutable and
    /// pinned by the job's `Arc`s. Only the final run-set swap is an
    /// exclusive critical section.
    fn run_one_compaction(&self) -> Result<bool, EngineError> {
        let _job_guard = self
            .shared
            .compaction
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))?;

        let snapshot: Vec<Arc<SortedRun>> = {
            let state = self.read_state()?;
            state.runs.clone()
        };

        let Some(job) = levels::pick_job(&snapshot, &self.shared.config) else {
            return Ok(false);
        };

        self.apply_job(&job)?;
        Ok(true)
    }

    /// Executes one job and swaps the results into the run set.
    ///
    /// The caller must hold the compaction mutex. The merge itself runs
    /// without the state lock; only the final swap is exclusive.
    fn apply_job(&self, job: &levels::CompactionJob) -> Result<(), EngineError> {
        let outcome = levels::execute_job(
            job,
            &self.shared.manifest,
            &self.shared.data_dir,
            &self.shared.config,
        )?;

        // Open the outputs before taking the write lock.
        let mut new_runs = Vec::with_capacity(outcome.added.len());
        for entry in &outcome.added {
            let path = self.shared.data_dir.join(entry.file_name());
            let run = SortedRun::open(&path, entry.id, entry.level)?;
            new_runs.push(Arc::new(run));
        }

        let mut state = self.write_state()?;
        state.runs.retain(|run| !outcome.removed_ids.contains(&run.id));
        state.runs.extend(new_runs);
        sort_runs(&mut state.runs);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Test support: pins and returns the current run set.
    #[cfg(test)]
    pub(crate) fn pinned_runs_for_test(&self) -> Result<Vec<Arc<SortedRun>>, EngineError> {
        Ok(self.read_state()?.runs.clone())
    }

    fn enqueue(&self, job: Job) {
        // A disconnected channel means the worker is gone (shutdown in
        // progress); jobs are then handled synchronously by close().
        let _ = self.shared.jobs.send(job);
    }

    fn check_fatal(&self) -> Result<(), EngineError> {
        if self.shared.fatal.load(Ordering::SeqCst) {
            return Err(EngineError::Fatal);
        }
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineState>, EngineError> {
        self.shared
            .state
            .read()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, EngineState>, EngineError> {
        self.shared
            .state
            .write()
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn lock_manifest(&self) -> Result<std::sync::MutexGuard<'_, Manifest>, EngineError> {
        self.shared
            .manifest
            .lock()
            .map_err(|_| EngineError::Internal("Mutex poisoned".into()))
    }
}

/// Keeps the run vec in probe order: L0 newest-first, then each deeper
/// level in key order.
fn sort_runs(runs: &mut [Arc<SortedRun>]) {
    runs.sort_by(|a, b| {
        a.level.cmp(&b.level).then_with(|| {
            if a.level == 0 {
                b.id.cmp(&a.id)
            } else {
                a.min_key().cmp(b.min_key())
            }
        })
    });
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove file");
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker
// ------------------------------------------------------------------------------------------------

/// Spawns the flush/compaction worker.
///
/// The worker holds only a `Weak` reference to the shared state so that
/// dropping the last user handle disconnects the job channel and ends
/// the thread. Flush and compaction failures retry with exponential
/// backoff; once the retry budget is exhausted the engine latches into a
/// fatal state and refuses further requests. Inputs are never retired on
/// a failed compaction, so a retry starts from intact state.
fn spawn_worker(
    shared: std::sync::Weak<Shared>,
    rx: Receiver<Job>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("stratumdb-worker".into())
        .spawn(move || {
            for job in rx.iter() {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let db = Db { shared };

                match job {
                    Job::Shutdown => break,
                    Job::Flush => {
                        run_with_backoff(&db, "flush", |db| {
                            // Drain the whole frozen queue, releasing the
                            // write lock between tables so readers and
                            // writers can interleave.
                            loop {
                                let mut state = db.write_state()?;
                                if state.frozen.is_empty() {
                                    return Ok(());
                                }
                                db.flush_oldest_frozen_locked(&mut state)?;
                            }
                        });
                    }
                    Job::CompactionCheck => {
                        run_with_backoff(&db, "compaction", |db| {
                            while db.run_one_compaction()? {}
                            Ok(())
                        });
                    }
                }

                if db.shared.fatal.load(Ordering::SeqCst) {
                    break;
                }
            }

            debug!("background worker stopped");
        })
}

/// Retries a background operation with exponential backoff; latches the
/// fatal flag once the retry budget is spent.
fn run_with_backoff(db: &Db, what: &str, op: impl Fn(&Db) -> Result<(), EngineError>) {
    let base = db.shared.config.compaction_retry_base_ms;
    let max_retries = db.shared.config.compaction_max_retries;

    for attempt in 0..=max_retries {
        match op(db) {
            Ok(()) => return,
            Err(e) => {
                if attempt == max_retries {
                    error!(what, error = %e, "background work failed; engine entering fatal state");
                    db.shared.fatal.store(true, Ordering::SeqCst);
                    return;
                }
                let delay = base.saturating_mul(1 << attempt);
                warn!(what, attempt, delay_ms = delay, error = %e, "background work failed; retrying");
                std::thread::sleep(Duration::from_millis(delay));
            }
        }
    }
}
