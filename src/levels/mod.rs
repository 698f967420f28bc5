//! Level management and leveled compaction.
//!
//! Runs are organised into levels `L0..Ln`:
//!
//! - **L0** receives flushed memtables. Runs may overlap in key range and
//!   are probed newest-first (descending run id — flushes are sequential,
//!   so a higher id always holds newer data).
//! - **L≥1** holds pairwise key-disjoint runs, so at most one run per
//!   level can contain a given key. Each level has a byte budget
//!   `B_L = B0 · M^L` for growth factor `M`.
//!
//! ## Compaction policy
//!
//! A job is triggered when L0 reaches its run-count threshold, or when a
//! deeper level exceeds its byte budget:
//!
//! - **L0 → L1**: all L0 runs plus every L1 run overlapping their
//!   combined key range.
//! - **L_i → L_{i+1}** (i ≥ 1): the oldest run of L_i plus every
//!   L_{i+1} run overlapping it.
//!
//! The selected inputs are k-way merged in `(key ASC, seq DESC)` order;
//! for each key only the highest-seq version survives. A winning
//! tombstone is dropped entirely when the output level is the bottom of
//! the tree — there is no older data left for it to shadow. Output is
//! split into runs of at most `target_run_bytes`.
//!
//! ## Publication
//!
//! All output files are fully written (temp + rename each), then a single
//! atomic manifest event replaces the inputs, then the manifest is
//! checkpointed. Retired files are unlinked last; readers still holding
//! `Arc` pins keep reading through their mmaps.

#[cfg(test)]
mod tests;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::engine::{DbConfig, Entry, MergeIterator};
use crate::manifest::{Manifest, ManifestError, ManifestRunEntry, run_file_name};
use crate::sstable::{RunError, RunWriter, SortedRun};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Sorted-run read or write failure.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// Manifest commit failure.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Level views
// ------------------------------------------------------------------------------------------------

/// Groups a flat run set by level.
///
/// `result[L]` holds level `L`'s runs: L0 ordered newest-first
/// (descending id), deeper levels ordered by `min_key` (they are
/// disjoint, so this is key order).
pub fn group_by_level(runs: &[Arc<SortedRun>]) -> Vec<Vec<Arc<SortedRun>>> {
    let max_level = runs.iter().map(|r| r.level).max().unwrap_or(0) as usize;
    let mut levels: Vec<Vec<Arc<SortedRun>>> = vec![Vec::new(); max_level + 1];

    for run in runs {
        levels[run.level as usize].push(Arc::clone(run));
    }

    if let Some(l0) = levels.first_mut() {
        l0.sort_by(|a, b| b.id.cmp(&a.id));
    }
    for level in levels.iter_mut().skip(1) {
        level.sort_by(|a, b| a.min_key().cmp(b.min_key()));
    }

    levels
}

/// Total bytes held by one level.
pub fn level_bytes(level_runs: &[Arc<SortedRun>]) -> u64 {
    level_runs.iter().map(|r| r.file_size()).sum()
}

/// Byte budget of level `L ≥ 1`: `B0 · M^L`.
pub fn level_budget(config: &DbConfig, level: u32) -> u64 {
    config
        .level_base_bytes
        .saturating_mul(config.level_growth_factor.saturating_pow(level))
}

/// Deepest level that currently holds at least one run.
pub fn bottom_level(runs: &[Arc<SortedRun>]) -> u32 {
    runs.iter().map(|r| r.level).max().unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Job selection
// ------------------------------------------------------------------------------------------------

/// A selected compaction: merge `inputs` and write the result at
/// `target_level`.
pub struct CompactionJob {
    /// Level the job was triggered on.
    pub source_level: u32,

    /// Level the merged output lands on.
    pub target_level: u32,

    /// Every input run: the source runs plus all overlapping runs at the
    /// target level.
    pub inputs: Vec<Arc<SortedRun>>,

    /// Whether winning tombstones may be dropped: true when the output
    /// level is the bottom of the tree.
    pub drop_tombstones: bool,
}

/// Evaluates the compaction triggers against a run-set snapshot.
///
/// Returns the first eligible job, preferring L0 (read amplification
/// there hurts every lookup), then the shallowest over-budget level.
/// Returns `None` when the tree is within policy.
pub fn pick_job(runs: &[Arc<SortedRun>], config: &DbConfig) -> Option<CompactionJob> {
    let levels = group_by_level(runs);
    let bottom = bottom_level(runs);

    // L0: run-count trigger.
    if let Some(l0) = levels.first()
        && l0.len() >= config.l0_compaction_trigger
    {
        let job = select_job(&levels, 0, l0.clone(), bottom);
        debug!(
            l0_runs = l0.len(),
            inputs = job.inputs.len(),
            "L0 compaction triggered"
        );
        return Some(job);
    }

    // Deeper levels: byte-budget trigger.
    for (level, level_runs) in levels.iter().enumerate().skip(1) {
        let level = level as u32;
        let bytes = level_bytes(level_runs);
        if bytes <= level_budget(config, level) {
            continue;
        }

        // Oldest run first, round-robin by lowest id.
        let Some(victim) = level_runs.iter().min_by_key(|r| r.id) else {
            continue;
        };
        let job = select_job(&levels, level, vec![Arc::clone(victim)], bottom);
        debug!(
            level,
            bytes,
            budget = level_budget(config, level),
            inputs = job.inputs.len(),
            "level over budget, compaction triggered"
        );
        return Some(job);
    }

    None
}

/// Builds a full compaction: every run merged into the bottom-most
/// populated level (at least L1), all spent tombstones dropped.
///
/// This is the explicit, operator-triggered variant behind
/// [`Db::compact`](crate::engine::Db::compact); the automatic path goes
/// through [`pick_job`]. Returns `None` on an empty tree.
pub fn full_compaction_job(runs: &[Arc<SortedRun>]) -> Option<CompactionJob> {
    if runs.is_empty() {
        return None;
    }

    let target_level = bottom_level(runs).max(1);
    Some(CompactionJob {
        source_level: 0,
        target_level,
        inputs: runs.to_vec(),
        // The whole tree is merged: nothing older can remain for a
        // tombstone to shadow.
        drop_tombstones: true,
    })
}

/// Completes a job: adds every target-level run overlapping the source
/// runs' combined key range.
fn select_job(
    levels: &[Vec<Arc<SortedRun>>],
    source_level: u32,
    sources: Vec<Arc<SortedRun>>,
    bottom: u32,
) -> CompactionJob {
    let target_level = source_level + 1;

    let lo = sources.iter().map(|r| r.min_key().to_vec()).min();
    let hi = sources.iter().map(|r| r.max_key().to_vec()).max();

    let mut inputs = sources;
    if let Some(target_runs) = levels.get(target_level as usize) {
        for run in target_runs {
            if run.overlaps(lo.as_deref(), hi.as_deref()) {
                inputs.push(Arc::clone(run));
            }
        }
    }

    // Tombstones can be reclaimed once nothing older can hold the key:
    // every target-level run overlapping the merged range is an input,
    // and no populated level lies below the output.
    let drop_tombstones = target_level >= bottom;

    CompactionJob {
        source_level,
        target_level,
        inputs,
        drop_tombstones,
    }
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Result of one executed compaction, enough for the engine to update its
/// in-memory run set.
pub struct CompactionOutcome {
    /// Run ids consumed by the merge.
    pub removed_ids: Vec<u64>,

    /// Manifest entries of the freshly-built output runs.
    pub added: Vec<ManifestRunEntry>,
}

/// Executes a compaction job: merge, write outputs, commit the manifest,
/// and unlink retired files.
///
/// Output runs are bounded at `config.target_run_bytes` each. The inputs
/// stay readable throughout. The manifest mutex is taken only for brief
/// moments (id allocation, the atomic commit, the checkpoint) — never
/// across the merge itself, so writers are not stalled by a long
/// compaction.
pub fn execute_job(
    job: &CompactionJob,
    manifest: &Mutex<Manifest>,
    data_dir: &Path,
    config: &DbConfig,
) -> Result<CompactionOutcome, CompactionError> {
    let removed_ids: Vec<u64> = job.inputs.iter().map(|r| r.id).collect();

    info!(
        source_level = job.source_level,
        target_level = job.target_level,
        inputs = removed_ids.len(),
        drop_tombstones = job.drop_tombstones,
        "compaction starting"
    );

    // K-way merge over full-run iterators.
    let iters: Vec<Box<dyn Iterator<Item = Entry> + '_>> = job
        .inputs
        .iter()
        .map(|run| Box::new(run.iter()) as Box<dyn Iterator<Item = Entry> + '_>)
        .collect();
    let merge = MergeIterator::new(iters);

    // Dedup: the stream is (key ASC, seq DESC), so the first entry per
    // key is the winner; older versions are skipped.
    let mut outputs: Vec<ManifestRunEntry> = Vec::new();
    let mut pending: Vec<Entry> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut last_key: Option<Vec<u8>> = None;

    for entry in merge {
        if last_key.as_deref() == Some(entry.key.as_slice()) {
            continue; // shadowed older version
        }
        last_key = Some(entry.key.clone());

        if entry.is_tombstone() && job.drop_tombstones {
            trace!(seq = entry.seq, "dropping spent tombstone at bottom level");
            continue;
        }

        pending_bytes += entry.encoded_size();
        pending.push(entry);

        if pending_bytes >= config.target_run_bytes {
            flush_output(
                manifest,
                data_dir,
                job.target_level,
                &mut pending,
                &mut outputs,
            )?;
            pending_bytes = 0;
        }
    }

    if !pending.is_empty() {
        flush_output(
            manifest,
            data_dir,
            job.target_level,
            &mut pending,
            &mut outputs,
        )?;
    }

    // One atomic manifest edit, then checkpoint.
    {
        let mut guard = manifest
            .lock()
            .map_err(|_| CompactionError::Internal("Mutex poisoned".into()))?;
        guard.apply_compaction(outputs.clone(), removed_ids.clone())?;
        guard.checkpoint()?;
    }

    // Unlink retired inputs. In-flight readers hold Arc pins; their
    // mmaps stay valid after the unlink.
    for run in &job.inputs {
        let path = data_dir.join(run_file_name(run.level, run.id));
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(id = run.id, error = %e, "failed to unlink retired run");
        }
    }

    info!(
        removed = removed_ids.len(),
        produced = outputs.len(),
        "compaction complete"
    );

    Ok(CompactionOutcome {
        removed_ids,
        added: outputs,
    })
}

/// Writes one output run from the pending entries and records its
/// manifest entry.
fn flush_output(
    manifest: &Mutex<Manifest>,
    data_dir: &Path,
    target_level: u32,
    pending: &mut Vec<Entry>,
    outputs: &mut Vec<ManifestRunEntry>,
) -> Result<(), CompactionError> {
    let entries = std::mem::take(pending);
    let count = entries.len();

    let id = {
        let guard = manifest
            .lock()
            .map_err(|_| CompactionError::Internal("Mutex poisoned".into()))?;
        guard.allocate_run_id()?
    };
    let path = run_path(data_dir, target_level, id);

    let summary = RunWriter::new(&path).build(entries.into_iter(), count)?;

    outputs.push(ManifestRunEntry {
        id,
        level: target_level,
        min_key: summary.min_key,
        max_key: summary.max_key,
        entry_count: summary.entry_count,
    });

    Ok(())
}

/// Absolute path of the run `(level, id)` under `data_dir`.
pub fn run_path(data_dir: &Path, level: u32, id: u64) -> PathBuf {
    data_dir.join(run_file_name(level, id))
}
