//! # Compaction Module
//!
//! Background merging of a column family's SSTables.
//!
//! ## Selection
//!
//! A [`CompactionStrategy`] looks at a [`View`] of the live set and proposes
//! a [`CompactionCandidate`]: the tables to merge, the level the output is
//! written to and where to split it. Two strategies exist:
//!
//! - [`stcs::SizeTieredStrategy`] merges tables of similar size, and falls
//!   back to rewriting a single table when enough of it is droppable
//!   tombstones.
//! - [`lcs::LeveledStrategy`] keeps levels of non-overlapping tables, each
//!   `fanout` times larger than the one above.
//!
//! ## Execution
//!
//! A [`task::CompactionTask`] streams the inputs through a
//! [`merger::RowMerger`], which reconciles the fragments of each row and
//! asks a [`purge::PurgeEvaluator`] which deletion markers may be dropped.
//! Rows owned by a single input with nothing to purge are copied through
//! without being decoded. The outputs replace the inputs in one atomic
//! version of the live set.
//!
//! ## Scheduling
//!
//! The [`manager::CompactionManager`] runs tasks on a fixed worker pool,
//! reserves inputs so no table is ever part of two compactions, and keeps
//! pending / active / completed gauges.
//!
//! ## Failure handling
//!
//! A table that fails to read during a compaction is marked suspect and is
//! never selected again. Every failure leaves the inputs live and the
//! outputs discarded; [`CompactionError::kind`] tells whether retrying the
//! family makes sense.

pub mod lcs;
pub mod manager;
pub mod merger;
pub mod purge;
pub mod stcs;
pub mod task;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::memtable::MemtableError;
use crate::sstable::{SSTable, SSTableError};
use crate::tracker::{TrackerError, View};

// ------------------------------------------------------------------------------------------------
// CompactionStrategy trait
// ------------------------------------------------------------------------------------------------

/// Chooses which tables of a family to merge next.
///
/// A strategy is only ever called with the family's selection lock held;
/// the candidate it returns is reserved before the lock is released, so
/// implementations need not worry about racing themselves.
pub trait CompactionStrategy: Send + Sync {
    /// Strategy class name, for logging.
    fn name(&self) -> &'static str;

    /// A table joined the live set (flush or compaction output).
    ///
    /// Called at most once per table; repeated calls must be harmless.
    fn notify_added(&mut self, _sstable: &Arc<SSTable>) {}

    /// A table left the live set.
    fn notify_removed(&mut self, _sstable: &Arc<SSTable>) {}

    /// Proposes the next background compaction.
    ///
    /// Returns `None` when nothing meets `ctx.min_threshold`, or when
    /// background compaction is disabled (thresholds of 0). Never proposes
    /// reserved or suspect tables, nor more than `ctx.max_threshold`
    /// tables unless the strategy's own layout requires it.
    fn next_background_task(
        &mut self,
        view: &View,
        ctx: &SelectionContext,
    ) -> Option<CompactionCandidate>;

    /// Candidates whose union is every live, unreserved, non-suspect table.
    fn maximal_tasks(&mut self, view: &View, ctx: &SelectionContext) -> Vec<CompactionCandidate>;

    /// Forgets all bookkeeping (after a truncate).
    fn reset(&mut self) {}
}

/// Family settings a strategy needs at selection time.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionContext {
    /// Fewest tables worth merging. 0 disables background selection.
    pub min_threshold: usize,

    /// Most tables merged at once. 0 disables background selection.
    pub max_threshold: usize,

    /// Deletion markers older than this second may be purged.
    pub gc_before: u32,

    /// Current wall-clock second.
    pub now: u32,

    /// Droppable-tombstone ratio above which a table is rewritten alone.
    pub tombstone_threshold: f64,

    /// Minimum table age in seconds for a single-table rewrite. 0 disables
    /// the age check.
    pub tombstone_compaction_interval: u32,

    /// Lowest timestamp held by the family's memtables, if any hold data.
    pub memtable_min_timestamp: Option<i64>,
}

impl SelectionContext {
    /// Whether background selection is switched off.
    pub fn is_disabled(&self) -> bool {
        self.min_threshold == 0 || self.max_threshold == 0
    }
}

/// Why a compaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Threshold-driven background merge.
    Compaction,
    /// Single-table rewrite to drop tombstones.
    TombstoneCompaction,
    /// Every table of the family merged on request.
    Maximal,
    /// Caller-chosen tables.
    UserDefined,
    /// Administrative removal without a merge.
    Unknown,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Compaction => "compaction",
            OperationType::TombstoneCompaction => "tombstone compaction",
            OperationType::Maximal => "maximal compaction",
            OperationType::UserDefined => "user-defined compaction",
            OperationType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Tables chosen for one compaction.
#[derive(Debug, Clone)]
pub struct CompactionCandidate {
    /// Inputs, non-empty, in the order the strategy chose them.
    pub sstables: Vec<Arc<SSTable>>,

    /// Level recorded in the output tables.
    pub target_level: u32,

    /// Start a new output once the current one reaches this many bytes.
    pub max_output_size: u64,

    /// Why the compaction runs.
    pub kind: OperationType,
}

impl CompactionCandidate {
    /// A candidate writing one unsplit output at level 0.
    pub fn unleveled(sstables: Vec<Arc<SSTable>>, kind: OperationType) -> Self {
        Self {
            sstables,
            target_level: 0,
            max_output_size: u64::MAX,
            kind,
        }
    }

    /// Generations of the inputs.
    pub fn ids(&self) -> Vec<u64> {
        self.sstables.iter().map(|s| s.generation()).collect()
    }

    /// Total on-disk bytes of the inputs.
    pub fn input_size(&self) -> u64 {
        self.sstables.iter().map(|s| s.file_size()).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Summary
// ------------------------------------------------------------------------------------------------

/// Outcome of one successful compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Why it ran.
    pub kind: OperationType,
    /// Retired tables.
    pub input_ids: Vec<u64>,
    /// Tables written; empty when every row was purged.
    pub output_ids: Vec<u64>,
    /// Rows written across all outputs.
    pub rows_written: u64,
    /// Of those, rows copied without decoding.
    pub rows_echoed: u64,
    /// Input bytes.
    pub bytes_in: u64,
    /// Output bytes.
    pub bytes_out: u64,
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Whether a failed compaction may simply be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Inputs are untouched and still live; the family can be compacted
    /// again (a corrupt input is now excluded).
    Retained,
    /// A configuration or invariant problem that retrying will not fix.
    Fatal,
}

/// Errors returned by compaction tasks and the manager.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// An input table could not be read. It has been marked suspect.
    #[error("sstable {table_id} is corrupt: {source}")]
    Corrupted {
        /// Generation of the failing input.
        table_id: u64,
        /// Underlying read failure.
        source: SSTableError,
    },

    /// Writing or opening an output failed.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Filesystem error outside table I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Live set rejected a reservation or a publish.
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Memtable could not be consulted.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Invalid settings.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The manager no longer accepts work.
    #[error("compaction manager is shut down")]
    Shutdown,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CompactionError {
    /// Classifies the failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            CompactionError::Corrupted { .. }
            | CompactionError::SSTable(_)
            | CompactionError::Io(_)
            | CompactionError::Shutdown => FailureKind::Retained,
            CompactionError::Tracker(e) => match e {
                TrackerError::Superseded { .. }
                | TrackerError::NotLive(_)
                | TrackerError::AlreadyCompacting(_)
                | TrackerError::Suspect(_) => FailureKind::Retained,
                TrackerError::DuplicateGeneration(_) | TrackerError::Internal(_) => {
                    FailureKind::Fatal
                }
            },
            CompactionError::Memtable(_)
            | CompactionError::Config(_)
            | CompactionError::Internal(_) => FailureKind::Fatal,
        }
    }

    /// Generation of the corrupt input, if that is what failed.
    pub fn corrupted_table(&self) -> Option<u64> {
        match self {
            CompactionError::Corrupted { table_id, .. } => Some(*table_id),
            _ => None,
        }
    }
}
