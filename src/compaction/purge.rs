//! # Purge decisions
//!
//! A deletion marker (cell tombstone, expired cell, row deletion) may only
//! be dropped when nothing it deletes can come back:
//!
//! 1. It is older than the family's grace window:
//!    `local_deletion_time < gc_before`, where
//!    `gc_before = now - gc_grace_seconds`.
//! 2. Its timestamp is below [`PurgeEvaluator::max_purgeable_timestamp`]
//!    for its key: the lowest timestamp any table *outside* the compaction,
//!    or any memtable, may hold for that key. Data older than the marker
//!    elsewhere would otherwise be resurrected once the marker is gone.
//!
//! Tables that may hold the key are found by key range and bloom filter;
//! when in doubt a table counts as holding it, so the marker is kept.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::trace;

use crate::memtable::HexKey;
use crate::row::{PurgeStats, Row};
use crate::sstable::SSTable;
use crate::tracker::View;

/// Per-compaction purge oracle.
#[derive(Debug)]
pub struct PurgeEvaluator {
    gc_before: u32,
    now: u32,

    /// Live tables outside the compaction.
    others: Vec<Arc<SSTable>>,

    /// Lowest timestamp held by any memtable, if one holds data.
    memtable_min_timestamp: Option<i64>,
}

/// Start of the grace window: markers deleted before this second are old
/// enough to purge.
pub fn gc_before(now: u32, gc_grace_seconds: u32) -> u32 {
    now.saturating_sub(gc_grace_seconds)
}

impl PurgeEvaluator {
    /// Builds the evaluator for a compaction of `candidate_ids`.
    pub fn new(
        candidate_ids: &[u64],
        view: &View,
        gc_before: u32,
        now: u32,
        memtable_min_timestamp: Option<i64>,
    ) -> Self {
        let candidates: BTreeSet<u64> = candidate_ids.iter().copied().collect();
        let others = view
            .sstables()
            .iter()
            .filter(|s| !candidates.contains(&s.generation()))
            .cloned()
            .collect();
        Self {
            gc_before,
            now,
            others,
            memtable_min_timestamp,
        }
    }

    /// Start of the grace window.
    pub fn gc_before(&self) -> u32 {
        self.gc_before
    }

    /// Current second used to expire cells.
    pub fn now(&self) -> u32 {
        self.now
    }

    /// Markers for `key` must be older than this timestamp to be purged.
    ///
    /// `i64::MAX` when no other table or memtable may hold the key.
    pub fn max_purgeable_timestamp(&self, key: &[u8]) -> i64 {
        let tables = self
            .others
            .iter()
            .filter(|s| s.may_contain(key))
            .map(|s| s.min_timestamp());
        tables
            .chain(self.memtable_min_timestamp)
            .min()
            .unwrap_or(i64::MAX)
    }

    /// Whether a marker written at `timestamp` and deleted at
    /// `local_deletion_time` may be dropped, given the key's
    /// `max_purgeable` timestamp.
    pub fn can_purge(&self, timestamp: i64, local_deletion_time: u32, max_purgeable: i64) -> bool {
        local_deletion_time < self.gc_before && timestamp < max_purgeable
    }

    /// Cheap pre-check for a row owned by a single input.
    ///
    /// `false` means no marker of a row whose lowest timestamp is
    /// `row_min_timestamp` can be purged, so the row can be copied as is.
    pub fn key_may_purge(&self, key: &[u8], row_min_timestamp: i64) -> bool {
        row_min_timestamp < self.max_purgeable_timestamp(key)
    }

    /// Garbage-collects a merged row in place.
    ///
    /// Returns `false` when nothing is left to write.
    pub fn purge(&self, key: &[u8], row: &mut Row) -> bool {
        if row.has_deletions() {
            let max_purgeable = self.max_purgeable_timestamp(key);
            let stats = row.purge(self.now, |ts, ldt| self.can_purge(ts, ldt, max_purgeable));
            if stats != PurgeStats::default() {
                trace!(
                    key = %HexKey(key),
                    shadowed = stats.shadowed,
                    expired = stats.expired,
                    purged_cells = stats.purged_cells,
                    purged_row_deletion = stats.purged_row_deletion,
                    max_purgeable,
                    "row purged"
                );
            }
        }
        !row.is_empty()
    }
}
