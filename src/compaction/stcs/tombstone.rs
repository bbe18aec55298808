//! Single-table tombstone compaction.
//!
//! When no bucket is ready, a table is rewritten by itself if enough of it
//! could be dropped:
//!
//! - its estimated droppable-tombstone ratio at `gc_before` exceeds
//!   `tombstone_threshold`;
//! - it is at least `tombstone_compaction_interval` seconds old (0 skips
//!   this check);
//! - no other live table that overlaps its key range, and no memtable,
//!   holds data old enough to keep those markers alive. Otherwise the
//!   rewrite would purge nothing and the same table would be selected
//!   again straight away.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::compaction::SelectionContext;
use crate::sstable::SSTable;
use crate::tracker::View;

/// Droppable ratio of `sstable` if it qualifies for a rewrite on its own.
pub fn worth_dropping_tombstones(
    sstable: &SSTable,
    view: &View,
    ctx: &SelectionContext,
) -> Option<f64> {
    let age = ctx.now.saturating_sub(sstable.properties().created_at);
    if ctx.tombstone_compaction_interval > 0 && age < ctx.tombstone_compaction_interval {
        return None;
    }

    let ratio = sstable.droppable_tombstone_ratio(ctx.gc_before);
    if ratio <= ctx.tombstone_threshold {
        return None;
    }

    let blocked = view.sstables().iter().any(|other| {
        other.generation() != sstable.generation()
            && other.overlaps(sstable)
            && other.min_timestamp() <= sstable.max_timestamp()
    });
    if blocked {
        trace!(
            table_id = sstable.generation(),
            ratio, "tombstone candidate shadowed by overlapping table"
        );
        return None;
    }
    if ctx
        .memtable_min_timestamp
        .is_some_and(|min| min <= sstable.max_timestamp())
    {
        trace!(
            table_id = sstable.generation(),
            ratio, "tombstone candidate shadowed by memtable"
        );
        return None;
    }

    Some(ratio)
}

/// Picks the table with the highest droppable ratio among `candidates`.
///
/// Ties go to the lowest generation.
pub fn select_candidate(
    view: &View,
    candidates: &[Arc<SSTable>],
    ctx: &SelectionContext,
) -> Option<Arc<SSTable>> {
    let mut best: Option<(&Arc<SSTable>, f64)> = None;

    for sstable in candidates {
        let Some(ratio) = worth_dropping_tombstones(sstable, view, ctx) else {
            continue;
        };
        match best {
            Some((_, best_ratio)) if ratio <= best_ratio => {}
            _ => best = Some((sstable, ratio)),
        }
    }

    let (sstable, ratio) = best?;
    debug!(
        table_id = sstable.generation(),
        ratio,
        tombstone_count = sstable.properties().tombstone_count,
        "tombstone compaction candidate"
    );
    Some(Arc::clone(sstable))
}
