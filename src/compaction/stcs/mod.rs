//! # Size-Tiered Compaction Strategy (STCS)
//!
//! Groups tables into **size buckets** and merges the members of one
//! bucket at a time, so each table is rewritten roughly once per size
//! tier it passes through.
//!
//! - **Bucketing**: tables below `min_sstable_size` share one "small"
//!   bucket; the rest are sorted by size and grouped while each size stays
//!   within `[avg × bucket_low, avg × bucket_high]` of the running bucket
//!   average.
//! - **Selection**: the bucket with the most members that reaches
//!   `min_threshold` wins; ties go to the bucket of smaller tables, then to
//!   the one holding the oldest generation. At most `max_threshold` of its
//!   smallest tables are merged.
//! - **Tombstone fallback**: with no bucket ready, a single table whose
//!   droppable-tombstone ratio is high enough is rewritten alone (see
//!   [`tombstone`]).

#[cfg(test)]
mod tests;

pub mod tombstone;

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::compaction::{CompactionCandidate, CompactionStrategy, OperationType, SelectionContext};
use crate::config::SizeTieredOptions;
use crate::sstable::SSTable;
use crate::tracker::View;

// ------------------------------------------------------------------------------------------------
// Bucketing
// ------------------------------------------------------------------------------------------------

/// Groups tables into size buckets.
///
/// Returns buckets of indices into `sstables`; inside a bucket, indices
/// are ordered by size ascending, then generation.
pub fn bucket_sstables(sstables: &[Arc<SSTable>], opts: &SizeTieredOptions) -> Vec<Vec<usize>> {
    if sstables.is_empty() {
        return Vec::new();
    }

    let mut indices: Vec<usize> = (0..sstables.len()).collect();
    indices.sort_by_key(|&i| (sstables[i].file_size(), sstables[i].generation()));

    let (small, regular): (Vec<usize>, Vec<usize>) = indices
        .into_iter()
        .partition(|&i| sstables[i].file_size() < opts.min_sstable_size);

    let mut buckets: Vec<Vec<usize>> = Vec::new();
    if !small.is_empty() {
        buckets.push(small);
    }

    let mut current: Vec<usize> = Vec::new();
    let mut current_total = 0f64;

    for idx in regular {
        let size = sstables[idx].file_size() as f64;
        if !current.is_empty() {
            let avg = current_total / current.len() as f64;
            if size < avg * opts.bucket_low || size > avg * opts.bucket_high {
                buckets.push(std::mem::take(&mut current));
                current_total = 0.0;
            }
        }
        current.push(idx);
        current_total += size;
    }

    if !current.is_empty() {
        buckets.push(current);
    }

    buckets
}

/// Picks the bucket to compact.
///
/// Among buckets with at least `min_threshold` members: most members
/// first, then smaller average size, then lowest generation. The winner is
/// truncated to its `max_threshold` smallest tables.
pub fn select_compaction_bucket(
    sstables: &[Arc<SSTable>],
    buckets: &[Vec<usize>],
    min_threshold: usize,
    max_threshold: usize,
) -> Option<Vec<usize>> {
    let average = |bucket: &[usize]| {
        bucket.iter().map(|&i| sstables[i].file_size()).sum::<u64>() as f64 / bucket.len() as f64
    };
    let oldest = |bucket: &[usize]| bucket.iter().map(|&i| sstables[i].generation()).min();

    buckets
        .iter()
        .filter(|b| b.len() >= min_threshold && !b.is_empty())
        .min_by(|a, b| {
            b.len()
                .cmp(&a.len())
                .then_with(|| {
                    average(a)
                        .partial_cmp(&average(b))
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| oldest(a).cmp(&oldest(b)))
        })
        .map(|bucket| bucket.iter().take(max_threshold).copied().collect())
}

// ------------------------------------------------------------------------------------------------
// Strategy
// ------------------------------------------------------------------------------------------------

/// Size-tiered strategy.
#[derive(Debug, Clone)]
pub struct SizeTieredStrategy {
    opts: SizeTieredOptions,
}

impl SizeTieredStrategy {
    /// Creates the strategy.
    pub fn new(opts: SizeTieredOptions) -> Self {
        Self { opts }
    }

    /// Bucketing options in use.
    pub fn options(&self) -> &SizeTieredOptions {
        &self.opts
    }
}

impl CompactionStrategy for SizeTieredStrategy {
    fn name(&self) -> &'static str {
        "SizeTieredCompactionStrategy"
    }

    fn next_background_task(
        &mut self,
        view: &View,
        ctx: &SelectionContext,
    ) -> Option<CompactionCandidate> {
        if ctx.is_disabled() {
            return None;
        }

        let candidates: Vec<Arc<SSTable>> = view.uncompacting().cloned().collect();
        let buckets = bucket_sstables(&candidates, &self.opts);

        if let Some(selected) =
            select_compaction_bucket(&candidates, &buckets, ctx.min_threshold, ctx.max_threshold)
        {
            let sstables: Vec<Arc<SSTable>> =
                selected.into_iter().map(|i| Arc::clone(&candidates[i])).collect();
            debug!(
                bucket_count = buckets.len(),
                selected = sstables.len(),
                "stcs: bucket selected"
            );
            return Some(CompactionCandidate::unleveled(
                sstables,
                OperationType::Compaction,
            ));
        }

        let target = tombstone::select_candidate(view, &candidates, ctx)?;
        Some(CompactionCandidate::unleveled(
            vec![target],
            OperationType::TombstoneCompaction,
        ))
    }

    fn maximal_tasks(&mut self, view: &View, _ctx: &SelectionContext) -> Vec<CompactionCandidate> {
        let sstables: Vec<Arc<SSTable>> = view.uncompacting().cloned().collect();
        if sstables.is_empty() {
            return Vec::new();
        }
        vec![CompactionCandidate::unleveled(sstables, OperationType::Maximal)]
    }
}
