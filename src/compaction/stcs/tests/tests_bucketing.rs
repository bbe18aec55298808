//! Size buckets and bucket selection.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compaction::stcs::{SizeTieredStrategy, bucket_sstables, select_compaction_bucket};
    use crate::compaction::{CompactionStrategy, OperationType};
    use crate::config::SizeTieredOptions;
    use crate::sstable::SSTable;
    use crate::testing::{build_sstable, init_tracing, live_rows, selection_context};
    use crate::tracker::Tracker;

    fn regular_only() -> SizeTieredOptions {
        SizeTieredOptions {
            min_sstable_size: 0,
            ..SizeTieredOptions::default()
        }
    }

    /// Tables 1..=3 hold 10 rows, 4..=5 hold 400 rows.
    fn two_tiers(dir: &std::path::Path) -> Vec<Arc<SSTable>> {
        let mut tables = Vec::new();
        for generation in 1..=3 {
            tables.push(build_sstable(dir, generation, 0, &live_rows("k", 10, 1)));
        }
        for generation in 4..=5 {
            tables.push(build_sstable(dir, generation, 0, &live_rows("k", 400, 1)));
        }
        tables
    }

    fn generations(tables: &[Arc<SSTable>], bucket: &[usize]) -> Vec<u64> {
        bucket.iter().map(|&i| tables[i].generation()).collect()
    }

    /// # Scenario
    /// Tables of similar size share a bucket; a much larger tier starts a
    /// new one.
    ///
    /// # Expected behavior
    /// Buckets `[1, 2, 3]` and `[4, 5]`.
    #[test]
    fn similar_sizes_share_a_bucket() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tables = two_tiers(tmp.path());

        let buckets = bucket_sstables(&tables, &regular_only());
        let buckets: Vec<Vec<u64>> = buckets.iter().map(|b| generations(&tables, b)).collect();
        assert_eq!(buckets, vec![vec![1, 2, 3], vec![4, 5]]);
    }

    /// # Scenario
    /// Everything below `min_sstable_size` lands in the small bucket,
    /// whatever the spread of sizes.
    #[test]
    fn small_tables_share_one_bucket() {
        let tmp = TempDir::new().unwrap();
        let tables = two_tiers(tmp.path());

        let opts = SizeTieredOptions {
            min_sstable_size: u64::MAX,
            ..SizeTieredOptions::default()
        };
        let buckets = bucket_sstables(&tables, &opts);
        assert_eq!(buckets.len(), 1);
        assert_eq!(generations(&tables, &buckets[0]), vec![1, 2, 3, 4, 5]);
    }

    /// # Scenario
    /// The fullest bucket wins; equal member counts prefer the smaller
    /// tables; the winner is truncated to `max_threshold`.
    #[test]
    fn selection_prefers_most_members_then_smaller_tables() {
        let tmp = TempDir::new().unwrap();
        let tables = two_tiers(tmp.path());
        let buckets = bucket_sstables(&tables, &regular_only());

        let chosen = select_compaction_bucket(&tables, &buckets, 2, 32).unwrap();
        assert_eq!(generations(&tables, &chosen), vec![1, 2, 3]);

        let chosen = select_compaction_bucket(&tables, &buckets, 2, 2).unwrap();
        assert_eq!(generations(&tables, &chosen), vec![1, 2]);

        assert!(select_compaction_bucket(&tables, &buckets, 4, 32).is_none());

        // Two buckets of two: the small tier wins the tie.
        let trimmed = vec![buckets[0][..2].to_vec(), buckets[1].clone()];
        let chosen = select_compaction_bucket(&tables, &trimmed, 2, 32).unwrap();
        assert_eq!(generations(&tables, &chosen), vec![1, 2]);
    }

    /// # Scenario
    /// The strategy skips reserved and suspect tables and proposes nothing
    /// when background compaction is disabled.
    ///
    /// # Actions
    /// 1. Reserve table 1, mark table 2 suspect.
    /// 2. Ask for a background task with thresholds `[2, 32]`.
    ///
    /// # Expected behavior
    /// Only table 3 of the small tier is eligible, so the larger tier
    /// `[4, 5]` is chosen. Thresholds `[0, 0]` yield nothing.
    #[test]
    fn background_selection_skips_unavailable_tables() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tracker = Arc::new(Tracker::new(two_tiers(tmp.path())).unwrap());
        let mut strategy = SizeTieredStrategy::new(regular_only());

        let _held = tracker.try_reserve(&[1]).unwrap();
        tracker.view().get(2).unwrap().mark_suspect();

        let candidate = strategy
            .next_background_task(&tracker.view(), &selection_context(2, 32))
            .unwrap();
        assert_eq!(candidate.ids(), vec![4, 5]);
        assert_eq!(candidate.kind, OperationType::Compaction);
        assert_eq!(candidate.target_level, 0);

        assert!(
            strategy
                .next_background_task(&tracker.view(), &selection_context(0, 0))
                .is_none()
        );
    }

    /// # Scenario
    /// A maximal candidate covers every selectable table in one set.
    #[test]
    fn maximal_takes_every_selectable_table() {
        let tmp = TempDir::new().unwrap();
        let tracker = Arc::new(Tracker::new(two_tiers(tmp.path())).unwrap());
        let mut strategy = SizeTieredStrategy::new(SizeTieredOptions::default());
        tracker.view().get(5).unwrap().mark_suspect();

        let tasks = strategy.maximal_tasks(&tracker.view(), &selection_context(2, 4));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].ids(), vec![1, 2, 3, 4]);
        assert_eq!(tasks[0].kind, OperationType::Maximal);
    }
}
