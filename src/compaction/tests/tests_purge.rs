//! Purge decisions against tables outside the compaction.

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compaction::purge::{PurgeEvaluator, gc_before};
    use crate::row::Mutation;
    use crate::testing::{build_sstable, init_tracing, live_rows};
    use crate::tracker::{Tracker, View};

    /// Candidate table 1 (`k`, ts 10), other tables 2 (`k`, ts 5) and
    /// 3 (`z`, ts 1).
    fn live_set(dir: &Path) -> Arc<View> {
        let tables = vec![
            build_sstable(dir, 1, 0, &live_rows("k", 10, 10)),
            build_sstable(dir, 2, 0, &live_rows("k", 10, 5)),
            build_sstable(dir, 3, 0, &live_rows("z", 10, 1)),
        ];
        Tracker::new(tables).unwrap().view()
    }

    /// # Scenario
    /// The grace window starts `gc_grace_seconds` before now and never
    /// underflows.
    #[test]
    fn gc_before_saturates() {
        assert_eq!(gc_before(1_000, 10), 990);
        assert_eq!(gc_before(1_000, 0), 1_000);
        assert_eq!(gc_before(100, 1_000), 0);
    }

    /// # Scenario
    /// Only tables outside the compaction that may hold the key bound the
    /// purgeable timestamp; memtables always do.
    ///
    /// # Expected behavior
    /// - A key of table 2's range is bounded by its ts 5.
    /// - A key nobody else holds is unbounded.
    /// - Memtable data at ts 3 bounds every key.
    #[test]
    fn max_purgeable_timestamp_considers_only_other_holders() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let view = live_set(tmp.path());

        let evaluator = PurgeEvaluator::new(&[1], &view, 100, 200, None);
        assert_eq!(evaluator.max_purgeable_timestamp(b"k0003"), 5);
        assert_eq!(evaluator.max_purgeable_timestamp(b"q0003"), i64::MAX);

        let all = PurgeEvaluator::new(&[1, 2, 3], &view, 100, 200, None);
        assert_eq!(all.max_purgeable_timestamp(b"k0003"), i64::MAX);

        let with_memtable = PurgeEvaluator::new(&[1, 2, 3], &view, 100, 200, Some(3));
        assert_eq!(with_memtable.max_purgeable_timestamp(b"q0003"), 3);
        assert_eq!(with_memtable.gc_before(), 100);
        assert_eq!(with_memtable.now(), 200);
    }

    /// # Scenario
    /// A marker needs both an expired grace window and a timestamp below
    /// the key's bound.
    #[test]
    fn can_purge_requires_both_conditions() {
        let tmp = TempDir::new().unwrap();
        let view = live_set(tmp.path());
        let evaluator = PurgeEvaluator::new(&[1], &view, 100, 200, None);

        assert!(evaluator.can_purge(4, 99, 5));
        assert!(!evaluator.can_purge(4, 100, 5), "deleted at gc_before");
        assert!(!evaluator.can_purge(5, 99, 5), "as new as data elsewhere");
    }

    /// # Scenario
    /// An old cell tombstone is dropped when nothing else holds its key,
    /// but kept when older data for the key lives outside the compaction.
    ///
    /// # Expected behavior
    /// - Key `q`: the row is purged empty.
    /// - Key `k0001`: the tombstone (ts 10) survives table 2's ts 5 data.
    #[test]
    fn purge_keeps_tombstones_shadowing_data_elsewhere() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let view = live_set(tmp.path());
        let evaluator = PurgeEvaluator::new(&[1], &view, 100, 200, None);

        let (key, mut row) = Mutation::new("q")
            .delete_cell("c", 10)
            .with_local_time(50)
            .into_row();
        assert!(!evaluator.purge(&key, &mut row));
        assert!(row.is_empty());

        let (key, mut row) = Mutation::new("k0001")
            .delete_cell("c", 10)
            .with_local_time(50)
            .into_row();
        assert!(evaluator.purge(&key, &mut row));
        assert_eq!(row.cells.len(), 1);
        assert!(row.cells[0].is_deletion_marker());
    }

    /// # Scenario
    /// A row deletion younger than the grace window is kept, and the live
    /// cells it shadows are dropped.
    #[test]
    fn young_row_deletion_survives() {
        let tmp = TempDir::new().unwrap();
        let view = live_set(tmp.path());
        let evaluator = PurgeEvaluator::new(&[1, 2, 3], &view, 100, 200, None);

        let (key, mut row) = Mutation::new("q")
            .add("a", "old", 1)
            .delete_row(2)
            .with_local_time(150)
            .into_row();
        assert!(evaluator.purge(&key, &mut row));
        assert!(row.cells.is_empty());
        assert!(row.deletion.is_some());
    }

    /// # Scenario
    /// The echo pre-check rules out purging when data outside the
    /// compaction is at least as old as the row.
    #[test]
    fn key_may_purge_compares_row_min_timestamp() {
        let tmp = TempDir::new().unwrap();
        let view = live_set(tmp.path());
        let evaluator = PurgeEvaluator::new(&[1], &view, 100, 200, None);

        assert!(!evaluator.key_may_purge(b"k0001", 10));
        assert!(!evaluator.key_may_purge(b"k0001", 5));
        assert!(evaluator.key_may_purge(b"k0001", 4));
        assert!(evaluator.key_may_purge(b"q", 10));
    }
}
