//! k-way merge, echoed rows and row reconciliation.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compaction::CompactionError;
    use crate::compaction::merger::{MergeIterator, MergedRow, RowMerger};
    use crate::compaction::purge::PurgeEvaluator;
    use crate::row::{Mutation, Row};
    use crate::sstable::{RowEntry, SSTable, SSTableError};
    use crate::testing::{build_sstable, init_tracing, live_rows};
    use crate::tracker::Tracker;

    type Source = std::vec::IntoIter<Result<RowEntry, SSTableError>>;

    fn entry(key: &str, timestamp: i64) -> RowEntry {
        let (key, row) = Mutation::new(key).add("c", "v", timestamp).into_row();
        RowEntry::from_row(key, &row).unwrap()
    }

    fn source(items: Vec<Result<RowEntry, SSTableError>>) -> Source {
        items.into_iter()
    }

    fn rows(mutations: Vec<Mutation>) -> Vec<(Vec<u8>, Row)> {
        mutations.into_iter().map(Mutation::into_row).collect()
    }

    fn keys(out: &[MergedRow]) -> Vec<&[u8]> {
        out.iter().map(MergedRow::key).collect()
    }

    /// # Scenario
    /// Fragments come out in key order, ties broken by source order.
    #[test]
    fn merge_iterator_orders_by_key_then_source() {
        let merge = MergeIterator::new(vec![
            (10, source(vec![Ok(entry("a", 1)), Ok(entry("c", 1))])),
            (20, source(vec![Ok(entry("b", 2)), Ok(entry("c", 2))])),
            (30, source(vec![])),
        ]);
        let out: Vec<(usize, Vec<u8>)> = merge.map(|r| r.map(|(i, e)| (i, e.key)).unwrap()).collect();
        assert_eq!(
            out,
            vec![
                (0, b"a".to_vec()),
                (1, b"b".to_vec()),
                (0, b"c".to_vec()),
                (1, b"c".to_vec()),
            ]
        );
    }

    /// # Scenario
    /// A source failing mid-stream still delivers the row read before the
    /// failure, then the error with the source id, then nothing.
    #[test]
    fn merge_iterator_surfaces_error_then_stops() {
        let mut merge = MergeIterator::new(vec![(
            7,
            source(vec![Ok(entry("a", 1)), Err(SSTableError::ChecksumMismatch), Ok(entry("b", 1))]),
        )]);

        assert_eq!(merge.next().unwrap().unwrap().1.key, b"a");
        let err = merge.next().unwrap().unwrap_err();
        assert_eq!(err.source_id, 7);
        assert!(err.error.is_corruption());
        assert!(merge.next().is_none());
    }

    /// # Scenario
    /// Rows owned by one input with nothing to purge are echoed; keys
    /// present in both inputs are reconciled and purged.
    ///
    /// # Starting environment
    /// Table 1: `a` (live), `b` (old cell tombstone, ts 10).
    /// Table 2: `b` (live, ts 5), `c` (live).
    ///
    /// # Expected behavior
    /// `a` and `c` echoed verbatim; `b` reconciles to the tombstone, which
    /// is purged, so the key disappears.
    #[test]
    fn sole_owner_rows_are_echoed() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let t1 = build_sstable(
            tmp.path(),
            1,
            0,
            &rows(vec![
                Mutation::new("a").add("c", "v", 1),
                Mutation::new("b").delete_cell("c", 10).with_local_time(50),
            ]),
        );
        let t2 = build_sstable(
            tmp.path(),
            2,
            0,
            &rows(vec![Mutation::new("b").add("c", "v", 5), Mutation::new("c").add("c", "v", 1)]),
        );
        let view = Tracker::new(vec![Arc::clone(&t1), Arc::clone(&t2)]).unwrap().view();
        let evaluator = PurgeEvaluator::new(&[1, 2], &view, 100, 200, None);

        let sources = vec![(1, t1.scanner()), (2, t2.scanner())];
        let out: Vec<MergedRow> = RowMerger::new(sources, &evaluator, false)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(keys(&out), vec![b"a".as_slice(), b"c".as_slice()]);
        assert!(out.iter().all(|r| matches!(r, MergedRow::Echoed(_))));
    }

    /// # Scenario
    /// With `force_deserialize` every surviving row is decoded and
    /// re-encoded, and none is lost.
    #[test]
    fn force_deserialize_merges_every_row() {
        let tmp = TempDir::new().unwrap();
        let t1 = build_sstable(tmp.path(), 1, 0, &live_rows("k", 5, 1));
        let t2 = build_sstable(tmp.path(), 2, 0, &live_rows("m", 5, 1));
        let view = Tracker::new(vec![Arc::clone(&t1), Arc::clone(&t2)]).unwrap().view();
        let evaluator = PurgeEvaluator::new(&[1, 2], &view, 100, 200, None);

        let sources = vec![(1, t1.scanner()), (2, t2.scanner())];
        let out: Vec<MergedRow> = RowMerger::new(sources, &evaluator, true)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|r| matches!(r, MergedRow::Merged { .. })));
    }

    /// # Scenario
    /// A sole-owner row whose tombstone may be purged is not echoed; when
    /// older data for the key lives outside the compaction it is echoed
    /// and the tombstone survives.
    #[test]
    fn sole_owner_tombstones_are_purged_only_when_safe() {
        let tmp = TempDir::new().unwrap();
        let tombstones = rows(vec![Mutation::new("d").delete_cell("c", 10).with_local_time(50)]);
        let candidate = build_sstable(tmp.path(), 1, 0, &tombstones);

        let view = Tracker::new(vec![Arc::clone(&candidate)]).unwrap().view();
        let evaluator = PurgeEvaluator::new(&[1], &view, 100, 200, None);
        let out: Vec<MergedRow> = RowMerger::new(vec![(1, candidate.scanner())], &evaluator, false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(out.is_empty(), "tombstone should be purged");

        let older: Arc<SSTable> =
            build_sstable(tmp.path(), 2, 0, &rows(vec![Mutation::new("d").add("c", "v", 1)]));
        let view = Tracker::new(vec![Arc::clone(&candidate), older]).unwrap().view();
        let evaluator = PurgeEvaluator::new(&[1], &view, 100, 200, None);
        let out: Vec<MergedRow> = RowMerger::new(vec![(1, candidate.scanner())], &evaluator, false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            MergedRow::Echoed(entry) => assert!(entry.has_deletions()),
            other => panic!("expected an echoed row, got {other:?}"),
        }
    }

    /// # Scenario
    /// A read failure names the failing table.
    #[test]
    fn read_failure_reports_table_id() {
        let tmp = TempDir::new().unwrap();
        let table = build_sstable(tmp.path(), 1, 0, &live_rows("k", 3, 1));
        let view = Tracker::new(vec![table]).unwrap().view();
        let evaluator = PurgeEvaluator::new(&[1, 42], &view, 100, 200, None);

        let sources = vec![
            (1, source(vec![Ok(entry("a", 1)), Ok(entry("z", 1))])),
            (42, source(vec![Err(SSTableError::ChecksumMismatch)])),
        ];
        let mut merger = RowMerger::new(sources, &evaluator, false);
        match merger.next() {
            Some(Err(CompactionError::Corrupted { table_id, .. })) => assert_eq!(table_id, 42),
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
