//! Scheduling, blocking operations and gauges.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::compaction::manager::{CompactionManager, UserDefinedOptions};
    use crate::compaction::{CompactionError, OperationType};
    use crate::row::Mutation;
    use crate::store::ColumnFamilyStore;
    use crate::testing::{
        corrupt_first_data_block, flush_mutations, init_tracing, open_store, stcs_config,
    };
    use crate::tracker::TrackerError;

    fn rows(prefix: &str, timestamp: i64) -> Vec<Mutation> {
        (0..10)
            .map(|i| Mutation::new(format!("{prefix}{i:04}")).add("c", "v", timestamp))
            .collect()
    }

    fn flush_tables(store: &ColumnFamilyStore, count: i64) -> Vec<u64> {
        (0..count).map(|ts| flush_mutations(store, rows("k", ts))).collect()
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// # Scenario
    /// With too few tables the handle is resolved on return and nothing is
    /// queued.
    #[test]
    fn nothing_to_do_resolves_immediately() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        flush_tables(&store, 1);
        let manager = CompactionManager::new(2).unwrap();

        let handle = manager.submit_background(&store);
        assert!(matches!(handle.try_wait(), Some(Ok(None))));
        assert_eq!(manager.pending_tasks(), 0);
        assert_eq!(manager.completed_tasks(), 0);
    }

    /// # Scenario
    /// One submission keeps compacting the family until nothing is left
    /// to do.
    ///
    /// # Actions
    /// 1. Flush 6 overlapping tables, thresholds `[2, 4]`.
    /// 2. Submit one background compaction.
    ///
    /// # Expected behavior
    /// - The first compaction merges 4 tables.
    /// - Follow-up compactions run without further submissions until one
    ///   table is left; the gauges then settle at 0.
    #[test]
    fn background_compaction_feeds_itself() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        flush_tables(&store, 6);
        let manager = CompactionManager::new(2).unwrap();

        let first = manager.submit_background(&store).wait().unwrap().unwrap();
        assert_eq!(first.input_ids.len(), 4);
        assert_eq!(first.kind, OperationType::Compaction);

        wait_until("one table", || store.sstable_count() == 1);
        wait_until("idle gauges", || {
            manager.pending_tasks() == 0 && manager.active_compactions() == 0
        });
        assert!(manager.completed_tasks() >= 2);
        assert_eq!(store.max_timestamp(), Some(5));
        assert_eq!(store.range_slice(b"", 100).unwrap().len(), 10);
    }

    /// # Scenario
    /// Background compaction honours the auto-compaction switch; maximal
    /// compaction does not.
    #[test]
    fn disabled_auto_compaction_only_blocks_background() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        flush_tables(&store, 4);
        store.disable_auto_compaction();
        let manager = CompactionManager::new(1).unwrap();

        assert!(matches!(manager.submit_background(&store).wait(), Ok(None)));
        assert_eq!(store.sstable_count(), 4);

        let summary = manager.perform_maximal(&store).unwrap();
        assert_eq!(summary.rounds, 1);
        assert_eq!(summary.compactions[0].kind, OperationType::Maximal);
        assert_eq!(store.sstable_count(), 1);
    }

    /// # Scenario
    /// Concurrent submissions never share an input, and every table is
    /// compacted at most once.
    #[test]
    fn concurrent_submissions_never_overlap() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 2));
        flush_tables(&store, 8);
        let manager = CompactionManager::new(4).unwrap();

        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                let store = Arc::clone(&store);
                thread::spawn(move || manager.submit_background(&store).wait())
            })
            .collect();

        let mut seen = BTreeSet::new();
        for submitter in submitters {
            if let Some(summary) = submitter.join().unwrap().unwrap() {
                for id in summary.input_ids {
                    assert!(seen.insert(id), "table {id} compacted twice");
                }
            }
        }
        wait_until("idle gauges", || {
            manager.pending_tasks() == 0 && manager.active_compactions() == 0
        });
        assert!(store.view().compacting().is_empty());
        assert_eq!(store.range_slice(b"", 100).unwrap().len(), 10);
    }

    /// # Scenario
    /// A maximal compaction hitting a corrupt table fails, blacklists it,
    /// and the next one compacts around it.
    #[test]
    fn maximal_compaction_skips_blacklisted_tables() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        let ids = flush_tables(&store, 3);
        corrupt_first_data_block(store.view().get(ids[1]).unwrap().path());
        let manager = CompactionManager::new(2).unwrap();

        let err = manager.force_major_compaction(&store).unwrap_err();
        assert_eq!(err.corrupted_table(), Some(ids[1]));
        assert!(store.view().get(ids[1]).unwrap().is_suspect());
        assert_eq!(store.sstable_count(), 3);

        let summary = manager.perform_maximal(&store).unwrap();
        assert_eq!(summary.compactions[0].input_ids, vec![ids[0], ids[2]]);
        assert_eq!(store.sstable_count(), 2);

        // Only the previous output is selectable: one more rewrite, then
        // no progress is possible.
        let summary = manager.perform_maximal(&store).unwrap();
        assert_eq!(summary.rounds, 1);
        assert_eq!(store.sstable_count(), 2);
    }

    /// # Scenario
    /// A user-defined compaction merges exactly the requested tables into
    /// level 0 and validates its input first.
    #[test]
    fn user_defined_compaction_uses_exact_tables() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        let ids = flush_tables(&store, 3);
        let manager = CompactionManager::new(2).unwrap();

        let summary = manager
            .perform_user_defined(&store, &[ids[0], ids[2]], UserDefinedOptions::default())
            .unwrap();
        assert_eq!(summary.kind, OperationType::UserDefined);
        assert_eq!(summary.input_ids, vec![ids[0], ids[2]]);
        assert!(store.view().get(ids[1]).is_some());
        let output = store.view().get(summary.output_ids[0]).cloned().unwrap();
        assert_eq!(output.level(), 0);

        let forced = manager
            .perform_user_defined(
                &store,
                &[ids[1]],
                UserDefinedOptions {
                    force_deserialize: true,
                },
            )
            .unwrap();
        assert_eq!(forced.rows_echoed, 0);
        assert_eq!(forced.rows_written, 10);

        assert!(matches!(
            manager.perform_user_defined(&store, &[9_999], UserDefinedOptions::default()),
            Err(CompactionError::Tracker(TrackerError::NotLive(9_999)))
        ));
        assert!(matches!(
            manager.perform_user_defined(&store, &[], UserDefinedOptions::default()),
            Err(CompactionError::Config(_))
        ));

        let held = store.tracker().try_reserve(&[summary.output_ids[0]]).unwrap();
        assert!(matches!(
            manager.perform_user_defined(&store, &summary.output_ids, UserDefinedOptions::default()),
            Err(CompactionError::Tracker(TrackerError::AlreadyCompacting(_)))
        ));
        drop(held);
    }

    /// # Scenario
    /// After shutdown no work is accepted; a pool of zero threads is
    /// rejected.
    #[test]
    fn shutdown_refuses_new_work() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        flush_tables(&store, 4);

        assert!(matches!(CompactionManager::new(0), Err(CompactionError::Config(_))));

        let manager = CompactionManager::new(2).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(matches!(
            manager.submit_background(&store).wait(),
            Err(CompactionError::Shutdown)
        ));
        assert_eq!(store.sstable_count(), 4);
        assert!(store.view().compacting().is_empty());
    }
}
