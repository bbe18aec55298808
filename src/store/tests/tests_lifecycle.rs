//! Opening, flushing, truncating and reconfiguring a family.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::thread;

    use tempfile::TempDir;

    use crate::compaction::OperationType;
    use crate::config::{CfConfig, ConfigError, LeveledOptions, StrategyConfig};
    use crate::row::Mutation;
    use crate::sstable::sstable_path;
    use crate::store::{ColumnFamilyStore, StoreError};
    use crate::testing::{flush_mutations, init_tracing, open_store, stcs_config};

    fn put(key: &str, timestamp: i64) -> Mutation {
        Mutation::new(key).add("c", "v", timestamp)
    }

    /// # Scenario
    /// Reopening a family finds its tables again and throws away an
    /// unfinished write.
    ///
    /// # Expected behavior
    /// - Both flushed tables are live after reopening.
    /// - The stray `.tmp` file is gone.
    /// - New generations continue above the existing ones.
    #[test]
    fn reopen_loads_tables_and_removes_temp_files() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let (a, b) = {
            let store = open_store(tmp.path(), stcs_config(2, 4));
            let a = flush_mutations(&store, [put("a", 1)]);
            let b = flush_mutations(&store, [put("b", 2)]);
            (a, b)
        };
        let dir = tmp.path().join("cf");
        let stray = sstable_path(&dir, 99).with_extension("tmp");
        fs::write(&stray, b"partial").unwrap();

        let store = open_store(tmp.path(), stcs_config(2, 4));
        let ids: Vec<u64> = store.live_sstables().iter().map(|s| s.generation()).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(!stray.exists());

        let c = flush_mutations(&store, [put("c", 3)]);
        assert!(c > b);
        assert_eq!(store.max_timestamp(), Some(3));
    }

    /// # Scenario
    /// `apply` reports when the memtable has reached its flush size, and
    /// `force_flush` on an empty memtable writes nothing.
    #[test]
    fn apply_signals_flush_size() {
        let tmp = TempDir::new().unwrap();
        let config = CfConfig {
            memtable_flush_size: 64,
            ..stcs_config(2, 4)
        };
        let store = open_store(tmp.path(), config);

        assert!(!store.apply(put("a", 1)).unwrap());
        let mut full = false;
        for i in 0..10 {
            full = store.apply(put(&format!("key-{i}"), 1)).unwrap();
        }
        assert!(full);
        assert!(!store.memtable_is_empty().unwrap());

        assert!(store.force_flush().unwrap().is_some());
        assert!(store.memtable_is_empty().unwrap());
        assert_eq!(store.force_flush().unwrap(), None);
        assert_eq!(store.sstable_count(), 1);
    }

    /// # Scenario
    /// An invalid configuration is rejected before anything is created.
    #[test]
    fn invalid_config_is_rejected_on_open() {
        let tmp = TempDir::new().unwrap();
        let config = CfConfig {
            strategy: StrategyConfig::Leveled(LeveledOptions {
                fanout: 1,
                ..LeveledOptions::default()
            }),
            ..CfConfig::default()
        };
        let err = ColumnFamilyStore::open(tmp.path().join("cf"), "cf", config).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(!tmp.path().join("cf").exists());
    }

    /// # Scenario
    /// Threshold changes are validated as a pair and rejected changes
    /// leave the old values in place.
    #[test]
    fn threshold_setters_validate() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(4, 32));

        store.set_maximum_compaction_threshold(8).unwrap();
        store.set_minimum_compaction_threshold(2).unwrap();
        assert!(matches!(
            store.set_minimum_compaction_threshold(9),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(store.set_minimum_compaction_threshold(1).is_err());
        assert!(store.set_maximum_compaction_threshold(1).is_err());

        let config = store.config();
        assert_eq!(config.min_compaction_threshold, 2);
        assert_eq!(config.max_compaction_threshold, 8);

        store.disable_auto_compaction();
        assert!(!store.is_auto_compaction_enabled());
        let ctx = store.selection_context();
        assert!(ctx.is_disabled());
        store.enable_auto_compaction();
        assert_eq!(store.selection_context().min_threshold, 2);
    }

    /// # Scenario
    /// Truncate drops tables and memtable contents and deletes the files.
    #[test]
    fn truncate_drops_everything() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        flush_mutations(&store, [put("a", 1)]);
        store.apply(put("b", 2)).unwrap();
        let epoch = store.view().epoch();

        store.truncate();
        assert_eq!(store.sstable_count(), 0);
        assert!(store.memtable_is_empty().unwrap());
        assert!(store.get_row(b"a").unwrap().is_none());
        assert!(store.get_row(b"b").unwrap().is_none());
        assert_eq!(store.view().epoch(), epoch + 1);

        let remaining = fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(remaining, 0);
    }

    /// # Scenario
    /// Marking tables compacted retires them without replacement; unknown
    /// ids are ignored.
    #[test]
    fn mark_compacted_retires_tables() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(2, 4));
        let a = flush_mutations(&store, [put("a", 1)]);
        let b = flush_mutations(&store, [put("b", 1)]);

        let removed = store.mark_compacted(&[a, 12_345], OperationType::Unknown);
        assert_eq!(removed, vec![a]);
        let ids: Vec<u64> = store.live_sstables().iter().map(|s| s.generation()).collect();
        assert_eq!(ids, vec![b]);
    }

    /// # Scenario
    /// A purge snapshot taken while flushes run never misses the newest
    /// write: it is either still in a memtable or already in the live set.
    ///
    /// # Actions
    /// 1. A writer applies timestamp `ts` to `k`, publishes `ts`, and
    ///    flushes, for `ts` in `1..=100`.
    /// 2. Meanwhile a reader reads the published timestamp `w`, then takes
    ///    a purge snapshot.
    ///
    /// # Expected behavior
    /// Every snapshot holds `w` in the view, or a memtable whose oldest
    /// data is at most `w`.
    #[test]
    fn purge_snapshot_covers_data_being_flushed() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let store = open_store(tmp.path(), stcs_config(0, 0));
        let written = Arc::new(AtomicI64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let store = Arc::clone(&store);
            let written = Arc::clone(&written);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for ts in 1..=100 {
                    store.apply(put("k", ts)).unwrap();
                    written.store(ts, Ordering::Release);
                    store.force_flush().unwrap();
                }
                done.store(true, Ordering::Release);
            })
        };

        let mut snapshots = 0;
        loop {
            let finished = done.load(Ordering::Acquire);
            let w = written.load(Ordering::Acquire);
            let (memtable_min, view) = store.purge_snapshot().unwrap();
            let in_view = view.max_timestamp().is_some_and(|max| max >= w);
            let in_memtable = memtable_min.is_some_and(|min| min <= w);
            assert!(
                w == 0 || in_view || in_memtable,
                "timestamp {w} missing: memtable {memtable_min:?}, view max {:?}",
                view.max_timestamp()
            );
            snapshots += 1;
            if finished {
                break;
            }
        }
        writer.join().unwrap();
        assert!(snapshots > 0);
    }
}
