//! Shared helpers for unit tests.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::compaction::SelectionContext;
use crate::config::{CfConfig, SizeTieredOptions, StrategyConfig};
use crate::row::{Mutation, Row, local_time};
use crate::sstable::{SSTable, SstBuilder, sstable_path};
use crate::store::ColumnFamilyStore;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Writes `rows` (sorted by key) as table `generation` at `level`.
pub(crate) fn build_sstable(
    dir: &Path,
    generation: u64,
    level: u32,
    rows: &[(Vec<u8>, Row)],
) -> Arc<SSTable> {
    let mut builder = SstBuilder::create(sstable_path(dir, generation), rows.len(), level).unwrap();
    for (key, row) in rows {
        builder.add_row(key.clone(), row).unwrap();
    }
    Arc::new(SSTable::open(builder.finish().unwrap(), generation).unwrap())
}

/// `count` single-cell rows `"{prefix}{i:04}"` written at `timestamp`.
pub(crate) fn live_rows(prefix: &str, count: usize, timestamp: i64) -> Vec<(Vec<u8>, Row)> {
    (0..count)
        .map(|i| {
            Mutation::new(format!("{prefix}{i:04}"))
                .add("c", format!("value-{i}"), timestamp)
                .into_row()
        })
        .collect()
}

/// `count` rows `"{prefix}{i:04}"` holding one cell tombstone each,
/// deleted at `local_time`.
pub(crate) fn tombstone_rows(
    prefix: &str,
    count: usize,
    timestamp: i64,
    local_time: u32,
) -> Vec<(Vec<u8>, Row)> {
    (0..count)
        .map(|i| {
            Mutation::new(format!("{prefix}{i:04}"))
                .delete_cell("c", timestamp)
                .with_local_time(local_time)
                .into_row()
        })
        .collect()
}

/// Selection settings with thresholds `[min, max]` and nothing old enough
/// to purge.
pub(crate) fn selection_context(min: usize, max: usize) -> SelectionContext {
    SelectionContext {
        min_threshold: min,
        max_threshold: max,
        gc_before: 0,
        now: local_time(),
        tombstone_threshold: 0.2,
        tombstone_compaction_interval: 0,
        memtable_min_timestamp: None,
    }
}

/// Size-tiered family settings with thresholds `[min, max]`, every table
/// in one bucket, and no grace period.
pub(crate) fn stcs_config(min: usize, max: usize) -> CfConfig {
    CfConfig {
        gc_grace_seconds: 0,
        min_compaction_threshold: min,
        max_compaction_threshold: max,
        strategy: StrategyConfig::SizeTiered(SizeTieredOptions {
            min_sstable_size: u64::MAX,
            ..SizeTieredOptions::default()
        }),
        tombstone_compaction_interval: 0,
        ..CfConfig::default()
    }
}

pub(crate) fn open_store(dir: &Path, config: CfConfig) -> Arc<ColumnFamilyStore> {
    ColumnFamilyStore::open(dir.join("cf"), "cf", config).unwrap()
}

/// Applies `mutations` and flushes them into one new table.
pub(crate) fn flush_mutations(
    store: &ColumnFamilyStore,
    mutations: impl IntoIterator<Item = Mutation>,
) -> u64 {
    for mutation in mutations {
        store.apply(mutation).unwrap();
    }
    store.force_flush().unwrap().unwrap()
}

/// Flips one byte inside the first data block, after the 12-byte header
/// and the block's 4-byte length.
pub(crate) fn corrupt_first_data_block(path: &Path) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let offset = 12 + 4 + 3;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    file.sync_all().unwrap();
}
