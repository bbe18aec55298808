//! # Column family store
//!
//! One column family: a directory of SSTables, the memtables in front of
//! them, the [`Tracker`] owning the live set, and the family's compaction
//! strategy.
//!
//! ## Layout
//!
//! Tables live directly in the family directory as `NNNNNN.sst`. On open,
//! leftover `*.tmp` files from interrupted writes are removed and every
//! `*.sst` file becomes live.
//!
//! ## Write path
//!
//! Mutations go to the active memtable. [`ColumnFamilyStore::force_flush`]
//! freezes it and writes every frozen memtable as a level-0 table. A frozen
//! memtable stays readable, and still counts for tombstone purging, until
//! the table written from it is live.
//!
//! ## Locks
//!
//! The strategy mutex doubles as the family's selection lock: candidate
//! selection and reservation both happen under it, and so does every
//! notification to the strategy.

#[cfg(test)]
mod tests;

use std::{
    fs, mem,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::purge;
use crate::compaction::merger::MergeIterator;
use crate::compaction::{CompactionStrategy, OperationType, SelectionContext};
use crate::config::{CfConfig, ConfigError, validate_thresholds};
use crate::memtable::{Memtable, MemtableError};
use crate::row::{Mutation, Row, local_time};
use crate::sstable::{
    self, RowEntry, SSTable, SSTableError, SstBuilder, TMP_EXTENSION, sstable_path,
};
use crate::tracker::{Tracker, TrackerError, View};

/// Source id of memtable rows in a read merge.
const MEMTABLE_SOURCE: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`ColumnFamilyStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid family configuration.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Error originating from a memtable.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from an SSTable.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Error originating from the live set.
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

struct Memtables {
    active: Arc<Memtable>,

    /// Oldest first.
    frozen: Vec<Arc<Memtable>>,
}

/// A column family.
pub struct ColumnFamilyStore {
    name: String,
    dir: PathBuf,
    config: RwLock<CfConfig>,
    auto_compaction: AtomicBool,
    tracker: Arc<Tracker>,
    strategy: Mutex<Box<dyn CompactionStrategy>>,
    memtables: RwLock<Memtables>,
    flush_lock: Mutex<()>,
}

impl std::fmt::Debug for ColumnFamilyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyStore")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("sstables", &self.sstable_count())
            .finish_non_exhaustive()
    }
}

impl ColumnFamilyStore {
    /// Opens (or creates) the family `name` stored in `dir`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Config`] for an invalid `config`; I/O and SSTable
    /// errors if an existing table cannot be opened.
    pub fn open(
        dir: impl AsRef<Path>,
        name: impl Into<String>,
        config: CfConfig,
    ) -> Result<Arc<Self>, StoreError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let name = name.into();
        fs::create_dir_all(&dir)?;

        let mut sstables = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().is_some_and(|ext| ext == TMP_EXTENSION) {
                warn!(path = %path.display(), "removing unfinished sstable");
                fs::remove_file(&path)?;
                continue;
            }
            if let Some(generation) = sstable::parse_generation(&path) {
                sstables.push(Arc::new(SSTable::open(&path, generation)?));
            }
        }

        let mut strategy = config.strategy.build();
        for sstable in &sstables {
            strategy.notify_added(sstable);
        }
        let tracker = Arc::new(Tracker::new(sstables)?);

        info!(
            family = %name,
            dir = %dir.display(),
            strategy = strategy.name(),
            sstables = tracker.view().sstables().len(),
            "column family opened"
        );

        Ok(Arc::new(Self {
            name,
            dir,
            config: RwLock::new(config),
            auto_compaction: AtomicBool::new(true),
            tracker,
            strategy: Mutex::new(strategy),
            memtables: RwLock::new(Memtables {
                active: Arc::new(Memtable::new()),
                frozen: Vec::new(),
            }),
            flush_lock: Mutex::new(()),
        }))
    }

    /// Family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the family's tables.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current settings.
    pub fn config(&self) -> CfConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current version of the live set.
    pub fn view(&self) -> Arc<View> {
        self.tracker.view()
    }

    pub(crate) fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Locks the strategy, which is also the selection lock.
    pub(crate) fn strategy(&self) -> MutexGuard<'_, Box<dyn CompactionStrategy>> {
        self.strategy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn memtables(&self) -> RwLockReadGuard<'_, Memtables> {
        self.memtables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn memtables_mut(&self) -> RwLockWriteGuard<'_, Memtables> {
        self.memtables.write().unwrap_or_else(PoisonError::into_inner)
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Applies a mutation to the active memtable.
    ///
    /// Returns `true` once the memtable has reached
    /// [`CfConfig::memtable_flush_size`]; flushing is up to the caller.
    pub fn apply(&self, mutation: Mutation) -> Result<bool, StoreError> {
        let (key, row) = mutation.into_row();
        let flush_size = self.config().memtable_flush_size;
        let memtables = self.memtables();
        memtables.active.apply(key, row)?;
        Ok(memtables.active.approximate_size()? >= flush_size)
    }

    /// Writes the active memtable, and any memtable left over from a failed
    /// flush, to level-0 tables.
    ///
    /// Returns the generation of the last table written, or `None` when
    /// there was nothing to flush.
    pub fn force_flush(&self) -> Result<Option<u64>, StoreError> {
        let _flush = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let pending = {
            let mut memtables = self.memtables_mut();
            if !memtables.active.is_empty()? {
                let active = mem::replace(&mut memtables.active, Arc::new(Memtable::new()));
                memtables.frozen.push(active);
            }
            memtables.frozen.clone()
        };

        let mut last = None;
        for memtable in pending {
            let sstable = self.write_memtable(&memtable)?;
            last = Some(sstable.generation());
            self.tracker.add_sstable(Arc::clone(&sstable))?;
            self.strategy().notify_added(&sstable);
            self.memtables_mut()
                .frozen
                .retain(|m| !Arc::ptr_eq(m, &memtable));
        }
        Ok(last)
    }

    fn write_memtable(&self, memtable: &Memtable) -> Result<Arc<SSTable>, StoreError> {
        let rows = memtable.snapshot()?;
        let generation = self.tracker.next_generation();
        let path = sstable_path(&self.dir, generation);

        let mut builder = SstBuilder::create(&path, rows.len(), 0)?;
        for (key, row) in &rows {
            builder.add_row(key.clone(), row)?;
        }
        let path = builder.finish()?;
        let sstable = Arc::new(SSTable::open(&path, generation)?);
        info!(
            family = %self.name,
            table_id = generation,
            rows = rows.len(),
            bytes = sstable.file_size(),
            "memtable flushed"
        );
        Ok(sstable)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Live cells of `key`, reconciled across memtables and tables.
    ///
    /// `None` when nothing of the row is visible.
    pub fn get_row(&self, key: &[u8]) -> Result<Option<Row>, StoreError> {
        let mut merged: Option<Row> = None;
        let mut fold = |row: Row| {
            merged = Some(match merged.take() {
                Some(acc) => acc.merge(row),
                None => row,
            });
        };

        // Memtables before the view: see `purge_snapshot`.
        {
            let memtables = self.memtables();
            for memtable in memtables.frozen.iter().chain([&memtables.active]) {
                if let Some(row) = memtable.get(key)? {
                    fold(row);
                }
            }
        }
        let view = self.view();
        for sstable in view.sstables().iter().filter(|s| s.may_contain(key)) {
            if let Some(row) = sstable.get(key)? {
                fold(row);
            }
        }
        Ok(merged.and_then(|row| live_view(&row, local_time())))
    }

    /// Up to `limit` visible rows with key `>= start`, in key order.
    pub fn range_slice(&self, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Row)>, StoreError> {
        type Source = Box<dyn Iterator<Item = Result<RowEntry, SSTableError>>>;

        let mut sources: Vec<(u64, Source)> = Vec::new();
        // Memtables before the view: see `purge_snapshot`.
        {
            let memtables = self.memtables();
            for memtable in memtables.frozen.iter().chain([&memtables.active]) {
                let entries = memtable
                    .rows_from(start)?
                    .into_iter()
                    .map(|(key, row)| RowEntry::from_row(key, &row).map_err(SSTableError::from))
                    .collect::<Vec<_>>();
                sources.push((MEMTABLE_SOURCE, Box::new(entries.into_iter())));
            }
        }
        let view = self.view();
        for sstable in view.sstables() {
            sources.push((sstable.generation(), Box::new(sstable.scanner_from(start)?)));
        }

        let now = local_time();
        let mut merge = MergeIterator::new(sources);
        let mut out = Vec::new();
        while out.len() < limit {
            let Some(first) = merge.next() else {
                break;
            };
            let (_, entry) = first.map_err(|e| read_failure(e.source_id, e.error))?;
            let mut row = entry.decode()?;
            while merge.peek_key() == Some(entry.key.as_slice()) {
                match merge.next() {
                    Some(Ok((_, fragment))) => row = row.merge(fragment.decode()?),
                    Some(Err(e)) => return Err(read_failure(e.source_id, e.error)),
                    None => break,
                }
            }
            if let Some(live) = live_view(&row, now) {
                out.push((entry.key, live));
            }
        }
        Ok(out)
    }

    /// Highest timestamp held by the live tables.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.view().max_timestamp()
    }

    /// `true` when no memtable holds unflushed rows.
    pub fn memtable_is_empty(&self) -> Result<bool, MemtableError> {
        let memtables = self.memtables();
        for memtable in memtables.frozen.iter().chain([&memtables.active]) {
            if !memtable.is_empty()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// What a purge decision must see: the lowest memtable timestamp and
    /// the live set, read in that order.
    ///
    /// A flush adds its table to the live set before it releases the
    /// frozen memtable, so data being flushed shows up in at least one of
    /// the two. Reading the view first could miss it in both.
    pub(crate) fn purge_snapshot(&self) -> Result<(Option<i64>, Arc<View>), MemtableError> {
        let memtable_min_timestamp = self.memtable_min_timestamp()?;
        Ok((memtable_min_timestamp, self.view()))
    }

    /// Lowest timestamp held by any memtable, frozen ones included.
    pub(crate) fn memtable_min_timestamp(&self) -> Result<Option<i64>, MemtableError> {
        let memtables = self.memtables();
        let mut min: Option<i64> = None;
        for memtable in memtables.frozen.iter().chain([&memtables.active]) {
            if let Some(ts) = memtable.min_timestamp()? {
                min = Some(min.map_or(ts, |m| m.min(ts)));
            }
        }
        Ok(min)
    }

    // --------------------------------------------------------------------------------------------
    // Live set administration
    // --------------------------------------------------------------------------------------------

    /// Live tables ordered by generation.
    pub fn live_sstables(&self) -> Vec<Arc<SSTable>> {
        self.view().sstables().to_vec()
    }

    /// Number of live tables.
    pub fn sstable_count(&self) -> usize {
        self.view().sstables().len()
    }

    /// Retires tables `ids` without replacement.
    ///
    /// Unknown ids are ignored. Returns the generations actually removed.
    pub fn mark_compacted(&self, ids: &[u64], kind: OperationType) -> Vec<u64> {
        let mut strategy = self.strategy();
        let removed = self.tracker.mark_compacted(ids);
        for sstable in &removed {
            strategy.notify_removed(sstable);
        }
        let removed: Vec<u64> = removed.iter().map(|s| s.generation()).collect();
        info!(family = %self.name, %kind, removed_ids = ?removed, "sstables marked compacted");
        removed
    }

    /// Tells the strategy a compaction swapped `removed` for `added`.
    pub(crate) fn notify_replaced(&self, removed: &[Arc<SSTable>], added: &[Arc<SSTable>]) {
        let mut strategy = self.strategy();
        for sstable in removed {
            strategy.notify_removed(sstable);
        }
        for sstable in added {
            strategy.notify_added(sstable);
        }
    }

    /// Drops all data of the family.
    ///
    /// Compactions already running cannot publish afterwards; their
    /// outputs are discarded.
    pub fn truncate(&self) {
        let _flush = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut strategy = self.strategy();
        {
            let mut memtables = self.memtables_mut();
            memtables.active = Arc::new(Memtable::new());
            memtables.frozen.clear();
        }
        let removed = self.tracker.truncate();
        strategy.reset();
        info!(family = %self.name, removed = removed.len(), "column family truncated");
    }

    // --------------------------------------------------------------------------------------------
    // Compaction settings
    // --------------------------------------------------------------------------------------------

    /// Sets the fewest tables a background compaction merges.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the pair would be invalid; nothing changes then.
    pub fn set_minimum_compaction_threshold(&self, min: usize) -> Result<(), ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        validate_thresholds(min, config.max_compaction_threshold)?;
        config.min_compaction_threshold = min;
        debug!(family = %self.name, min, "minimum compaction threshold set");
        Ok(())
    }

    /// Sets the most tables a background compaction merges.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the pair would be invalid; nothing changes then.
    pub fn set_maximum_compaction_threshold(&self, max: usize) -> Result<(), ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        validate_thresholds(config.min_compaction_threshold, max)?;
        config.max_compaction_threshold = max;
        debug!(family = %self.name, max, "maximum compaction threshold set");
        Ok(())
    }

    /// Stops background compaction. Maximal and user-defined compactions
    /// still run.
    pub fn disable_auto_compaction(&self) {
        self.auto_compaction.store(false, Ordering::Release);
    }

    /// Resumes background compaction.
    pub fn enable_auto_compaction(&self) {
        self.auto_compaction.store(true, Ordering::Release);
    }

    /// Whether background compaction may select tables of this family.
    pub fn is_auto_compaction_enabled(&self) -> bool {
        self.auto_compaction.load(Ordering::Acquire)
    }

    /// Settings a strategy selects with right now. Thresholds read 0 while
    /// auto compaction is off.
    pub(crate) fn selection_context(&self) -> SelectionContext {
        let config = self.config();
        let now = local_time();
        let (min_threshold, max_threshold) = if self.is_auto_compaction_enabled() {
            (config.min_compaction_threshold, config.max_compaction_threshold)
        } else {
            (0, 0)
        };
        // An unreadable memtable counts as holding the oldest data, so no
        // tombstone rewrite is proposed against it.
        let memtable_min_timestamp = self.memtable_min_timestamp().unwrap_or_else(|e| {
            warn!(family = %self.name, error = %e, "memtable unreadable during selection");
            Some(i64::MIN)
        });
        SelectionContext {
            min_threshold,
            max_threshold,
            gc_before: purge::gc_before(now, config.gc_grace_seconds),
            now,
            tombstone_threshold: config.tombstone_threshold,
            tombstone_compaction_interval: config.tombstone_compaction_interval,
            memtable_min_timestamp,
        }
    }
}

/// The cells of `row` a reader sees at `now`, or `None` if there are none.
fn live_view(row: &Row, now: u32) -> Option<Row> {
    let mut live = Row::new();
    for cell in row.live_cells(now) {
        live.add(cell.clone());
    }
    (!live.cells.is_empty()).then_some(live)
}

fn read_failure(source_id: u64, err: SSTableError) -> StoreError {
    error!(table_id = source_id, error = %err, "read failed");
    StoreError::SSTable(err)
}
