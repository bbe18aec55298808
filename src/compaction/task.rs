//! # Compaction task
//!
//! Executes one reserved [`CompactionCandidate`]:
//!
//! 1. Builds a [`PurgeEvaluator`] against the live set and memtables.
//! 2. Streams the inputs through a [`RowMerger`] into new tables, starting
//!    a new output whenever the current one reaches `max_output_size`
//!    (only ever between rows).
//! 3. Records in every output a max timestamp no lower than the highest
//!    max timestamp among the inputs, so purging or shadowing never makes
//!    the family's max timestamp go backwards.
//! 4. Swaps inputs for outputs in a single new version of the live set and
//!    tells the strategy.
//!
//! ## Failure handling
//!
//! Nothing is published unless every row was written. On failure the
//! partial outputs are deleted, the inputs stay live, and the reservation
//! is released when the task returns. An input that could not be read is
//! marked suspect first, so no future compaction selects it again.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::compaction::merger::{MergedRow, RowMerger};
use crate::compaction::purge::{self, PurgeEvaluator};
use crate::compaction::{CompactionCandidate, CompactionError, CompactionSummary};
use crate::row::local_time;
use crate::sstable::{SSTable, SstBuilder, sstable_path};
use crate::store::ColumnFamilyStore;
use crate::tracker::Reservation;

/// One compaction in progress.
pub struct CompactionTask<'a> {
    store: &'a ColumnFamilyStore,
    candidate: CompactionCandidate,
    force_deserialize: bool,

    builder: Option<SstBuilder>,
    builder_generation: u64,
    outputs: Vec<Arc<SSTable>>,
    expected_rows: usize,
    max_input_timestamp: i64,

    rows_written: u64,
    rows_echoed: u64,
}

impl<'a> CompactionTask<'a> {
    /// Prepares the compaction of `candidate`, whose tables must be held by
    /// the reservation passed to [`execute`](Self::execute).
    pub fn new(
        store: &'a ColumnFamilyStore,
        candidate: CompactionCandidate,
        force_deserialize: bool,
    ) -> Self {
        let expected_rows = candidate
            .sstables
            .iter()
            .map(|s| s.properties().row_count)
            .sum::<u64>();
        let max_input_timestamp = candidate
            .sstables
            .iter()
            .map(|s| s.max_timestamp())
            .max()
            .unwrap_or(i64::MIN);
        Self {
            store,
            candidate,
            force_deserialize,
            builder: None,
            builder_generation: 0,
            outputs: Vec::new(),
            expected_rows: usize::try_from(expected_rows).unwrap_or(usize::MAX),
            max_input_timestamp,
            rows_written: 0,
            rows_echoed: 0,
        }
    }

    /// Runs the compaction and publishes its outputs.
    ///
    /// `reservation` is released when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`CompactionError::Corrupted`] if an input failed to read; that
    ///   input is now suspect.
    /// - [`CompactionError::SSTable`] / [`CompactionError::Io`] if writing
    ///   an output failed.
    /// - [`CompactionError::Tracker`] if the live set changed under the
    ///   compaction (e.g. a truncate).
    pub fn execute(mut self, reservation: Reservation) -> Result<CompactionSummary, CompactionError> {
        let input_ids = self.candidate.ids();
        if reservation.ids() != input_ids.as_slice() {
            return Err(CompactionError::Internal(format!(
                "reservation {:?} does not cover candidate {input_ids:?}",
                reservation.ids()
            )));
        }
        info!(
            family = self.store.name(),
            kind = %self.candidate.kind,
            selected_ids = ?input_ids,
            target_level = self.candidate.target_level,
            "compaction started"
        );

        match self.run(&reservation) {
            Ok(summary) => {
                info!(
                    family = self.store.name(),
                    kind = %summary.kind,
                    selected_ids = ?summary.input_ids,
                    new_ids = ?summary.output_ids,
                    rows_written = summary.rows_written,
                    rows_echoed = summary.rows_echoed,
                    bytes_in = summary.bytes_in,
                    bytes_out = summary.bytes_out,
                    "compaction finished"
                );
                Ok(summary)
            }
            Err(err) => {
                self.abandon_outputs();
                if let Some(table_id) = err.corrupted_table()
                    && let Some(sstable) = self.candidate.sstables.iter().find(|s| s.generation() == table_id)
                {
                    sstable.mark_suspect();
                }
                error!(
                    family = self.store.name(),
                    selected_ids = ?input_ids,
                    error = %err,
                    "compaction failed"
                );
                Err(err)
            }
        }
    }

    fn run(&mut self, reservation: &Reservation) -> Result<CompactionSummary, CompactionError> {
        let now = local_time();
        let config = self.store.config();
        let gc_before = purge::gc_before(now, config.gc_grace_seconds);
        let (memtable_min_timestamp, view) = self.store.purge_snapshot()?;
        let evaluator = PurgeEvaluator::new(
            reservation.ids(),
            &view,
            gc_before,
            now,
            memtable_min_timestamp,
        );
        drop(view);

        let sources = self
            .candidate
            .sstables
            .iter()
            .map(|s| (s.generation(), s.scanner()))
            .collect();
        let merger = RowMerger::new(sources, &evaluator, self.force_deserialize);

        for merged in merger {
            self.write(merged?)?;
        }
        self.finish_output()?;

        let removed = self.store.tracker().replace(reservation, self.outputs.clone())?;
        self.store.notify_replaced(&removed, &self.outputs);

        Ok(CompactionSummary {
            kind: self.candidate.kind,
            input_ids: self.candidate.ids(),
            output_ids: self.outputs.iter().map(|s| s.generation()).collect(),
            rows_written: self.rows_written,
            rows_echoed: self.rows_echoed,
            bytes_in: self.candidate.input_size(),
            bytes_out: self.outputs.iter().map(|s| s.file_size()).sum(),
        })
    }

    fn write(&mut self, row: MergedRow) -> Result<(), CompactionError> {
        if self.builder.is_none() {
            let generation = self.store.tracker().next_generation();
            let path = sstable_path(self.store.dir(), generation);
            self.builder = Some(SstBuilder::create(
                &path,
                self.expected_rows,
                self.candidate.target_level,
            )?);
            self.builder_generation = generation;
        }
        let Some(builder) = self.builder.as_mut() else {
            return Err(CompactionError::Internal("no output open".into()));
        };

        match row {
            MergedRow::Echoed(entry) => {
                builder.append_entry(&entry)?;
                self.rows_echoed += 1;
            }
            MergedRow::Merged { key, row } => builder.add_row(key, &row)?,
        }
        self.rows_written += 1;

        if builder.estimated_size() >= self.candidate.max_output_size {
            self.finish_output()?;
        }
        Ok(())
    }

    /// Seals the current output, if any, and opens it for reading.
    fn finish_output(&mut self) -> Result<(), CompactionError> {
        let Some(mut builder) = self.builder.take() else {
            return Ok(());
        };
        builder.raise_max_timestamp(self.max_input_timestamp);
        let rows = builder.row_count();
        let path = builder.finish()?;
        let sstable = Arc::new(SSTable::open(&path, self.builder_generation)?);
        debug!(
            table_id = self.builder_generation,
            rows,
            bytes = sstable.file_size(),
            level = self.candidate.target_level,
            "compaction output sealed"
        );
        self.outputs.push(sstable);
        Ok(())
    }

    /// Deletes every output written so far.
    fn abandon_outputs(&mut self) {
        // Dropping an unfinished builder removes its temporary file.
        self.builder = None;
        for sstable in self.outputs.drain(..) {
            debug!(table_id = sstable.generation(), "discarding compaction output");
            sstable.mark_obsolete();
        }
    }
}
