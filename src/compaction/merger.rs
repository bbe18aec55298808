//! # Row merging
//!
//! [`MergeIterator`] is a heap-based k-way merge over key-ordered row
//! streams. It yields every fragment of every source in `(key ASC,
//! source ASC)` order, so all fragments of one key come out together.
//!
//! [`RowMerger`] groups those fragments per key and decides, row by row,
//! how the row reaches the output:
//!
//! - **Echoed**: the key has exactly one fragment, no full reconciliation
//!   was requested, and either the row has no deletion markers or none of
//!   them could be purged. The encoded row is copied through unchanged.
//! - **Merged**: otherwise every fragment is decoded, the fragments are
//!   reconciled, and the result is purged. A row left with nothing is not
//!   emitted.
//!
//! Every key present in any input comes out at most once, and exactly once
//! if anything of it survives. A key owned by a single input is never
//! skipped because the other inputs are empty for it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::compaction::CompactionError;
use crate::compaction::purge::PurgeEvaluator;
use crate::row::Row;
use crate::sstable::{RowEntry, SSTableError};

// ------------------------------------------------------------------------------------------------
// MergeIterator
// ------------------------------------------------------------------------------------------------

/// A source that failed to produce its next row.
#[derive(Debug)]
pub struct SourceError {
    /// Id the source was registered with.
    pub source_id: u64,
    /// Read failure.
    pub error: SSTableError,
}

/// Heap-based k-way merge of key-ordered [`RowEntry`] streams.
///
/// Stops for good after the first source error.
pub struct MergeIterator<I> {
    sources: Vec<(u64, I)>,
    heap: BinaryHeap<MergeHeapEntry>,
    pending_error: Option<SourceError>,
    primed: bool,
    done: bool,
}

struct MergeHeapEntry {
    entry: RowEntry,
    source_idx: usize,
}

impl Ord for MergeHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so smallest key / first source pops first.
        self.entry
            .key
            .cmp(&other.entry.key)
            .then_with(|| self.source_idx.cmp(&other.source_idx))
            .reverse()
    }
}

impl PartialOrd for MergeHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHeapEntry {}

impl<I> MergeIterator<I>
where
    I: Iterator<Item = Result<RowEntry, SSTableError>>,
{
    /// Merges `sources`, each tagged with the id reported on errors.
    ///
    /// Sources are read lazily, starting with the first call to `next`.
    pub fn new(sources: Vec<(u64, I)>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
            primed: false,
            done: false,
        }
    }

    /// Key of the next fragment, if it is known to exist.
    pub fn peek_key(&self) -> Option<&[u8]> {
        if self.pending_error.is_some() || !self.primed {
            return None;
        }
        self.heap.peek().map(|e| e.entry.key.as_slice())
    }

    /// Pulls the next row of source `idx` into the heap.
    fn refill(&mut self, idx: usize) -> Result<(), SourceError> {
        let (source_id, source) = &mut self.sources[idx];
        match source.next() {
            Some(Ok(entry)) => {
                self.heap.push(MergeHeapEntry {
                    entry,
                    source_idx: idx,
                });
                Ok(())
            }
            Some(Err(error)) => Err(SourceError {
                source_id: *source_id,
                error,
            }),
            None => Ok(()),
        }
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: Iterator<Item = Result<RowEntry, SSTableError>>,
{
    /// Index of the source in the order given to `new`, and its row.
    type Item = Result<(usize, RowEntry), SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Some(Err(err));
        }
        if !self.primed {
            self.primed = true;
            for idx in 0..self.sources.len() {
                if let Err(err) = self.refill(idx) {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }

        let top = self.heap.pop()?;
        if let Err(err) = self.refill(top.source_idx) {
            self.pending_error = Some(err);
        }
        Some(Ok((top.source_idx, top.entry)))
    }
}

// ------------------------------------------------------------------------------------------------
// RowMerger
// ------------------------------------------------------------------------------------------------

/// One output row.
#[derive(Debug)]
pub enum MergedRow {
    /// Copied through from its only input, still encoded.
    Echoed(RowEntry),

    /// Reconciled and purged.
    Merged {
        /// Row key.
        key: Vec<u8>,
        /// Surviving content, never empty.
        row: Row,
    },
}

impl MergedRow {
    /// Row key.
    pub fn key(&self) -> &[u8] {
        match self {
            MergedRow::Echoed(entry) => &entry.key,
            MergedRow::Merged { key, .. } => key,
        }
    }
}

/// Groups merged fragments per key and reconciles them.
pub struct RowMerger<'a, I> {
    merge: MergeIterator<I>,
    evaluator: &'a PurgeEvaluator,
    force_deserialize: bool,
}

impl<'a, I> RowMerger<'a, I>
where
    I: Iterator<Item = Result<RowEntry, SSTableError>>,
{
    /// Merges the inputs `sources`, tagged by table generation.
    ///
    /// With `force_deserialize` every row is decoded and re-encoded, even
    /// those that could be echoed.
    pub fn new(
        sources: Vec<(u64, I)>,
        evaluator: &'a PurgeEvaluator,
        force_deserialize: bool,
    ) -> Self {
        Self {
            merge: MergeIterator::new(sources),
            evaluator,
            force_deserialize,
        }
    }

    fn corrupted(&self, err: SourceError) -> CompactionError {
        CompactionError::Corrupted {
            table_id: err.source_id,
            source: err.error,
        }
    }

    fn source_id(&self, idx: usize) -> u64 {
        self.merge.sources[idx].0
    }

    /// Next group of fragments sharing a key, in source order.
    fn next_group(&mut self) -> Option<Result<Vec<(usize, RowEntry)>, CompactionError>> {
        let first = match self.merge.next()? {
            Ok(first) => first,
            Err(err) => return Some(Err(self.corrupted(err))),
        };
        let mut group = vec![first];
        while self.merge.peek_key() == Some(group[0].1.key.as_slice()) {
            match self.merge.next() {
                Some(Ok(fragment)) => group.push(fragment),
                Some(Err(err)) => return Some(Err(self.corrupted(err))),
                None => break,
            }
        }
        Some(Ok(group))
    }

    fn can_echo(&self, entry: &RowEntry) -> bool {
        !self.force_deserialize
            && (!entry.has_deletions()
                || !self
                    .evaluator
                    .key_may_purge(&entry.key, entry.header.min_timestamp))
    }

    fn merge_group(&self, group: Vec<(usize, RowEntry)>) -> Result<Option<MergedRow>, CompactionError> {
        let mut key = Vec::new();
        let mut merged: Option<Row> = None;
        for (idx, entry) in group {
            let row = entry.decode().map_err(|source| CompactionError::Corrupted {
                table_id: self.source_id(idx),
                source,
            })?;
            key = entry.key;
            merged = Some(match merged {
                Some(acc) => acc.merge(row),
                None => row,
            });
        }
        let Some(mut row) = merged else {
            return Ok(None);
        };
        if !self.evaluator.purge(&key, &mut row) {
            return Ok(None);
        }
        Ok(Some(MergedRow::Merged { key, row }))
    }
}

impl<I> Iterator for RowMerger<'_, I>
where
    I: Iterator<Item = Result<RowEntry, SSTableError>>,
{
    type Item = Result<MergedRow, CompactionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut group = match self.next_group()? {
                Ok(group) => group,
                Err(err) => return Some(Err(err)),
            };

            if group.len() == 1 && self.can_echo(&group[0].1) {
                let (_, entry) = group.remove(0);
                return Some(Ok(MergedRow::Echoed(entry)));
            }

            match self.merge_group(group) {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
