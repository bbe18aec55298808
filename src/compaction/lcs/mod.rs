//! # Leveled Compaction Strategy (LCS)
//!
//! Tables are arranged in levels. Flushes land in L0, whose tables may
//! overlap. Every level `L >= 1` holds tables with disjoint key ranges and
//! a byte budget of `max_sstable_size × fanout^L`; L0's budget is
//! `min_threshold` tables.
//!
//! ## Background selection
//!
//! Levels are scanned from L0 upward and the first level over budget that
//! yields an admissible candidate wins:
//!
//! - **L0**: the oldest L0 table, the other L0 tables overlapping it (up to
//!   `max_threshold`), and every L1 table overlapping their combined range.
//! - **L >= 1**: one table, taken round-robin by key after the last key
//!   compacted out of that level, plus every L+1 table overlapping it.
//!
//! Output goes to the next level, split into tables of about
//! `max_sstable_size` bytes. A candidate is inadmissible if a table it must
//! include is reserved or suspect, if it would promote past the last
//! level, or (for L0) if another L0 compaction is already running. These
//! rules keep levels `>= 1` free of overlaps even with several compactions
//! in flight.
//!
//! ## Maximal compaction
//!
//! Every selectable table is merged into the highest populated level (at
//! least L1). When a table left out, because it is suspect or reserved,
//! overlaps the inputs there, or may be promoted there by a running
//! compaction, the output goes to L0 instead.


use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::compaction::{CompactionCandidate, CompactionStrategy, OperationType, SelectionContext};
use crate::config::LeveledOptions;
use crate::sstable::SSTable;
use crate::tracker::View;

/// Leveled strategy.
#[derive(Debug, Clone)]
pub struct LeveledStrategy {
    opts: LeveledOptions,

    /// Generations per level, fed by `notify_added` / `notify_removed`.
    levels: Vec<BTreeSet<u64>>,

    /// Max key of the last table compacted out of each level.
    last_compacted_key: Vec<Option<Vec<u8>>>,
}

impl LeveledStrategy {
    /// Creates the strategy.
    pub fn new(opts: LeveledOptions) -> Self {
        let max_levels = opts.max_levels.max(2) as usize;
        Self {
            opts,
            levels: vec![BTreeSet::new(); max_levels],
            last_compacted_key: vec![None; max_levels],
        }
    }

    /// Byte budget of `level` (`level >= 1`).
    pub fn max_bytes_for_level(&self, level: usize) -> u64 {
        let fanout = u64::from(self.opts.fanout);
        let exp = u32::try_from(level).unwrap_or(u32::MAX);
        fanout
            .checked_pow(exp)
            .and_then(|m| m.checked_mul(self.opts.max_sstable_size))
            .unwrap_or(u64::MAX)
    }

    /// Number of tables the strategy has placed in each level.
    pub fn level_counts(&self) -> Vec<usize> {
        self.levels.iter().map(BTreeSet::len).collect()
    }

    fn last_level(&self) -> usize {
        self.levels.len() - 1
    }

    fn clamp(&self, level: u32) -> usize {
        (level as usize).min(self.last_level())
    }

    fn level_of(&self, sstable: &SSTable) -> usize {
        let generation = sstable.generation();
        self.levels
            .iter()
            .position(|set| set.contains(&generation))
            .unwrap_or_else(|| self.clamp(sstable.level()))
    }

    /// Live tables grouped by level. L0 is in generation order, other
    /// levels in key order.
    fn level_tables(&self, view: &View) -> Vec<Vec<Arc<SSTable>>> {
        let mut levels = vec![Vec::new(); self.levels.len()];
        for sstable in view.sstables() {
            levels[self.level_of(sstable)].push(Arc::clone(sstable));
        }
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.min_key().cmp(b.min_key()));
        }
        levels
    }

    fn over_budget(&self, level: usize, tables: &[Arc<SSTable>], ctx: &SelectionContext) -> bool {
        if level == 0 {
            return tables.len() >= ctx.min_threshold;
        }
        let bytes: u64 = tables.iter().map(|s| s.file_size()).sum();
        bytes > self.max_bytes_for_level(level)
    }

    fn l0_candidate(
        &self,
        view: &View,
        levels: &[Vec<Arc<SSTable>>],
        ctx: &SelectionContext,
    ) -> Option<CompactionCandidate> {
        let l0 = &levels[0];
        if l0.iter().any(|s| view.is_compacting(s.generation())) {
            trace!("lcs: L0 compaction already running");
            return None;
        }

        let mut available = l0.iter().filter(|s| !s.is_suspect());
        let oldest = available.next()?;
        let mut selected = vec![Arc::clone(oldest)];
        let mut min_key = oldest.min_key().to_vec();
        let mut max_key = oldest.max_key().to_vec();

        for sstable in available {
            if selected.len() >= ctx.max_threshold {
                break;
            }
            if sstable.overlaps_range(&min_key, &max_key) {
                if sstable.min_key() < min_key.as_slice() {
                    min_key = sstable.min_key().to_vec();
                }
                if sstable.max_key() > max_key.as_slice() {
                    max_key = sstable.max_key().to_vec();
                }
                selected.push(Arc::clone(sstable));
            }
        }

        let next = overlapping(&levels[1], &min_key, &max_key);
        if !admissible(view, &next) {
            trace!("lcs: L1 overlap of L0 candidate unavailable");
            return None;
        }
        selected.extend(next);
        Some(self.candidate(selected, 1))
    }

    fn level_candidate(
        &mut self,
        level: usize,
        view: &View,
        levels: &[Vec<Arc<SSTable>>],
    ) -> Option<CompactionCandidate> {
        if level >= self.last_level() {
            return None;
        }
        let tables = &levels[level];
        if tables.is_empty() {
            return None;
        }

        let start = match &self.last_compacted_key[level] {
            Some(last) => tables
                .iter()
                .position(|s| s.min_key() > last.as_slice())
                .unwrap_or(0),
            None => 0,
        };

        for offset in 0..tables.len() {
            let sstable = &tables[(start + offset) % tables.len()];
            if view.is_compacting(sstable.generation()) || sstable.is_suspect() {
                continue;
            }
            let next = overlapping(&levels[level + 1], sstable.min_key(), sstable.max_key());
            if !admissible(view, &next) {
                continue;
            }
            self.last_compacted_key[level] = Some(sstable.max_key().to_vec());
            let mut selected = vec![Arc::clone(sstable)];
            selected.extend(next);
            return Some(self.candidate(selected, level as u32 + 1));
        }
        None
    }

    /// Whether a table left out of a maximal compaction could overlap its
    /// output at `target_level`.
    ///
    /// That is a suspect or reserved table already in `target_level`, or a
    /// reserved table elsewhere whose running compaction may promote into
    /// it, in either case overlapping the inputs' key span.
    fn maximal_output_conflicts(
        &self,
        view: &View,
        inputs: &[Arc<SSTable>],
        target_level: usize,
    ) -> bool {
        let (Some(min), Some(max)) = (
            inputs.iter().map(|s| s.min_key()).min(),
            inputs.iter().map(|s| s.max_key()).max(),
        ) else {
            return false;
        };
        let chosen: BTreeSet<u64> = inputs.iter().map(|s| s.generation()).collect();
        view.sstables()
            .iter()
            .filter(|s| !chosen.contains(&s.generation()))
            .filter(|s| self.level_of(s) == target_level || view.is_compacting(s.generation()))
            .any(|s| s.overlaps_range(min, max))
    }

    fn candidate(&self, sstables: Vec<Arc<SSTable>>, target_level: u32) -> CompactionCandidate {
        CompactionCandidate {
            sstables,
            target_level,
            max_output_size: self.opts.max_sstable_size,
            kind: OperationType::Compaction,
        }
    }
}

/// Tables of a key-ordered level overlapping `[min, max]`.
fn overlapping(level: &[Arc<SSTable>], min: &[u8], max: &[u8]) -> Vec<Arc<SSTable>> {
    level
        .iter()
        .filter(|s| s.overlaps_range(min, max))
        .cloned()
        .collect()
}

/// Whether every table in `tables` may join a compaction.
fn admissible(view: &View, tables: &[Arc<SSTable>]) -> bool {
    tables
        .iter()
        .all(|s| !view.is_compacting(s.generation()) && !s.is_suspect())
}

impl CompactionStrategy for LeveledStrategy {
    fn name(&self) -> &'static str {
        "LeveledCompactionStrategy"
    }

    fn notify_added(&mut self, sstable: &Arc<SSTable>) {
        let level = self.clamp(sstable.level());
        self.levels[level].insert(sstable.generation());
    }

    fn notify_removed(&mut self, sstable: &Arc<SSTable>) {
        for level in &mut self.levels {
            level.remove(&sstable.generation());
        }
    }

    fn next_background_task(
        &mut self,
        view: &View,
        ctx: &SelectionContext,
    ) -> Option<CompactionCandidate> {
        if ctx.is_disabled() {
            return None;
        }
        let levels = self.level_tables(view);

        for level in 0..self.last_level() {
            if !self.over_budget(level, &levels[level], ctx) {
                continue;
            }
            let candidate = if level == 0 {
                self.l0_candidate(view, &levels, ctx)
            } else {
                self.level_candidate(level, view, &levels)
            };
            if let Some(candidate) = candidate {
                debug!(
                    level,
                    target_level = candidate.target_level,
                    selected_ids = ?candidate.ids(),
                    "lcs: candidate selected"
                );
                return Some(candidate);
            }
        }
        None
    }

    fn maximal_tasks(&mut self, view: &View, _ctx: &SelectionContext) -> Vec<CompactionCandidate> {
        let sstables: Vec<Arc<SSTable>> = view.uncompacting().cloned().collect();
        if sstables.is_empty() {
            return Vec::new();
        }
        let mut target_level = sstables
            .iter()
            .map(|s| self.level_of(s))
            .max()
            .unwrap_or(0)
            .max(1);
        if self.maximal_output_conflicts(view, &sstables, target_level) {
            debug!(target_level, "lcs: maximal output kept in L0");
            target_level = 0;
        }
        let mut candidate = self.candidate(sstables, target_level as u32);
        candidate.kind = OperationType::Maximal;
        vec![candidate]
    }

    fn reset(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
        for key in &mut self.last_compacted_key {
            *key = None;
        }
    }
}
