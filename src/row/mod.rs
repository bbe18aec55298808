//! # Row model
//!
//! Rows are the unit the compaction engine merges. A row belongs to one
//! row key and holds an optional row-level deletion plus a name-sorted set
//! of cells. Every cell carries a client-supplied timestamp; conflicting
//! versions of the same cell are reconciled last-write-wins.
//!
//! ## Deletion markers
//!
//! - [`CellKind::Tombstone`] deletes one cell as of its timestamp.
//! - [`CellKind::Expiring`] is a live cell until its local expiration time
//!   and a tombstone afterwards. Its grace period counts from the write
//!   (`local_expiration_time - ttl`).
//! - [`DeletionInfo`] deletes every cell of the row whose timestamp is
//!   `<= marked_for_delete_at`.
//!
//! All deletion markers carry a *local deletion time* in wall-clock
//! seconds. A marker may only be purged once that time is older than the
//! family's grace window (see [`crate::compaction::purge`]).

pub mod encoding_impls;
pub mod mutation;

#[cfg(test)]
mod tests;

pub use mutation::Mutation;

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

// ------------------------------------------------------------------------------------------------
// Time
// ------------------------------------------------------------------------------------------------

/// Current wall-clock time in seconds since the UNIX epoch.
///
/// Saturates at `u32::MAX`; a clock before the epoch reads as 0.
pub fn local_time() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    u32::try_from(secs).unwrap_or(u32::MAX)
}

// ------------------------------------------------------------------------------------------------
// Cell
// ------------------------------------------------------------------------------------------------

/// Liveness state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    /// Ordinary live value.
    Live,

    /// Cell deletion.
    Tombstone {
        /// Wall-clock second at which the delete was applied.
        local_deletion_time: u32,
    },

    /// Value with a time-to-live.
    Expiring {
        /// Time-to-live in seconds.
        ttl: u32,
        /// Wall-clock second at which the value stops being live.
        local_expiration_time: u32,
    },
}

impl CellKind {
    /// Tie-break rank for equal timestamps: deletions beat expiring values
    /// beat live values.
    fn rank(&self) -> u8 {
        match self {
            CellKind::Live => 0,
            CellKind::Expiring { .. } => 1,
            CellKind::Tombstone { .. } => 2,
        }
    }

    /// Secondary tie-break inside the same rank.
    fn local_time(&self) -> u32 {
        match self {
            CellKind::Live => 0,
            CellKind::Tombstone {
                local_deletion_time,
            } => *local_deletion_time,
            CellKind::Expiring {
                local_expiration_time,
                ..
            } => *local_expiration_time,
        }
    }
}

/// A single named value inside a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Column name; cells of a row are ordered by name bytes.
    pub name: Vec<u8>,

    /// Value bytes. Empty for tombstones.
    pub value: Vec<u8>,

    /// Client-supplied write timestamp.
    pub timestamp: i64,

    /// Liveness state.
    pub kind: CellKind,
}

impl Cell {
    /// A live cell.
    pub fn live(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp,
            kind: CellKind::Live,
        }
    }

    /// A cell deletion applied at `local_deletion_time`.
    pub fn tombstone(name: impl Into<Vec<u8>>, timestamp: i64, local_deletion_time: u32) -> Self {
        Self {
            name: name.into(),
            value: Vec::new(),
            timestamp,
            kind: CellKind::Tombstone {
                local_deletion_time,
            },
        }
    }

    /// A value written at `local_time` that expires `ttl` seconds later.
    pub fn expiring(
        name: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timestamp: i64,
        ttl: u32,
        local_time: u32,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp,
            kind: CellKind::Expiring {
                ttl,
                local_expiration_time: local_time.saturating_add(ttl),
            },
        }
    }

    /// Whether the cell reads as absent at `now`.
    pub fn is_deleted(&self, now: u32) -> bool {
        match self.kind {
            CellKind::Live => false,
            CellKind::Tombstone { .. } => true,
            CellKind::Expiring {
                local_expiration_time,
                ..
            } => now >= local_expiration_time,
        }
    }

    /// Whether the cell is, or will become, a deletion marker.
    pub fn is_deletion_marker(&self) -> bool {
        !matches!(self.kind, CellKind::Live)
    }

    /// The second the grace window counts from, for cells that are
    /// deletions at `now`.
    pub fn deletion_time(&self, now: u32) -> Option<u32> {
        match self.kind {
            CellKind::Live => None,
            CellKind::Tombstone {
                local_deletion_time,
            } => Some(local_deletion_time),
            CellKind::Expiring {
                ttl,
                local_expiration_time,
            } if now >= local_expiration_time => Some(local_expiration_time.saturating_sub(ttl)),
            CellKind::Expiring { .. } => None,
        }
    }

    /// Rewrites an expired cell as the tombstone it has become.
    ///
    /// Returns `true` if the cell changed.
    pub fn expire(&mut self, now: u32) -> bool {
        if let CellKind::Expiring { .. } = self.kind
            && let Some(local_deletion_time) = self.deletion_time(now)
        {
            self.kind = CellKind::Tombstone {
                local_deletion_time,
            };
            self.value.clear();
            return true;
        }
        false
    }

    /// Last-write-wins reconciliation of two versions of the same cell.
    ///
    /// The order is total: timestamp, then deletion rank, then value bytes,
    /// then local time. Merging the same versions in any order yields the
    /// same winner.
    pub fn reconcile(self, other: Cell) -> Cell {
        match self.precedence_cmp(&other) {
            Ordering::Less => other,
            _ => self,
        }
    }

    fn precedence_cmp(&self, other: &Cell) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.kind.rank().cmp(&other.kind.rank()))
            .then_with(|| self.value.cmp(&other.value))
            .then_with(|| self.kind.local_time().cmp(&other.kind.local_time()))
    }
}

// ------------------------------------------------------------------------------------------------
// DeletionInfo
// ------------------------------------------------------------------------------------------------

/// Row-level tombstone.
///
/// Ordering is by `marked_for_delete_at`, then `local_deletion_time`, so
/// `max` picks the deletion that wins reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeletionInfo {
    /// Cells with a timestamp at or below this value are deleted.
    pub marked_for_delete_at: i64,

    /// Wall-clock second at which the delete was applied.
    pub local_deletion_time: u32,
}

impl DeletionInfo {
    /// Whether this deletion hides `cell`.
    pub fn shadows(&self, cell: &Cell) -> bool {
        cell.timestamp <= self.marked_for_delete_at
    }
}

// ------------------------------------------------------------------------------------------------
// Row
// ------------------------------------------------------------------------------------------------

/// All cells stored for one row key, plus an optional row deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    /// Row-level tombstone, if any.
    pub deletion: Option<DeletionInfo>,

    /// Cells ordered by name, at most one per name.
    pub cells: Vec<Cell>,
}

/// Counts of what a purge pass removed or rewrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    /// Cells dropped because a row deletion hides them.
    pub shadowed: usize,
    /// Expiring cells rewritten as tombstones.
    pub expired: usize,
    /// Cell tombstones dropped.
    pub purged_cells: usize,
    /// Whether the row deletion itself was dropped.
    pub purged_row_deletion: bool,
}

impl Row {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or reconciles a cell, keeping name order.
    pub fn add(&mut self, cell: Cell) {
        match self
            .cells
            .binary_search_by(|c| c.name.as_slice().cmp(&cell.name))
        {
            Ok(i) => {
                if cell.precedence_cmp(&self.cells[i]) == Ordering::Greater {
                    self.cells[i] = cell;
                }
            }
            Err(i) => self.cells.insert(i, cell),
        }
    }

    /// Applies a row deletion, keeping the stronger of the two.
    pub fn delete(&mut self, deletion: DeletionInfo) {
        self.deletion = Some(match self.deletion {
            Some(current) => current.max(deletion),
            None => deletion,
        });
    }

    /// Merges two fragments of the same row.
    pub fn merge(self, other: Row) -> Row {
        let deletion = match (self.deletion, other.deletion) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let mut cells = Vec::with_capacity(self.cells.len().max(other.cells.len()));
        let mut left = self.cells.into_iter().peekable();
        let mut right = other.cells.into_iter().peekable();

        loop {
            let ord = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.name.cmp(&b.name),
            };
            match ord {
                Ordering::Less => cells.extend(left.next()),
                Ordering::Greater => cells.extend(right.next()),
                Ordering::Equal => {
                    if let (Some(a), Some(b)) = (left.next(), right.next()) {
                        cells.push(a.reconcile(b));
                    }
                }
            }
        }

        Row { deletion, cells }
    }

    /// `true` when the row holds neither cells nor a row deletion.
    pub fn is_empty(&self) -> bool {
        self.deletion.is_none() && self.cells.is_empty()
    }

    /// Whether the row carries any deletion marker (row deletion,
    /// tombstone, or expiring cell).
    pub fn has_deletions(&self) -> bool {
        self.deletion.is_some() || self.cells.iter().any(Cell::is_deletion_marker)
    }

    /// Highest timestamp among cells and the row deletion.
    pub fn max_timestamp(&self) -> Option<i64> {
        let cells = self.cells.iter().map(|c| c.timestamp);
        let deletion = self.deletion.map(|d| d.marked_for_delete_at);
        cells.chain(deletion).max()
    }

    /// Lowest timestamp among cells and the row deletion.
    pub fn min_timestamp(&self) -> Option<i64> {
        let cells = self.cells.iter().map(|c| c.timestamp);
        let deletion = self.deletion.map(|d| d.marked_for_delete_at);
        cells.chain(deletion).min()
    }

    /// Cells visible to a reader at `now`: not shadowed, not deleted.
    pub fn live_cells(&self, now: u32) -> impl Iterator<Item = &Cell> + '_ {
        self.cells.iter().filter(move |c| {
            !c.is_deleted(now) && !self.deletion.is_some_and(|d| d.shadows(c))
        })
    }

    /// Garbage-collects the row in place.
    ///
    /// Shadowed cells are always dropped and expired cells always become
    /// tombstones. Deletion markers are dropped only when
    /// `can_purge(timestamp, local_deletion_time)` allows it.
    pub fn purge(&mut self, now: u32, can_purge: impl Fn(i64, u32) -> bool) -> PurgeStats {
        let mut stats = PurgeStats::default();

        if let Some(deletion) = self.deletion {
            let before = self.cells.len();
            self.cells.retain(|c| !deletion.shadows(c));
            stats.shadowed = before - self.cells.len();
        }

        for cell in &mut self.cells {
            if cell.expire(now) {
                stats.expired += 1;
            }
        }

        let before = self.cells.len();
        self.cells.retain(|c| match c.kind {
            CellKind::Tombstone {
                local_deletion_time,
            } => !can_purge(c.timestamp, local_deletion_time),
            _ => true,
        });
        stats.purged_cells = before - self.cells.len();

        if let Some(deletion) = self.deletion
            && can_purge(deletion.marked_for_delete_at, deletion.local_deletion_time)
        {
            self.deletion = None;
            stats.purged_row_deletion = true;
        }

        stats
    }

    /// Deletion times fed into an SSTable's droppable-tombstone histogram.
    ///
    /// Expiring cells contribute their expiration time, the earliest moment
    /// they can become droppable.
    pub fn deletion_points(&self) -> impl Iterator<Item = u32> + '_ {
        let cells = self.cells.iter().filter_map(|c| match c.kind {
            CellKind::Live => None,
            CellKind::Tombstone {
                local_deletion_time,
            } => Some(local_deletion_time),
            CellKind::Expiring {
                local_expiration_time,
                ..
            } => Some(local_expiration_time),
        });
        cells.chain(self.deletion.map(|d| d.local_deletion_time))
    }
}
