//! Write builder for one row key.

use super::{Cell, DeletionInfo, Row, local_time};

#[derive(Debug, Clone)]
enum Op {
    Put {
        name: Vec<u8>,
        value: Vec<u8>,
        timestamp: i64,
        ttl: Option<u32>,
    },
    DeleteCell {
        name: Vec<u8>,
        timestamp: i64,
    },
    DeleteRow {
        timestamp: i64,
    },
}

/// A batch of writes against a single row key.
///
/// Deletion and expiration times are stamped from the wall clock when the
/// mutation is applied, unless pinned with [`Mutation::with_local_time`].
///
/// ```rust
/// use strata::Mutation;
///
/// let m = Mutation::new(b"user:1")
///     .add(b"name", b"ada", 10)
///     .add_expiring(b"session", b"tok", 10, 3600)
///     .delete_cell(b"email", 11);
/// assert_eq!(m.key(), b"user:1");
/// ```
#[derive(Debug, Clone)]
pub struct Mutation {
    key: Vec<u8>,
    ops: Vec<Op>,
    local_time: Option<u32>,
}

impl Mutation {
    /// Starts a mutation for `key`.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ops: Vec::new(),
            local_time: None,
        }
    }

    /// Writes a live cell.
    pub fn add(mut self, name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        self.ops.push(Op::Put {
            name: name.into(),
            value: value.into(),
            timestamp,
            ttl: None,
        });
        self
    }

    /// Writes a cell that expires `ttl` seconds after the write.
    pub fn add_expiring(
        mut self,
        name: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        timestamp: i64,
        ttl: u32,
    ) -> Self {
        self.ops.push(Op::Put {
            name: name.into(),
            value: value.into(),
            timestamp,
            ttl: Some(ttl),
        });
        self
    }

    /// Deletes one cell.
    pub fn delete_cell(mut self, name: impl Into<Vec<u8>>, timestamp: i64) -> Self {
        self.ops.push(Op::DeleteCell {
            name: name.into(),
            timestamp,
        });
        self
    }

    /// Deletes every cell of the row written at or before `timestamp`.
    pub fn delete_row(mut self, timestamp: i64) -> Self {
        self.ops.push(Op::DeleteRow { timestamp });
        self
    }

    /// Pins the wall-clock second used for deletion and expiration times.
    pub fn with_local_time(mut self, secs: u32) -> Self {
        self.local_time = Some(secs);
        self
    }

    /// The row key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// `true` when no writes were added.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Resolves the batch into the row fragment it writes.
    pub(crate) fn into_row(self) -> (Vec<u8>, Row) {
        let now = self.local_time.unwrap_or_else(local_time);
        let mut row = Row::new();
        for op in self.ops {
            match op {
                Op::Put {
                    name,
                    value,
                    timestamp,
                    ttl: None,
                } => row.add(Cell::live(name, value, timestamp)),
                Op::Put {
                    name,
                    value,
                    timestamp,
                    ttl: Some(ttl),
                } => row.add(Cell::expiring(name, value, timestamp, ttl, now)),
                Op::DeleteCell { name, timestamp } => {
                    row.add(Cell::tombstone(name, timestamp, now))
                }
                Op::DeleteRow { timestamp } => row.delete(DeletionInfo {
                    marked_for_delete_at: timestamp,
                    local_deletion_time: now,
                }),
            }
        }
        (self.key, row)
    }
}
