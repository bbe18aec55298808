//! # Memtable Module
//!
//! The mutable, in-memory layer of a column family. Writes are merged into
//! a sorted map of rows keyed by row key; a flush writes the whole map as
//! one level-0 SSTable.
//!
//! Memtables are not logged. Durability of unflushed writes is left to
//! whoever drives the flush.
//!
//! A memtable being flushed is *frozen*: it stops receiving writes but
//! stays readable, and its timestamps still count when compaction decides
//! whether a tombstone may be purged, until the SSTable written from it is
//! part of the live set.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fmt,
    ops::Bound,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use thiserror::Error;
use tracing::{error, trace};

use crate::row::Row;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Row keys must be non-empty.
    #[error("Row key is empty")]
    EmptyKey,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// A thread-safe, sorted, in-memory set of rows.
#[derive(Default)]
pub struct Memtable {
    inner: RwLock<MemtableInner>,
}

#[derive(Default)]
struct MemtableInner {
    tree: BTreeMap<Vec<u8>, Row>,

    /// Rough byte size of all keys, names and values held.
    approximate_size: usize,

    min_timestamp: Option<i64>,
    max_timestamp: Option<i64>,
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemtableInner>, MemtableError> {
        self.inner.read().map_err(|_| {
            error!("Read-write lock poisoned during memtable read");
            MemtableError::Internal("RwLock poisoned".into())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemtableInner>, MemtableError> {
        self.inner.write().map_err(|_| {
            error!("Read-write lock poisoned during memtable write");
            MemtableError::Internal("RwLock poisoned".into())
        })
    }

    /// Merges a row fragment into the row stored under `key`.
    pub fn apply(&self, key: Vec<u8>, row: Row) -> Result<(), MemtableError> {
        if key.is_empty() {
            return Err(MemtableError::EmptyKey);
        }
        trace!(key = %HexKey(&key), cells = row.cells.len(), "memtable apply");

        let size = key.len()
            + row
                .cells
                .iter()
                .map(|c| c.name.len() + c.value.len() + 16)
                .sum::<usize>();
        let min = row.min_timestamp();
        let max = row.max_timestamp();

        let mut guard = self.write()?;
        let merged = match guard.tree.remove(&key) {
            Some(existing) => existing.merge(row),
            None => row,
        };
        guard.tree.insert(key, merged);
        guard.approximate_size += size;
        guard.min_timestamp = match (guard.min_timestamp, min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        guard.max_timestamp = match (guard.max_timestamp, max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    /// Row stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Row>, MemtableError> {
        Ok(self.read()?.tree.get(key).cloned())
    }

    /// Copy of every row with key `>= start`, in key order.
    pub fn rows_from(&self, start: &[u8]) -> Result<Vec<(Vec<u8>, Row)>, MemtableError> {
        let guard = self.read()?;
        Ok(guard
            .tree
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }

    /// Copy of every row, in key order.
    pub fn snapshot(&self) -> Result<Vec<(Vec<u8>, Row)>, MemtableError> {
        self.rows_from(&[])
    }

    /// Lowest timestamp written, or `None` when empty.
    pub fn min_timestamp(&self) -> Result<Option<i64>, MemtableError> {
        Ok(self.read()?.min_timestamp)
    }

    /// Highest timestamp written, or `None` when empty.
    pub fn max_timestamp(&self) -> Result<Option<i64>, MemtableError> {
        Ok(self.read()?.max_timestamp)
    }

    /// Approximate bytes held.
    pub fn approximate_size(&self) -> Result<usize, MemtableError> {
        Ok(self.read()?.approximate_size)
    }

    /// Number of distinct row keys.
    pub fn len(&self) -> Result<usize, MemtableError> {
        Ok(self.read()?.tree.len())
    }

    /// `true` when no row has been written.
    pub fn is_empty(&self) -> Result<bool, MemtableError> {
        Ok(self.read()?.tree.is_empty())
    }
}

// ------------------------------------------------------------------------------------------------
// Tracing Helper
// ------------------------------------------------------------------------------------------------

/// Displays a key as hex, abbreviated past 32 bytes.
pub(crate) struct HexKey<'a>(pub(crate) &'a [u8]);

impl fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= 32 {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
        } else {
            for byte in &self.0[..16] {
                write!(f, "{byte:02x}")?;
            }
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
