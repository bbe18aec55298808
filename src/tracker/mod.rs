//! # Live table tracking
//!
//! The [`Tracker`] owns the set of SSTables that make up a column family
//! and the subset currently reserved by compactions. Both live in one
//! immutable [`View`]; every change installs a new `Arc<View>` with a higher
//! version, so a reader, a strategy poll or a compaction always sees one
//! complete, consistent version and never a half-applied change.
//!
//! ## Reservations
//!
//! [`Tracker::try_reserve`] claims a set of tables for one compaction,
//! all or nothing. The returned [`Reservation`] releases its claim when it
//! is dropped, so a table stops being "compacting" exactly when the task
//! that owns it ends, however it ends.
//!
//! ## Truncation epochs
//!
//! [`Tracker::truncate`] empties the live set and bumps the view's epoch.
//! A reservation remembers the epoch it was taken in; publishing the
//! results of a compaction that started before a truncate is rejected with
//! [`TrackerError::Superseded`], so truncated data never reappears.


use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::sstable::SSTable;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Tracker`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The table is not part of the live set.
    #[error("sstable {0} is not live")]
    NotLive(u64),

    /// The table is already reserved by another compaction.
    #[error("sstable {0} is already compacting")]
    AlreadyCompacting(u64),

    /// The table failed a previous compaction and is excluded.
    #[error("sstable {0} is suspect")]
    Suspect(u64),

    /// A table with this generation is already live.
    #[error("sstable {0} is already live")]
    DuplicateGeneration(u64),

    /// The family was truncated, or the inputs retired, after the
    /// reservation was taken.
    #[error("live set changed since reservation (epoch {reserved} -> {current})")]
    Superseded {
        /// Epoch at reservation time.
        reserved: u64,
        /// Epoch at publish time.
        current: u64,
    },

    /// A reservation was used with a tracker that did not issue it, or for
    /// tables it does not hold.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// View
// ------------------------------------------------------------------------------------------------

/// Immutable snapshot of a family's tables.
#[derive(Debug, Default, Clone)]
pub struct View {
    version: u64,
    epoch: u64,
    sstables: Vec<Arc<SSTable>>,
    compacting: BTreeSet<u64>,
}

impl View {
    /// Increases with every change to the live or compacting set.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Increases with every truncate.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Live tables ordered by generation.
    pub fn sstables(&self) -> &[Arc<SSTable>] {
        &self.sstables
    }

    /// Generations reserved by running compactions.
    pub fn compacting(&self) -> &BTreeSet<u64> {
        &self.compacting
    }

    /// Whether `generation` is reserved.
    pub fn is_compacting(&self, generation: u64) -> bool {
        self.compacting.contains(&generation)
    }

    /// Live table with `generation`.
    pub fn get(&self, generation: u64) -> Option<&Arc<SSTable>> {
        self.sstables
            .binary_search_by_key(&generation, |s| s.generation())
            .ok()
            .map(|i| &self.sstables[i])
    }

    /// Live tables a compaction may select: not reserved, not suspect.
    pub fn uncompacting(&self) -> impl Iterator<Item = &Arc<SSTable>> + '_ {
        self.sstables
            .iter()
            .filter(|s| !self.compacting.contains(&s.generation()) && !s.is_suspect())
    }

    /// Highest timestamp over the live tables.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.sstables.iter().map(|s| s.max_timestamp()).max()
    }

    /// Total on-disk bytes of the live tables.
    pub fn total_size(&self) -> u64 {
        self.sstables.iter().map(|s| s.file_size()).sum()
    }

    fn successor(&self) -> View {
        View {
            version: self.version + 1,
            ..self.clone()
        }
    }

    fn insert(&mut self, sstable: Arc<SSTable>) -> Result<(), TrackerError> {
        match self
            .sstables
            .binary_search_by_key(&sstable.generation(), |s| s.generation())
        {
            Ok(_) => Err(TrackerError::DuplicateGeneration(sstable.generation())),
            Err(i) => {
                self.sstables.insert(i, sstable);
                Ok(())
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Tracker
// ------------------------------------------------------------------------------------------------

/// Versioned owner of a family's live tables and reservations.
pub struct Tracker {
    view: RwLock<Arc<View>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("next_generation", &self.next_generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Tracker {
    /// Starts tracking `sstables`. New generations are allocated above the
    /// highest one given.
    pub fn new(sstables: Vec<Arc<SSTable>>) -> Result<Self, TrackerError> {
        let mut view = View::default();
        let mut highest = 0;
        for sstable in sstables {
            highest = highest.max(sstable.generation());
            view.insert(sstable)?;
        }
        Ok(Self {
            view: RwLock::new(Arc::new(view)),
            next_generation: AtomicU64::new(highest + 1),
        })
    }

    /// Current snapshot.
    pub fn view(&self) -> Arc<View> {
        Arc::clone(&self.view.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Allocates a fresh generation number.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Applies `change` to a copy of the current view and installs it.
    ///
    /// Lock poisoning is tolerated: a view is replaced wholesale, so a
    /// panic elsewhere cannot leave one half-written.
    fn update<T>(
        &self,
        change: impl FnOnce(&mut View) -> Result<T, TrackerError>,
    ) -> Result<T, TrackerError> {
        let mut guard = self.view.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.successor();
        let out = change(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Adds a freshly flushed table.
    pub fn add_sstable(&self, sstable: Arc<SSTable>) -> Result<(), TrackerError> {
        let generation = sstable.generation();
        let version = self.update(|view| {
            view.insert(sstable)?;
            Ok(view.version)
        })?;
        debug!(table_id = generation, version, "sstable added");
        Ok(())
    }

    /// Reserves `ids` for one compaction, all or nothing.
    ///
    /// # Errors
    ///
    /// The first id that is not live, is suspect, or is already reserved.
    pub fn try_reserve(self: &Arc<Self>, ids: &[u64]) -> Result<Reservation, TrackerError> {
        let epoch = self.update(|view| {
            for &id in ids {
                let sstable = view.get(id).ok_or(TrackerError::NotLive(id))?;
                if sstable.is_suspect() {
                    return Err(TrackerError::Suspect(id));
                }
                if view.compacting.contains(&id) {
                    return Err(TrackerError::AlreadyCompacting(id));
                }
            }
            let unique: BTreeSet<u64> = ids.iter().copied().collect();
            if unique.len() != ids.len() {
                return Err(TrackerError::Internal("duplicate id in reservation".into()));
            }
            view.compacting.extend(unique);
            Ok(view.epoch)
        })?;
        trace!(selected_ids = ?ids, epoch, "reserved");
        Ok(Reservation {
            tracker: Arc::clone(self),
            ids: ids.to_vec(),
            epoch,
        })
    }

    /// Atomically swaps a compaction's inputs for its outputs.
    ///
    /// Returns the retired inputs, already marked obsolete.
    ///
    /// # Errors
    ///
    /// [`TrackerError::Superseded`] if the family was truncated since the
    /// reservation was taken or an input is no longer live.
    pub fn replace(
        &self,
        reservation: &Reservation,
        added: Vec<Arc<SSTable>>,
    ) -> Result<Vec<Arc<SSTable>>, TrackerError> {
        if !std::ptr::eq(Arc::as_ptr(&reservation.tracker), self) {
            return Err(TrackerError::Internal(
                "reservation belongs to another tracker".into(),
            ));
        }
        let new_ids: Vec<u64> = added.iter().map(|s| s.generation()).collect();
        let removed = self.update(|view| {
            if view.epoch != reservation.epoch {
                return Err(TrackerError::Superseded {
                    reserved: reservation.epoch,
                    current: view.epoch,
                });
            }
            if reservation.ids.iter().any(|id| view.get(*id).is_none()) {
                return Err(TrackerError::Superseded {
                    reserved: reservation.epoch,
                    current: view.epoch,
                });
            }
            let (removed, kept): (Vec<_>, Vec<_>) = view
                .sstables
                .drain(..)
                .partition(|s| reservation.ids.contains(&s.generation()));
            view.sstables = kept;
            for sstable in added {
                view.insert(sstable)?;
            }
            Ok(removed)
        })?;
        for sstable in &removed {
            sstable.mark_obsolete();
        }
        info!(selected_ids = ?reservation.ids, new_ids = ?new_ids, "live set replaced");
        Ok(removed)
    }

    /// Removes `ids` from the live set without replacement.
    ///
    /// Unknown ids are ignored; returns the tables actually removed.
    pub fn mark_compacted(&self, ids: &[u64]) -> Vec<Arc<SSTable>> {
        let removed = self
            .update(|view| {
                let (removed, kept): (Vec<_>, Vec<_>) = view
                    .sstables
                    .drain(..)
                    .partition(|s| ids.contains(&s.generation()));
                view.sstables = kept;
                Ok(removed)
            })
            .unwrap_or_default();
        for sstable in &removed {
            sstable.mark_obsolete();
        }
        removed
    }

    /// Drops every live table and starts a new epoch.
    pub fn truncate(&self) -> Vec<Arc<SSTable>> {
        let (removed, epoch) = self
            .update(|view| {
                view.epoch += 1;
                Ok((std::mem::take(&mut view.sstables), view.epoch))
            })
            .unwrap_or_default();
        for sstable in &removed {
            sstable.mark_obsolete();
        }
        info!(epoch, removed = removed.len(), "live set truncated");
        removed
    }

    fn release(&self, ids: &[u64]) {
        let _ = self.update(|view| {
            for id in ids {
                view.compacting.remove(id);
            }
            Ok(())
        });
        trace!(released = ?ids, "reservation released");
    }
}

// ------------------------------------------------------------------------------------------------
// Reservation
// ------------------------------------------------------------------------------------------------

/// Claim on a set of tables for one compaction. Released on drop.
pub struct Reservation {
    tracker: Arc<Tracker>,
    ids: Vec<u64>,
    epoch: u64,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("ids", &self.ids)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Reservation {
    /// Reserved generations, in the order requested.
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// Truncation epoch the reservation was taken in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.tracker.release(&self.ids);
    }
}
