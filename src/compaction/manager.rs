//! # Compaction manager
//!
//! Runs compactions on a fixed pool of named worker threads fed by a
//! `crossbeam` channel of boxed jobs.
//!
//! ## Submission
//!
//! [`CompactionManager::submit_background`] asks the family's strategy for
//! a candidate and reserves it while holding the family's selection lock,
//! so two submissions can never pick overlapping tables. When nothing is
//! eligible the returned handle is already resolved. A finished background
//! compaction submits again for the same family while the queue has room,
//! so one trigger drains all the work that has built up.
//!
//! ## Blocking operations
//!
//! [`perform_maximal`](CompactionManager::perform_maximal) and
//! [`perform_user_defined`](CompactionManager::perform_user_defined) run
//! their tasks on the pool and wait for them. They must not be called from
//! a compaction worker.
//!
//! ## Gauges
//!
//! `pending_tasks` counts queued jobs, `active_compactions` running ones,
//! `completed_tasks` finished ones (successful or not). Once no work is
//! left, pending and active both read 0.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::compaction::task::CompactionTask;
use crate::compaction::{CompactionCandidate, CompactionError, CompactionSummary, OperationType};
use crate::config::ConfigError;
use crate::store::ColumnFamilyStore;
use crate::tracker::Reservation;

type Job = Box<dyn FnOnce() + Send>;

/// Result delivered through a [`CompactionHandle`]: `None` when there was
/// nothing to compact.
pub type CompactionOutcome = Result<Option<CompactionSummary>, CompactionError>;

// ------------------------------------------------------------------------------------------------
// Handles and summaries
// ------------------------------------------------------------------------------------------------

/// Completion handle of one submitted compaction.
#[derive(Debug)]
pub struct CompactionHandle {
    rx: Receiver<CompactionOutcome>,
}

impl CompactionHandle {
    fn resolved(outcome: CompactionOutcome) -> Self {
        let (tx, rx) = channel::bounded(1);
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Blocks until the compaction has finished.
    pub fn wait(self) -> CompactionOutcome {
        self.rx.recv().unwrap_or(Err(CompactionError::Shutdown))
    }

    /// Outcome if the compaction has already finished.
    pub fn try_wait(&self) -> Option<CompactionOutcome> {
        self.rx.try_recv().ok()
    }
}

/// Options of a user-defined compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserDefinedOptions {
    /// Decode and re-encode every row, even rows that could be copied
    /// through unchanged.
    pub force_deserialize: bool,
}

/// Outcome of a maximal compaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaximalSummary {
    /// Rounds that ran at least one compaction.
    pub rounds: usize,
    /// Every compaction, in completion order per round.
    pub compactions: Vec<CompactionSummary>,
}

// ------------------------------------------------------------------------------------------------
// Manager
// ------------------------------------------------------------------------------------------------

/// Shared compaction scheduler. Cloning yields another handle to the same
/// pool.
#[derive(Clone)]
pub struct CompactionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    capacity: usize,
    pending: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
}

impl std::fmt::Debug for CompactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionManager")
            .field("capacity", &self.inner.capacity)
            .field("pending", &self.pending_tasks())
            .field("active", &self.active_compactions())
            .finish_non_exhaustive()
    }
}

/// Decrements a gauge when dropped, so a panicking task still leaves it
/// balanced.
struct GaugeGuard<'a>(&'a AtomicUsize);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CompactionManager {
    /// Starts `thread_pool_size` workers.
    ///
    /// # Errors
    ///
    /// [`CompactionError::Config`] for a pool size of 0,
    /// [`CompactionError::Io`] if a thread cannot be spawned.
    pub fn new(thread_pool_size: usize) -> Result<Self, CompactionError> {
        if thread_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                option: "thread_pool_size",
                value: "0".into(),
                reason: "must be >= 1",
            }
            .into());
        }

        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(thread_pool_size);
        for id in 0..thread_pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("strata-compaction-{id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("compaction job panicked");
                        }
                    }
                })?;
            workers.push(handle);
        }
        // Workers hold their own receiver clones.
        drop(receiver);

        info!(pool_size = thread_pool_size, "compaction manager started");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
                capacity: thread_pool_size,
                pending: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        })
    }

    /// Number of worker threads.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Compactions queued but not yet running.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Compactions currently running.
    pub fn active_compactions(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Compactions finished since the manager started.
    pub fn completed_tasks(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Background
    // --------------------------------------------------------------------------------------------

    /// Submits the next background compaction of `store`, if any.
    ///
    /// The handle resolves to `Ok(None)` straight away when the strategy
    /// has nothing to propose.
    pub fn submit_background(&self, store: &Arc<ColumnFamilyStore>) -> CompactionHandle {
        if self.is_shut_down() {
            return CompactionHandle::resolved(Err(CompactionError::Shutdown));
        }
        let Some((candidate, reservation)) = self.select_background(store) else {
            trace!(family = store.name(), "no background compaction needed");
            return CompactionHandle::resolved(Ok(None));
        };
        self.enqueue(store, candidate, reservation, false, true)
    }

    /// Polls the strategy and reserves its candidate under the selection
    /// lock.
    fn select_background(
        &self,
        store: &Arc<ColumnFamilyStore>,
    ) -> Option<(CompactionCandidate, Reservation)> {
        let mut strategy = store.strategy();
        let view = store.view();
        let ctx = store.selection_context();
        let candidate = strategy.next_background_task(&view, &ctx)?;
        match store.tracker().try_reserve(&candidate.ids()) {
            Ok(reservation) => Some((candidate, reservation)),
            Err(e) => {
                warn!(
                    family = store.name(),
                    strategy = strategy.name(),
                    error = %e,
                    "strategy proposed unavailable tables"
                );
                None
            }
        }
    }

    /// Queues one reserved compaction.
    fn enqueue(
        &self,
        store: &Arc<ColumnFamilyStore>,
        candidate: CompactionCandidate,
        reservation: Reservation,
        force_deserialize: bool,
        self_feed: bool,
    ) -> CompactionHandle {
        let (tx, rx) = channel::bounded(1);
        let manager = self.clone();
        let job_store = Arc::clone(store);

        let job: Job = Box::new(move || {
            let inner = &manager.inner;
            inner.pending.fetch_sub(1, Ordering::AcqRel);
            inner.active.fetch_add(1, Ordering::AcqRel);
            let outcome = {
                let _active = GaugeGuard(&inner.active);
                CompactionTask::new(&job_store, candidate, force_deserialize).execute(reservation)
            };
            inner.completed.fetch_add(1, Ordering::AcqRel);

            let resubmit = self_feed
                && match &outcome {
                    Ok(summary) => made_progress(summary),
                    Err(e) => e.corrupted_table().is_some(),
                };
            let _ = tx.send(outcome.map(Some));

            if resubmit && manager.pending_tasks() < manager.capacity() {
                let _ = manager.submit_background(&job_store);
            }
        });

        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let sent = {
            let guard = self
                .inner
                .sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(sender) => sender.send(job).is_ok(),
                None => false,
            }
        };
        if !sent {
            // The job and its reservation were dropped with the channel.
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            return CompactionHandle::resolved(Err(CompactionError::Shutdown));
        }
        debug!(family = store.name(), pending = self.pending_tasks(), "compaction queued");
        CompactionHandle { rx }
    }

    // --------------------------------------------------------------------------------------------
    // Blocking operations
    // --------------------------------------------------------------------------------------------

    /// Compacts the whole family, in as many rounds as the strategy needs.
    ///
    /// Rounds stop once at most one live table is left, nothing is
    /// selectable, or a round would only recompact the previous round's
    /// outputs. The first failed compaction ends the run.
    pub fn perform_maximal(
        &self,
        store: &Arc<ColumnFamilyStore>,
    ) -> Result<MaximalSummary, CompactionError> {
        let mut summary = MaximalSummary::default();
        let mut previous_outputs: Option<BTreeSet<u64>> = None;

        loop {
            if summary.rounds > 0 && store.view().sstables().len() <= 1 {
                break;
            }

            let reserved = self.reserve_maximal(store)?;
            if reserved.is_empty() {
                break;
            }
            let inputs: BTreeSet<u64> = reserved.iter().flat_map(|(c, _)| c.ids()).collect();
            if previous_outputs.as_ref() == Some(&inputs) {
                debug!(family = store.name(), "maximal compaction converged");
                break;
            }

            let handles: Vec<CompactionHandle> = reserved
                .into_iter()
                .map(|(candidate, reservation)| {
                    self.enqueue(store, candidate, reservation, false, false)
                })
                .collect();

            let mut first_error = None;
            let mut outputs = BTreeSet::new();
            for handle in handles {
                match handle.wait() {
                    Ok(Some(done)) => {
                        outputs.extend(done.output_ids.iter().copied());
                        summary.compactions.push(done);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            summary.rounds += 1;
            previous_outputs = Some(outputs);
        }

        info!(
            family = store.name(),
            rounds = summary.rounds,
            compactions = summary.compactions.len(),
            "maximal compaction finished"
        );
        Ok(summary)
    }

    fn reserve_maximal(
        &self,
        store: &Arc<ColumnFamilyStore>,
    ) -> Result<Vec<(CompactionCandidate, Reservation)>, CompactionError> {
        let mut strategy = store.strategy();
        let view = store.view();
        let ctx = store.selection_context();
        let mut reserved = Vec::new();
        for candidate in strategy.maximal_tasks(&view, &ctx) {
            let reservation = store.tracker().try_reserve(&candidate.ids())?;
            reserved.push((candidate, reservation));
        }
        Ok(reserved)
    }

    /// Major compaction; see [`perform_maximal`](Self::perform_maximal).
    pub fn force_major_compaction(
        &self,
        store: &Arc<ColumnFamilyStore>,
    ) -> Result<MaximalSummary, CompactionError> {
        self.perform_maximal(store)
    }

    /// Compacts exactly the live tables `ids` into level 0, waiting for
    /// the result.
    ///
    /// # Errors
    ///
    /// [`CompactionError::Tracker`] if a table is not live, is suspect, or
    /// is already compacting; otherwise as for the task itself.
    pub fn perform_user_defined(
        &self,
        store: &Arc<ColumnFamilyStore>,
        ids: &[u64],
        options: UserDefinedOptions,
    ) -> Result<CompactionSummary, CompactionError> {
        if ids.is_empty() {
            return Err(ConfigError::InvalidValue {
                option: "sstables",
                value: "[]".into(),
                reason: "at least one table is required",
            }
            .into());
        }

        let (candidate, reservation) = {
            let _selection = store.strategy();
            let reservation = store.tracker().try_reserve(ids)?;
            let view = store.view();
            let sstables = ids
                .iter()
                .map(|id| {
                    view.get(*id)
                        .cloned()
                        .ok_or(CompactionError::Internal(format!("reserved table {id} vanished")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let candidate = CompactionCandidate::unleveled(sstables, OperationType::UserDefined);
            (candidate, reservation)
        };

        self.enqueue(store, candidate, reservation, options.force_deserialize, false)
            .wait()?
            .ok_or_else(|| CompactionError::Internal("user-defined compaction produced no result".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------------------------------------------

    fn is_shut_down(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops accepting work, runs what is queued, and joins the workers.
    ///
    /// Calling it more than once is harmless.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Whether a finished compaction changed anything worth selecting again.
///
/// A tombstone rewrite that purged nothing yields the same table, and
/// selection would propose it again at once.
fn made_progress(summary: &CompactionSummary) -> bool {
    summary.kind != OperationType::TombstoneCompaction || summary.bytes_out < summary.bytes_in
}

impl ManagerInner {
    fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return;
        };
        // Dropping the sender lets workers drain the queue and exit.
        drop(sender);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("compaction worker panicked");
            }
        }
        info!(
            completed = self.completed.load(Ordering::Acquire),
            "compaction manager shut down"
        );
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
