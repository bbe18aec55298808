//! # strata
//!
//! Background compaction for an LSM-tree column-family store: the
//! machinery that merges immutable SSTables, drops data that deletions
//! have made unreachable, and keeps the number of tables a read must visit
//! bounded.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata::{CfConfig, Db, DbConfig, Mutation};
//!
//! let db = Db::open("/tmp/strata_db", DbConfig::default()).unwrap();
//! let users = db.create_family("users", CfConfig::default()).unwrap();
//!
//! db.apply("users", Mutation::new("ada").add("name", "Ada", 1)).unwrap();
//! db.flush("users").unwrap();
//!
//! // Merge everything into as few tables as the strategy allows.
//! db.compaction_manager().perform_maximal(&users).unwrap();
//! assert!(users.get_row(b"ada").unwrap().is_some());
//!
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Size-tiered and leveled strategies**, selected per family.
//! - **Tombstone purging** that never resurrects data held elsewhere.
//! - **Echoed rows**: rows owned by a single input are copied verbatim.
//! - **Corruption isolation**: a table that fails to read is blacklisted
//!   while the rest of the family keeps compacting.
//! - **Versioned live set**: readers and compactions always see one
//!   consistent set of tables.

pub mod compaction;
pub mod config;
pub(crate) mod encoding;
pub mod memtable;
pub mod row;
pub mod sstable;
pub mod store;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use compaction::manager::{
    CompactionHandle, CompactionManager, CompactionOutcome, MaximalSummary, UserDefinedOptions,
};
pub use compaction::{
    CompactionCandidate, CompactionError, CompactionStrategy, CompactionSummary, FailureKind,
    OperationType, SelectionContext,
};
pub use config::{CfConfig, ConfigError, LeveledOptions, SizeTieredOptions, StrategyConfig};
pub use row::{Cell, CellKind, DeletionInfo, Mutation, Row};
pub use sstable::{SSTable, SSTableError};
pub use store::{ColumnFamilyStore, StoreError};
pub use tracker::{Reservation, Tracker, TrackerError, View};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// ```rust
/// use strata::DbConfig;
///
/// let config = DbConfig { thread_pool_size: 4 };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Number of compaction worker threads.
    ///
    /// Default: 2. Must be >= 1.
    pub thread_pool_size: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { thread_pool_size: 2 }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_pool_size < 1 {
            return Err(ConfigError::InvalidValue {
                option: "thread_pool_size",
                value: self.thread_pool_size.to_string(),
                reason: "must be >= 1",
            });
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    /// Family names must be non-empty ASCII letters, digits, `_` or `-`.
    #[error("invalid family name {0:?}")]
    InvalidFamilyName(String),

    /// No family with this name was created.
    #[error("unknown column family {0:?}")]
    UnknownFamily(String),

    /// A family with this name already exists.
    #[error("column family {0:?} already exists")]
    FamilyExists(String),

    /// Error originating from a column family.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Error originating from the compaction manager.
    #[error("{0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// A set of column families sharing one compaction pool.
///
/// Each family lives in its own sub-directory of the database directory.
/// When a flush produces a new table and auto compaction is on for that
/// family, a background compaction is submitted.
///
/// # Shutdown
///
/// Call [`Db::close`] to stop the pool after the queued compactions have
/// run. Dropping the handle does the same.
pub struct Db {
    dir: PathBuf,
    manager: CompactionManager,
    families: RwLock<BTreeMap<String, Arc<ColumnFamilyStore>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.dir)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens a database rooted at `path`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// [`DbError::Config`] if any configuration parameter is out of range.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let manager = CompactionManager::new(config.thread_pool_size)?;

        info!(path = %dir.display(), pool_size = config.thread_pool_size, "database opened");
        Ok(Self {
            dir,
            manager,
            families: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// The shared compaction scheduler.
    pub fn compaction_manager(&self) -> &CompactionManager {
        &self.manager
    }

    /// Opens the family `name`, loading any tables already on disk.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidFamilyName`] / [`DbError::FamilyExists`].
    /// - [`DbError::Store`] if `config` is invalid or a table cannot be
    ///   opened.
    pub fn create_family(
        &self,
        name: &str,
        config: CfConfig,
    ) -> Result<Arc<ColumnFamilyStore>, DbError> {
        self.check_open()?;
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(DbError::InvalidFamilyName(name.to_string()));
        }

        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        if families.contains_key(name) {
            return Err(DbError::FamilyExists(name.to_string()));
        }
        let store = ColumnFamilyStore::open(self.dir.join(name), name, config)?;
        families.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// The family `name`.
    pub fn family(&self, name: &str) -> Result<Arc<ColumnFamilyStore>, DbError> {
        self.families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownFamily(name.to_string()))
    }

    /// Applies a mutation to family `name`, flushing once its memtable is
    /// full.
    pub fn apply(&self, name: &str, mutation: Mutation) -> Result<(), DbError> {
        self.check_open()?;
        let store = self.family(name)?;
        if store.apply(mutation)? {
            self.flush_store(&store)?;
        }
        Ok(())
    }

    /// Flushes family `name` and, if a table was written and auto
    /// compaction is on, submits a background compaction.
    ///
    /// Returns the generation of the new table, if any.
    pub fn flush(&self, name: &str) -> Result<Option<u64>, DbError> {
        self.check_open()?;
        let store = self.family(name)?;
        self.flush_store(&store)
    }

    fn flush_store(&self, store: &Arc<ColumnFamilyStore>) -> Result<Option<u64>, DbError> {
        let flushed = store.force_flush()?;
        if flushed.is_some() && store.is_auto_compaction_enabled() {
            // The handle is dropped; the result is only logged.
            let _ = self.manager.submit_background(store);
            debug!(family = store.name(), "background compaction submitted");
        }
        Ok(flushed)
    }

    /// Stops the compaction pool once the queued compactions have run.
    ///
    /// Unflushed memtable contents are not persisted. Subsequent operations
    /// return [`DbError::Closed`]; calling `close` more than once is
    /// harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.manager.shutdown();
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        for store in families.values() {
            if let Ok(false) = store.memtable_is_empty() {
                warn!(family = store.name(), "closing with unflushed writes");
            }
        }
        info!(path = %self.dir.display(), "database closed");
        Ok(())
    }

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
