//! # Configuration
//!
//! Per-family settings ([`CfConfig`]) and the compaction strategy choice
//! ([`StrategyConfig`]). Every value is checked by `validate()` when a
//! family is opened or a setting changes, so a bad option is rejected up
//! front and never surfaces in the middle of a compaction.
//!
//! Strategies can also be chosen by class name with string options, the
//! way schema definitions name them:
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use strata::StrategyConfig;
//!
//! let mut options = BTreeMap::new();
//! options.insert("sstable_size_in_mb".to_string(), "2".to_string());
//! let strategy = StrategyConfig::from_class("LeveledCompactionStrategy", &options).unwrap();
//! assert_eq!(strategy.name(), "LeveledCompactionStrategy");
//!
//! assert!(StrategyConfig::from_class("NoSuchStrategy", &BTreeMap::new()).is_err());
//! ```

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::compaction::CompactionStrategy;
use crate::compaction::lcs::LeveledStrategy;
use crate::compaction::stcs::SizeTieredStrategy;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Rejected configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// No strategy is registered under this class name.
    #[error("unknown compaction strategy class {0:?}")]
    UnknownStrategy(String),

    /// The strategy does not accept this option.
    #[error("{strategy} does not accept option {option:?}")]
    UnknownOption {
        /// Strategy class name.
        strategy: &'static str,
        /// Offending option.
        option: String,
    },

    /// An option or field has an unusable value.
    #[error("invalid value {value:?} for {option}: {reason}")]
    InvalidValue {
        /// Option or field name.
        option: &'static str,
        /// Value as given.
        value: String,
        /// What is required instead.
        reason: &'static str,
    },
}

fn invalid(option: &'static str, value: impl ToString, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        option,
        value: value.to_string(),
        reason,
    }
}

fn parse<T: std::str::FromStr>(option: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(option, value, "not a number"))
}

// ------------------------------------------------------------------------------------------------
// Strategy options
// ------------------------------------------------------------------------------------------------

/// Size-tiered compaction options.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeTieredOptions {
    /// Tables below this many bytes all share one bucket.
    ///
    /// Default: 50 MiB.
    pub min_sstable_size: u64,

    /// A table joins a bucket if its size is at least this fraction of the
    /// bucket average. Default: 0.5.
    pub bucket_low: f64,

    /// ... and at most this multiple of it. Default: 1.5.
    pub bucket_high: f64,
}

impl Default for SizeTieredOptions {
    fn default() -> Self {
        Self {
            min_sstable_size: 50 * 1024 * 1024,
            bucket_low: 0.5,
            bucket_high: 1.5,
        }
    }
}

impl SizeTieredOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.bucket_low.is_finite() && self.bucket_low > 0.0 && self.bucket_low <= 1.0) {
            return Err(invalid("bucket_low", self.bucket_low, "must be in (0, 1]"));
        }
        if !(self.bucket_high.is_finite() && self.bucket_high >= 1.0) {
            return Err(invalid("bucket_high", self.bucket_high, "must be >= 1"));
        }
        if self.bucket_high <= self.bucket_low {
            return Err(invalid(
                "bucket_high",
                self.bucket_high,
                "must be greater than bucket_low",
            ));
        }
        Ok(())
    }
}

/// Leveled compaction options.
#[derive(Debug, Clone, PartialEq)]
pub struct LeveledOptions {
    /// Target size of each output table in levels >= 1. Default: 5 MiB.
    pub max_sstable_size: u64,

    /// Size ratio between consecutive levels. Default: 10.
    pub fanout: u32,

    /// Number of levels including L0. Default: 8.
    pub max_levels: u32,
}

impl Default for LeveledOptions {
    fn default() -> Self {
        Self {
            max_sstable_size: 5 * 1024 * 1024,
            fanout: 10,
            max_levels: 8,
        }
    }
}

impl LeveledOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sstable_size == 0 {
            return Err(invalid("sstable_size_in_mb", 0, "must be positive"));
        }
        if self.fanout < 2 {
            return Err(invalid("fanout_size", self.fanout, "must be >= 2"));
        }
        if !(2..=16).contains(&self.max_levels) {
            return Err(invalid("max_levels", self.max_levels, "must be in 2..=16"));
        }
        Ok(())
    }
}

/// Which compaction strategy a family runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyConfig {
    /// Merge similarly sized tables.
    SizeTiered(SizeTieredOptions),
    /// Keep levels of non-overlapping tables.
    Leveled(LeveledOptions),
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::SizeTiered(SizeTieredOptions::default())
    }
}

const SIZE_TIERED: &str = "SizeTieredCompactionStrategy";
const LEVELED: &str = "LeveledCompactionStrategy";

impl StrategyConfig {
    /// Resolves a strategy by class name and parses its string options.
    ///
    /// The class name may be bare or package-qualified
    /// (`a.b.SizeTieredCompactionStrategy`). Recognised options:
    ///
    /// - size-tiered: `min_sstable_size` (bytes), `bucket_low`, `bucket_high`
    /// - leveled: `sstable_size_in_mb`, `fanout_size`, `max_levels`
    pub fn from_class(
        class: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let short = class.rsplit('.').next().unwrap_or(class);
        let config = match short {
            SIZE_TIERED => {
                let mut opts = SizeTieredOptions::default();
                for (key, value) in options {
                    match key.as_str() {
                        "min_sstable_size" => opts.min_sstable_size = parse("min_sstable_size", value)?,
                        "bucket_low" => opts.bucket_low = parse("bucket_low", value)?,
                        "bucket_high" => opts.bucket_high = parse("bucket_high", value)?,
                        other => {
                            return Err(ConfigError::UnknownOption {
                                strategy: SIZE_TIERED,
                                option: other.to_string(),
                            });
                        }
                    }
                }
                StrategyConfig::SizeTiered(opts)
            }
            LEVELED => {
                let mut opts = LeveledOptions::default();
                for (key, value) in options {
                    match key.as_str() {
                        "sstable_size_in_mb" => {
                            let mb: u64 = parse("sstable_size_in_mb", value)?;
                            opts.max_sstable_size = mb
                                .checked_mul(1024 * 1024)
                                .ok_or_else(|| invalid("sstable_size_in_mb", value, "too large"))?;
                        }
                        "fanout_size" => opts.fanout = parse("fanout_size", value)?,
                        "max_levels" => opts.max_levels = parse("max_levels", value)?,
                        other => {
                            return Err(ConfigError::UnknownOption {
                                strategy: LEVELED,
                                option: other.to_string(),
                            });
                        }
                    }
                }
                StrategyConfig::Leveled(opts)
            }
            _ => return Err(ConfigError::UnknownStrategy(class.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Class name of the strategy.
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::SizeTiered(_) => SIZE_TIERED,
            StrategyConfig::Leveled(_) => LEVELED,
        }
    }

    /// Checks the strategy options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StrategyConfig::SizeTiered(opts) => opts.validate(),
            StrategyConfig::Leveled(opts) => opts.validate(),
        }
    }

    /// Instantiates the strategy.
    pub fn build(&self) -> Box<dyn CompactionStrategy> {
        match self {
            StrategyConfig::SizeTiered(opts) => Box::new(SizeTieredStrategy::new(opts.clone())),
            StrategyConfig::Leveled(opts) => Box::new(LeveledStrategy::new(opts.clone())),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Column family configuration
// ------------------------------------------------------------------------------------------------

/// Settings of one column family.
///
/// # Example
///
/// ```rust
/// use strata::{CfConfig, StrategyConfig, LeveledOptions};
///
/// let config = CfConfig {
///     gc_grace_seconds: 0,
///     strategy: StrategyConfig::Leveled(LeveledOptions::default()),
///     ..CfConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CfConfig {
    /// Seconds a deletion marker must age before compaction may drop it.
    ///
    /// Default: 864000 (ten days).
    pub gc_grace_seconds: u32,

    /// Fewest tables a background compaction merges.
    ///
    /// Default: 4. Must be >= 2, or 0 together with
    /// `max_compaction_threshold` to disable background compaction.
    pub min_compaction_threshold: usize,

    /// Most tables a background compaction merges.
    ///
    /// Default: 32. Must be >= `min_compaction_threshold`.
    pub max_compaction_threshold: usize,

    /// Compaction strategy.
    pub strategy: StrategyConfig,

    /// Estimated droppable-tombstone ratio above which a lone table is
    /// compacted by itself. Default: 0.2.
    pub tombstone_threshold: f64,

    /// Minimum age in seconds of a table before it is compacted alone for
    /// its tombstones. 0 disables the check. Default: 86400.
    pub tombstone_compaction_interval: u32,

    /// Memtable size in bytes at which [`Db::apply`](crate::Db::apply)
    /// flushes automatically. Default: 4 MiB.
    pub memtable_flush_size: usize,
}

impl Default for CfConfig {
    fn default() -> Self {
        Self {
            gc_grace_seconds: 864_000,
            min_compaction_threshold: 4,
            max_compaction_threshold: 32,
            strategy: StrategyConfig::default(),
            tombstone_threshold: 0.2,
            tombstone_compaction_interval: 86_400,
            memtable_flush_size: 4 * 1024 * 1024,
        }
    }
}

impl CfConfig {
    /// Validates every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_thresholds(self.min_compaction_threshold, self.max_compaction_threshold)?;
        if !(self.tombstone_threshold.is_finite()
            && (0.0..=1.0).contains(&self.tombstone_threshold))
        {
            return Err(invalid(
                "tombstone_threshold",
                self.tombstone_threshold,
                "must be in [0, 1]",
            ));
        }
        if self.memtable_flush_size == 0 {
            return Err(invalid("memtable_flush_size", 0, "must be positive"));
        }
        self.strategy.validate()
    }
}

/// Checks a `(min, max)` compaction threshold pair.
pub(crate) fn validate_thresholds(min: usize, max: usize) -> Result<(), ConfigError> {
    if min == 0 && max == 0 {
        return Ok(());
    }
    if min < 2 {
        return Err(invalid(
            "min_compaction_threshold",
            min,
            "must be >= 2 (or 0 with max 0 to disable)",
        ));
    }
    if max < min {
        return Err(invalid(
            "max_compaction_threshold",
            max,
            "must be >= min_compaction_threshold",
        ));
    }
    Ok(())
}
