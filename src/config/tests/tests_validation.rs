//! Configuration parsing and validation.

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::config::{
        CfConfig, ConfigError, LeveledOptions, SizeTieredOptions, StrategyConfig,
        validate_thresholds,
    };

    fn opts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(CfConfig::default().validate().is_ok());
        assert!(
            StrategyConfig::Leveled(LeveledOptions::default())
                .validate()
                .is_ok()
        );
    }

    /// # Scenario
    /// Class names resolve bare or package-qualified; options are parsed
    /// into the matching option struct.
    #[test]
    fn from_class_parses_options() {
        let stcs = StrategyConfig::from_class(
            "org.example.SizeTieredCompactionStrategy",
            &opts(&[("min_sstable_size", "512"), ("bucket_low", "0.25")]),
        )
        .unwrap();
        assert_eq!(
            stcs,
            StrategyConfig::SizeTiered(SizeTieredOptions {
                min_sstable_size: 512,
                bucket_low: 0.25,
                bucket_high: 1.5,
            })
        );

        let lcs = StrategyConfig::from_class(
            "LeveledCompactionStrategy",
            &opts(&[("sstable_size_in_mb", "2"), ("fanout_size", "4")]),
        )
        .unwrap();
        assert_eq!(
            lcs,
            StrategyConfig::Leveled(LeveledOptions {
                max_sstable_size: 2 * 1024 * 1024,
                fanout: 4,
                max_levels: 8,
            })
        );
    }

    /// # Scenario
    /// Unknown classes, unknown options and malformed values are all
    /// configuration errors.
    #[test]
    fn from_class_rejects_bad_input() {
        assert!(matches!(
            StrategyConfig::from_class("DateTieredCompactionStrategy", &BTreeMap::new()),
            Err(ConfigError::UnknownStrategy(_))
        ));
        assert!(matches!(
            StrategyConfig::from_class(
                "SizeTieredCompactionStrategy",
                &opts(&[("sstable_size_in_mb", "1")])
            ),
            Err(ConfigError::UnknownOption { .. })
        ));
        assert!(matches!(
            StrategyConfig::from_class(
                "SizeTieredCompactionStrategy",
                &opts(&[("bucket_low", "abc")])
            ),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            StrategyConfig::from_class(
                "SizeTieredCompactionStrategy",
                &opts(&[("bucket_low", "1.2"), ("bucket_high", "1.1")])
            ),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(
            StrategyConfig::from_class(
                "LeveledCompactionStrategy",
                &opts(&[("sstable_size_in_mb", "0")])
            )
            .is_err()
        );
    }

    #[test]
    fn thresholds() {
        assert!(validate_thresholds(0, 0).is_ok());
        assert!(validate_thresholds(2, 2).is_ok());
        assert!(validate_thresholds(2, 4).is_ok());
        assert!(validate_thresholds(1, 4).is_err());
        assert!(validate_thresholds(4, 2).is_err());
        assert!(validate_thresholds(0, 4).is_err());

        let bad = CfConfig {
            tombstone_threshold: 1.5,
            ..CfConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
