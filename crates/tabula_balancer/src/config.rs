//! Declarative balancer configuration: per-bundle JSON with named groups,
//! and per-table overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tabula_common::error::{TabulaResult, ValidationError};

use crate::metric::{Metric, MetricConfig};

pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupConfig {
    pub enable_reshard: bool,
    pub enable_move: bool,
    pub min_tablet_size: u64,
    pub desired_tablet_size: u64,
    pub max_tablet_size: u64,
    pub metric: MetricConfig,
    /// Actions issued for the group per iteration.
    pub max_concurrent_actions: usize,
    /// Relative spread between the most and least loaded cells that
    /// triggers moves.
    pub move_deviation_threshold: f64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enable_reshard: true,
            enable_move: true,
            min_tablet_size: 128 * 1024 * 1024,
            desired_tablet_size: 10 * 1024 * 1024 * 1024,
            max_tablet_size: 20 * 1024 * 1024 * 1024,
            metric: MetricConfig::DataSize,
            max_concurrent_actions: 10,
            move_deviation_threshold: 0.1,
        }
    }
}

/// `0 <= 2 * min <= desired < max`: a split piece never qualifies for
/// merge and a merged tablet never qualifies for split.
pub fn validate_sizes(min: u64, desired: u64, max: u64) -> TabulaResult<()> {
    if min.saturating_mul(2) > desired || desired >= max {
        return Err(ValidationError::Config(format!(
            "tablet sizes must satisfy 2 * min <= desired < max, got min={min} desired={desired} max={max}"
        ))
        .into());
    }
    Ok(())
}

impl GroupConfig {
    pub fn validate(&self, name: &str) -> TabulaResult<()> {
        validate_sizes(self.min_tablet_size, self.desired_tablet_size, self.max_tablet_size)?;
        if self.max_concurrent_actions == 0 {
            return Err(ValidationError::Config(format!(
                "group {name}: max_concurrent_actions must be positive"
            ))
            .into());
        }
        if !(self.move_deviation_threshold >= 0.0) {
            return Err(ValidationError::Config(format!(
                "group {name}: move_deviation_threshold must be non-negative"
            ))
            .into());
        }
        Metric::compile(&self.metric)?;
        Ok(())
    }
}

/// Contents of a bundle's `tablet_balancer_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BundleBalancerConfig {
    pub enable_reshard: bool,
    pub enable_move: bool,
    pub groups: BTreeMap<String, GroupConfig>,
}

impl Default for BundleBalancerConfig {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(DEFAULT_GROUP.to_string(), GroupConfig::default());
        Self {
            enable_reshard: true,
            enable_move: true,
            groups,
        }
    }
}

impl BundleBalancerConfig {
    /// Parse and validate; the `default` group is always present.
    pub fn parse(json: &serde_json::Value) -> TabulaResult<Self> {
        let mut config: BundleBalancerConfig = serde_json::from_value(json.clone())
            .map_err(|e| ValidationError::Config(format!("tablet_balancer_config: {e}")))?;
        config
            .groups
            .entry(DEFAULT_GROUP.to_string())
            .or_default();
        for (name, group) in &config.groups {
            group.validate(name)?;
        }
        Ok(config)
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }
}

/// Per-table `tablet_balancer_config` attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableBalancerConfig {
    pub enable_auto_reshard: Option<bool>,
    pub enable_auto_tablet_move: Option<bool>,
    pub group: Option<String>,
    pub min_tablet_size: Option<u64>,
    pub desired_tablet_size: Option<u64>,
    pub max_tablet_size: Option<u64>,
}

impl TableBalancerConfig {
    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(DEFAULT_GROUP)
    }

    /// Table size overrides on top of the group's, validated together.
    pub fn effective_sizes(&self, group: &GroupConfig) -> TabulaResult<(u64, u64, u64)> {
        let sizes = (
            self.min_tablet_size.unwrap_or(group.min_tablet_size),
            self.desired_tablet_size.unwrap_or(group.desired_tablet_size),
            self.max_tablet_size.unwrap_or(group.max_tablet_size),
        );
        validate_sizes(sizes.0, sizes.1, sizes.2)?;
        Ok(sizes)
    }

    pub fn reshard_enabled(&self) -> bool {
        self.enable_auto_reshard.unwrap_or(true)
    }

    pub fn move_enabled(&self) -> bool {
        self.enable_auto_tablet_move.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_fills_default_group() {
        let config = BundleBalancerConfig::parse(&json!({
            "enable_move": false,
            "groups": {
                "party": {
                    "metric": {"parameterized": "double([/statistics/uncompressed_data_size])"},
                    "min_tablet_size": 10,
                    "desired_tablet_size": 30,
                    "max_tablet_size": 40
                }
            }
        }))
        .unwrap();
        assert!(!config.enable_move);
        assert!(config.enable_reshard);
        assert!(config.group(DEFAULT_GROUP).is_some());
        let party = config.group("party").unwrap();
        assert_eq!(party.desired_tablet_size, 30);
        assert!(matches!(party.metric, MetricConfig::Parameterized(_)));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        // 2 * min > desired
        assert!(BundleBalancerConfig::parse(&json!({
            "groups": {"g": {"min_tablet_size": 20, "desired_tablet_size": 30, "max_tablet_size": 40}}
        }))
        .is_err());
        // desired == max
        assert!(validate_sizes(1, 40, 40).is_err());
        assert!(BundleBalancerConfig::parse(&json!({"enable_everything": true})).is_err());
        assert!(BundleBalancerConfig::parse(&json!({
            "groups": {"g": {"metric": {"parameterized": "[/no/such/counter] + 1"}}}
        }))
        .is_err());
        assert!(BundleBalancerConfig::parse(&json!({"groups": {"g": {"metric": "row_count"}}})).is_ok());
    }

    #[test]
    fn test_table_overrides() {
        let table: TableBalancerConfig = serde_json::from_value(json!({
            "min_tablet_size": 500,
            "max_tablet_size": 1000,
            "desired_tablet_size": 750
        }))
        .unwrap();
        assert_eq!(table.group_name(), DEFAULT_GROUP);
        assert_eq!(table.effective_sizes(&GroupConfig::default()).unwrap(), (500, 750, 1000));
        assert!(table.reshard_enabled() && table.move_enabled());

        let broken = TableBalancerConfig {
            desired_tablet_size: Some(5),
            ..table
        };
        assert!(broken.effective_sizes(&GroupConfig::default()).is_err());
    }
}
