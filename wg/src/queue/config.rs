//! Work queue configuration

use std::collections::HashMap;
use std::time::Duration;

use gatestore::{JobKind, PriorityBands};
use serde::{Deserialize, Serialize};

/// Queue tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Store-wide running ceilings per kind; kinds not listed use the
    /// default ceiling
    pub ceilings: HashMap<JobKind, u32>,

    /// Ceiling for kinds without an explicit entry
    #[serde(rename = "default-ceiling")]
    pub default_ceiling: u32,

    /// How long records stay readable after enqueue (ms)
    #[serde(rename = "retention-ttl-ms")]
    pub retention_ttl_ms: i64,

    /// Worker re-check interval when the queue looks idle (ms)
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Cadence of the purge sweep and the recovery probe (ms)
    #[serde(rename = "maintenance-interval-ms")]
    pub maintenance_interval_ms: u64,

    /// Size-hint thresholds for priority band mapping
    pub bands: PriorityBands,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ceilings: HashMap::new(),
            default_ceiling: 3,
            retention_ttl_ms: 24 * 60 * 60 * 1000,
            poll_interval_ms: 250,
            maintenance_interval_ms: 5_000,
            bands: PriorityBands::default(),
        }
    }
}

impl QueueConfig {
    /// Running ceiling for one kind
    pub fn ceiling_for(&self, kind: JobKind) -> u32 {
        self.ceilings.get(&kind).copied().unwrap_or(self.default_ceiling)
    }

    /// Get the poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the maintenance interval as a Duration
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert!(config.ceilings.is_empty());
        assert_eq!(config.default_ceiling, 3);
        assert_eq!(config.retention_ttl_ms, 86_400_000);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.maintenance_interval(), Duration::from_secs(5));
        assert_eq!(config.bands.small_max, 10);
        assert_eq!(config.bands.medium_max, 25);
    }

    #[test]
    fn test_ceiling_lookup_falls_back_to_default() {
        let config = QueueConfig {
            ceilings: HashMap::from([(JobKind::Report, 1), (JobKind::Analysis, 8)]),
            default_ceiling: 4,
            ..Default::default()
        };
        assert_eq!(config.ceiling_for(JobKind::Report), 1);
        assert_eq!(config.ceiling_for(JobKind::Analysis), 8);
        assert_eq!(config.ceiling_for(JobKind::Outreach), 4);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
ceilings:
  report: 1
default-ceiling: 2
bands:
  small-max: 5
"#;
        let config: QueueConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ceiling_for(JobKind::Report), 1);
        assert_eq!(config.ceiling_for(JobKind::Prospecting), 2);
        assert_eq!(config.bands.small_max, 5);
        assert_eq!(config.bands.medium_max, 25);
        assert_eq!(config.poll_interval_ms, 250);
    }
}
