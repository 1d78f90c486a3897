//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Max in-flight upstream calls from this process
    #[serde(rename = "max-in-flight")]
    pub max_in_flight: usize,

    /// Minimum spacing between consecutive call starts in milliseconds
    #[serde(rename = "min-spacing-ms")]
    pub min_spacing_ms: u64,

    /// Attempts per dispatch before giving up
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Longest limiter-advised wait honored as-is in milliseconds;
    /// longer advice falls through to backoff
    #[serde(rename = "max-limiter-wait-ms")]
    pub max_limiter_wait_ms: u64,

    /// First backoff step in milliseconds
    #[serde(rename = "base-backoff-ms")]
    pub base_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            min_spacing_ms: 150,
            max_attempts: 5,
            max_limiter_wait_ms: 10_000,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    /// Get the minimum spacing as a Duration
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }

    /// Get the longest honored limiter wait as a Duration
    pub fn max_limiter_wait(&self) -> Duration {
        Duration::from_millis(self.max_limiter_wait_ms)
    }

    /// Get the first backoff step as a Duration
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Get the backoff ceiling as a Duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.min_spacing_ms, 150);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_limiter_wait_ms, 10_000);
        assert_eq!(config.base_backoff_ms, 500);
        assert_eq!(config.max_backoff_ms, 30_000);
    }

    #[test]
    fn test_duration_helpers() {
        let config = DispatcherConfig {
            min_spacing_ms: 200,
            max_limiter_wait_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(config.min_spacing(), Duration::from_millis(200));
        assert_eq!(config.max_limiter_wait(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "max-in-flight: 8\nmin-spacing-ms: 50\n";
        let config: DispatcherConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.min_spacing_ms, 50);
        assert_eq!(config.max_attempts, 5);
    }
}
