//! WorkGate configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatcherConfig;
use crate::limiter::Quotas;
use crate::queue::QueueConfig;

/// Environment variable overriding the shared store URL
pub const STORE_URL_ENV: &str = "WORKGATE_STORE_URL";

/// Main WorkGate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shared store connection
    pub store: StoreConfig,

    /// Outbound call pacing
    pub dispatcher: DispatcherConfig,

    /// Work queue tuning
    pub queue: QueueConfig,

    /// Upstream quotas keyed by `provider:model`
    pub quotas: Quotas,

    /// Append-only JSONL event log; unset disables it
    #[serde(rename = "event-log")]
    pub event_log: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR); the CLI flag wins
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        for (key, spec) in self.quotas.iter() {
            if !(spec.margin > 0.0 && spec.margin <= 1.0) {
                return Err(eyre::eyre!(
                    "Quota {} has margin {}; it must be within (0, 1]",
                    key,
                    spec.margin
                ));
            }
        }
        if self.queue.default_ceiling == 0 {
            return Err(eyre::eyre!("queue.default-ceiling must be at least 1"));
        }
        for (kind, ceiling) in &self.queue.ceilings {
            if *ceiling == 0 {
                return Err(eyre::eyre!("Ceiling for {} must be at least 1", kind));
            }
        }
        if self.dispatcher.max_in_flight == 0 {
            return Err(eyre::eyre!("dispatcher.max-in-flight must be at least 1"));
        }
        if self.dispatcher.max_attempts == 0 {
            return Err(eyre::eyre!("dispatcher.max-attempts must be at least 1"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .workgate.yml
        let local_config = PathBuf::from(".workgate.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/workgate/workgate.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("workgate").join("workgate.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Best-effort read of just the log level, usable before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Shared store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL
    pub url: String,

    /// Key prefix isolating this deployment's state
    pub prefix: String,

    /// How often a degraded component re-probes the store (ms)
    #[serde(rename = "probe-interval-ms")]
    pub probe_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "workgate".to_string(),
            probe_interval_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Connection URL, honoring the environment override
    pub fn resolved_url(&self) -> String {
        std::env::var(STORE_URL_ENV).unwrap_or_else(|_| self.url.clone())
    }

    /// Get the probe interval as a Duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}
