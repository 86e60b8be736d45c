use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use executors::storage::StorageRoots;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Polling and retry knobs, all in milliseconds unless the name says otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub session_resolution_timeout_ms: u64,
    pub resolution_poll_interval_ms: u64,
    pub staleness_allowance_ms: u64,
    pub tail_poll_interval_ms: u64,
    pub session_lookup_attempts: usize,
    pub session_lookup_delay_ms: u64,
    pub running_window_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            session_resolution_timeout_ms: 10_000,
            resolution_poll_interval_ms: 500,
            staleness_allowance_ms: 5_000,
            tail_poll_interval_ms: 500,
            session_lookup_attempts: 10,
            session_lookup_delay_ms: 500,
            running_window_secs: 30,
        }
    }
}

impl TimingConfig {
    pub fn session_resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.session_resolution_timeout_ms)
    }

    pub fn resolution_poll_interval(&self) -> Duration {
        Duration::from_millis(self.resolution_poll_interval_ms)
    }

    pub fn staleness_allowance(&self) -> Duration {
        Duration::from_millis(self.staleness_allowance_ms)
    }

    pub fn tail_poll_interval(&self) -> Duration {
        Duration::from_millis(self.tail_poll_interval_ms)
    }

    pub fn session_lookup_delay(&self) -> Duration {
        Duration::from_millis(self.session_lookup_delay_ms)
    }

    pub fn running_window(&self) -> Duration {
        Duration::from_secs(self.running_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageRoots,
    pub timing: TimingConfig,
    /// JSON file with user profile definitions, merged over the built-in table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles_path: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let timing = &self.timing;
        if timing.tail_poll_interval_ms == 0 || timing.resolution_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if timing.session_lookup_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "session_lookup_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Missing file yields defaults; a malformed file is an error.
pub fn load_config_from_file(config_path: &Path) -> Result<EngineConfig, ConfigError> {
    match std::fs::read_to_string(config_path) {
        Ok(raw) => EngineConfig::from_toml(&raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %config_path.display(), "No engine config file, using defaults");
            Ok(EngineConfig::default())
        }
        Err(err) => Err(err.into()),
    }
}
