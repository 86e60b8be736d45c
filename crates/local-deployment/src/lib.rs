use std::{path::Path, sync::Arc};

use anyhow::Context;
use executors::profile::ProfileRegistry;
use services::services::{
    active_executions::ActiveExecutions,
    config::{EngineConfig, load_config_from_file},
    log_source::LogSourceFactory,
};
pub use utils::logging::init_tracing;

pub mod command;
pub mod execution;

pub use execution::LocalExecutionService;

/// Every engine component, built once and shared. Cloning is cheap.
#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<EngineConfig>,
    profiles: Arc<ProfileRegistry>,
    active: Arc<ActiveExecutions>,
    log_sources: LogSourceFactory,
    execution: LocalExecutionService,
}

impl LocalDeployment {
    /// Loads the engine config (defaults when `config_path` is `None` or missing) and the
    /// profile table it points at.
    pub fn new(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => load_config_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };
        Self::from_config(config)
    }

    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let profiles = ProfileRegistry::load(config.profiles_path.as_deref())
            .context("Failed to load profiles")?;
        Ok(Self::with_profiles(config, profiles))
    }

    pub fn with_profiles(config: EngineConfig, profiles: ProfileRegistry) -> Self {
        let active = Arc::new(ActiveExecutions::new());
        let profiles = Arc::new(profiles);
        let log_sources =
            LogSourceFactory::new(&config.storage, active.clone(), config.timing.clone());
        let execution = LocalExecutionService::new(
            profiles.clone(),
            active.clone(),
            config.storage.clone(),
            config.timing.clone(),
        );
        tracing::debug!(
            profiles = profiles.labels().count(),
            "Local deployment ready"
        );
        Self {
            config: Arc::new(config),
            profiles,
            active,
            log_sources,
            execution,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn profiles(&self) -> &Arc<ProfileRegistry> {
        &self.profiles
    }

    pub fn active_executions(&self) -> &Arc<ActiveExecutions> {
        &self.active
    }

    pub fn log_sources(&self) -> &LogSourceFactory {
        &self.log_sources
    }

    pub fn execution(&self) -> &LocalExecutionService {
        &self.execution
    }
}
