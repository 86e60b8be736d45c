use std::collections::HashMap;

use tokio::process::Command;

use crate::command::CommandConfig;

/// Environment variables to inject into agent processes
#[derive(Debug, Clone, Default)]
pub struct ExecutionEnv {
    pub vars: HashMap<String, String>,
}

impl ExecutionEnv {
    /// Quiet, colorless output so stdout stays machine-readable.
    pub fn for_agent() -> Self {
        let mut env = Self::default();
        env.insert("NO_COLOR", "1");
        env.insert("NPM_CONFIG_LOGLEVEL", "error");
        env.insert("NODE_NO_WARNINGS", "1");
        env
    }

    /// Insert an environment variable
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Merge additional vars into this env. Incoming keys overwrite existing ones.
    pub fn merge(&mut self, other: &HashMap<String, String>) {
        self.vars
            .extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Return a new env with overrides applied. Overrides take precedence.
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        self.merge(overrides);
        self
    }

    /// Return a new env with the profile command's env merged in.
    pub fn with_profile(self, cmd: &CommandConfig) -> Self {
        self.with_overrides(&cmd.env)
    }

    /// Apply all environment variables to a Command
    pub fn apply_to_command(&self, command: &mut Command) {
        for (key, value) in &self.vars {
            command.env(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.vars.get(key)
    }
}
