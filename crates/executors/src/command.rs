use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use workspace_utils::shell::resolve_executable_path;

use crate::executors::ExecutorError;

#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("base command is empty after parsing")]
    EmptyCommand,
    #[error("invalid shell parameters: {0}")]
    InvalidShellParams(String),
}

/// Program plus arguments, ready to hand to the process spawner.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandParts {
    program: String,
    args: Vec<String>,
}

impl CommandParts {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), ExecutorError> {
        let CommandParts { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(ExecutorError::ExecutableNotFound { program })?;
        Ok((executable, args))
    }
}

/// How a profile invokes its agent binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
pub struct CommandConfig {
    /// Base executable command (e.g., "codex" or "npx -y opencode-ai")
    pub base: String,
    /// Parameters appended to the base command on every launch
    #[serde(default)]
    pub params: Vec<String>,
    /// Environment variables set on the spawned process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandConfig {
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = params.into_iter().map(|p| p.into()).collect();
        self
    }

    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(more.into_iter().map(|p| p.into()));
        self
    }

    pub fn override_base<S: Into<String>>(mut self, base: S) -> Self {
        self.base = base.into();
        self
    }

    fn extend_shell_params<I>(self, more: I) -> Result<Self, CommandBuildError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let joined = more
            .into_iter()
            .map(|p| p.into())
            .collect::<Vec<String>>()
            .join(" ");

        let extra: Vec<String> = split_command_line(&joined)
            .map_err(|err| CommandBuildError::InvalidShellParams(format!("{joined}: {err}")))?;

        Ok(self.extend_params(extra))
    }

    /// Base words, configured params, then `trailing` (prompt or session-linking args).
    pub fn build(&self, trailing: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());
        parts.extend(trailing.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

/// Adjustments a variant (or a user profile file) makes on top of a base command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS, Default)]
pub struct CmdOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_command_override: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_params: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

pub fn apply_overrides(
    config: CommandConfig,
    overrides: &CmdOverrides,
) -> Result<CommandConfig, CommandBuildError> {
    let mut config = match overrides.base_command_override {
        Some(ref base) => config.override_base(base.clone()),
        None => config,
    };
    if let Some(ref env) = overrides.env {
        config
            .env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    match overrides.additional_params {
        Some(ref extra) => config.extend_shell_params(extra.clone()),
        None => Ok(config),
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}
