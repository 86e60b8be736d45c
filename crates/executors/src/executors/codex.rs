pub mod normalize_logs;
pub mod session;

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use ts_rs::TS;

use crate::{
    command::CommandConfig,
    executors::{BaseCodingAgent, ExecutorError, LaunchParameters, StandardCodingAgentExecutor},
    session_resolver::SessionIdStrategy,
};

/// Sandbox policy modes for Codex
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, TS, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

/// `codex exec --json`, prompt on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS, Default)]
pub struct Codex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxMode>,
}

impl Codex {
    fn extra_params(&self) -> Vec<String> {
        let mut params = Vec::new();
        if let Some(model) = &self.model {
            params.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(sandbox) = self.sandbox {
            params.extend(["--sandbox".to_string(), sandbox.as_ref().to_string()]);
        }
        params
    }

    fn resolver() -> SessionIdStrategy {
        SessionIdStrategy::stdout(&["thread_id", "session_id"])
            .with_filesystem(BaseCodingAgent::Codex)
    }
}

impl StandardCodingAgentExecutor for Codex {
    fn build_initial(
        &self,
        command: &CommandConfig,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        Ok(LaunchParameters {
            command: command.build(&self.extra_params())?,
            stdin: Some(prompt.to_string()),
            resolver: Some(Self::resolver()),
        })
    }

    fn build_follow_up(
        &self,
        command: &CommandConfig,
        session_id: &str,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        let mut trailing = self.extra_params();
        trailing.extend(["resume".to_string(), session_id.to_string()]);
        Ok(LaunchParameters {
            command: command.build(&trailing)?,
            stdin: Some(prompt.to_string()),
            resolver: None,
        })
    }
}
