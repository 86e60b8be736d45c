use std::{path::Path, process::Stdio};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumDiscriminants, EnumIter, EnumString, VariantNames};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use ts_rs::TS;

use crate::{
    command::{CommandBuildError, CommandConfig, CommandParts},
    env::ExecutionEnv,
    executors::{claude::ClaudeCode, codex::Codex, gemini::Gemini, opencode::Opencode},
    session_resolver::SessionIdStrategy,
};

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod opencode;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Follow-up is not supported: {0}")]
    FollowUpNotSupported(String),
    #[error(transparent)]
    SpawnError(#[from] std::io::Error),
    #[error(transparent)]
    CommandBuild(#[from] CommandBuildError),
    #[error("Executable `{program}` not found in PATH")]
    ExecutableNotFound { program: String },
}

#[enum_dispatch]
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, TS, Display, EnumDiscriminants, VariantNames,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[strum_discriminants(
    name(BaseCodingAgent),
    derive(EnumString, EnumIter, Hash, strum_macros::Display, Serialize, Deserialize, TS),
    strum(serialize_all = "SCREAMING_SNAKE_CASE"),
    serde(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum CodingAgent {
    ClaudeCode,
    Codex,
    Gemini,
    Opencode,
}

/// What a parameter builder hands back for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchParameters {
    pub command: CommandParts,
    /// Written to the child's stdin, which is then closed. `None` leaves stdin null.
    pub stdin: Option<String>,
    pub resolver: Option<SessionIdStrategy>,
}

impl LaunchParameters {
    /// Launch for profiles without a builder: prompt as the last argument, no resolver.
    pub fn generic(command: &CommandConfig, prompt: &str) -> Result<Self, ExecutorError> {
        Ok(Self {
            command: command.build(&[prompt.to_string()])?,
            stdin: None,
            resolver: None,
        })
    }
}

/// Per-agent parameter builder: pure mapping from a request to process arguments.
#[enum_dispatch(CodingAgent)]
pub trait StandardCodingAgentExecutor {
    fn build_initial(
        &self,
        command: &CommandConfig,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError>;

    /// `session_id` is the agent-native id, already decoded from its composite form.
    fn build_follow_up(
        &self,
        command: &CommandConfig,
        session_id: &str,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError>;
}

/// Spawn the agent in its own process group with piped stdout/stderr.
pub async fn spawn_agent(
    params: &LaunchParameters,
    current_dir: &Path,
    env: &ExecutionEnv,
) -> Result<AsyncGroupChild, ExecutorError> {
    let (program_path, args) = params.command.clone().into_resolved().await?;

    let mut command = Command::new(program_path);
    command
        .kill_on_drop(true)
        .stdin(if params.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(current_dir)
        .args(&args);

    env.apply_to_command(&mut command);

    let mut child = command.group_spawn()?;

    if let Some(payload) = params.stdin.clone()
        && let Some(mut stdin) = child.inner().stdin.take()
    {
        // written off-task so a chatty child cannot deadlock against a full stdout pipe
        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                tracing::warn!("Failed to write prompt to agent stdin: {err}");
                return;
            }
            let _ = stdin.shutdown().await;
        });
    }

    Ok(child)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn executor_types_use_screaming_snake_case() {
        assert_eq!(BaseCodingAgent::ClaudeCode.to_string(), "CLAUDE_CODE");
        assert_eq!(BaseCodingAgent::from_str("OPENCODE").unwrap(), BaseCodingAgent::Opencode);
        assert!(BaseCodingAgent::from_str("CURSOR").is_err());

        let parsed: BaseCodingAgent = serde_json::from_str(r#""CODEX""#).unwrap();
        assert_eq!(parsed, BaseCodingAgent::Codex);
        assert_eq!(BaseCodingAgent::iter().count(), 4);
    }

    #[test]
    fn builder_config_deserializes_externally_tagged() {
        let agent: CodingAgent = serde_json::from_str(r#"{"GEMINI": {}}"#).unwrap();
        assert_eq!(BaseCodingAgent::from(&agent), BaseCodingAgent::Gemini);
    }

    #[test]
    fn generic_launch_appends_prompt() {
        let params =
            LaunchParameters::generic(&CommandConfig::new("aider").params(["--yes"]), "hi")
                .unwrap();
        assert_eq!(params.command.args(), ["--yes", "hi"]);
        assert!(params.resolver.is_none());
    }

    #[tokio::test]
    async fn spawn_agent_pipes_stdin_and_stdout() {
        use tokio::io::AsyncReadExt;

        let params = LaunchParameters {
            command: CommandConfig::new("/bin/cat").build(&[]).unwrap(),
            stdin: Some("hello".to_string()),
            resolver: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_agent(&params, dir.path(), &ExecutionEnv::for_agent())
            .await
            .unwrap();

        let mut out = String::new();
        child
            .inner()
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert!(child.wait().await.unwrap().success());
    }
}
