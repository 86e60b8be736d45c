pub mod normalize_logs;
pub mod session;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{
    command::CommandConfig,
    executors::{ExecutorError, LaunchParameters, StandardCodingAgentExecutor},
    session_resolver::SessionIdStrategy,
};

/// Claude Code in print mode with stream-json output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS, Default)]
pub struct ClaudeCode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dangerously_skip_permissions: Option<bool>,
}

impl ClaudeCode {
    fn extra_params(&self) -> Vec<String> {
        let mut params = Vec::new();
        if self.dangerously_skip_permissions.unwrap_or(false) {
            params.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = &self.model {
            params.extend(["--model".to_string(), model.clone()]);
        }
        params
    }
}

impl StandardCodingAgentExecutor for ClaudeCode {
    fn build_initial(
        &self,
        command: &CommandConfig,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        Ok(LaunchParameters {
            command: command.build(&self.extra_params())?,
            stdin: Some(prompt.to_string()),
            resolver: Some(SessionIdStrategy::stdout(&["session_id"])),
        })
    }

    fn build_follow_up(
        &self,
        command: &CommandConfig,
        session_id: &str,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        let mut trailing = self.extra_params();
        trailing.extend(["--resume".to_string(), session_id.to_string()]);
        Ok(LaunchParameters {
            command: command.build(&trailing)?,
            stdin: Some(prompt.to_string()),
            resolver: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CommandConfig {
        CommandConfig::new("claude").params(["-p", "--output-format=stream-json", "--verbose"])
    }

    #[test]
    fn initial_launch_pipes_prompt_and_scans_stdout() {
        let params = ClaudeCode::default().build_initial(&base(), "fix it").unwrap();
        assert_eq!(params.command.program(), "claude");
        assert_eq!(
            params.command.args(),
            ["-p", "--output-format=stream-json", "--verbose"]
        );
        assert_eq!(params.stdin.as_deref(), Some("fix it"));
        assert_eq!(
            params.resolver.map(|r| r.stdout_fields),
            Some(vec!["session_id".to_string()])
        );
    }

    #[test]
    fn follow_up_resumes_native_session() {
        let agent = ClaudeCode {
            model: Some("opus".into()),
            dangerously_skip_permissions: None,
        };
        let params = agent.build_follow_up(&base(), "abc-123", "more").unwrap();
        assert!(params.command.args().ends_with(&[
            "--model".to_string(),
            "opus".to_string(),
            "--resume".to_string(),
            "abc-123".to_string()
        ]));
        assert!(params.resolver.is_none());
    }
}
