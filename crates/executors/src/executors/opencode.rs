pub mod normalize_logs;
pub mod session;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{
    command::CommandConfig,
    executors::{BaseCodingAgent, ExecutorError, LaunchParameters, StandardCodingAgentExecutor},
    session_resolver::SessionIdStrategy,
};

/// `opencode run <prompt>`. The prompt is an argument and stdin stays closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS, Default)]
pub struct Opencode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Opencode {
    fn extra_params(&self) -> Vec<String> {
        let mut params = Vec::new();
        if let Some(model) = &self.model {
            params.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(agent) = &self.agent {
            params.extend(["--agent".to_string(), agent.clone()]);
        }
        params
    }
}

impl StandardCodingAgentExecutor for Opencode {
    fn build_initial(
        &self,
        command: &CommandConfig,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        let mut trailing = self.extra_params();
        trailing.push(prompt.to_string());
        Ok(LaunchParameters {
            command: command.build(&trailing)?,
            stdin: None,
            resolver: Some(SessionIdStrategy::filesystem(BaseCodingAgent::Opencode)),
        })
    }

    fn build_follow_up(
        &self,
        command: &CommandConfig,
        session_id: &str,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        let mut trailing = self.extra_params();
        trailing.extend([
            prompt.to_string(),
            "--session".to_string(),
            session_id.to_string(),
        ]);
        Ok(LaunchParameters {
            command: command.build(&trailing)?,
            stdin: None,
            resolver: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CommandConfig {
        CommandConfig::new("opencode").params(["run"])
    }

    #[test]
    fn prompt_is_positional() {
        let params = Opencode::default().build_initial(&base(), "write tests").unwrap();
        assert_eq!(params.command.args(), ["run", "write tests"]);
        assert!(params.stdin.is_none());
        assert_eq!(
            params.resolver.and_then(|r| r.filesystem),
            Some(BaseCodingAgent::Opencode)
        );
    }

    #[test]
    fn follow_up_appends_session_flag_last() {
        let agent = Opencode {
            model: Some("anthropic/claude-sonnet-4".into()),
            agent: None,
        };
        let params = agent.build_follow_up(&base(), "abc123", "and docs").unwrap();
        assert_eq!(
            params.command.args(),
            [
                "run",
                "--model",
                "anthropic/claude-sonnet-4",
                "and docs",
                "--session",
                "abc123"
            ]
        );
    }
}
