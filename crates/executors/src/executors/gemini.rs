pub mod normalize_logs;
pub mod session;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{
    command::CommandConfig,
    executors::{BaseCodingAgent, ExecutorError, LaunchParameters, StandardCodingAgentExecutor},
    session_resolver::SessionIdStrategy,
};

/// Gemini CLI. It never prints its session id, so the chat file is found by polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS, Default)]
pub struct Gemini {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Gemini {
    fn extra_params(&self) -> Vec<String> {
        self.model
            .iter()
            .flat_map(|model| ["--model".to_string(), model.clone()])
            .collect()
    }
}

impl StandardCodingAgentExecutor for Gemini {
    fn build_initial(
        &self,
        command: &CommandConfig,
        prompt: &str,
    ) -> Result<LaunchParameters, ExecutorError> {
        Ok(LaunchParameters {
            command: command.build(&self.extra_params())?,
            stdin: Some(prompt.to_string()),
            resolver: Some(SessionIdStrategy::filesystem(BaseCodingAgent::Gemini)),
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
