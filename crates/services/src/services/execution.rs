//! Launching agents: request and result types plus the service contract the deployment
//! implements.

use std::{io, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use executors::{
    executors::{BaseCodingAgent, ExecutorError},
    profile::{ExecutorProfileId, ProfileError},
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use ts_rs::TS;
use utils::log_msg::LogMsg;
use uuid::Uuid;

use crate::services::log_source::{
    LogSourceError,
    ids::{self, SessionId},
};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Workspace does not exist or is not a directory: {}", .0.display())]
    Workspace(PathBuf),
    #[error("Failed to spawn agent: {0}")]
    Spawn(#[from] ExecutorError),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session is already running: {0}")]
    SessionAlreadyRunning(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_) | Self::SessionAlreadyRunning(_)
        )
    }
}

impl From<ProfileError> for ExecutionError {
    fn from(err: ProfileError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<LogSourceError> for ExecutionError {
    fn from(err: LogSourceError) -> Self {
        match err {
            LogSourceError::SessionNotFound(id) => Self::SessionNotFound(id),
            other => Self::Configuration(other.to_string()),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LaunchKind {
    New,
    FollowUp,
}

/// Who runs and where. Built per request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub profile_label: String,
    pub variant_label: Option<String>,
    pub executor: BaseCodingAgent,
    /// Composite project id.
    pub project_id: String,
    /// Encoded adapter key: the base64url form of the workspace path.
    pub actual_project_id: String,
    pub workspace_path: PathBuf,
}

impl ExecutionContext {
    pub fn new(
        profile: ExecutorProfileId,
        executor: BaseCodingAgent,
        workspace_path: impl Into<PathBuf>,
    ) -> Self {
        let workspace_path = workspace_path.into();
        let key = workspace_path.to_string_lossy();
        Self {
            project_id: ids::compose_project_id(executor, &key),
            actual_project_id: ids::encode_key(&key),
            profile_label: profile.label,
            variant_label: profile.variant,
            executor,
            workspace_path,
        }
    }

    pub fn profile_id(&self) -> ExecutorProfileId {
        ExecutorProfileId {
            label: self.profile_label.clone(),
            variant: self.variant_label.clone(),
        }
    }

    /// The key adapters list this workspace under.
    pub fn project_key(&self) -> String {
        self.workspace_path.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub context: ExecutionContext,
    pub kind: LaunchKind,
    /// Prompt for a new chat, message for a follow-up.
    pub prompt: String,
    /// Composite id of the session being continued.
    pub session_id: Option<String>,
    /// Native id used until the agent's own id is known.
    pub provisional_session_id: String,
}

impl LaunchRequest {
    pub fn new_chat(context: ExecutionContext, prompt: impl Into<String>) -> Self {
        Self {
            context,
            kind: LaunchKind::New,
            prompt: prompt.into(),
            session_id: None,
            provisional_session_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn follow_up(
        context: ExecutionContext,
        session_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            context,
            kind: LaunchKind::FollowUp,
            prompt: message.into(),
            session_id: Some(session_id.into()),
            provisional_session_id: Uuid::new_v4().to_string(),
        }
    }

    /// Composite id registered while the agent has not reported its own.
    pub fn provisional_composite_id(&self) -> String {
        ids::compose_session_id(
            self.context.executor,
            &self.context.project_key(),
            &self.provisional_session_id,
        )
    }

    /// The continued session, decoded and checked against the launch's executor.
    pub fn target_session(&self) -> Result<SessionId, ExecutionError> {
        let raw = self.session_id.as_deref().ok_or_else(|| {
            ExecutionError::Configuration("follow-up without a session id".to_string())
        })?;
        let parsed = ids::parse_session_id(raw)?;
        if parsed.executor != self.context.executor {
            return Err(ExecutionError::Configuration(format!(
                "session {raw} belongs to {} but profile `{}` runs {}",
                parsed.executor, self.context.profile_label, self.context.executor
            )));
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Composite session id, rewritten to the agent's own id once resolved.
    pub session_id: String,
    pub process_id: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub project_id: String,
    pub kind: LaunchKind,
}

#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn spawn_new(&self, request: LaunchRequest) -> Result<ExecutionResult, ExecutionError>;

    async fn follow_up(&self, request: LaunchRequest) -> Result<ExecutionResult, ExecutionError>;

    async fn execute(&self, request: LaunchRequest) -> Result<ExecutionResult, ExecutionError> {
        match request.kind {
            LaunchKind::New => self.spawn_new(request).await,
            LaunchKind::FollowUp => self.follow_up(request).await,
        }
    }

    /// Signals the process and returns `true` when the session is tracked. The session is
    /// unregistered when the process exits, not here.
    async fn stop_execution(&self, session_id: &str) -> bool;

    fn is_running(&self, session_id: &str) -> bool;

    /// Raw stdout/stderr of a tracked execution as `STDOUT`/`STDERR` patches.
    fn stream_raw_output(
        &self,
        session_id: &str,
    ) -> Option<BoxStream<'static, Result<LogMsg, io::Error>>>;
}
