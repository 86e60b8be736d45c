//! Read-side access to agent session logs.
//!
//! Every agent gets one [`LogSource`] that knows its on-disk layout. Sources only list and
//! open; the shared [`tail`] driver turns an opened [`SessionReader`] into a patch stream, and
//! the [`factory::LogSourceFactory`] routes composite ids to the right source.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use executors::{executors::BaseCodingAgent, storage::SessionHeader};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use utils::log_msg::LogMsg;

use crate::services::active_executions::ActiveExecutions;

pub mod claude;
pub mod codex;
pub mod factory;
pub mod gemini;
pub mod ids;
pub mod opencode;
pub mod tail;

pub use factory::LogSourceFactory;
pub use tail::SessionReader;

#[derive(Debug, Error)]
pub enum LogSourceError {
    #[error("Unknown executor: {0}")]
    UnknownExecutor(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session stream failed: {0}")]
    StreamIo(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LogSourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

/// Patches of one session, then `Finished`. An `Err` item ends the stream.
pub type LogStream = BoxStream<'static, Result<LogMsg, LogSourceError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub git_repo_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub project_id: String,
    pub file_path: String,
    pub title: String,
    pub first_user_message: Option<String>,
    pub workspace_path: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub file_size: u64,
}

/// What every source needs to classify session status.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub active: Arc<ActiveExecutions>,
    pub running_window: Duration,
}

impl SourceContext {
    pub fn new(active: Arc<ActiveExecutions>, running_window: Duration) -> Self {
        Self {
            active,
            running_window,
        }
    }

    fn status(
        &self,
        session_id: &str,
        modified: Option<SystemTime>,
        header_ok: bool,
    ) -> SessionStatus {
        let recently_written = modified
            .and_then(|m| m.elapsed().ok())
            .is_some_and(|age| age <= self.running_window);
        if self.active.is_active(session_id) || recently_written {
            SessionStatus::Running
        } else if !header_ok {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        }
    }

    /// Listing row for one session file. `fallback_id` names the session when its header
    /// cannot be read; without one the file is left out.
    pub fn session_info(
        &self,
        executor: BaseCodingAgent,
        project_key: &str,
        file: &Path,
        header: io::Result<SessionHeader>,
        fallback_id: Option<String>,
    ) -> Option<SessionInfo> {
        let metadata = std::fs::metadata(file).ok();
        let modified = metadata.as_ref().and_then(|m| m.modified().ok());
        let mtime: Option<DateTime<Utc>> = modified.map(Into::into);
        let header_ok = header.is_ok();
        if let Err(err) = &header {
            tracing::debug!(path = %file.display(), "Unreadable session header: {err}");
        }
        let mut header = header.unwrap_or_default();
        if header.native_id.is_empty() {
            header.native_id = fallback_id?;
        }

        let id = ids::compose_session_id(executor, project_key, &header.native_id);
        let created_at = header.created_at.or(mtime).unwrap_or_else(Utc::now);
        Some(SessionInfo {
            status: self.status(&id, modified, header_ok),
            project_id: ids::compose_project_id(executor, project_key),
            file_path: file.to_string_lossy().into_owned(),
            title: header.title.unwrap_or_else(|| header.native_id.clone()),
            first_user_message: header.first_user_message,
            workspace_path: header
                .workspace
                .map(|w| w.to_string_lossy().into_owned()),
            created_at,
            updated_at: header.updated_at.or(mtime).unwrap_or(created_at),
            file_size: metadata.map(|m| m.len()).unwrap_or_default(),
            id,
        })
    }
}

/// Collects project keys and their session file times while a source scans its storage.
#[derive(Debug, Default)]
pub struct ProjectAccumulator {
    projects: BTreeMap<String, (PathBuf, Vec<SystemTime>)>,
}

impl ProjectAccumulator {
    pub fn touch(&mut self, key: &str, path: &Path, modified: Option<SystemTime>) {
        let entry = self
            .projects
            .entry(key.to_string())
            .or_insert_with(|| (path.to_path_buf(), Vec::new()));
        entry.1.extend(modified);
    }

    pub fn into_projects(self, executor: BaseCodingAgent) -> Vec<ProjectInfo> {
        self.projects
            .into_iter()
            .map(|(key, (path, times))| {
                let now = Utc::now();
                let created_at = times.iter().min().map(|t| (*t).into()).unwrap_or(now);
                let updated_at = times.iter().max().map(|t| (*t).into()).unwrap_or(now);
                ProjectInfo {
                    id: ids::compose_project_id(executor, &key),
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| key.clone()),
                    git_repo_path: path.to_string_lossy().into_owned(),
                    created_at,
                    updated_at,
                }
            })
            .collect()
    }
}

/// One agent's storage layout.
#[async_trait]
pub trait LogSource: Send + Sync {
    fn executor(&self) -> BaseCodingAgent;

    /// A missing storage root is an empty list.
    async fn list_projects(&self) -> Result<Vec<ProjectInfo>, LogSourceError>;

    async fn list_sessions(&self, project_key: &str) -> Result<Vec<SessionInfo>, LogSourceError>;

    /// Reader positioned at the start of the session, or `None` when no such session exists.
    async fn open_session(
        &self,
        project_key: &str,
        native_id: &str,
    ) -> Result<Option<Box<dyn SessionReader>>, LogSourceError>;
}

/// Run filesystem scanning off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, LogSourceError>
where
    F: FnOnce() -> Result<T, LogSourceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LogSourceError::Io(io::Error::other(e)))?
}
