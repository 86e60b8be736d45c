//! Discovering the session id an agent mints for itself.
//!
//! Two strategies exist: scanning the agent's stdout for a JSON object that carries a
//! session-id field, and polling the agent's storage directory for a freshly written session
//! whose working directory matches the launch. A profile may declare either or both; the
//! caller races them.

use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::{
    executors::{BaseCodingAgent, claude, codex, gemini, opencode},
    storage::StorageRoots,
};

/// Longest stdout line kept while looking for a session id; longer lines are discarded.
pub const MAX_SCAN_LINE_BYTES: usize = 64 * 1024;

/// Objects nested under these keys are searched as well as the top level.
const NESTED_KEYS: &[&str] = &["msg", "payload", "params", "result", "data"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdStrategy {
    /// Field names that carry the session id in stdout JSON. Empty disables the scan.
    pub stdout_fields: Vec<String>,
    /// Agent whose storage directory is polled, if any.
    pub filesystem: Option<BaseCodingAgent>,
}

impl SessionIdStrategy {
    pub fn stdout(fields: &[&str]) -> Self {
        Self {
            stdout_fields: fields.iter().map(|f| f.to_string()).collect(),
            filesystem: None,
        }
    }

    pub fn filesystem(agent: BaseCodingAgent) -> Self {
        Self {
            stdout_fields: Vec::new(),
            filesystem: Some(agent),
        }
    }

    pub fn with_filesystem(mut self, agent: BaseCodingAgent) -> Self {
        self.filesystem = Some(agent);
        self
    }

    pub fn scans_stdout(&self) -> bool {
        !self.stdout_fields.is_empty()
    }
}

/// Session id from one stdout line, if the line is a JSON object naming one.
pub fn extract_session_id(line: &str, fields: &[String]) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;

    let lookup = |obj: &Value| {
        fields.iter().find_map(|field| {
            obj.get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    };

    lookup(&value).or_else(|| {
        NESTED_KEYS
            .iter()
            .filter_map(|key| value.get(*key))
            .find_map(lookup)
    })
}

/// Read stdout chunks until a line yields a session id or the stream ends.
pub async fn scan_stdout_for_session_id<S>(mut stream: S, fields: &[String]) -> Option<String>
where
    S: Stream<Item = Result<String, io::Error>> + Unpin,
{
    let mut buffer = String::new();
    let mut discarding = false;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::debug!("stdout scan stopped on read error: {err}");
                return None;
            }
        };
        buffer.push_str(&chunk);

        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            if discarding {
                discarding = false;
                continue;
            }
            if let Some(id) = extract_session_id(&line, fields) {
                return Some(id);
            }
        }

        if buffer.len() > MAX_SCAN_LINE_BYTES {
            tracing::debug!(
                bytes = buffer.len(),
                "Discarding oversized stdout line during session scan"
            );
            buffer.clear();
            discarding = true;
        }
    }

    if discarding {
        return None;
    }
    extract_session_id(&buffer, fields)
}

/// One filesystem lookup: newest session for `workspace` touched at or after `not_before`.
pub fn find_recent_session(
    agent: BaseCodingAgent,
    roots: &StorageRoots,
    workspace: &Path,
    not_before: SystemTime,
) -> Option<String> {
    let find: fn(&Path, &Path, SystemTime) -> Option<String> = match agent {
        BaseCodingAgent::ClaudeCode => claude::session::find_recent_session,
        BaseCodingAgent::Codex => codex::session::find_recent_session,
        BaseCodingAgent::Gemini => gemini::session::find_recent_session,
        BaseCodingAgent::Opencode => opencode::session::find_recent_session,
    };
    find(roots.root_for(agent), workspace, not_before)
}

/// Poll until a matching session shows up. Never returns `None` on its own; callers bound it
/// with a deadline and drop it when another strategy wins.
pub async fn poll_filesystem_for_session(
    agent: BaseCodingAgent,
    roots: StorageRoots,
    workspace: PathBuf,
    not_before: SystemTime,
    interval: Duration,
) -> String {
    loop {
        let roots = roots.clone();
        let workspace_clone = workspace.clone();
        let found = tokio::task::spawn_blocking(move || {
            find_recent_session(agent, &roots, &workspace_clone, not_before)
        })
        .await
        .ok()
        .flatten();

        if let Some(id) = found {
            tracing::debug!(%agent, session_id = %id, "Session file discovered");
            return id;
        }
        tokio::time::sleep(interval).await;
    }
}
