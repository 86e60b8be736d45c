//! Composite ids: `EXECUTOR:base64url(key)` for projects and
//! `EXECUTOR:base64url(key):native_id` for sessions.

use std::{fmt, str::FromStr};

use base64::{
    Engine as _,
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
};
use executors::executors::BaseCodingAgent;

use super::LogSourceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectId {
    pub executor: BaseCodingAgent,
    /// Adapter-specific project key, usually a workspace path.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    pub executor: BaseCodingAgent,
    pub project_key: String,
    pub native_id: String,
}

impl SessionId {
    pub fn project(&self) -> ProjectId {
        ProjectId {
            executor: self.executor,
            key: self.project_key.clone(),
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&compose_project_id(self.executor, &self.key))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&compose_session_id(
            self.executor,
            &self.project_key,
            &self.native_id,
        ))
    }
}

pub fn encode_key(key: &str) -> String {
    URL_SAFE.encode(key.as_bytes())
}

/// Accepts padded and unpadded input.
pub fn decode_key(encoded: &str) -> Result<String, LogSourceError> {
    let bytes = URL_SAFE
        .decode(encoded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .map_err(|e| LogSourceError::InvalidId(format!("`{encoded}` is not base64url: {e}")))?;
    let key = String::from_utf8(bytes)
        .map_err(|_| LogSourceError::InvalidId(format!("`{encoded}` does not decode to UTF-8")))?;
    if key.is_empty() {
        return Err(LogSourceError::InvalidId("empty project key".to_string()));
    }
    Ok(key)
}

fn parse_executor(prefix: &str) -> Result<BaseCodingAgent, LogSourceError> {
    BaseCodingAgent::from_str(prefix)
        .map_err(|_| LogSourceError::UnknownExecutor(prefix.to_string()))
}

pub fn compose_project_id(executor: BaseCodingAgent, key: &str) -> String {
    format!("{executor}:{}", encode_key(key))
}

pub fn compose_session_id(executor: BaseCodingAgent, key: &str, native_id: &str) -> String {
    format!("{executor}:{}:{native_id}", encode_key(key))
}

pub fn parse_project_id(id: &str) -> Result<ProjectId, LogSourceError> {
    let (prefix, encoded) = id
        .split_once(':')
        .ok_or_else(|| LogSourceError::InvalidId(id.to_string()))?;
    let executor = parse_executor(prefix)?;
    Ok(ProjectId {
        executor,
        key: decode_key(encoded)?,
    })
}

/// The native id keeps any further `:` it contains.
pub fn parse_session_id(id: &str) -> Result<SessionId, LogSourceError> {
    let mut parts = id.splitn(3, ':');
    let (Some(prefix), Some(encoded), Some(native_id)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(LogSourceError::InvalidId(id.to_string()));
    };
    let executor = parse_executor(prefix)?;
    if native_id.is_empty() {
        return Err(LogSourceError::InvalidId(format!("{id}: empty session id")));
    }
    Ok(SessionId {
        executor,
        project_key: decode_key(encoded)?,
        native_id: native_id.to_string(),
    })
}
