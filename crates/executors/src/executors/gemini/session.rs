//! Gemini CLI chats: `<root>/tmp/<sha256(project path)>/chats/session-*.json`.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use workspace_utils::text::summarize;

use crate::storage::{
    SessionHeader, file_name_str, list_dir, modified_time, newest_since, parse_rfc3339,
};

const TITLE_CHARS: usize = 80;
const PROJECT_ROOT_FILE: &str = ".project_root";

/// One chat file. Gemini rewrites the whole document on every turn.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeminiSession {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub project_hash: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub messages: Vec<GeminiMessage>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeminiMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub thoughts: Vec<GeminiThought>,
    #[serde(default)]
    pub tool_calls: Vec<GeminiToolCall>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GeminiThought {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub result_display: Option<Value>,
    #[serde(default)]
    pub status: String,
}

impl GeminiMessage {
    /// Message text; content is either a string or a list of `{text}` parts.
    pub fn text(&self) -> String {
        content_text(&self.content)
    }
}

pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

pub fn tmp_dir(root: &Path) -> PathBuf {
    root.join("tmp")
}

pub fn project_hash(workspace: &Path) -> String {
    let digest = Sha256::digest(workspace.to_string_lossy().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash directories that hold at least a `chats` folder.
pub fn project_dirs(root: &Path) -> io::Result<Vec<PathBuf>> {
    list_dir(&tmp_dir(root), |p| p.join("chats").is_dir())
}

/// Project path from `.project_root`, when Gemini wrote one.
pub fn project_root(project_dir: &Path) -> Option<PathBuf> {
    fs::read_to_string(project_dir.join(PROJECT_ROOT_FILE))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// A project key is either a workspace path (hashed) or a literal hash directory name.
pub fn resolve_project_dir(root: &Path, key: &str) -> Option<PathBuf> {
    let hashed = tmp_dir(root).join(project_hash(Path::new(key)));
    if hashed.is_dir() {
        return Some(hashed);
    }
    let literal = tmp_dir(root).join(key);
    (!key.contains('/') && literal.is_dir()).then_some(literal)
}

pub fn session_files(project_dir: &Path) -> io::Result<Vec<PathBuf>> {
    list_dir(&project_dir.join("chats"), |p| {
        let name = file_name_str(p);
        p.is_file() && name.starts_with("session-") && name.ends_with(".json")
    })
}

pub fn read_session(path: &Path) -> io::Result<GeminiSession> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn read_header(path: &Path) -> io::Result<SessionHeader> {
    let session = read_session(path)?;
    let first_user_message = session
        .messages
        .iter()
        .filter(|m| m.kind == "user")
        .map(GeminiMessage::text)
        .find(|t| !t.trim().is_empty());

    Ok(SessionHeader {
        native_id: session.session_id.clone(),
        workspace: path
            .parent()
            .and_then(Path::parent)
            .and_then(project_root),
        title: first_user_message
            .as_deref()
            .map(|m| summarize(m, TITLE_CHARS)),
        first_user_message,
        created_at: session.start_time.as_deref().and_then(parse_rfc3339),
        updated_at: session
            .last_updated
            .as_deref()
            .and_then(parse_rfc3339)
            .or_else(|| modified_time(path).map(Into::into)),
    })
}

fn file_session_id(path: &Path) -> Option<String> {
    read_session(path)
        .ok()
        .map(|s| s.session_id)
        .filter(|id| !id.is_empty())
}

/// Chat file for `native_id`, searched under `project_key` first and then everywhere.
pub fn find_session_file(root: &Path, project_key: &str, native_id: &str) -> Option<PathBuf> {
    let matches = |dir: &Path| {
        session_files(dir)
            .ok()?
            .into_iter()
            .find(|f| file_session_id(f).as_deref() == Some(native_id))
    };
    if let Some(dir) = resolve_project_dir(root, project_key)
        && let Some(found) = matches(dir.as_path())
    {
        return Some(found);
    }
    project_dirs(root).ok()?.iter().find_map(|dir| matches(dir.as_path()))
}

pub fn find_recent_session(
    root: &Path,
    workspace: &Path,
    not_before: SystemTime,
) -> Option<String> {
    let dir = tmp_dir(root).join(project_hash(workspace));
    let candidates = session_files(&dir).ok()?.into_iter().filter_map(|file| {
        let session = read_session(&file).ok()?;
        let updated = session
            .last_updated
            .as_deref()
            .and_then(parse_rfc3339)
            .map(SystemTime::from)
            .or_else(|| modified_time(&file))?;
        (!session.session_id.is_empty()).then_some((updated, session.session_id))
    });
    newest_since(candidates, not_before)
}
