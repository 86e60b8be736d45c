use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executors::BaseCodingAgent;

/// Where each agent keeps its session logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageRoots {
    /// Claude config dir (`~/.claude`); sessions live in `projects/`.
    pub claude: PathBuf,
    /// Codex home (`~/.codex`); rollouts live in `sessions/YYYY/MM/DD/`.
    pub codex: PathBuf,
    /// Gemini dir (`~/.gemini`); chats live in `tmp/<project hash>/chats/`.
    pub gemini: PathBuf,
    /// OpenCode data dir (`~/.local/share/opencode`); records live in `storage/`.
    pub opencode: PathBuf,
}

impl Default for StorageRoots {
    fn default() -> Self {
        Self::from_env()
    }
}

impl StorageRoots {
    /// Defaults under the home directory, honoring each agent's own override variable.
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let env_dir = |key: &str| {
            std::env::var_os(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };

        let data_home =
            env_dir("XDG_DATA_HOME").unwrap_or_else(|| home.join(".local").join("share"));

        Self {
            claude: env_dir("CLAUDE_CONFIG_DIR").unwrap_or_else(|| home.join(".claude")),
            codex: env_dir("CODEX_HOME").unwrap_or_else(|| home.join(".codex")),
            gemini: env_dir("GEMINI_DIR").unwrap_or_else(|| home.join(".gemini")),
            opencode: data_home.join("opencode"),
        }
    }

    /// All four roots under one directory, laid out the way the agents do in `$HOME`.
    pub fn under(base: &Path) -> Self {
        Self {
            claude: base.join(".claude"),
            codex: base.join(".codex"),
            gemini: base.join(".gemini"),
            opencode: base.join(".local").join("share").join("opencode"),
        }
    }

    pub fn root_for(&self, agent: BaseCodingAgent) -> &Path {
        match agent {
            BaseCodingAgent::ClaudeCode => &self.claude,
            BaseCodingAgent::Codex => &self.codex,
            BaseCodingAgent::Gemini => &self.gemini,
            BaseCodingAgent::Opencode => &self.opencode,
        }
    }
}

/// What a listing needs from one session file, read without normalizing the transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionHeader {
    pub native_id: String,
    /// Working directory the agent recorded for the session.
    pub workspace: Option<PathBuf>,
    pub title: Option<String>,
    pub first_user_message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Entries of `dir` accepted by `keep`; a missing directory is empty.
pub fn list_dir<F>(dir: &Path, keep: F) -> io::Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> bool,
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| keep(path))
        .collect();
    paths.sort();
    Ok(paths)
}

pub fn file_name_str(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// Newest candidate whose timestamp is at or after `not_before`.
pub fn newest_since<T>(
    candidates: impl IntoIterator<Item = (SystemTime, T)>,
    not_before: SystemTime,
) -> Option<T> {
    candidates
        .into_iter()
        .filter(|(time, _)| *time >= not_before)
        .max_by_key(|(time, _)| *time)
        .map(|(_, item)| item)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
