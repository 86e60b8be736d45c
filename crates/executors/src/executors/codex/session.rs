//! Codex rollout files: `<root>/sessions/YYYY/MM/DD/rollout-<timestamp>-<uuid>.jsonl`.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::LazyLock,
    time::SystemTime,
};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;
use workspace_utils::{path::same_workspace, text::summarize};

use crate::storage::{SessionHeader, file_name_str, modified_time, newest_since, parse_rfc3339};

const HEADER_SCAN_LINES: usize = 50;
const TITLE_CHARS: usize = 80;

static ROLLOUT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\.jsonl$",
    )
    .expect("valid regex")
});

/// The `session_meta` header of a rollout.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RolloutMeta {
    pub id: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

pub fn sessions_dir(root: &Path) -> PathBuf {
    root.join("sessions")
}

/// Every rollout under the date-partitioned sessions tree.
pub fn rollout_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(sessions_dir(root))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let name = file_name_str(path);
            name.starts_with("rollout-") && name.ends_with(".jsonl")
        })
        .collect();
    files.sort();
    files
}

/// Pattern: rollout-{timestamp}-{uuid}.jsonl
pub fn extract_session_id_from_rollout_path(path: &Path) -> Option<String> {
    ROLLOUT_ID
        .captures(file_name_str(path))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Reads `session_meta` from a rollout's first record. Legacy rollouts carry the same fields
/// at the top level.
pub fn parse_meta_line(line: &str) -> Option<RolloutMeta> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let meta = match value.get("type").and_then(Value::as_str) {
        Some("session_meta") => value.get("payload")?.clone(),
        _ if value.get("id").is_some() => value,
        _ => return None,
    };
    serde_json::from_value(meta).ok()
}

pub fn read_meta(path: &Path) -> io::Result<RolloutMeta> {
    let mut first = String::new();
    BufReader::new(File::open(path)?).read_line(&mut first)?;
    parse_meta_line(&first).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("rollout {} has no session_meta header", path.display()),
        )
    })
}

/// First prompt the user typed, skipping injected context blocks. Legacy rollouts write the
/// message without the `response_item` envelope.
fn user_prompt(value: &Value) -> Option<String> {
    let item = match value.get("type")?.as_str()? {
        "response_item" => value.get("payload")?,
        _ => value,
    };
    if item.get("type")?.as_str()? != "message" || item.get("role")?.as_str()? != "user" {
        return None;
    }
    item.get("content")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty() && !is_injected_context(text))
        .map(str::to_string)
}

pub(crate) fn is_injected_context(text: &str) -> bool {
    let text = text.trim_start();
    text.starts_with("<environment_context>") || text.starts_with("<user_instructions>")
}

pub fn read_header(path: &Path) -> io::Result<SessionHeader> {
    let meta = read_meta(path)?;
    let reader = BufReader::new(File::open(path)?);
    let first_user_message = reader
        .lines()
        .take(HEADER_SCAN_LINES)
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str::<Value>(&line).ok())
        .find_map(|value| user_prompt(&value));

    Ok(SessionHeader {
        native_id: meta.id,
        workspace: meta.cwd,
        title: first_user_message
            .as_deref()
            .map(|m| summarize(m, TITLE_CHARS)),
        first_user_message,
        created_at: meta.timestamp.as_deref().and_then(parse_rfc3339),
        updated_at: modified_time(path).map(Into::into),
    })
}

/// Rollout whose file name ends in `native_id`.
pub fn find_session_file(root: &Path, native_id: &str) -> Option<PathBuf> {
    let suffix = format!("{native_id}.jsonl");
    rollout_files(root)
        .into_iter()
        .find(|path| file_name_str(path).ends_with(&suffix))
}

pub fn find_recent_session(
    root: &Path,
    workspace: &Path,
    not_before: SystemTime,
) -> Option<String> {
    let candidates = rollout_files(root).into_iter().filter_map(|path| {
        let modified = modified_time(&path)?;
        if modified < not_before {
            return None;
        }
        let meta = read_meta(&path).ok()?;
        let cwd = meta.cwd?;
        same_workspace(&cwd, workspace).then_some((modified, meta.id))
    });
    newest_since(candidates, not_before)
}
