//! On-disk layout of Claude Code sessions: `<root>/projects/<encoded cwd>/<uuid>.jsonl`.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::Deserialize;
use workspace_utils::text::summarize;

use super::normalize_logs::ClaudeMessage;
use crate::storage::{
    SessionHeader, file_name_str, list_dir, modified_time, newest_since, parse_rfc3339,
};

/// Only this many leading records are read when building a listing.
pub const HEADER_SCAN_LINES: usize = 50;

const TITLE_CHARS: usize = 80;

#[derive(Deserialize, Debug, Default)]
struct HeaderRecord {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "isMeta", default)]
    is_meta: bool,
    #[serde(default)]
    message: Option<ClaudeMessage>,
    #[serde(default)]
    summary: Option<String>,
}

pub fn projects_dir(root: &Path) -> PathBuf {
    root.join("projects")
}

/// Claude names a project directory after its cwd with every non-alphanumeric char as `-`.
pub fn encode_project_dir(workspace: &Path) -> String {
    workspace
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Lossy inverse of [`encode_project_dir`], used when no record names a cwd.
pub fn decode_project_dir(name: &str) -> PathBuf {
    PathBuf::from(name.replace('-', "/"))
}

pub fn project_dirs(root: &Path) -> io::Result<Vec<PathBuf>> {
    list_dir(&projects_dir(root), |p| p.is_dir())
}

/// Main-thread transcripts; `agent-*.jsonl` sidechains are left out.
pub fn session_files(project_dir: &Path) -> io::Result<Vec<PathBuf>> {
    list_dir(project_dir, |p| {
        let name = file_name_str(p);
        p.is_file() && name.ends_with(".jsonl") && !name.starts_with("agent-")
    })
}

pub fn native_id(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

fn header_records(path: &Path) -> io::Result<Vec<HeaderRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines().take(HEADER_SCAN_LINES) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HeaderRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => tracing::debug!(path = %path.display(), "Skipping header line: {err}"),
        }
    }
    Ok(records)
}

/// Working directory recorded by any session in `project_dir`, else the decoded dir name.
pub fn project_path(project_dir: &Path) -> PathBuf {
    let recorded = session_files(project_dir)
        .unwrap_or_default()
        .iter()
        .find_map(|file| {
            header_records(file)
                .ok()?
                .into_iter()
                .find_map(|r| r.cwd.filter(|c| !c.is_empty()))
        });
    recorded
        .map(PathBuf::from)
        .unwrap_or_else(|| decode_project_dir(file_name_str(project_dir)))
}

/// Listing metadata from the first [`HEADER_SCAN_LINES`] records.
///
/// Fails with `InvalidData` when none of them parse.
pub fn read_header(path: &Path) -> io::Result<SessionHeader> {
    let records = header_records(path)?;
    if records.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no Claude records in {}", path.display()),
        ));
    }

    let first_user_message = records
        .iter()
        .filter(|r| r.kind == "user" && !r.is_meta)
        .find_map(|r| r.message.as_ref()?.content.user_text().map(str::to_string));
    let summary = records
        .iter()
        .rev()
        .find_map(|r| (r.kind == "summary").then(|| r.summary.clone()).flatten());

    Ok(SessionHeader {
        native_id: records
            .iter()
            .find_map(|r| r.session_id.clone())
            .or_else(|| native_id(path))
            .unwrap_or_default(),
        workspace: records
            .iter()
            .find_map(|r| r.cwd.clone())
            .map(PathBuf::from),
        title: summary.or_else(|| {
            first_user_message
                .as_deref()
                .map(|m| summarize(m, TITLE_CHARS))
        }),
        first_user_message,
        created_at: records
            .iter()
            .find_map(|r| r.timestamp.as_deref().and_then(parse_rfc3339)),
        updated_at: modified_time(path).map(Into::into),
    })
}

/// Transcript for `native_id`, looked up under the workspace's project dir first.
pub fn find_session_file(root: &Path, workspace: &Path, native_id: &str) -> Option<PathBuf> {
    let file_name = format!("{native_id}.jsonl");
    let direct = projects_dir(root)
        .join(encode_project_dir(workspace))
        .join(&file_name);
    if direct.is_file() {
        return Some(direct);
    }
    project_dirs(root)
        .ok()?
        .into_iter()
        .map(|dir| dir.join(&file_name))
        .find(|p| p.is_file())
}

pub fn find_recent_session(
    root: &Path,
    workspace: &Path,
    not_before: SystemTime,
) -> Option<String> {
    let dir = projects_dir(root).join(encode_project_dir(workspace));
    let candidates = session_files(&dir)
        .ok()?
        .into_iter()
        .filter_map(|file| Some((modified_time(&file)?, native_id(&file)?)));
    newest_since(candidates, not_before)
}
