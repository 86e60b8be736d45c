//! OpenCode's record store under `<root>/storage/`: one JSON file per project, session,
//! message and part.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use workspace_utils::{path::same_workspace, text::summarize};

use crate::storage::{SessionHeader, file_name_str, from_millis, list_dir};

const TITLE_CHARS: usize = 80;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ProjectRecord {
    pub id: String,
    #[serde(default)]
    pub worktree: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TimeInfo {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub updated: Option<i64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    #[serde(rename = "projectID", default)]
    pub project_id: String,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub time: TimeInfo,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub time: TimeInfo,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ToolStateRecord {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PartRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub synthetic: Option<bool>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(rename = "callID", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub state: Option<ToolStateRecord>,
    #[serde(default)]
    pub files: Vec<String>,
}

pub fn storage_dir(root: &Path) -> PathBuf {
    root.join("storage")
}

fn json_files(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    list_dir(dir, |p| {
        let name = file_name_str(p);
        p.is_file() && name.starts_with(prefix) && name.ends_with(".json")
    })
}

pub fn read_record<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let raw = fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn projects(root: &Path) -> io::Result<HashMap<String, ProjectRecord>> {
    let files = json_files(&storage_dir(root).join("project"), "")?;
    Ok(files
        .iter()
        .filter_map(|f| read_record::<ProjectRecord>(f).ok())
        .map(|p| (p.id.clone(), p))
        .collect())
}

/// Every `ses_*.json` across all project folders.
pub fn session_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for dir in list_dir(&storage_dir(root).join("session"), |p| p.is_dir())? {
        files.extend(json_files(&dir, "ses_")?);
    }
    Ok(files)
}

/// Sessions that parse; unreadable files are skipped.
pub fn sessions(root: &Path) -> io::Result<Vec<(PathBuf, SessionRecord)>> {
    Ok(session_files(root)?
        .into_iter()
        .filter_map(|f| read_record::<SessionRecord>(&f).ok().map(|s| (f, s)))
        .collect())
}

/// The session's own directory, else its project's worktree.
pub fn session_workspace(
    session: &SessionRecord,
    projects: &HashMap<String, ProjectRecord>,
) -> Option<PathBuf> {
    session
        .directory
        .clone()
        .filter(|d| !d.as_os_str().is_empty())
        .or_else(|| projects.get(&session.project_id)?.worktree.clone())
}

pub fn find_session_file(root: &Path, native_id: &str) -> Option<PathBuf> {
    let file_name = format!("{native_id}.json");
    list_dir(&storage_dir(root).join("session"), |p| p.is_dir())
        .ok()?
        .into_iter()
        .map(|dir| dir.join(&file_name))
        .find(|p| p.is_file())
}

/// Messages of a session in creation order.
pub fn messages(root: &Path, session_id: &str) -> io::Result<Vec<MessageRecord>> {
    let files = json_files(&storage_dir(root).join("message").join(session_id), "msg_")?;
    let mut messages: Vec<MessageRecord> = files
        .iter()
        .filter_map(|f| read_record(f).ok())
        .collect();
    messages.sort_by(|a, b| {
        let key = |m: &MessageRecord| (m.time.created.unwrap_or_default(), m.id.clone());
        key(a).cmp(&key(b))
    });
    Ok(messages)
}

/// Parts of a message; OpenCode ids sort chronologically.
pub fn parts(root: &Path, message_id: &str) -> io::Result<Vec<PartRecord>> {
    let files = json_files(&storage_dir(root).join("part").join(message_id), "prt_")?;
    let mut parts: Vec<PartRecord> = files
        .iter()
        .filter_map(|f| read_record(f).ok())
        .collect();
    parts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(parts)
}

fn first_user_text(root: &Path, session_id: &str) -> Option<String> {
    messages(root, session_id)
        .ok()?
        .iter()
        .filter(|m| m.role == "user")
        .find_map(|m| {
            parts(root, &m.id).ok()?.into_iter().find_map(|p| {
                (p.kind == "text" && !p.synthetic.unwrap_or(false))
                    .then_some(p.text)
                    .flatten()
                    .filter(|t| !t.trim().is_empty())
            })
        })
}

pub fn read_header(root: &Path, path: &Path) -> io::Result<SessionHeader> {
    let session: SessionRecord = read_record(path)?;
    let first_user_message = first_user_text(root, &session.id);
    let title = session
        .title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| first_user_message.as_deref().map(|m| summarize(m, TITLE_CHARS)));

    Ok(SessionHeader {
        native_id: session.id,
        workspace: session.directory,
        title,
        first_user_message,
        created_at: session.time.created.and_then(from_millis),
        updated_at: session.time.updated.and_then(from_millis),
    })
}

fn millis_to_system_time(millis: i64) -> Option<SystemTime> {
    u64::try_from(millis)
        .ok()
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
}

pub fn find_recent_session(
    root: &Path,
    workspace: &Path,
    not_before: SystemTime,
) -> Option<String> {
    let candidates = sessions(root).ok()?.into_iter().filter_map(|(_, session)| {
        let directory = session.directory.as_deref()?;
        if !same_workspace(directory, workspace) {
            return None;
        }
        let updated = session.time.updated.or(session.time.created)?;
        Some((millis_to_system_time(updated)?, session.id))
    });
    crate::storage::newest_since(candidates, not_before)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::fs;

    use serde_json::{Value, json};

    use super::*;

    pub fn write(root: &Path, rel: &str, value: Value) {
        let path = storage_dir(root).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, value.to_string()).unwrap();
    }

    /// One project, one session with a user prompt and an assistant reply.
    pub fn basic_session(root: &Path, workspace: &str, updated_ms: i64) {
        write(root, "project/prj1.json", json!({"id": "prj1", "worktree": workspace}));
        write(
            root,
            "session/prj1/ses_abc.json",
            json!({"id": "ses_abc", "projectID": "prj1", "directory": workspace,
                   "title": "", "time": {"created": updated_ms - 1000, "updated": updated_ms}}),
        );
        write(
            root,
            "message/ses_abc/msg_001.json",
            json!({"id": "msg_001", "sessionID": "ses_abc", "role": "user", "time": {"created": 1}}),
        );
        write(
            root,
            "part/msg_001/prt_001.json",
            json!({"id": "prt_001", "type": "text", "text": "refactor the parser"}),
        );
        write(
            root,
            "message/ses_abc/msg_002.json",
            json!({"id": "msg_002", "sessionID": "ses_abc", "role": "assistant", "time": {"created": 2}}),
        );
        write(
            root,
            "part/msg_002/prt_002.json",
            json!({"id": "prt_002", "type": "text", "text": "Done."}),
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{fixtures::basic_session, *};

    #[test]
    fn header_falls_back_to_first_prompt() {
        let root = tempfile::tempdir().unwrap();
        basic_session(root.path(), "/work/oc", 1_750_000_000_000);

        let path = find_session_file(root.path(), "ses_abc").unwrap();
        let header = read_header(root.path(), &path).unwrap();
        assert_eq!(header.native_id, "ses_abc");
        assert_eq!(header.workspace, Some(PathBuf::from("/work/oc")));
        assert_eq!(header.title.as_deref(), Some("refactor the parser"));
        assert!(header.updated_at.is_some());

        let msgs = messages(root.path(), "ses_abc").unwrap();
        assert_eq!(msgs.iter().map(|m| m.role.as_str()).collect::<Vec<_>>(), ["user", "assistant"]);
    }

    #[test]
    fn workspace_falls_back_to_project_worktree() {
        let session = SessionRecord {
            id: "ses_x".into(),
            project_id: "prj".into(),
            directory: None,
            title: None,
            time: TimeInfo::default(),
        };
        let projects = HashMap::from([(
            "prj".to_string(),
            ProjectRecord {
                id: "prj".into(),
                worktree: Some(PathBuf::from("/work/tree")),
            },
        )]);
        assert_eq!(
            session_workspace(&session, &projects),
            Some(PathBuf::from("/work/tree"))
        );
    }

    #[test]
    fn recent_session_by_directory_and_updated_time() {
        let root = tempfile::tempdir().unwrap();
        basic_session(root.path(), "/work/oc", Utc::now().timestamp_millis());
        let since = SystemTime::now() - Duration::from_secs(30);

        assert_eq!(
            find_recent_session(root.path(), Path::new("/work/oc"), since),
            Some("ses_abc".to_string())
        );
        assert_eq!(find_recent_session(root.path(), Path::new("/work/x"), since), None);
    }
}
