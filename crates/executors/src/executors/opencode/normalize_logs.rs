use std::collections::{HashMap, HashSet};

use json_patch::Patch;
use serde_json::Value;
use workspace_utils::{
    diff::{Diff, DiffChangeKind, create_unified_diff},
    path::make_path_relative,
};

use super::session::{MessageRecord, PartRecord, ToolStateRecord};
use crate::logs::{
    ActionType, CommandExitStatus, CommandRunResult, FileChange, NormalizedEntry,
    NormalizedEntryType, TodoItem, ToolResult, ToolStatus,
    utils::{ConversationPatch, EntryIndexProvider},
};

fn input_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| input.get(*k).and_then(Value::as_str))
}

fn tool_status(state: Option<&ToolStateRecord>) -> ToolStatus {
    match state.map(|s| s.status.as_str()) {
        Some("completed") => ToolStatus::Success,
        Some("error") => ToolStatus::Failed,
        _ => ToolStatus::Created,
    }
}

fn build_action_type(tool: &str, state: Option<&ToolStateRecord>, worktree: &str) -> ActionType {
    let null = Value::Null;
    let input = state.map(|s| &s.input).unwrap_or(&null);
    let output = state.and_then(|s| s.output.clone().or_else(|| s.error.clone()));
    let path = || {
        input_str(input, &["filePath", "file_path", "path"])
            .map(|p| make_path_relative(p, worktree))
            .unwrap_or_default()
    };

    match tool {
        "read" => ActionType::FileRead { path: path() },
        "write" => {
            let content = input_str(input, &["content"]).unwrap_or_default();
            ActionType::FileEdit {
                path: path(),
                changes: (!content.is_empty())
                    .then(|| FileChange::Write {
                        content: content.to_string(),
                    })
                    .into_iter()
                    .collect(),
            }
        }
        "edit" => {
            let path = path();
            let diff = create_unified_diff(
                &path,
                input_str(input, &["oldString"]).unwrap_or_default(),
                input_str(input, &["newString"]).unwrap_or_default(),
            );
            ActionType::FileEdit {
                path,
                changes: vec![FileChange::Edit {
                    unified_diff: diff,
                    has_line_numbers: false,
                }],
            }
        }
        "bash" => {
            let exit_code = state
                .and_then(|s| s.metadata.get("exit"))
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok());
            ActionType::CommandRun {
                command: input_str(input, &["command"]).unwrap_or_default().to_string(),
                result: (output.is_some() || exit_code.is_some()).then(|| CommandRunResult {
                    exit_status: exit_code.map(|code| CommandExitStatus::ExitCode { code }),
                    output,
                }),
            }
        }
        "grep" | "glob" => ActionType::Search {
            query: input_str(input, &["pattern", "query"])
                .unwrap_or_default()
                .to_string(),
        },
        "webfetch" => ActionType::WebFetch {
            url: input_str(input, &["url"]).unwrap_or_default().to_string(),
        },
        "list" => ActionType::Other {
            description: format!("List directory: {}", path()),
        },
        "todowrite" | "todoread" => ActionType::TodoManagement {
            todos: input
                .get("todos")
                .and_then(|t| serde_json::from_value::<Vec<TodoItem>>(t.clone()).ok())
                .unwrap_or_default(),
            operation: if tool == "todowrite" { "write" } else { "read" }.to_string(),
        },
        "task" => ActionType::TaskCreate {
            description: input_str(input, &["description", "prompt"])
                .unwrap_or_default()
                .to_string(),
        },
        other => ActionType::Tool {
            tool_name: other.to_string(),
            arguments: input.is_object().then(|| input.clone()),
            result: output.map(ToolResult::markdown),
        },
    }
}

fn build_content(tool: &str, state: Option<&ToolStateRecord>, action_type: &ActionType) -> String {
    let content = match action_type {
        ActionType::CommandRun { command, .. } => command.as_str(),
        ActionType::FileRead { path } | ActionType::FileEdit { path, .. } => path.as_str(),
        ActionType::Search { query } => query.as_str(),
        ActionType::WebFetch { url } => url.as_str(),
        ActionType::TaskCreate { description } => description.as_str(),
        ActionType::Other { description } => description.as_str(),
        ActionType::TodoManagement { .. } => "TODO list updated",
        ActionType::Tool { .. } => "",
    }
    .trim();

    if content.is_empty() {
        state
            .and_then(|s| s.title.as_deref())
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(tool)
            .to_string()
    } else {
        content.to_string()
    }
}

/// Turns OpenCode messages and their parts into conversation patches.
///
/// OpenCode mutates part files in place while a turn runs, so the same message is fed
/// repeatedly. Parts are tracked by id; a part whose entry changed is replaced at its
/// original index and an unchanged part emits nothing.
pub struct OpencodeNormalizer {
    entry_index: EntryIndexProvider,
    worktree: String,
    parts: HashMap<String, (usize, NormalizedEntry)>,
    patched: HashSet<String>,
}

impl OpencodeNormalizer {
    pub fn new(worktree: impl Into<String>, entry_index: EntryIndexProvider) -> Self {
        Self {
            entry_index,
            worktree: worktree.into(),
            parts: HashMap::new(),
            patched: HashSet::new(),
        }
    }

    fn part_entry(&self, message: &MessageRecord, part: &PartRecord) -> Option<NormalizedEntry> {
        let text = || part.text.as_deref().filter(|t| !t.trim().is_empty());
        match part.kind.as_str() {
            "text" if !part.synthetic.unwrap_or(false) => {
                let kind = match message.role.as_str() {
                    "user" => NormalizedEntryType::UserMessage,
                    _ => NormalizedEntryType::AssistantMessage,
                };
                Some(NormalizedEntry::new(kind, text()?))
            }
            "reasoning" => Some(NormalizedEntry::new(NormalizedEntryType::Thinking, text()?)),
            "tool" => {
                let tool = part.tool.as_deref().unwrap_or("tool");
                let state = part.state.as_ref();
                let action_type = build_action_type(tool, state, &self.worktree);
                let content = build_content(tool, state, &action_type);
                Some(NormalizedEntry::new(
                    NormalizedEntryType::ToolUse {
                        tool_name: tool.to_string(),
                        action_type,
                        status: tool_status(state),
                    },
                    content,
                ))
            }
            _ => None,
        }
    }

    fn patch_diffs(&mut self, part: &PartRecord) -> Vec<Patch> {
        if !self.patched.insert(part.id.clone()) {
            return Vec::new();
        }
        part.files
            .iter()
            .map(|file| {
                let path = make_path_relative(file, &self.worktree);
                ConversationPatch::add_diff(
                    self.entry_index.next(),
                    Diff::omitted(path, DiffChangeKind::Modified),
                )
            })
            .collect()
    }

    fn upsert(&mut self, part_id: &str, entry: NormalizedEntry) -> Option<Patch> {
        match self.parts.get_mut(part_id) {
            Some((index, previous)) if *previous != entry => {
                *previous = entry.clone();
                Some(ConversationPatch::replace(*index, entry))
            }
            Some(_) => None,
            None => {
                let index = self.entry_index.next();
                self.parts.insert(part_id.to_string(), (index, entry.clone()));
                Some(ConversationPatch::add_normalized_entry(index, entry))
            }
        }
    }

    pub fn normalize_message(
        &mut self,
        message: &MessageRecord,
        parts: &[PartRecord],
    ) -> Vec<Patch> {
        let mut patches = Vec::new();
        for part in parts {
            if part.kind == "patch" {
                patches.extend(self.patch_diffs(part));
                continue;
            }
            if let Some(entry) = self.part_entry(message, part)
                && let Some(patch) = self.upsert(&part.id, entry)
            {
                patches.push(patch);
            }
        }
        patches
    }
}
