use std::collections::HashMap;

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workspace_utils::{diff::create_unified_diff, path::make_path_relative};

use crate::logs::{
    ActionType, CommandExitStatus, CommandRunResult, FileChange, LineNormalizer, NormalizedEntry,
    NormalizedEntryType, TodoItem, ToolResult, ToolStatus,
    utils::{ConversationPatch, EntryIndexProvider},
};

/// One line of a Claude session transcript.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeRecord {
    User {
        message: ClaudeMessage,
        #[serde(default, rename = "isMeta")]
        is_meta: bool,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Assistant {
        message: ClaudeMessage,
        #[serde(default)]
        timestamp: Option<String>,
    },
    System {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, rename = "isMeta")]
        is_meta: bool,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Summary {
        summary: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ClaudeMessage {
    #[serde(default)]
    pub role: String,
    pub content: ClaudeMessageContent,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ClaudeMessageContent {
    Text(String),
    Array(Vec<ClaudeContentItem>),
}

impl ClaudeMessageContent {
    fn items(&self) -> impl Iterator<Item = &ClaudeContentItem> {
        match self {
            ClaudeMessageContent::Array(items) => items.iter(),
            ClaudeMessageContent::Text(_) => [].iter(),
        }
    }

    /// Text the user typed, ignoring tool results and command wrappers.
    pub fn user_text(&self) -> Option<&str> {
        let text = match self {
            ClaudeMessageContent::Text(text) => Some(text.as_str()),
            ClaudeMessageContent::Array(items) => items.iter().find_map(|item| match item {
                ClaudeContentItem::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }?;
        let trimmed = text.trim();
        (!trimmed.is_empty() && !trimmed.starts_with('<')).then_some(trimmed)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeContentItem {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        #[serde(flatten)]
        tool_data: ClaudeToolData,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "name", content = "input")]
pub enum ClaudeToolData {
    TodoWrite {
        todos: Vec<ClaudeTodoItem>,
    },
    Task {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },
    Glob {
        pattern: String,
        #[serde(default)]
        path: Option<String>,
    },
    #[serde(rename = "LS")]
    Ls {
        path: String,
    },
    Read {
        file_path: String,
    },
    Bash {
        command: String,
        #[serde(default)]
        description: Option<String>,
    },
    Grep {
        pattern: String,
        #[serde(default)]
        path: Option<String>,
    },
    ExitPlanMode {
        plan: String,
    },
    Edit {
        file_path: String,
        #[serde(default)]
        old_string: Option<String>,
        #[serde(default)]
        new_string: Option<String>,
    },
    MultiEdit {
        file_path: String,
        edits: Vec<ClaudeEditItem>,
    },
    Write {
        file_path: String,
        content: String,
    },
    NotebookEdit {
        notebook_path: String,
        #[serde(default)]
        new_source: Option<String>,
    },
    WebFetch {
        url: String,
    },
    WebSearch {
        query: String,
    },
    #[serde(untagged)]
    Unknown {
        #[serde(flatten)]
        data: HashMap<String, Value>,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ClaudeTodoItem {
    pub content: String,
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ClaudeEditItem {
    #[serde(default)]
    pub old_string: Option<String>,
    #[serde(default)]
    pub new_string: Option<String>,
}

impl ClaudeToolData {
    pub fn get_name(&self) -> &str {
        match self {
            ClaudeToolData::TodoWrite { .. } => "TodoWrite",
            ClaudeToolData::Task { .. } => "Task",
            ClaudeToolData::Glob { .. } => "Glob",
            ClaudeToolData::Ls { .. } => "LS",
            ClaudeToolData::Read { .. } => "Read",
            ClaudeToolData::Bash { .. } => "Bash",
            ClaudeToolData::Grep { .. } => "Grep",
            ClaudeToolData::ExitPlanMode { .. } => "ExitPlanMode",
            ClaudeToolData::Edit { .. } => "Edit",
            ClaudeToolData::MultiEdit { .. } => "MultiEdit",
            ClaudeToolData::Write { .. } => "Write",
            ClaudeToolData::NotebookEdit { .. } => "NotebookEdit",
            ClaudeToolData::WebFetch { .. } => "WebFetch",
            ClaudeToolData::WebSearch { .. } => "WebSearch",
            ClaudeToolData::Unknown { data } => data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    fn input(&self) -> Value {
        match self {
            ClaudeToolData::Unknown { data } => data.get("input").cloned().unwrap_or(Value::Null),
            other => serde_json::to_value(other)
                .ok()
                .and_then(|mut v| v.get_mut("input").map(Value::take))
                .unwrap_or(Value::Null),
        }
    }

    /// `mcp__server__tool` is shown as `mcp:server:tool`.
    fn display_name(&self) -> String {
        let name = self.get_name();
        let parts: Vec<&str> = name.split("__").collect();
        if name.starts_with("mcp__") && parts.len() >= 3 {
            format!("mcp:{}:{}", parts[1], parts[2])
        } else {
            name.to_string()
        }
    }
}

fn extract_action_type(tool_data: &ClaudeToolData, worktree: &str) -> ActionType {
    match tool_data {
        ClaudeToolData::Read { file_path } => ActionType::FileRead {
            path: make_path_relative(file_path, worktree),
        },
        ClaudeToolData::Edit {
            file_path,
            old_string,
            new_string,
        } => {
            let changes = if old_string.is_some() || new_string.is_some() {
                vec![FileChange::Edit {
                    unified_diff: create_unified_diff(
                        file_path,
                        old_string.as_deref().unwrap_or_default(),
                        new_string.as_deref().unwrap_or_default(),
                    ),
                    has_line_numbers: false,
                }]
            } else {
                vec![]
            };
            ActionType::FileEdit {
                path: make_path_relative(file_path, worktree),
                changes,
            }
        }
        ClaudeToolData::MultiEdit { file_path, edits } => ActionType::FileEdit {
            path: make_path_relative(file_path, worktree),
            changes: edits
                .iter()
                .filter(|edit| edit.old_string.is_some() || edit.new_string.is_some())
                .map(|edit| FileChange::Edit {
                    unified_diff: create_unified_diff(
                        file_path,
                        edit.old_string.as_deref().unwrap_or_default(),
                        edit.new_string.as_deref().unwrap_or_default(),
                    ),
                    has_line_numbers: false,
                })
                .collect(),
        },
        ClaudeToolData::Write { file_path, content } => ActionType::FileEdit {
            path: make_path_relative(file_path, worktree),
            changes: vec![FileChange::Write {
                content: content.clone(),
            }],
        },
        ClaudeToolData::Bash { command, .. } => ActionType::CommandRun {
            command: command.clone(),
            result: None,
        },
        ClaudeToolData::Grep { pattern, .. } | ClaudeToolData::Glob { pattern, .. } => {
            ActionType::Search {
                query: pattern.clone(),
            }
        }
        ClaudeToolData::WebFetch { url } => ActionType::WebFetch { url: url.clone() },
        ClaudeToolData::WebSearch { query } => ActionType::WebFetch { url: query.clone() },
        ClaudeToolData::Task {
            description,
            prompt,
        } => ActionType::TaskCreate {
            description: description
                .clone()
                .or_else(|| prompt.clone())
                .unwrap_or_default(),
        },
        ClaudeToolData::TodoWrite { todos } => ActionType::TodoManagement {
            todos: todos
                .iter()
                .map(|t| TodoItem {
                    content: t.content.clone(),
                    status: t.status.clone(),
                    priority: t.priority.clone(),
                })
                .collect(),
            operation: "write".to_string(),
        },
        ClaudeToolData::Ls { .. } => ActionType::Other {
            description: "List directory".to_string(),
        },
        ClaudeToolData::ExitPlanMode { plan } => ActionType::Other {
            description: plan.clone(),
        },
        ClaudeToolData::NotebookEdit { .. } => ActionType::Tool {
            tool_name: "NotebookEdit".to_string(),
            arguments: Some(tool_data.input()),
            result: None,
        },
        ClaudeToolData::Unknown { .. } => {
            if tool_data.get_name().starts_with("mcp__") {
                ActionType::Tool {
                    tool_name: tool_data.display_name(),
                    arguments: Some(tool_data.input()),
                    result: None,
                }
            } else {
                ActionType::Other {
                    description: format!("Tool: {}", tool_data.get_name()),
                }
            }
        }
    }
}

fn concise_content(tool_data: &ClaudeToolData, action_type: &ActionType, worktree: &str) -> String {
    match action_type {
        ActionType::FileRead { path } | ActionType::FileEdit { path, .. } => path.clone(),
        ActionType::CommandRun { command, .. } => command.clone(),
        ActionType::Search { query } => match tool_data {
            ClaudeToolData::Glob {
                path: Some(path), ..
            } => format!("Find files: `{query}` in {}", make_path_relative(path, worktree)),
            ClaudeToolData::Glob { .. } => format!("Find files: `{query}`"),
            _ => query.clone(),
        },
        ActionType::WebFetch { url } => url.clone(),
        ActionType::TaskCreate { description } if description.is_empty() => "Task".to_string(),
        ActionType::TaskCreate { description } => format!("Task: `{description}`"),
        ActionType::TodoManagement { .. } => "TODO list updated".to_string(),
        ActionType::Tool { tool_name, .. } => match tool_data {
            ClaudeToolData::NotebookEdit { notebook_path, .. } => {
                format!("`{}`", make_path_relative(notebook_path, worktree))
            }
            _ => tool_name.clone(),
        },
        ActionType::Other { description } => match tool_data {
            ClaudeToolData::Ls { path } => {
                let relative = make_path_relative(path, worktree);
                if relative.is_empty() {
                    description.clone()
                } else {
                    format!("List directory: {relative}")
                }
            }
            _ => description.clone(),
        },
    }
}

/// Text of a tool result block, which is either a string or a list of text blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Structured when the text parses as JSON, markdown otherwise.
fn tool_result_value(content: &Value) -> ToolResult {
    match content {
        Value::String(_) | Value::Array(_) => {
            let text = tool_result_text(content);
            match serde_json::from_str::<Value>(&text) {
                Ok(parsed) if parsed.is_object() || parsed.is_array() => ToolResult::json(parsed),
                _ => ToolResult::markdown(text),
            }
        }
        other => ToolResult::json(other.clone()),
    }
}

#[derive(Debug, Clone)]
struct ClaudeToolCall {
    index: usize,
    tool_data: ClaudeToolData,
    entry: NormalizedEntry,
}

/// Normalizes Claude transcript lines, merging each `tool_result` into its `tool_use` entry.
pub struct ClaudeLogNormalizer {
    entry_index: EntryIndexProvider,
    worktree: String,
    tool_map: HashMap<String, ClaudeToolCall>,
}

impl ClaudeLogNormalizer {
    pub fn new(worktree: impl Into<String>, entry_index: EntryIndexProvider) -> Self {
        Self {
            entry_index,
            worktree: worktree.into(),
            tool_map: HashMap::new(),
        }
    }

    fn add(&self, entry: NormalizedEntry) -> Patch {
        ConversationPatch::add_normalized_entry(self.entry_index.next(), entry)
    }

    fn normalize_record(&mut self, record: ClaudeRecord) -> Vec<Patch> {
        match record {
            ClaudeRecord::User {
                message,
                is_meta,
                timestamp,
            } => {
                if is_meta {
                    return vec![];
                }
                self.normalize_user(&message, timestamp)
            }
            ClaudeRecord::Assistant { message, timestamp } => {
                self.normalize_assistant(&message, timestamp)
            }
            ClaudeRecord::System {
                content: Some(content),
                is_meta: false,
                timestamp,
            } if !content.trim().is_empty() => vec![self.add(
                NormalizedEntry::new(NormalizedEntryType::SystemMessage, content)
                    .with_timestamp(timestamp),
            )],
            ClaudeRecord::System { .. } | ClaudeRecord::Summary { .. } | ClaudeRecord::Unknown => {
                vec![]
            }
        }
    }

    fn normalize_user(&mut self, message: &ClaudeMessage, timestamp: Option<String>) -> Vec<Patch> {
        let mut patches = Vec::new();
        if let ClaudeMessageContent::Text(text) = &message.content {
            if let Some(stdout) = text
                .strip_prefix("<local-command-stdout>")
                .and_then(|t| t.strip_suffix("</local-command-stdout>"))
            {
                patches.push(self.add(
                    NormalizedEntry::new(NormalizedEntryType::SystemMessage, stdout)
                        .with_timestamp(timestamp),
                ));
            } else if !text.trim().is_empty() {
                patches.push(self.add(
                    NormalizedEntry::new(NormalizedEntryType::UserMessage, text.clone())
                        .with_timestamp(timestamp),
                ));
            }
            return patches;
        }

        for item in message.content.items() {
            match item {
                ClaudeContentItem::Text { text } if !text.trim().is_empty() => {
                    patches.push(self.add(
                        NormalizedEntry::new(NormalizedEntryType::UserMessage, text.clone())
                            .with_timestamp(timestamp.clone()),
                    ));
                }
                ClaudeContentItem::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    if let Some(patch) = self.complete_tool_call(tool_use_id, content, *is_error) {
                        patches.push(patch);
                    }
                }
                _ => {}
            }
        }
        patches
    }

    fn normalize_assistant(
        &mut self,
        message: &ClaudeMessage,
        timestamp: Option<String>,
    ) -> Vec<Patch> {
        if let ClaudeMessageContent::Text(text) = &message.content {
            return vec![self.add(
                NormalizedEntry::new(NormalizedEntryType::AssistantMessage, text.clone())
                    .with_timestamp(timestamp),
            )];
        }

        let mut patches = Vec::new();
        for item in message.content.items() {
            match item {
                ClaudeContentItem::Text { text } => patches.push(self.add(
                    NormalizedEntry::new(NormalizedEntryType::AssistantMessage, text.clone())
                        .with_timestamp(timestamp.clone()),
                )),
                ClaudeContentItem::Thinking { thinking } => patches.push(self.add(
                    NormalizedEntry::new(NormalizedEntryType::Thinking, thinking.clone())
                        .with_timestamp(timestamp.clone()),
                )),
                ClaudeContentItem::ToolUse { id, tool_data } => {
                    let action_type = extract_action_type(tool_data, &self.worktree);
                    let content = concise_content(tool_data, &action_type, &self.worktree);
                    let entry = NormalizedEntry {
                        timestamp: timestamp.clone(),
                        entry_type: NormalizedEntryType::ToolUse {
                            tool_name: tool_data.display_name(),
                            action_type,
                            status: ToolStatus::Created,
                        },
                        content,
                        metadata: Some(serde_json::json!({ "tool_call_id": id })),
                    };
                    let index = self.entry_index.next();
                    patches.push(ConversationPatch::add_normalized_entry(index, entry.clone()));
                    self.tool_map.insert(
                        id.clone(),
                        ClaudeToolCall {
                            index,
                            tool_data: tool_data.clone(),
                            entry,
                        },
                    );
                }
                ClaudeContentItem::ToolResult { .. } | ClaudeContentItem::Unsupported => {}
            }
        }
        patches
    }

    fn complete_tool_call(
        &mut self,
        tool_use_id: &str,
        content: &Value,
        is_error: Option<bool>,
    ) -> Option<Patch> {
        let Some(call) = self.tool_map.remove(tool_use_id) else {
            tracing::debug!(tool_use_id, "tool_result without a matching tool_use");
            return None;
        };
        let status = if is_error.unwrap_or(false) {
            ToolStatus::Failed
        } else {
            ToolStatus::Success
        };

        let NormalizedEntryType::ToolUse {
            tool_name,
            action_type,
            ..
        } = call.entry.entry_type.clone()
        else {
            return None;
        };

        let action_type = match action_type {
            ActionType::CommandRun { command, .. } => ActionType::CommandRun {
                command,
                result: Some(CommandRunResult {
                    exit_status: is_error.map(|failed| CommandExitStatus::Success {
                        success: !failed,
                    }),
                    output: Some(tool_result_text(content)),
                }),
            },
            ActionType::Tool {
                tool_name,
                arguments,
                ..
            } => ActionType::Tool {
                tool_name,
                arguments,
                result: Some(tool_result_value(content)),
            },
            ActionType::Other { .. } if matches!(call.tool_data, ClaudeToolData::Unknown { .. }) => {
                ActionType::Tool {
                    tool_name: call.tool_data.display_name(),
                    arguments: Some(call.tool_data.input()),
                    result: Some(tool_result_value(content)),
                }
            }
            other => other,
        };

        let entry = NormalizedEntry {
            entry_type: NormalizedEntryType::ToolUse {
                tool_name,
                action_type,
                status,
            },
            ..call.entry
        };
        Some(ConversationPatch::replace(call.index, entry))
    }
}

impl LineNormalizer for ClaudeLogNormalizer {
    fn normalize_line(&mut self, line: &str) -> Vec<Patch> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        match serde_json::from_str::<ClaudeRecord>(trimmed) {
            Ok(record) => self.normalize_record(record),
            Err(err) => {
                tracing::debug!("Skipping unparseable Claude record: {err}");
                vec![]
            }
        }
    }
}
