use std::collections::HashMap;

use json_patch::Patch;
use serde::Deserialize;
use serde_json::Value;
use workspace_utils::{diff::Diff, path::make_path_relative};

use super::session::is_injected_context;
use crate::logs::{
    ActionType, CommandExitStatus, CommandRunResult, FileChange, LineNormalizer, NormalizedEntry,
    NormalizedEntryType, ToolResult, ToolStatus,
    utils::{ConversationPatch, EntryIndexProvider},
};

/// Envelope shared by every rollout record.
#[derive(Deserialize, Debug)]
struct RolloutLine {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Record types legacy rollouts write bare, without the `response_item` envelope.
const BARE_RESPONSE_ITEMS: &[&str] = &[
    "message",
    "reasoning",
    "function_call",
    "function_call_output",
    "custom_tool_call",
    "custom_tool_call_output",
    "web_search_call",
];

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseItem {
    Message {
        role: String,
        #[serde(default)]
        content: Vec<ContentItem>,
    },
    Reasoning {
        #[serde(default)]
        summary: Vec<ReasoningSummary>,
    },
    FunctionCall {
        name: String,
        #[serde(default)]
        arguments: String,
        call_id: String,
    },
    FunctionCallOutput {
        call_id: String,
        #[serde(default)]
        output: Value,
    },
    CustomToolCall {
        name: String,
        #[serde(default)]
        input: String,
        call_id: String,
    },
    CustomToolCallOutput {
        call_id: String,
        #[serde(default)]
        output: Value,
    },
    WebSearchCall {
        #[serde(default)]
        action: Option<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    InputText { text: String },
    OutputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct ReasoningSummary {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventMsg {
    TurnDiff {
        unified_diff: String,
    },
    Error {
        message: String,
    },
    TurnAborted {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Exec output as Codex records it: a JSON string wrapping output and exit metadata, or
/// plain text.
#[derive(Deserialize, Debug, Default)]
struct ExecOutput {
    #[serde(default)]
    output: String,
    #[serde(default)]
    metadata: Option<ExecMetadata>,
}

#[derive(Deserialize, Debug, Default)]
struct ExecMetadata {
    #[serde(default)]
    exit_code: Option<i32>,
}

fn parse_exec_output(output: &Value) -> ExecOutput {
    let text = match output {
        Value::String(s) => s.clone(),
        Value::Null => return ExecOutput::default(),
        other => other.to_string(),
    };
    serde_json::from_str::<ExecOutput>(&text)
        .ok()
        .filter(|parsed| parsed.metadata.is_some())
        .unwrap_or(ExecOutput {
            output: text,
            metadata: None,
        })
}

#[derive(Debug, Clone)]
enum CallKind {
    Command { command: String },
    Patch { path: String, patch: String },
    Tool { name: String, arguments: Value },
}

#[derive(Debug, Clone)]
struct CallState {
    index: usize,
    kind: CallKind,
    timestamp: Option<String>,
    status: ToolStatus,
    exit_code: Option<i32>,
    output: Option<String>,
}

impl CallState {
    fn to_normalized_entry(&self) -> NormalizedEntry {
        let (tool_name, action_type, content) = match &self.kind {
            CallKind::Command { command } => (
                "bash".to_string(),
                ActionType::CommandRun {
                    command: command.clone(),
                    result: self.output.as_ref().map(|output| CommandRunResult {
                        exit_status: self
                            .exit_code
                            .map(|code| CommandExitStatus::ExitCode { code }),
                        output: Some(output.clone()),
                    }),
                },
                command.clone(),
            ),
            CallKind::Patch { path, patch } => (
                "apply_patch".to_string(),
                ActionType::FileEdit {
                    path: path.clone(),
                    changes: vec![FileChange::Edit {
                        unified_diff: patch.clone(),
                        has_line_numbers: false,
                    }],
                },
                path.clone(),
            ),
            CallKind::Tool { name, arguments } => (
                name.clone(),
                ActionType::Tool {
                    tool_name: name.clone(),
                    arguments: Some(arguments.clone()),
                    result: self.output.clone().map(ToolResult::markdown),
                },
                name.clone(),
            ),
        };
        NormalizedEntry {
            timestamp: self.timestamp.clone(),
            entry_type: NormalizedEntryType::ToolUse {
                tool_name,
                action_type,
                status: self.status.clone(),
            },
            content,
            metadata: None,
        }
    }
}

/// `["bash", "-lc", "cmd"]` is shown as `cmd`; other argv forms are space-joined.
fn command_from_arguments(arguments: &Value) -> Option<String> {
    if let Some(cmd) = arguments.get("cmd").and_then(Value::as_str) {
        return Some(cmd.to_string());
    }
    let argv: Vec<&str> = arguments
        .get("command")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    match argv.as_slice() {
        [shell, flag, script] if shell.ends_with("sh") && flag.starts_with('-') => {
            Some(script.to_string())
        }
        _ => Some(argv.join(" ")),
    }
}

/// First file named in an `apply_patch` body.
fn patch_target(patch: &str) -> Option<&str> {
    patch.lines().find_map(|line| {
        ["*** Update File: ", "*** Add File: ", "*** Delete File: "]
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
            .map(str::trim)
    })
}

/// Normalizes Codex rollout records into conversation patches.
pub struct CodexLogNormalizer {
    entry_index: EntryIndexProvider,
    worktree: String,
    calls: HashMap<String, CallState>,
}

impl CodexLogNormalizer {
    pub fn new(worktree: impl Into<String>, entry_index: EntryIndexProvider) -> Self {
        Self {
            entry_index,
            worktree: worktree.into(),
            calls: HashMap::new(),
        }
    }

    fn add(&self, entry: NormalizedEntry) -> Patch {
        ConversationPatch::add_normalized_entry(self.entry_index.next(), entry)
    }

    fn message(&self, kind: NormalizedEntryType, text: &str, ts: &Option<String>) -> Patch {
        self.add(NormalizedEntry::new(kind, text).with_timestamp(ts.clone()))
    }

    fn start_call(&mut self, call_id: String, kind: CallKind, timestamp: Option<String>) -> Patch {
        let state = CallState {
            index: self.entry_index.next(),
            kind,
            timestamp,
            status: ToolStatus::Created,
            exit_code: None,
            output: None,
        };
        let patch =
            ConversationPatch::add_normalized_entry(state.index, state.to_normalized_entry());
        self.calls.insert(call_id, state);
        patch
    }

    fn finish_call(&mut self, call_id: &str, output: &Value) -> Option<Patch> {
        let Some(mut state) = self.calls.remove(call_id) else {
            tracing::debug!(call_id, "Output for unknown Codex call");
            return None;
        };
        let parsed = parse_exec_output(output);
        state.exit_code = parsed.metadata.and_then(|m| m.exit_code);
        state.status = match state.exit_code {
            Some(code) if code != 0 => ToolStatus::Failed,
            _ => ToolStatus::Success,
        };
        state.output = Some(parsed.output);
        Some(ConversationPatch::replace(state.index, state.to_normalized_entry()))
    }

    fn call_kind(&self, name: &str, raw_arguments: &str) -> CallKind {
        let arguments: Value = serde_json::from_str(raw_arguments)
            .unwrap_or_else(|_| Value::String(raw_arguments.into()));
        match name {
            "shell" | "exec_command" | "local_shell" => match command_from_arguments(&arguments) {
                Some(command) => CallKind::Command { command },
                None => CallKind::Tool {
                    name: name.to_string(),
                    arguments,
                },
            },
            "apply_patch" => {
                let patch = arguments
                    .get("input")
                    .and_then(Value::as_str)
                    .unwrap_or(raw_arguments)
                    .to_string();
                let path = patch_target(&patch)
                    .map(|p| make_path_relative(p, &self.worktree))
                    .unwrap_or_default();
                CallKind::Patch { path, patch }
            }
            _ => CallKind::Tool {
                name: name.to_string(),
                arguments,
            },
        }
    }

    fn normalize_response_item(&mut self, item: ResponseItem, ts: Option<String>) -> Vec<Patch> {
        match item {
            ResponseItem::Message { role, content } => {
                let kind = match role.as_str() {
                    "user" => NormalizedEntryType::UserMessage,
                    "assistant" => NormalizedEntryType::AssistantMessage,
                    _ => return vec![],
                };
                content
                    .iter()
                    .filter_map(|c| match c {
                        ContentItem::InputText { text } | ContentItem::OutputText { text } => {
                            Some(text.as_str())
                        }
                        ContentItem::Other => None,
                    })
                    .filter(|text| !text.trim().is_empty() && !is_injected_context(text))
                    .map(|text| self.message(kind.clone(), text, &ts))
                    .collect()
            }
            ResponseItem::Reasoning { summary } => summary
                .iter()
                .filter(|s| !s.text.trim().is_empty())
                .map(|s| self.message(NormalizedEntryType::Thinking, &s.text, &ts))
                .collect(),
            ResponseItem::FunctionCall {
                name,
                arguments,
                call_id,
            } => {
                let kind = self.call_kind(&name, &arguments);
                vec![self.start_call(call_id, kind, ts)]
            }
            ResponseItem::CustomToolCall {
                name,
                input,
                call_id,
            } => {
                let kind = if name == "apply_patch" {
                    let path = patch_target(&input)
                        .map(|p| make_path_relative(p, &self.worktree))
                        .unwrap_or_default();
                    CallKind::Patch { path, patch: input }
                } else {
                    self.call_kind(&name, &input)
                };
                vec![self.start_call(call_id, kind, ts)]
            }
            ResponseItem::FunctionCallOutput { call_id, output }
            | ResponseItem::CustomToolCallOutput { call_id, output } => {
                self.finish_call(&call_id, &output).into_iter().collect()
            }
            ResponseItem::WebSearchCall { action } => {
                let query = action
                    .as_ref()
                    .and_then(|a| a.get("query"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let entry = NormalizedEntry {
                    timestamp: ts,
                    entry_type: NormalizedEntryType::ToolUse {
                        tool_name: "web_search".to_string(),
                        action_type: ActionType::WebFetch { url: query.clone() },
                        status: ToolStatus::Success,
                    },
                    content: query,
                    metadata: None,
                };
                vec![self.add(entry)]
            }
            ResponseItem::Other => vec![],
        }
    }

    fn normalize_event(&mut self, event: EventMsg, ts: Option<String>) -> Vec<Patch> {
        match event {
            EventMsg::TurnDiff { unified_diff } => Diff::from_unified(&unified_diff)
                .into_iter()
                .map(|diff| ConversationPatch::add_diff(self.entry_index.next(), diff))
                .collect(),
            EventMsg::Error { message } => {
                vec![self.message(NormalizedEntryType::ErrorMessage, &message, &ts)]
            }
            EventMsg::TurnAborted { reason } => {
                let content = match reason {
                    Some(reason) => format!("Turn aborted: {reason}"),
                    None => "Turn aborted".to_string(),
                };
                vec![self.message(NormalizedEntryType::SystemMessage, &content, &ts)]
            }
            EventMsg::Other => vec![],
        }
    }
}

impl LineNormalizer for CodexLogNormalizer {
    fn normalize_line(&mut self, line: &str) -> Vec<Patch> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return vec![];
        }
        let record = match serde_json::from_str::<RolloutLine>(trimmed) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!("Skipping unparseable Codex record: {err}");
                return vec![];
            }
        };
        match record.kind.as_str() {
            "response_item" => match serde_json::from_value::<ResponseItem>(record.payload) {
                Ok(item) => self.normalize_response_item(item, record.timestamp),
                Err(err) => {
                    tracing::debug!("Skipping malformed response_item: {err}");
                    vec![]
                }
            },
            kind if BARE_RESPONSE_ITEMS.contains(&kind) => {
                match serde_json::from_str::<ResponseItem>(trimmed) {
                    Ok(item) => self.normalize_response_item(item, record.timestamp),
                    Err(err) => {
                        tracing::debug!("Skipping malformed legacy {kind} record: {err}");
                        vec![]
                    }
                }
            }
            "event_msg" => match serde_json::from_value::<EventMsg>(record.payload) {
                Ok(event) => self.normalize_event(event, record.timestamp),
                Err(err) => {
                    tracing::debug!("Skipping malformed event_msg: {err}");
                    vec![]
                }
            },
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::logs::utils::patch::extract_normalized_entry_from_patch;

    fn normalizer() -> CodexLogNormalizer {
        CodexLogNormalizer::new("/work/svc", EntryIndexProvider::new())
    }

    fn item(payload: Value) -> String {
        json!({"timestamp": "2025-06-01T10:00:01.000Z", "type": "response_item", "payload": payload})
            .to_string()
    }

    fn entry(patches: &[Patch]) -> (usize, NormalizedEntry) {
        extract_normalized_entry_from_patch(&patches[0]).unwrap()
    }

    #[test]
    fn messages_and_reasoning() {
        let mut n = normalizer();
        assert!(
            n.normalize_line(&item(json!({"type":"message","role":"user","content":[
                {"type":"input_text","text":"<environment_context>x</environment_context>"}]})))
                .is_empty()
        );
        assert!(
            n.normalize_line(&item(json!({"type":"message","role":"developer","content":[
                {"type":"input_text","text":"rules"}]})))
                .is_empty()
        );

        let user = n.normalize_line(&item(json!({"type":"message","role":"user","content":[
            {"type":"input_text","text":"add retries"}]})));
        let (index, user) = entry(&user);
        assert_eq!(index, 0);
        assert_eq!(user.entry_type, NormalizedEntryType::UserMessage);
        assert_eq!(user.timestamp.as_deref(), Some("2025-06-01T10:00:01.000Z"));

        let thinking = n.normalize_line(&item(json!({"type":"reasoning","summary":[
            {"type":"summary_text","text":"**Planning**"}]})));
        assert_eq!(entry(&thinking).1.entry_type, NormalizedEntryType::Thinking);

        let reply = n.normalize_line(&item(json!({"type":"message","role":"assistant","content":[
            {"type":"output_text","text":"Done."}]})));
        assert_eq!(entry(&reply).0, 2);
    }

    #[test]
    fn shell_call_output_replaces_entry() {
        let mut n = normalizer();
        let added = n.normalize_line(&item(json!({
            "type":"function_call","name":"shell","call_id":"call_1",
            "arguments":"{\"command\":[\"bash\",\"-lc\",\"cargo test\"],\"workdir\":\"/work/svc\"}"
        })));
        let (index, created) = entry(&added);
        assert_eq!(created.content, "cargo test");

        let done = n.normalize_line(&item(json!({
            "type":"function_call_output","call_id":"call_1",
            "output":"{\"output\":\"test result: FAILED\",\"metadata\":{\"exit_code\":101,\"duration_seconds\":1.2}}"
        })));
        let value = serde_json::to_value(&done[0]).unwrap();
        assert_eq!(value[0]["op"], "replace");
        let (replaced_index, finished) = entry(&done);
        assert_eq!(replaced_index, index);
        match finished.entry_type {
            NormalizedEntryType::ToolUse {
                action_type: ActionType::CommandRun { result, .. },
                status,
                ..
            } => {
                assert_eq!(status, ToolStatus::Failed);
                let result = result.unwrap();
                assert_eq!(result.output.as_deref(), Some("test result: FAILED"));
                assert_eq!(
                    result.exit_status,
                    Some(CommandExitStatus::ExitCode { code: 101 })
                );
            }
            other => panic!("unexpected entry type: {other:?}"),
        }
    }

    #[test]
    fn apply_patch_becomes_file_edit() {
        let mut n = normalizer();
        let patch = "*** Begin Patch\n*** Update File: /work/svc/src/lib.rs\n@@\n-a\n+b\n*** End Patch";
        let added = n.normalize_line(&item(json!({
            "type":"custom_tool_call","name":"apply_patch","call_id":"p1","input": patch
        })));
        match entry(&added).1.entry_type {
            NormalizedEntryType::ToolUse {
                action_type: ActionType::FileEdit { path, changes },
                ..
            } => {
                assert_eq!(path, "src/lib.rs");
                assert_eq!(changes.len(), 1);
            }
            other => panic!("unexpected entry type: {other:?}"),
        }
    }

    #[test]
    fn events_emit_diffs_and_errors() {
        let mut n = normalizer();
        let diff = json!({"type":"event_msg","payload":{"type":"turn_diff","unified_diff":
            "diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-x\n+y\n"}})
        .to_string();
        let patches = n.normalize_line(&diff);
        assert_eq!(patches.len(), 1);
        let value = serde_json::to_value(&patches[0]).unwrap();
        assert_eq!(value[0]["value"]["type"], "DIFF");
        assert_eq!(value[0]["path"], "/entries/0");

        let err = json!({"type":"event_msg","payload":{"type":"error","message":"rate limited"}})
            .to_string();
        assert_eq!(entry(&n.normalize_line(&err)).1.entry_type, NormalizedEntryType::ErrorMessage);

        let dup = json!({"type":"event_msg","payload":{"type":"agent_message","message":"hi"}})
            .to_string();
        assert!(n.normalize_line(&dup).is_empty());
        assert!(n.normalize_line(r#"{"type":"session_meta","payload":{"id":"x"}}"#).is_empty());
    }

    #[test]
    fn legacy_bare_items_are_normalized() {
        let mut n = normalizer();
        assert!(n.normalize_line(r#"{"id":"abc","cwd":"/work/old"}"#).is_empty());
        assert!(n.normalize_line(r#"{"record_type":"state"}"#).is_empty());

        let user = n.normalize_line(
            r#"{"type":"message","role":"user","content":[{"type":"input_text","text":"rename it"}]}"#,
        );
        let (index, user) = entry(&user);
        assert_eq!(index, 0);
        assert_eq!(user.entry_type, NormalizedEntryType::UserMessage);
        assert_eq!(user.content, "rename it");

        let call = n.normalize_line(
            r#"{"type":"function_call","name":"shell","call_id":"c1","arguments":"{\"command\":[\"ls\"]}"}"#,
        );
        assert_eq!(entry(&call).0, 1);
        let done = n.normalize_line(r#"{"type":"function_call_output","call_id":"c1","output":"a.rs"}"#);
        assert_eq!(entry(&done).0, 1);

        let reply = n.normalize_line(
            r#"{"type":"message","role":"assistant","content":[{"type":"output_text","text":"Renamed."}]}"#,
        );
        assert_eq!(entry(&reply).0, 2);
    }
}
