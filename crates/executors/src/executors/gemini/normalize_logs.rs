use std::collections::HashMap;

use json_patch::Patch;
use serde_json::Value;
use workspace_utils::{diff::create_unified_diff, path::make_path_relative};

use super::session::{GeminiMessage, GeminiSession, GeminiToolCall, content_text};
use crate::logs::{
    ActionType, CommandRunResult, FileChange, NormalizedEntry, NormalizedEntryType, ToolResult,
    ToolStatus,
    utils::{ConversationPatch, EntryIndexProvider},
};

fn arg<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(*k).and_then(Value::as_str))
}

fn tool_status(status: &str) -> ToolStatus {
    match status {
        "success" => ToolStatus::Success,
        "error" | "cancelled" => ToolStatus::Failed,
        _ => ToolStatus::Created,
    }
}

/// Display text of a tool result: `resultDisplay` when it is a string, else the
/// `functionResponse` output.
fn result_text(call: &GeminiToolCall) -> Option<String> {
    if let Some(Value::String(display)) = &call.result_display {
        return Some(display.clone());
    }
    call.result
        .as_array()?
        .iter()
        .filter_map(|part| {
            let response = part.get("functionResponse")?.get("response")?;
            response
                .get("output")
                .or_else(|| response.get("error"))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
        })
        .reduce(|a, b| format!("{a}\n{b}"))
}

fn tool_action(call: &GeminiToolCall, worktree: &str) -> (ActionType, String) {
    let args = &call.args;
    let path = || {
        arg(args, &["absolute_path", "file_path", "path"])
            .map(|p| make_path_relative(p, worktree))
            .unwrap_or_default()
    };
    match call.name.as_str() {
        "read_file" | "read_many_files" => {
            let path = path();
            (ActionType::FileRead { path: path.clone() }, path)
        }
        "write_file" => {
            let path = path();
            let content = arg(args, &["content"]).unwrap_or_default().to_string();
            (
                ActionType::FileEdit {
                    path: path.clone(),
                    changes: vec![FileChange::Write { content }],
                },
                path,
            )
        }
        "replace" => {
            let path = path();
            let diff = create_unified_diff(
                &path,
                arg(args, &["old_string"]).unwrap_or_default(),
                arg(args, &["new_string"]).unwrap_or_default(),
            );
            (
                ActionType::FileEdit {
                    path: path.clone(),
                    changes: vec![FileChange::Edit {
                        unified_diff: diff,
                        has_line_numbers: false,
                    }],
                },
                path,
            )
        }
        "run_shell_command" => {
            let command = arg(args, &["command"]).unwrap_or_default().to_string();
            let result = result_text(call).map(|output| CommandRunResult {
                exit_status: None,
                output: Some(output),
            });
            (
                ActionType::CommandRun {
                    command: command.clone(),
                    result,
                },
                command,
            )
        }
        "search_file_content" | "glob" => {
            let query = arg(args, &["pattern"]).unwrap_or_default().to_string();
            (ActionType::Search { query: query.clone() }, query)
        }
        "web_fetch" | "google_web_search" => {
            let url = arg(args, &["url", "prompt", "query"])
                .unwrap_or_default()
                .to_string();
            (ActionType::WebFetch { url: url.clone() }, url)
        }
        "list_directory" => (
            ActionType::Other {
                description: "List directory".to_string(),
            },
            format!("List directory: {}", path()),
        ),
        name => (
            ActionType::Tool {
                tool_name: name.to_string(),
                arguments: Some(args.clone()),
                result: result_text(call).map(ToolResult::markdown),
            },
            name.to_string(),
        ),
    }
}

/// Normalizes a whole Gemini chat document. Fed the same document again after Gemini
/// rewrites it, it adds unseen messages and tool calls and replaces changed ones in place.
pub struct GeminiSessionNormalizer {
    entry_index: EntryIndexProvider,
    worktree: String,
    seen: HashMap<String, (usize, NormalizedEntry)>,
}

impl GeminiSessionNormalizer {
    pub fn new(worktree: impl Into<String>, entry_index: EntryIndexProvider) -> Self {
        Self {
            entry_index,
            worktree: worktree.into(),
            seen: HashMap::new(),
        }
    }

    fn upsert(&mut self, key: String, entry: NormalizedEntry) -> Option<Patch> {
        match self.seen.get_mut(&key) {
            Some((index, previous)) if *previous != entry => {
                *previous = entry.clone();
                Some(ConversationPatch::replace(*index, entry))
            }
            Some(_) => None,
            None => {
                let index = self.entry_index.next();
                self.seen.insert(key, (index, entry.clone()));
                Some(ConversationPatch::add_normalized_entry(index, entry))
            }
        }
    }

    fn message_entries(
        &self,
        position: usize,
        message: &GeminiMessage,
    ) -> Vec<(String, NormalizedEntry)> {
        let key = if message.id.is_empty() {
            format!("#{position}")
        } else {
            message.id.clone()
        };
        let ts = message.timestamp.clone();
        let mut out = Vec::new();

        for (i, thought) in message.thoughts.iter().enumerate() {
            let text = match (thought.subject.is_empty(), thought.description.is_empty()) {
                (false, false) => format!("**{}**\n{}", thought.subject, thought.description),
                (false, true) => thought.subject.clone(),
                _ => thought.description.clone(),
            };
            if !text.trim().is_empty() {
                out.push((
                    format!("{key}:thought:{i}"),
                    NormalizedEntry::new(NormalizedEntryType::Thinking, text)
                        .with_timestamp(ts.clone()),
                ));
            }
        }

        let kind = match message.kind.as_str() {
            "user" => Some(NormalizedEntryType::UserMessage),
            "gemini" => Some(NormalizedEntryType::AssistantMessage),
            "info" => Some(NormalizedEntryType::SystemMessage),
            "error" => Some(NormalizedEntryType::ErrorMessage),
            _ => None,
        };
        let text = content_text(&message.content);
        if let Some(kind) = kind
            && !text.trim().is_empty()
        {
            out.push((
                format!("{key}:content"),
                NormalizedEntry::new(kind, text).with_timestamp(ts.clone()),
            ));
        }

        for (i, call) in message.tool_calls.iter().enumerate() {
            let (action_type, content) = tool_action(call, &self.worktree);
            let call_key = if call.id.is_empty() {
                format!("{key}:tool:{i}")
            } else {
                format!("tool:{}", call.id)
            };
            out.push((
                call_key,
                NormalizedEntry {
                    timestamp: ts.clone(),
                    entry_type: NormalizedEntryType::ToolUse {
                        tool_name: call.name.clone(),
                        action_type,
                        status: tool_status(&call.status),
                    },
                    content,
                    metadata: None,
                },
            ));
        }
        out
    }

    pub fn normalize_document(&mut self, session: &GeminiSession) -> Vec<Patch> {
        let entries: Vec<(String, NormalizedEntry)> = session
            .messages
            .iter()
            .enumerate()
            .flat_map(|(position, message)| self.message_entries(position, message))
            .collect();
        entries
            .into_iter()
            .filter_map(|(key, entry)| self.upsert(key, entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> GeminiSession {
        serde_json::from_value(value).unwrap()
    }

    fn ops(patches: &[Patch]) -> Vec<(String, String)> {
        patches
            .iter()
            .map(|p| {
                let v = serde_json::to_value(p).unwrap();
                (
                    v[0]["op"].as_str().unwrap().to_string(),
                    v[0]["path"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn rereading_only_emits_changes() {
        let mut n = GeminiSessionNormalizer::new("/work/gem", EntryIndexProvider::new());
        let first = doc(json!({
            "sessionId": "s",
            "messages": [
                {"id": "m1", "type": "user", "content": "list files"},
                {"id": "m2", "type": "gemini", "content": "",
                 "thoughts": [{"subject": "Listing", "description": "use ls"}],
                 "toolCalls": [{"id": "c1", "name": "run_shell_command",
                                "args": {"command": "ls"}, "status": "executing"}]}
            ]
        }));
        assert_eq!(
            ops(&n.normalize_document(&first)),
            [
                ("add".to_string(), "/entries/0".to_string()),
                ("add".to_string(), "/entries/1".to_string()),
                ("add".to_string(), "/entries/2".to_string()),
            ]
        );
        assert!(n.normalize_document(&first).is_empty());

        let second = doc(json!({
            "sessionId": "s",
            "messages": [
                {"id": "m1", "type": "user", "content": "list files"},
                {"id": "m2", "type": "gemini", "content": "",
                 "thoughts": [{"subject": "Listing", "description": "use ls"}],
                 "toolCalls": [{"id": "c1", "name": "run_shell_command",
                                "args": {"command": "ls"}, "status": "success",
                                "resultDisplay": "a.txt"}]},
                {"id": "m3", "type": "gemini", "content": "There is one file."}
            ]
        }));
        let patches = n.normalize_document(&second);
        assert_eq!(
            ops(&patches),
            [
                ("replace".to_string(), "/entries/2".to_string()),
                ("add".to_string(), "/entries/3".to_string()),
            ]
        );

        let value = serde_json::to_value(&patches[0]).unwrap();
        let content = &value[0]["value"]["content"];
        assert_eq!(content["entry_type"]["status"]["status"], "success");
        assert_eq!(
            content["entry_type"]["action_type"]["result"]["output"],
            "a.txt"
        );
    }

    #[test]
    fn tool_names_map_to_actions() {
        let call = |name: &str, args: Value| GeminiToolCall {
            id: "x".into(),
            name: name.into(),
            args,
            ..Default::default()
        };
        let (read, content) = tool_action(
            &call("read_file", json!({"absolute_path": "/work/gem/src/a.rs"})),
            "/work/gem",
        );
        assert_eq!(read, ActionType::FileRead { path: "src/a.rs".into() });
        assert_eq!(content, "src/a.rs");

        let (other, _) = tool_action(&call("save_memory", json!({"fact": "x"})), "/work/gem");
        assert!(matches!(other, ActionType::Tool { tool_name, .. } if tool_name == "save_memory"));
    }
}
