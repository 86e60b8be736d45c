use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::{from_value, json, to_value};
use ts_rs::TS;
use workspace_utils::diff::Diff;

use crate::logs::NormalizedEntry;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
enum PatchOperation {
    Add,
    Replace,
    Remove,
}

/// Payload of a conversation patch, tagged on the wire as `{type, content}`.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type", content = "content")]
pub enum PatchType {
    NormalizedEntry(NormalizedEntry),
    Stdout(String),
    Stderr(String),
    Diff(Diff),
}

#[derive(Serialize)]
struct PatchEntry {
    op: PatchOperation,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<PatchType>,
}

/// RFC 6901 escaping for one JSON pointer segment.
pub fn escape_json_pointer_segment(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

pub fn entry_path(segment: &str) -> String {
    format!("/entries/{}", escape_json_pointer_segment(segment))
}

fn single(op: PatchOperation, entry_index: usize, value: Option<PatchType>) -> Patch {
    let patch_entry = PatchEntry {
        op,
        path: entry_path(&entry_index.to_string()),
        value,
    };
    // every PatchEntry serializes to a valid operation; the default is never reached
    from_value(json!([patch_entry])).unwrap_or_default()
}

/// Helper functions to create JSON patches for conversation entries
pub struct ConversationPatch;

impl ConversationPatch {
    /// Create an ADD patch for a new conversation entry at the given index
    pub fn add_normalized_entry(entry_index: usize, entry: NormalizedEntry) -> Patch {
        single(
            PatchOperation::Add,
            entry_index,
            Some(PatchType::NormalizedEntry(entry)),
        )
    }

    /// Create an ADD patch for a chunk of raw stdout at the given index
    pub fn add_stdout(entry_index: usize, entry: String) -> Patch {
        single(PatchOperation::Add, entry_index, Some(PatchType::Stdout(entry)))
    }

    /// Create an ADD patch for a chunk of raw stderr at the given index
    pub fn add_stderr(entry_index: usize, entry: String) -> Patch {
        single(PatchOperation::Add, entry_index, Some(PatchType::Stderr(entry)))
    }

    pub fn add_diff(entry_index: usize, diff: Diff) -> Patch {
        single(PatchOperation::Add, entry_index, Some(PatchType::Diff(diff)))
    }

    pub fn replace_diff(entry_index: usize, diff: Diff) -> Patch {
        single(PatchOperation::Replace, entry_index, Some(PatchType::Diff(diff)))
    }

    /// Create a REPLACE patch for updating an existing conversation entry at the given index
    pub fn replace(entry_index: usize, entry: NormalizedEntry) -> Patch {
        single(
            PatchOperation::Replace,
            entry_index,
            Some(PatchType::NormalizedEntry(entry)),
        )
    }

    pub fn remove(entry_index: usize) -> Patch {
        single(PatchOperation::Remove, entry_index, None)
    }
}

/// Extract the entry index and `NormalizedEntry` from a JsonPatch if it contains one
pub fn extract_normalized_entry_from_patch(patch: &Patch) -> Option<(usize, NormalizedEntry)> {
    let value = to_value(patch).ok()?;
    let ops = value.as_array()?;
    ops.iter().rev().find_map(|op| {
        let path = op.get("path")?.as_str()?;
        let entry_index = path.strip_prefix("/entries/")?.parse::<usize>().ok()?;

        let value = op.get("value")?;
        (value.get("type")?.as_str()? == "NORMALIZED_ENTRY")
            .then(|| value.get("content"))
            .flatten()
            .and_then(|c| from_value::<NormalizedEntry>(c.clone()).ok())
            .map(|entry| (entry_index, entry))
    })
}
