use serde::{Deserialize, Serialize};
use similar::TextDiff;
use ts_rs::TS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "camelCase")]
pub enum DiffChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

/// Payload of a `DIFF` conversation patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub change: DiffChangeKind,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified_diff: Option<String>,
    pub content_omitted: bool,
    pub additions: Option<usize>,
    pub deletions: Option<usize>,
}

impl Diff {
    /// A diff that only names the file; the agent did not record the contents.
    pub fn omitted(path: impl Into<String>, change: DiffChangeKind) -> Self {
        let path = path.into();
        Self {
            change,
            old_path: (change != DiffChangeKind::Added).then(|| path.clone()),
            new_path: (change != DiffChangeKind::Deleted).then_some(path),
            old_content: None,
            new_content: None,
            unified_diff: None,
            content_omitted: true,
            additions: None,
            deletions: None,
        }
    }

    /// Split a (possibly multi-file) unified diff into one `Diff` per file.
    pub fn from_unified(unified: &str) -> Vec<Diff> {
        let mut blocks: Vec<Vec<&str>> = Vec::new();
        for line in unified.lines() {
            if line.starts_with("diff --git ") || blocks.is_empty() {
                blocks.push(Vec::new());
            }
            if let Some(block) = blocks.last_mut() {
                block.push(line);
            }
        }

        blocks
            .into_iter()
            .filter(|block| block.iter().any(|l| l.starts_with("@@") || l.starts_with("---")))
            .map(|block| parse_file_block(&block))
            .collect()
    }
}

fn parse_file_block(lines: &[&str]) -> Diff {
    let mut change = DiffChangeKind::Modified;
    let mut old_path = None;
    let mut new_path = None;

    for line in lines {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let mut parts = rest.split_whitespace();
            old_path = parts.next().map(strip_side_prefix);
            new_path = parts.next().map(strip_side_prefix);
        } else if line.starts_with("new file mode") {
            change = DiffChangeKind::Added;
        } else if line.starts_with("deleted file mode") {
            change = DiffChangeKind::Deleted;
        } else if line.starts_with("rename from") {
            change = DiffChangeKind::Renamed;
        } else if let Some(path) = line.strip_prefix("--- ") {
            old_path = (path != "/dev/null").then(|| strip_side_prefix(path));
        } else if let Some(path) = line.strip_prefix("+++ ") {
            new_path = (path != "/dev/null").then(|| strip_side_prefix(path));
        }
    }

    let text = lines.join("\n");
    let (additions, deletions) = count_changes(&text);
    Diff {
        change,
        old_path,
        new_path,
        old_content: None,
        new_content: None,
        unified_diff: Some(text),
        content_omitted: false,
        additions: Some(additions),
        deletions: Some(deletions),
    }
}

fn strip_side_prefix(path: &str) -> String {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

/// Unified diff between two in-memory versions of `path`.
pub fn create_unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Number of added and removed lines in a unified diff, ignoring file headers.
pub fn count_changes(unified: &str) -> (usize, usize) {
    unified
        .lines()
        .filter(|l| !l.starts_with("+++") && !l.starts_with("---"))
        .fold((0, 0), |(add, del), line| match line.as_bytes().first() {
            Some(b'+') => (add + 1, del),
            Some(b'-') => (add, del + 1),
            _ => (add, del),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_diff_counts_lines() {
        let diff = create_unified_diff("src/lib.rs", "a\nb\nc\n", "a\nB\nc\nd\n");
        assert!(diff.starts_with("--- a/src/lib.rs"));
        assert_eq!(count_changes(&diff), (2, 1));
    }

    #[test]
    fn multi_file_unified_diff_is_split_per_file() {
        let unified = "diff --git a/one.txt b/one.txt\n\
                       --- a/one.txt\n\
                       +++ b/one.txt\n\
                       @@ -1 +1 @@\n\
                       -old\n\
                       +new\n\
                       diff --git a/two.txt b/two.txt\n\
                       new file mode 100644\n\
                       --- /dev/null\n\
                       +++ b/two.txt\n\
                       @@ -0,0 +1 @@\n\
                       +hello\n";

        let diffs = Diff::from_unified(unified);
        assert_eq!(diffs.len(), 2);
        assert_eq!(diffs[0].change, DiffChangeKind::Modified);
        assert_eq!(diffs[0].new_path.as_deref(), Some("one.txt"));
        assert_eq!((diffs[0].additions, diffs[0].deletions), (Some(1), Some(1)));
        assert_eq!(diffs[1].change, DiffChangeKind::Added);
        assert_eq!(diffs[1].old_path, None);
        assert_eq!(diffs[1].new_path.as_deref(), Some("two.txt"));
    }

    #[test]
    fn omitted_diff_serializes_camel_case() {
        let value = serde_json::to_value(Diff::omitted("a.rs", DiffChangeKind::Modified)).unwrap();
        assert_eq!(value["contentOmitted"], true);
        assert_eq!(value["newPath"], "a.rs");
        assert!(value.get("unifiedDiff").is_none());
    }
}
