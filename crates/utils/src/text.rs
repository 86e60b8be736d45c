/// Single-line preview of a message: whitespace collapsed, cut to `max_chars` characters
/// with a trailing ellipsis when shortened.
pub fn summarize(content: &str, max_chars: usize) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
