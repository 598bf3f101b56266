//! Compact output rendering helpers for notifications and CLI surfaces.

/// Platform message size limit.
pub const MESSAGE_LIMIT: usize = 2000;

/// Collapse newlines/extra whitespace and bound length for one-line display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Split `header` + `lines` into messages no longer than `max_chars`.
///
/// The header is repeated on continuation messages; a single oversized
/// line is truncated rather than split.
pub fn chunk_message(header: &str, lines: &[String], max_chars: usize) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current = header.to_string();
    let line_budget = max_chars.saturating_sub(header.chars().count() + 1).max(1);

    for line in lines {
        let line = if line.chars().count() > line_budget {
            compact_line(line, line_budget.saturating_sub(3))
        } else {
            line.clone()
        };
        let has_lines = current.len() > header.len();
        if has_lines && current.chars().count() + 1 + line.chars().count() > max_chars {
            messages.push(std::mem::replace(&mut current, header.to_string()));
        }
        current.push('\n');
        current.push_str(&line);
    }
    if current.len() > header.len() || messages.is_empty() {
        messages.push(current);
    }
    messages
}
