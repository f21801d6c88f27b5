/// Keep the first `max_chars` characters and append a `[truncated N chars]` marker.
///
/// Used for captured command output, where the reader needs to know how much
/// was cut rather than just that something was.
#[inline]
pub fn truncate_with_marker(s: &str, max_chars: usize) -> String {
    let Some((cut, _)) = s.char_indices().nth(max_chars) else {
        return s.to_string();
    };
    let dropped = s[cut..].chars().count();
    format!("{}...[truncated {} chars]", &s[..cut], dropped)
}

/// Truncate to a maximum character count, adding "..." when shortened.
#[inline]
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", truncated)
}

/// Truncate at a word boundary so the result (including "...") fits in
/// `max_chars` characters.
pub fn truncate_at_boundary(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return ".".repeat(max_chars);
    }
    let cut = s
        .char_indices()
        .nth(max_chars - 3)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let head = &s[..cut];
    let boundary = head
        .rfind(|c: char| c.is_whitespace() || c == '.' || c == ',')
        .filter(|&b| b > 0)
        .unwrap_or(cut);
    format!("{}...", &s[..boundary])
}
