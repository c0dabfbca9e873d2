/// Characters kept in citation snippets and search previews.
pub const SNIPPET_CHARS: usize = 200;

/// First `max_chars` characters of `text`, always followed by `...`.
///
/// Used for citation snippets, which are marked as excerpts even when the
/// chunk is short.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Single-line preview: whitespace runs collapse to one space, and the
/// text is cut at `max_chars` characters with `...` only when it was
/// longer.
pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_counts_characters_not_bytes() {
        let text = "é".repeat(300);
        let s = snippet(&text, SNIPPET_CHARS);
        assert_eq!(s.chars().count(), SNIPPET_CHARS + 3);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn snippet_marks_short_text() {
        assert_eq!(snippet("short", SNIPPET_CHARS), "short...");
    }

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(preview("a\n\n  b\tc", 10), "a b c");
    }

    #[test]
    fn preview_truncates_long_text() {
        let text = "word ".repeat(100);
        let p = preview(&text, 20);
        assert_eq!(p, format!("{}...", &text.trim_end()[..20]));
    }
}
