/// Default number of lines in a snippet when no match is found.
pub const DEFAULT_SNIPPET_LINES: usize = 4;

/// Maximum number of characters in a snippet before truncation.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 300;

/// Extract a snippet around the first line matching `query` in `text`.
///
/// The whole query is tried first, then each of its words. Returns
/// `(snippet_text, start_line_number)` where the line number is 1-indexed
/// within `text`. If nothing matches, returns the first few lines.
/// Returns `None` if the text is empty.
///
/// # Examples
///
/// ```
/// use docseek::text_util::extract_snippet;
///
/// let text = "intro\nthe leave policy\nmore";
/// let (snippet, line) = extract_snippet(text, "Leave").unwrap();
/// assert_eq!(line, 1);
/// assert!(snippet.contains("the leave policy"));
/// ```
pub fn extract_snippet(text: &str, query: &str) -> Option<(String, usize)> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let query_lower = query.trim().to_lowercase();
    let needles = std::iter::once(query_lower.as_str())
        .chain(query_lower.split_whitespace().filter(|w| w.chars().count() >= 2));
    let lowered: Vec<String> = lines.iter().map(|l| l.to_lowercase()).collect();

    let mut match_idx = None;
    for needle in needles {
        if needle.is_empty() {
            continue;
        }
        if let Some(idx) = lowered.iter().position(|l| l.contains(needle)) {
            match_idx = Some(idx);
            break;
        }
    }

    let (start, end) = if let Some(idx) = match_idx {
        let start = idx.saturating_sub(1);
        let end = (idx + 2).min(lines.len());
        (start, end)
    } else {
        (0, DEFAULT_SNIPPET_LINES.min(lines.len()))
    };

    let mut snippet = lines[start..end].join("\n");
    if let Some((cut, _)) = snippet.char_indices().nth(DEFAULT_SNIPPET_MAX_CHARS) {
        snippet.truncate(cut);
        snippet.push_str("...");
    }

    Some((snippet, start + 1))
}
