use once_cell::sync::Lazy;
use regex::Regex;

// Retrieval citations such as "[doc1]", together with the space before them
static CITATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[^\S\n]*\[(?:doc|ref)\s*\d+\]").expect("valid regex"));
static INLINE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\S\n]+").expect("valid regex"));
static SPACE_AROUND_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r" ?\n ?").expect("valid regex"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Remove citation markers and redundant whitespace from a model answer.
/// Line breaks are kept (at most one blank line in a row).
pub fn sanitize_answer(raw: &str) -> String {
    let text = CITATION.replace_all(raw, "");
    let text = INLINE_WHITESPACE.replace_all(&text, " ");
    let text = SPACE_AROUND_NEWLINE.replace_all(&text, "\n");
    let text = BLANK_LINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}
