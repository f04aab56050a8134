//! Post-processing of raw model output.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Remove `<think>…</think>` reasoning sections.
///
/// An unclosed opening tag drops everything after it. A closing tag with no
/// opening tag drops everything before it.
#[must_use]
pub fn strip_reasoning(raw: &str) -> String {
    let mut text = raw;
    if let Some(close) = text.find(THINK_CLOSE)
        && !text[..close].contains(THINK_OPEN)
    {
        text = &text[close + THINK_CLOSE.len()..];
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find(THINK_OPEN) {
        out.push_str(&rest[..open]);
        match rest[open..].find(THINK_CLOSE) {
            Some(close) => rest = &rest[open + close + THINK_CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Truncate `text` to at most `limit` characters, cutting at the last
/// whitespace boundary instead of mid-word.
///
/// Falls back to a hard cut when the first word alone exceeds the limit.
#[must_use]
pub fn truncate_at_whitespace(text: &str, limit: usize) -> String {
    let Some((cut, next)) = text.char_indices().nth(limit) else {
        return text.to_string();
    };

    let head = &text[..cut];
    if next.is_whitespace() {
        let trimmed = head.trim_end();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    match head.rfind(char::is_whitespace) {
        Some(boundary) if !head[..boundary].trim_end().is_empty() => {
            head[..boundary].trim_end().to_string()
        }
        _ => head.to_string(),
    }
}
