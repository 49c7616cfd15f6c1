/// Pretty-print a compact JSON-ish string for display in a notification
///
/// Breaks the line after every comma and around braces. This is intentionally
/// naive: it does not parse the text, so it also works on error messages.
pub fn pretty_print(text: &str) -> String {
    text.replace(',', ",\n  ")
        .replace('{', "{\n  ")
        .replace('}', "\n}")
}

/// Append a bracketed marker such as `[modified]` to a piece of text
pub fn with_marker(text: &str, marker: &str) -> String {
    if text.is_empty() {
        format!("[{}]", marker)
    } else {
        format!("{} [{}]", text, marker)
    }
}
