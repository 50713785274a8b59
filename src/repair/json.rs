//! Lenient JSON recovery for model output.
//!
//! Tool-call arguments from smaller hosted models are frequently almost-JSON: wrapped in
//! a markdown fence, carrying a trailing comma, or cut off before the closing brace.

use super::compile;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| compile(r"```(?:json|JSON)?\s*([\s\S]*?)\s*```"));
static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| compile(r",(\s*[}\]])"));

/// Parse `text` as JSON, trying progressively more aggressive recoveries.
pub fn parse_lenient(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    let mut candidates: Vec<&str> = Vec::new();
    if let Some(inner) = FENCED_JSON.captures(trimmed).and_then(|c| c.get(1)) {
        candidates.push(inner.as_str());
    }
    if let Some(start) = trimmed.find(['{', '[']) {
        candidates.push(&trimmed[start..]);
    }

    for candidate in candidates {
        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
            return Some(v);
        }
        let balanced = close_brackets(&TRAILING_COMMA.replace_all(candidate, "$1"));
        if let Ok(v) = serde_json::from_str::<Value>(&balanced) {
            return Some(v);
        }
        // A complete value followed by chatter: parse only the first value.
        let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
        if let Some(Ok(v)) = stream.next() {
            return Some(v);
        }
    }
    None
}

/// Close any open strings, objects and arrays at the end of a truncated document.
fn close_brackets(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    let mut out = text.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    if out.ends_with(',') || out.ends_with(':') {
        out.pop();
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_and_fenced() {
        assert_eq!(parse_lenient(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(
            parse_lenient("Sure:\n```json\n{\"q\": \"rust\"}\n```"),
            Some(json!({"q": "rust"}))
        );
    }

    #[test]
    fn test_trailing_comma_and_truncation() {
        assert_eq!(parse_lenient(r#"{"a": [1, 2,], }"#), Some(json!({"a": [1, 2]})));
        assert_eq!(
            parse_lenient(r#"{"query": "rust async", "limit": 5"#),
            Some(json!({"query": "rust async", "limit": 5}))
        );
        assert_eq!(parse_lenient(r#"{"query": "rus"#), Some(json!({"query": "rus"})));
    }

    #[test]
    fn test_leading_and_trailing_chatter() {
        assert_eq!(
            parse_lenient(r#"args: {"x": true} hope that helps"#),
            Some(json!({"x": true}))
        );
    }

    #[test]
    fn test_garbage() {
        assert_eq!(parse_lenient(""), None);
        assert_eq!(parse_lenient("no json here"), None);
    }
}
