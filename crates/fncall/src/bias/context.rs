//! Structural position inside a partially generated JSON document.

use serde::Serialize;

/// Where the next token of a partial JSON document will land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonContext {
    /// Nothing generated yet.
    Root,
    /// Directly inside an object.
    Object,
    /// Directly inside an array.
    Array,
    /// Inside an open string literal.
    String,
    /// Outside any container; a value may follow.
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Object,
    Array,
}

/// Walk `partial` one character at a time, tracking open containers and
/// whether a string literal is open (backslash escapes respected).
pub fn detect_json_context(partial: &str) -> JsonContext {
    if partial.trim().is_empty() {
        return JsonContext::Root;
    }

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in partial.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push(Frame::Object),
            '[' => stack.push(Frame::Array),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        return JsonContext::String;
    }
    match stack.last() {
        Some(Frame::Object) => JsonContext::Object,
        Some(Frame::Array) => JsonContext::Array,
        None => JsonContext::Value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers() {
        assert_eq!(detect_json_context(""), JsonContext::Root);
        assert_eq!(detect_json_context("  "), JsonContext::Root);
        assert_eq!(detect_json_context("{"), JsonContext::Object);
        assert_eq!(detect_json_context(r#"{"users": ["#), JsonContext::Array);
        assert_eq!(detect_json_context(r#"{"users": [{"#), JsonContext::Object);
        assert_eq!(detect_json_context(r#"{"a": [1, 2]"#), JsonContext::Object);
        assert_eq!(detect_json_context(r#"{"a": 1}"#), JsonContext::Value);
    }

    #[test]
    fn escaped_quotes_do_not_close_strings() {
        assert_eq!(
            detect_json_context(r#"{"text": "He said \"hi\""}"#),
            JsonContext::Value
        );
        assert_eq!(
            detect_json_context(r#"{"text": "He said \"hi"#),
            JsonContext::String
        );
        assert_eq!(detect_json_context(r#"{"k": "a\\"#), JsonContext::String);
        assert_eq!(detect_json_context(r#"{"k": "a\\""#), JsonContext::Object);
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        assert_eq!(detect_json_context(r#"{"k": "[{""#), JsonContext::Object);
    }
}
