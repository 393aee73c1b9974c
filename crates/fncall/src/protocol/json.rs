//! JSON-envelope dialect.
//!
//! The canonical shape is `{"function_call": {"name": .., "arguments": {..}}}`.
//! The parser also accepts the shapes models commonly drift into:
//!
//! - `{"function_calls": [ {..}, {..} ]}` for several calls at once,
//! - a bare `{"name": .., "arguments": {..}}` object (or an array of them),
//! - OpenAI-style `{"tool_calls": [{"function": {..}}]}`,
//! - `arguments` as a string holding a JSON object,
//! - any of the above inside a fenced code block.
//!
//! When none of that parses (usually a truncated stream), a regex locates the
//! `"function_call": {"name": ..` prefix and whatever arguments are visible
//! after it are salvaged.

use super::{ToolCallProvider, example_arguments, parse_parameter_value};
use crate::error::{ConversionError, ConversionErrorCode};
use crate::{Arguments, ToolCall, ToolDefinition, ToolFormat, ToolResult, arguments_from_value};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("valid regex"));

static PARTIAL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""function_call"\s*:\s*\{\s*"name"\s*:\s*"([^"]+)""#).expect("valid regex")
});

static ARGUMENTS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""arguments"\s*:\s*"#).expect("valid regex"));

static VISIBLE_PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#""([^"]+)"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?|true|false|null)"#,
    )
    .expect("valid regex")
});

/// Provider for the `{"function_call": ..}` dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonToolProvider;

impl JsonToolProvider {
    pub fn new() -> Self {
        Self
    }

    /// Interpret a decoded JSON value as zero or more calls.
    pub fn calls_from_value(value: &Value) -> Vec<ToolCall> {
        match value {
            Value::Array(items) => items.iter().flat_map(Self::calls_from_value).collect(),
            Value::Object(map) => {
                if let Some(inner) = map.get("function_call") {
                    return Self::call_from_object(inner).into_iter().collect();
                }
                if let Some(Value::Array(items)) = map.get("function_calls") {
                    return items.iter().flat_map(Self::calls_from_value).collect();
                }
                if let Some(Value::Array(items)) = map.get("tool_calls") {
                    return items
                        .iter()
                        .filter_map(|item| {
                            let inner = item.get("function").unwrap_or(item);
                            let call = Self::call_from_object(inner)?;
                            Some(match item.get("id").and_then(|v| v.as_str()) {
                                Some(id) => call.with_id(id),
                                None => call,
                            })
                        })
                        .collect();
                }
                Self::call_from_object(value).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn call_from_object(value: &Value) -> Option<ToolCall> {
        let name = value.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        let raw_args = value
            .get("arguments")
            .or_else(|| value.get("parameters"))
            .unwrap_or(&Value::Null);
        let arguments = arguments_from_value(raw_args)?;
        let mut call = ToolCall::new(name, arguments).with_format(ToolFormat::Json);
        if let Some(id) = value.get("id").and_then(|v| v.as_str()) {
            call = call.with_id(id);
        }
        if let Some(desc) = value.get("description").and_then(|v| v.as_str()) {
            call.description = Some(desc.to_string());
        }
        Some(call)
    }

    /// Whole-text candidates: the trimmed response, then every fenced block.
    fn candidates(response: &str) -> Vec<&str> {
        let mut out = vec![response.trim()];
        out.extend(
            FENCE_RE
                .captures_iter(response)
                .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim())),
        );
        out
    }

    /// Recover calls from truncated or prose-wrapped `"function_call"` prefixes.
    fn parse_partial(response: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        for cap in PARTIAL_CALL_RE.captures_iter(response) {
            let Some(whole) = cap.get(0) else { continue };
            let name = cap[1].trim();
            let rest = response.get(whole.end()..).unwrap_or_default();

            let mut arguments = Arguments::new();
            if let Some(key) = ARGUMENTS_KEY_RE.find(rest) {
                let after = rest.get(key.end()..).unwrap_or_default();
                arguments = salvage_arguments(after);
            }
            calls.push(ToolCall::new(name, arguments).with_format(ToolFormat::Json));
        }
        calls
    }
}

/// Arguments from the text right after `"arguments":`. A balanced object is
/// decoded whole; a truncated one yields whatever complete pairs are visible.
fn salvage_arguments(after: &str) -> Arguments {
    let trimmed = after.trim_start();
    if trimmed.starts_with('"') {
        // String-encoded arguments.
        if let Ok(Value::String(s)) = serde_json::Deserializer::from_str(trimmed)
            .into_iter::<Value>()
            .next()
            .unwrap_or(Ok(Value::Null))
            && let Some(args) = arguments_from_value(&Value::String(s))
        {
            return args;
        }
    }
    if let Some(object) = extract_balanced(trimmed, 0)
        && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(object)
    {
        return map;
    }

    // Truncated: every complete scalar pair that is visible.
    let mut args = Arguments::new();
    for cap in VISIBLE_PAIR_RE.captures_iter(trimmed) {
        let key = cap[1].to_string();
        if !args.contains_key(&key) {
            args.insert(key, parse_parameter_value(&cap[2]));
        }
    }
    args
}

/// A named call, bare or enveloped, whose `arguments` cannot become a map.
fn has_unusable_arguments(value: &Value) -> bool {
    let inner = value.get("function_call").unwrap_or(value);
    inner.get("name").and_then(Value::as_str).is_some()
        && inner
            .get("arguments")
            .is_some_and(|args| arguments_from_value(args).is_none())
}

/// The balanced `{..}` or `[..]` span starting at byte `start`, respecting
/// string literals and escapes. Returns `None` if `text[start]` opens neither
/// or the span never closes.
pub fn extract_balanced(text: &str, start: usize) -> Option<&str> {
    let tail = text.get(start..)?;
    if !(tail.starts_with('{') || tail.starts_with('[')) {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in tail.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return tail.get(..=i);
                }
            }
            _ => {}
        }
    }
    None
}

impl ToolCallProvider for JsonToolProvider {
    fn format(&self) -> ToolFormat {
        ToolFormat::Json
    }

    fn try_parse(&self, response: &str) -> Result<Vec<ToolCall>, ConversionError> {
        let mut saw_json = false;
        let mut bad_arguments = false;
        for candidate in Self::candidates(response) {
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                saw_json = true;
                let calls = Self::calls_from_value(&value);
                if !calls.is_empty() {
                    return Ok(calls);
                }
                bad_arguments |= has_unusable_arguments(&value);
            }
        }

        let calls = Self::parse_partial(response);
        if !calls.is_empty() {
            return Ok(calls);
        }

        if bad_arguments {
            Err(ConversionError::new(
                ConversionErrorCode::InvalidArguments,
                "named call whose arguments are not an object",
            ))
        } else if saw_json {
            Err(ConversionError::new(
                ConversionErrorCode::MissingField,
                "JSON present but no object carries a tool name",
            ))
        } else {
            Err(ConversionError::new(
                ConversionErrorCode::NoToolCalls,
                "no function_call object found",
            ))
        }
    }

    fn format_tool_definition(&self, definition: &ToolDefinition) -> String {
        let value = json!({
            "name": definition.name,
            "description": definition.description,
            "parameters": definition.parameters,
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
    }

    fn format_tool_result(&self, result: &ToolResult) -> String {
        let body = if result.is_error {
            json!({
                "id": result.id,
                "name": result.name,
                "error": result.content_text(),
            })
        } else {
            json!({
                "id": result.id,
                "name": result.name,
                "result": result.result,
            })
        };
        json!({ "function_result": body }).to_string()
    }

    fn instructions(&self, tools: &[ToolDefinition]) -> String {
        let mut out = String::from(
            "You can call tools. To call one, respond with ONLY a JSON object of this form \
             and no other text:\n\
             {\"function_call\": {\"name\": \"<tool name>\", \"arguments\": {<arguments>}}}\n\
             To call several tools at once use {\"function_calls\": [..]} with one entry per call.\n\
             When you have the final answer, reply in plain text without any function_call.\n\n\
             Available tools:\n",
        );
        for def in tools {
            out.push_str(&self.format_tool_definition(def));
            out.push('\n');
        }
        let (name, args) = example_arguments(tools);
        let example = json!({"function_call": {"name": name, "arguments": args}});
        out.push_str(&format!("\nExample:\n{example}"));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope() {
        let calls = JsonToolProvider.parse_tool_calls(
            r#"{"function_call": {"name": "read_file", "arguments": {"path": "/tmp/a.txt"}}}"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "/tmp/a.txt");
        assert_eq!(calls[0].format, Some(ToolFormat::Json));
    }

    #[test]
    fn parses_multiple_and_bare_shapes() {
        let calls = JsonToolProvider.parse_tool_calls(
            r#"{"function_calls": [
                {"name": "a", "arguments": {}},
                {"function_call": {"name": "b", "arguments": {"x": 1}}}
            ]}"#,
        );
        assert_eq!(calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), ["a", "b"]);

        let bare =
            JsonToolProvider.parse_tool_calls(r#"{"name": "ls", "arguments": {"path": "."}}"#);
        assert_eq!(bare[0].name, "ls");
    }

    #[test]
    fn string_encoded_arguments() {
        let calls = JsonToolProvider.parse_tool_calls(
            r#"{"tool_calls": [{"id": "abc", "function": {"name": "grep", "arguments": "{\"pattern\": \"fn\"}"}}]}"#,
        );
        assert_eq!(calls[0].id, "abc");
        assert_eq!(calls[0].arguments["pattern"], "fn");
    }

    #[test]
    fn parses_inside_fence() {
        let response = "Sure:\n```json\n{\"function_call\": {\"name\": \"ls\", \"arguments\": {\"path\": \"/\"}}}\n```\nDone.";
        let calls = JsonToolProvider.parse_tool_calls(response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["path"], "/");
    }

    #[test]
    fn truncated_call_salvages_visible_arguments() {
        let response = r#"{"function_call": {"name": "write_file", "arguments": {"path": "/tmp/x", "append": true, "content": "hel"#;
        let calls = JsonToolProvider.parse_tool_calls(response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "write_file");
        assert_eq!(calls[0].arguments["path"], "/tmp/x");
        assert_eq!(calls[0].arguments["append"], true);
        assert!(!calls[0].arguments.contains_key("content"));
    }

    #[test]
    fn prose_wrapped_call_is_found() {
        let response = r#"I'll do that now. "function_call": {"name": "ls", "arguments": {"path": "src"}} hope that helps"#;
        let calls = JsonToolProvider.parse_tool_calls(response);
        assert_eq!(calls[0].arguments["path"], "src");
    }

    #[test]
    fn plain_text_and_nameless_json_yield_nothing() {
        assert!(JsonToolProvider.parse_tool_calls("The answer is 4.").is_empty());
        let err = JsonToolProvider.try_parse(r#"{"answer": 4}"#).unwrap_err();
        assert_eq!(err.code, ConversionErrorCode::MissingField);
        let err = JsonToolProvider
            .try_parse(r#"{"name": "ls", "arguments": [1, 2]}"#)
            .unwrap_err();
        assert_eq!(err.code, ConversionErrorCode::InvalidArguments);
    }

    #[test]
    fn balanced_extraction_respects_strings() {
        let text = r#"x {"a": "}{", "b": {"c": 1}} tail"#;
        let start = text.find('{').unwrap();
        assert_eq!(
            extract_balanced(text, start),
            Some(r#"{"a": "}{", "b": {"c": 1}}"#)
        );
        assert_eq!(extract_balanced("{\"open\": 1", 0), None);
    }

    #[test]
    fn formats_result_envelope() {
        let call = ToolCall::new("ls", Arguments::new());
        let ok: Value = serde_json::from_str(
            &JsonToolProvider.format_tool_result(&ToolResult::success(&call, json!(["a"]))),
        )
        .unwrap();
        assert_eq!(ok["function_result"]["result"][0], "a");
        assert_eq!(ok["function_result"]["id"], call.id.as_str());

        let err: Value = serde_json::from_str(
            &JsonToolProvider.format_tool_result(&ToolResult::failure(&call, "nope")),
        )
        .unwrap();
        assert_eq!(err["function_result"]["error"], "nope");
    }

    #[test]
    fn instructions_contain_example_envelope() {
        let text = JsonToolProvider.instructions(&[]);
        assert!(text.contains(r#""function_call""#));
        assert!(text.contains("list_directory"));
    }
}
