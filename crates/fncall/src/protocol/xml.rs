//! Tag-delimited dialect.
//!
//! ```text
//! <function_calls>
//! <invoke name="read_file">
//! <parameter name="path">/src/main.rs</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! Parameter values are JSON-decoded when possible and kept as strings
//! otherwise. Streaming output is often cut off mid-call, so when no complete
//! block exists the provider salvages whatever `<invoke>` prefix is visible.

use super::{ToolCallProvider, example_arguments, parse_parameter_value};
use crate::error::{ConversionError, ConversionErrorCode};
use crate::{Arguments, ToolCall, ToolDefinition, ToolFormat, ToolResult};
use regex::Regex;
use std::sync::LazyLock;

/// Tools that list a directory; a salvaged call without `path` defaults to `"."`.
const DIRECTORY_LISTING_TOOLS: &[&str] = &["list_directory", "list_files", "list_dir", "ls"];

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:\w+:)?function_calls>(.*?)</(?:\w+:)?function_calls>")
        .expect("valid regex")
});

static INVOKE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(?:\w+:)?invoke\b[^>]*\bname\s*=\s*"([^"]+)"[^>]*>(.*?)</(?:\w+:)?invoke>"#)
        .expect("valid regex")
});

static INVOKE_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(?:\w+:)?invoke\b[^>]*\bname\s*=\s*"([^"]+)"[^>]*>?"#).expect("valid regex")
});

static PARAMETER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<(?:\w+:)?parameter\b[^>]*\bname\s*=\s*"([^"]+)"[^>]*>(.*?)</(?:\w+:)?parameter>"#,
    )
    .expect("valid regex")
});

static TRAILING_PARAMETER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(?:\w+:)?parameter\b[^>]*\bname\s*=\s*"([^"]+)"[^>]*>([^<]*)$"#)
        .expect("valid regex")
});

/// Provider for the tag-delimited `<function_calls>` dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlToolProvider;

impl XmlToolProvider {
    pub fn new() -> Self {
        Self
    }

    fn parse_parameters(body: &str) -> Arguments {
        let mut args = Arguments::new();
        for cap in PARAMETER_RE.captures_iter(body) {
            args.insert(cap[1].trim().to_string(), parse_parameter_value(&cap[2]));
        }
        args
    }

    fn parse_invokes(block: &str) -> Vec<ToolCall> {
        INVOKE_RE
            .captures_iter(block)
            .map(|cap| {
                ToolCall::new(cap[1].trim(), Self::parse_parameters(&cap[2]))
                    .with_format(ToolFormat::Xml)
            })
            .collect()
    }

    /// Best-effort recovery from an `<invoke>` that never closed.
    fn parse_partial(response: &str) -> Vec<ToolCall> {
        let starts: Vec<(usize, usize, String)> = INVOKE_OPEN_RE
            .captures_iter(response)
            .filter_map(|cap| {
                let whole = cap.get(0)?;
                Some((whole.start(), whole.end(), cap[1].trim().to_string()))
            })
            .collect();

        let mut calls = Vec::new();
        for (i, (start, open_end, name)) in starts.iter().enumerate() {
            let end = starts.get(i + 1).map_or(response.len(), |next| next.0);
            let segment = response.get(*start..end).unwrap_or_default();

            // A complete invoke inside the segment parses normally.
            if let Some(cap) = INVOKE_RE.captures(segment) {
                calls.push(
                    ToolCall::new(cap[1].trim(), Self::parse_parameters(&cap[2]))
                        .with_format(ToolFormat::Xml),
                );
                continue;
            }

            let body = response.get(*open_end..end).unwrap_or_default();
            let mut args = Self::parse_parameters(body);
            if let Some(cap) = TRAILING_PARAMETER_RE.captures(body) {
                let value = cap[2].trim();
                let key = cap[1].trim().to_string();
                if !value.is_empty() && !args.contains_key(&key) {
                    args.insert(key, parse_parameter_value(value));
                }
            }
            if DIRECTORY_LISTING_TOOLS.contains(&name.as_str()) && !args.contains_key("path") {
                args.insert("path".into(), serde_json::Value::String(".".into()));
            }
            calls.push(ToolCall::new(name.clone(), args).with_format(ToolFormat::Xml));
        }
        calls
    }
}

impl ToolCallProvider for XmlToolProvider {
    fn format(&self) -> ToolFormat {
        ToolFormat::Xml
    }

    fn try_parse(&self, response: &str) -> Result<Vec<ToolCall>, ConversionError> {
        let mut calls: Vec<ToolCall> = BLOCK_RE
            .captures_iter(response)
            .flat_map(|cap| Self::parse_invokes(&cap[1]))
            .collect();

        if calls.is_empty() {
            calls = Self::parse_partial(response);
        }

        if calls.is_empty() && BLOCK_RE.is_match(response) {
            return Err(ConversionError::new(
                ConversionErrorCode::InvalidFormat,
                "<function_calls> block holds no usable <invoke>",
            ));
        }
        if calls.is_empty() {
            return Err(ConversionError::new(
                ConversionErrorCode::NoToolCalls,
                "no <function_calls> block or <invoke> tag found",
            ));
        }
        Ok(calls)
    }

    fn format_tool_definition(&self, definition: &ToolDefinition) -> String {
        let mut out = format!(
            "<tool_description>\n<tool_name>{}</tool_name>\n<description>{}</description>\n<parameters>\n",
            definition.name, definition.description
        );
        let required = definition.required();
        if let Some(props) = definition.properties() {
            for (name, schema) in props {
                let ty = schema.get("type").and_then(|t| t.as_str()).unwrap_or("string");
                let desc = schema
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default();
                out.push_str(&format!(
                    "<parameter>\n<name>{name}</name>\n<type>{ty}</type>\n<description>{desc}</description>\n<required>{}</required>\n</parameter>\n",
                    required.contains(&name.as_str())
                ));
            }
        }
        out.push_str("</parameters>\n</tool_description>");
        out
    }

    fn format_tool_result(&self, result: &ToolResult) -> String {
        if result.is_error {
            format!(
                "<function_results>\n<error>\n<tool_name>{}</tool_name>\n<stderr>\n{}\n</stderr>\n</error>\n</function_results>",
                result.name,
                result.content_text()
            )
        } else {
            format!(
                "<function_results>\n<result>\n<tool_name>{}</tool_name>\n<stdout>\n{}\n</stdout>\n</result>\n</function_results>",
                result.name,
                result.content_text()
            )
        }
    }

    fn instructions(&self, tools: &[ToolDefinition]) -> String {
        let mut out = String::from(
            "In this environment you have access to a set of tools you can use to answer the user's question.\n\
             To call a tool, write a <function_calls> block like the one below. You may include several \
             <invoke> elements in one block. String and scalar parameters are written as-is; lists and \
             objects are written as JSON.\n\n\
             <function_calls>\n<invoke name=\"$TOOL_NAME\">\n<parameter name=\"$PARAMETER_NAME\">$PARAMETER_VALUE</parameter>\n</invoke>\n</function_calls>\n\n\
             Here are the tools available:\n<tools>\n",
        );
        for def in tools {
            out.push_str(&self.format_tool_definition(def));
            out.push('\n');
        }
        out.push_str("</tools>\n\nExample:\n");

        let (name, args) = example_arguments(tools);
        out.push_str(&format!("<function_calls>\n<invoke name=\"{name}\">\n"));
        for (key, value) in &args {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("<parameter name=\"{key}\">{rendered}</parameter>\n"));
        }
        out.push_str("</invoke>\n</function_calls>");
        out
    }
}
