//! Tool-call dialects: parse model output into canonical [`ToolCall`]s and
//! render definitions, results, and calling instructions back out.
//!
//! Two dialects ship built in:
//!
//! - [`xml::XmlToolProvider`]: tag-delimited `<function_calls>` blocks with
//!   `<invoke name="..">` and `<parameter name="..">` children.
//! - [`json::JsonToolProvider`]: `{"function_call": {"name", "arguments"}}`
//!   envelopes.
//!
//! [`ToolProtocol`] owns both and parses with the preferred dialect first,
//! falling back to the other. Parsing never fails: output that contains no
//! recognizable call yields an empty list.

pub mod json;
pub mod xml;

use crate::error::ConversionError;
use crate::{ToolCall, ToolDefinition, ToolFormat, ToolResult};
use tracing::debug;

/// One tool-calling dialect.
pub trait ToolCallProvider: Send + Sync {
    /// The dialect this provider speaks.
    fn format(&self) -> ToolFormat;

    /// Strict parse. Returns a [`ConversionError`] when the response holds no
    /// call in this dialect.
    fn try_parse(&self, response: &str) -> Result<Vec<ToolCall>, ConversionError>;

    /// Parse a model response into canonical calls. Never fails; an empty
    /// list means "no tool call present".
    fn parse_tool_calls(&self, response: &str) -> Vec<ToolCall> {
        match self.try_parse(response) {
            Ok(calls) => calls,
            Err(e) => {
                debug!("{} provider found no tool calls: {e}", self.format());
                Vec::new()
            }
        }
    }

    /// Render a tool definition in this dialect's declaration shape.
    fn format_tool_definition(&self, definition: &ToolDefinition) -> String;

    /// Render a tool result for re-insertion into the conversation.
    fn format_tool_result(&self, result: &ToolResult) -> String;

    /// Prompt fragment teaching a model this calling convention, with the
    /// available tools and one example.
    fn instructions(&self, tools: &[ToolDefinition]) -> String;
}

/// Registry of the built-in dialects with preferred-format selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolProtocol {
    xml: xml::XmlToolProvider,
    json: json::JsonToolProvider,
}

impl ToolProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// The provider for a dialect.
    pub fn provider(&self, format: ToolFormat) -> &dyn ToolCallProvider {
        match format {
            ToolFormat::Xml => &self.xml,
            ToolFormat::Json => &self.json,
        }
    }

    /// Parse with the preferred dialect, falling back to the other one.
    ///
    /// Returns the calls and the dialect that produced them. When neither
    /// dialect finds anything the preferred format is returned with an empty
    /// list.
    pub fn parse(&self, response: &str, preferred: ToolFormat) -> (Vec<ToolCall>, ToolFormat) {
        for format in [preferred, preferred.fallback()] {
            let calls = self.provider(format).parse_tool_calls(response);
            if !calls.is_empty() {
                debug!("Parsed {} tool call(s) as {format}", calls.len());
                return (calls, format);
            }
        }
        (Vec::new(), preferred)
    }

    /// Convenience: parse and drop the dialect tag.
    pub fn parse_tool_calls(&self, response: &str, preferred: ToolFormat) -> Vec<ToolCall> {
        self.parse(response, preferred).0
    }

    /// Render results in the given dialect, one block per result.
    pub fn format_results(&self, results: &[ToolResult], format: ToolFormat) -> String {
        let provider = self.provider(format);
        results
            .iter()
            .map(|r| provider.format_tool_result(r))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse a raw parameter value: JSON when it parses, otherwise the trimmed
/// string.
pub(crate) fn parse_parameter_value(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}

/// Build a one-call example for the instructions fragment from the first
/// tool's first declared property.
pub(crate) fn example_arguments(tools: &[ToolDefinition]) -> (String, crate::Arguments) {
    let Some(tool) = tools.first() else {
        let mut args = crate::Arguments::new();
        args.insert("path".into(), serde_json::Value::String(".".into()));
        return ("list_directory".into(), args);
    };
    let mut args = crate::Arguments::new();
    if let Some(props) = tool.properties() {
        let required = tool.required();
        for (name, schema) in props {
            if !required.is_empty() && !required.contains(&name.as_str()) {
                continue;
            }
            let placeholder = match schema.get("type").and_then(|t| t.as_str()) {
                Some("integer") | Some("number") => serde_json::json!(1),
                Some("boolean") => serde_json::json!(true),
                Some("array") => serde_json::json!([]),
                Some("object") => serde_json::json!({}),
                _ => serde_json::Value::String(format!("<{name}>")),
            };
            args.insert(name.clone(), placeholder);
        }
    }
    (tool.name.clone(), args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefers_requested_format_then_falls_back() {
        let protocol = ToolProtocol::new();
        let json = r#"{"function_call": {"name": "read_file", "arguments": {"path": "/a"}}}"#;

        let (calls, format) = protocol.parse(json, ToolFormat::Xml);
        assert_eq!(calls.len(), 1);
        assert_eq!(format, ToolFormat::Json);
        assert_eq!(calls[0].format, Some(ToolFormat::Json));

        let xml = r#"<function_calls><invoke name="read_file"><parameter name="path">/a</parameter></invoke></function_calls>"#;
        let (calls, format) = protocol.parse(xml, ToolFormat::Json);
        assert_eq!(calls.len(), 1);
        assert_eq!(format, ToolFormat::Xml);
    }

    #[test]
    fn parse_plain_text_is_empty() {
        let protocol = ToolProtocol::new();
        let (calls, format) = protocol.parse("Just a friendly answer.", ToolFormat::Json);
        assert!(calls.is_empty());
        assert_eq!(format, ToolFormat::Json);
    }

    #[test]
    fn parameter_values_parse_as_json_when_possible() {
        assert_eq!(parse_parameter_value(" 42 "), serde_json::json!(42));
        assert_eq!(parse_parameter_value("true"), serde_json::json!(true));
        assert_eq!(parse_parameter_value("src/main.rs"), serde_json::json!("src/main.rs"));
        assert_eq!(parse_parameter_value("[1, 2]"), serde_json::json!([1, 2]));
    }

    #[test]
    fn example_uses_required_properties() {
        let tools = vec![ToolDefinition::new(
            "search",
            "Search",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"}
                },
                "required": ["query"]
            }),
        )];
        let (name, args) = example_arguments(&tools);
        assert_eq!(name, "search");
        assert!(args.contains_key("query"));
        assert!(!args.contains_key("limit"));
    }
}
