//! Prompt tuning for JSON generation.

use crate::ToolDefinition;
use crate::ToolFormat;
use crate::model::ModelCapabilities;
use crate::protocol::ToolCallProvider;
use crate::protocol::json::JsonToolProvider;
use serde_json::Value;

/// Stop sequences that curb rambling after the JSON payload.
pub const JSON_STOP_SEQUENCES: &[&str] = &["\n\n\n", "\nUser:", "\nHuman:", "</json>"];

const JSON_ONLY_INSTRUCTION: &str = "Respond with valid JSON only. Do not wrap it in markdown \
     code fences and do not add any explanation before or after it.";

const RETRY_INSTRUCTION: &str = "Your previous reply could not be parsed as JSON. Reply again \
     with a single valid JSON value and nothing else.";

/// Adapt `prompt` for a backend. JSON-preferring backends also get the target
/// schema and an example.
pub fn optimize_prompt(
    prompt: &str,
    capabilities: &ModelCapabilities,
    schema: Option<&Value>,
    example: Option<&Value>,
    attempt: u32,
) -> String {
    let mut out = String::with_capacity(prompt.len() + 256);
    out.push_str(prompt.trim_end());
    out.push_str("\n\n");
    out.push_str(JSON_ONLY_INSTRUCTION);

    let prefers_json = capabilities.supports_json_mode
        || capabilities.preferred_tool_format == ToolFormat::Json;
    if prefers_json {
        if let Some(schema) = schema {
            out.push_str("\n\nThe JSON must match this schema:\n");
            out.push_str(&pretty(schema));
        }
        if let Some(example) = example {
            out.push_str("\n\nExample of a valid reply:\n");
            out.push_str(&example.to_string());
        }
    }

    if attempt > 1 {
        out.push_str("\n\n");
        out.push_str(RETRY_INSTRUCTION);
    }
    out
}

/// Embed a textual tool catalog for backends without native tool calling.
pub fn tool_catalog_prompt(prompt: &str, tools: &[ToolDefinition]) -> String {
    format!(
        "{}\n\n{}",
        JsonToolProvider.instructions(tools),
        prompt.trim_end()
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
