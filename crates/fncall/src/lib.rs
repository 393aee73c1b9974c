//! Function-calling reliability and execution layer for LLM agents.
//!
//! `fncall` sits between a language-model backend and a registry of tools.
//! Models are wildly inconsistent about how they express a tool invocation:
//! some emit tag-delimited `<invoke>` blocks, some emit JSON envelopes, some
//! emit JSON with unquoted keys and trailing commas, some get truncated
//! mid-call. This crate turns all of that into one canonical [`ToolCall`],
//! executes it safely, and keeps the running conversation inside the model's
//! context window.
//!
//! # Where to find things
//!
//! - **Parse or render a tool-call dialect:** [`protocol::ToolProtocol`] with
//!   the [`protocol::xml::XmlToolProvider`] and
//!   [`protocol::json::JsonToolProvider`] dialects.
//! - **Recover a call from malformed JSON:** [`repair::JsonRepairParser`].
//! - **Bias decoding toward valid JSON:** [`bias::LogitBiasCalculator`] and
//!   [`bias::detect_json_context`].
//! - **Get structured JSON out of a model reliably:**
//!   [`generator::ReliableJsonGenerator`].
//! - **Validate and run tool calls:** [`engine::ToolExecutionEngine`] with a
//!   [`engine::SecurityConfig`].
//! - **Keep a conversation under budget:** [`context::SmartContextManager`].
//! - **Do all of the above in one call:**
//!   [`coordinator::FunctionCallingCoordinator`].
//!
//! Backends plug in through [`model::ModelAdapter`]; tools plug in through
//! [`tools::Tool`] and [`tools::ToolRegistry`].
//!
//! # Example
//!
//! ```ignore
//! use fncall::prelude::*;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct ListArgs { path: String }
//!
//! let list = FnTool::new(
//!     ToolDefinition::for_args::<ListArgs>("list_directory", "List a directory"),
//!     |args: ListArgs| async move { list(&args.path).await },
//! );
//! let coordinator = FunctionCallingCoordinator::new(Arc::new(ToolSet::new().with(list)));
//!
//! let outcome = coordinator
//!     .execute_coordinated_function_calling(
//!         &model,
//!         "What is in the project root?",
//!         None,
//!         &CoordinatorConfig::default(),
//!         None,
//!     )
//!     .await;
//!
//! println!("{}", outcome.final_response);
//! ```

pub mod bias;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod generator;
pub mod model;
pub mod prelude;
pub mod protocol;
pub mod repair;
pub mod retry;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

// ── Constants ──────────────────────────────────────────────────────

/// Default number of coordinated generate/execute iterations.
pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Default number of JSON generation attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// Tool authors use this to derive [`ToolDefinition::parameters`] from a
/// typed argument struct instead of writing the schema by hand.
///
/// # Example
///
/// ```
/// use fncall::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ListArgs {
///     path: String,
///     #[serde(default)]
///     recursive: Option<bool>,
/// }
///
/// let schema = json_schema_for::<ListArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"path".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

/// Validate `value` against a JSON Schema, collecting every violation as
/// `"<instance path>: <message>"`. A schema that does not compile is treated
/// as permissive.
pub fn validate_json(
    schema: &serde_json::Value,
    value: &serde_json::Value,
) -> Result<(), Vec<String>> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Skipping validation against invalid schema: {e}");
            return Ok(());
        }
    };
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

// ── Ids ────────────────────────────────────────────────────────────

/// Generate a unique id for a tool call.
pub fn generate_call_id() -> String {
    generate_id("call")
}

/// Generate a unique id for a coordinated session.
pub fn generate_session_id() -> String {
    generate_id("session")
}

pub(crate) fn generate_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter keeps ids unique for calls within the same nanosecond.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:x}-{count:04x}")
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in a model conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// Tool arguments: a string-keyed map of arbitrary JSON values.
///
/// `serde_json::Value` is already the tagged union the schema validator needs
/// (null, bool, number, string, array, object), so arguments are never an
/// untyped blob.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// The textual dialect a tool call was expressed in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ToolFormat {
    /// Tag-delimited `<function_calls><invoke name="..">` blocks.
    Xml,
    /// `{"function_call": {"name": .., "arguments": {..}}}` envelopes.
    Json,
}

impl ToolFormat {
    /// The other dialect, used for parse fallback.
    pub fn fallback(self) -> Self {
        match self {
            ToolFormat::Xml => ToolFormat::Json,
            ToolFormat::Json => ToolFormat::Xml,
        }
    }
}

impl std::fmt::Display for ToolFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFormat::Xml => write!(f, "xml"),
            ToolFormat::Json => write!(f, "json"),
        }
    }
}

/// Canonical, backend-agnostic tool call. Never mutated after creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ToolFormat>,
}

impl ToolCall {
    /// Create a call with a freshly generated id.
    pub fn new(name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            id: generate_call_id(),
            name: name.into(),
            arguments,
            description: None,
            format: None,
        }
    }

    /// Tag the call with the dialect it was parsed from.
    pub fn with_format(mut self, format: ToolFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Use an explicit id instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// The call as a plain `{"name", "arguments"}` JSON object.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "arguments": self.arguments,
        })
    }
}

/// Result of executing one [`ToolCall`]. Exactly one per call, including on
/// failure; `id` always equals the originating call's id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_error: bool,
}

impl ToolResult {
    /// A successful result for `call`.
    pub fn success(call: &ToolCall, result: serde_json::Value) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            result,
            error: None,
            is_error: false,
        }
    }

    /// A failed result for `call`.
    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            result: serde_json::Value::Null,
            error: Some(error.into()),
            is_error: true,
        }
    }

    /// Render the payload as text for re-insertion into a conversation.
    pub fn content_text(&self) -> String {
        if let Some(ref err) = self.error {
            return err.clone();
        }
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A tool's declared interface. Supplied by the registry; immutable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema-like parameter declaration (`type: object`, `properties`,
    /// `required`).
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Build a definition whose parameters are derived from a typed argument
    /// struct via [`json_schema_for`].
    pub fn for_args<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(name, description, json_schema_for::<T>())
    }

    /// Declared properties, if any.
    pub fn properties(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.parameters.get("properties").and_then(|p| p.as_object())
    }

    /// Names of the required parameters.
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Convert an arbitrary JSON value into an argument map.
///
/// Objects are taken as-is; a string holding a JSON object (OpenAI-style
/// `"arguments": "{...}"`) is decoded; anything else yields `None`.
pub fn arguments_from_value(value: &serde_json::Value) -> Option<Arguments> {
    match value {
        serde_json::Value::Object(map) => Some(map.clone()),
        serde_json::Value::String(s) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        },
        serde_json::Value::Null => Some(Arguments::new()),
        _ => None,
    }
}
