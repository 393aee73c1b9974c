//! Convenience re-exports for common `fncall` types.
//!
//! ```ignore
//! use fncall::prelude::*;
//! ```
//!
//! Covers the coordinator and its configs, the model adapter contract, the
//! tool traits, and the data model. Strategy internals (repair steps,
//! compression strategies, bias vocabularies) are left out; import those from
//! their modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    Arguments, Message, MessageRole, ToolCall, ToolDefinition, ToolFormat, ToolResult,
    json_schema_for,
};

// ── Components ──────────────────────────────────────────────────────
pub use crate::bias::{BiasPreset, LogitBiasCalculator, LogitBiasConfig, detect_json_context};
pub use crate::context::{ContextManagerConfig, SmartContextManager};
pub use crate::coordinator::{CoordinatedResult, CoordinatorConfig, FunctionCallingCoordinator};
pub use crate::engine::{ExecutionContext, SecurityConfig, ToolExecutionEngine};
pub use crate::generator::{FallbackStrategy, JsonGenerationOptions, ReliableJsonGenerator};
pub use crate::protocol::{ToolCallProvider, ToolProtocol};
pub use crate::repair::JsonRepairParser;
pub use crate::retry::RetryConfig;

// ── Backends and tools ──────────────────────────────────────────────
pub use crate::error::{ModelError, ToolError};
pub use crate::model::{
    ConversationContext, GenerateOptions, ModelAdapter, ModelCapabilities, ModelContext,
};
pub use crate::tools::{FnTool, Tool, ToolCategory, ToolFuture, ToolRegistry, ToolSet};
