//! Error taxonomy.
//!
//! None of these escape the public entry points as panics or unhandled
//! errors: tool errors become `ToolResult { is_error: true }`, conversion
//! errors become an empty parse result, model errors are collected into the
//! generator's diagnostic list.

use std::time::Duration;
use thiserror::Error;

/// Phrases that mark a tool failure as critical. A critical failure halts a
/// sequential batch.
pub const CRITICAL_ERROR_PHRASES: &[&str] = &[
    "security violation",
    "permission denied",
    "access denied",
    "authentication failed",
];

/// Whether an error message belongs to the critical category.
pub fn is_critical_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CRITICAL_ERROR_PHRASES.iter().any(|p| lower.contains(p))
}

/// Validation and execution failures for a single tool call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("permission denied: {category} access is not allowed for tool '{tool}'")]
    PermissionDenied { tool: String, category: String },

    #[error("security violation: path '{path}' rejected ({reason})")]
    PathViolation { path: String, reason: String },

    #[error("argument validation failed for tool '{tool}': {details}")]
    SchemaMismatch { tool: String, details: String },

    #[error("argument '{argument}' is {size} bytes, exceeding the {limit} byte limit")]
    FileTooLarge {
        argument: String,
        size: usize,
        limit: usize,
    },

    #[error("tool '{tool}' timed out after {}ms", .after.as_millis())]
    Timeout { tool: String, after: Duration },

    #[error("tool '{0}' was cancelled")]
    Cancelled(String),

    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    /// Whether this error halts a sequential batch.
    pub fn is_critical(&self) -> bool {
        is_critical_error(&self.to_string())
    }
}

/// Machine-readable code carried by a [`ConversionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionErrorCode {
    InvalidFormat,
    MissingField,
    InvalidArguments,
    NoToolCalls,
}

impl std::fmt::Display for ConversionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ConversionErrorCode::InvalidFormat => "INVALID_FORMAT",
            ConversionErrorCode::MissingField => "MISSING_FIELD",
            ConversionErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ConversionErrorCode::NoToolCalls => "NO_TOOL_CALLS",
        };
        f.write_str(code)
    }
}

/// Internal format-translation failure inside the protocol layer.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("[{code}] {message}")]
pub struct ConversionError {
    pub code: ConversionErrorCode,
    pub message: String,
}

impl ConversionError {
    pub fn new(code: ConversionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Failures reported by a model adapter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("generation cancelled")]
    Cancelled,

    #[error("generation timed out")]
    Timeout,
}

/// The operation did not finish within its time limit.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation timed out after {}ms", .0.as_millis())]
pub struct TimeoutError(pub Duration);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_phrases_detected() {
        assert!(is_critical_error("Permission denied: /etc/shadow"));
        assert!(is_critical_error("ACCESS DENIED"));
        assert!(is_critical_error("authentication failed for user"));
        assert!(!is_critical_error("file not found"));
    }

    #[test]
    fn security_variants_are_critical() {
        let denied = ToolError::PermissionDenied {
            tool: "shell".into(),
            category: "shell".into(),
        };
        let path = ToolError::PathViolation {
            path: "../etc".into(),
            reason: "traversal".into(),
        };
        assert!(denied.is_critical());
        assert!(path.is_critical());
        assert!(!ToolError::UnknownTool("x".into()).is_critical());
        assert!(
            !ToolError::Timeout {
                tool: "x".into(),
                after: Duration::from_secs(1)
            }
            .is_critical()
        );
    }

    #[test]
    fn conversion_error_display_carries_code() {
        let err = ConversionError::new(ConversionErrorCode::MissingField, "no name");
        assert_eq!(err.to_string(), "[MISSING_FIELD] no name");
    }
}
