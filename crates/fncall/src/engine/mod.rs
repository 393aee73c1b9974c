//! Validated, time-limited tool execution.
//!
//! [`ToolExecutionEngine`] looks a call's tool up in a [`ToolRegistry`],
//! checks it against the context's [`SecurityConfig`] and the tool's declared
//! schema, then races the tool against `max_execution_time`. Every call yields
//! exactly one [`ToolResult`] with the call's id, and every call lands in the
//! per-session [`AuditLog`].
//!
//! Batches run either concurrently (results in input order) or one at a time,
//! in which case a critical failure stops the batch.

pub mod audit;
pub mod security;

pub use audit::{AuditEntry, AuditLog, SessionStats};
pub use security::{ExecutionContext, SecurityConfig};

use crate::error::{TimeoutError, ToolError, is_critical_error};
use crate::retry::with_timeout;
use crate::tools::{Tool, ToolRegistry};
use crate::{ToolCall, ToolResult, validate_json};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Log a tool call with a truncated argument preview.
pub fn log_tool_call(name: &str, arguments: &str) {
    let preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {name}({preview}{})",
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

pub struct ToolExecutionEngine {
    registry: Arc<dyn ToolRegistry>,
    audit: AuditLog,
}

impl std::fmt::Debug for ToolExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutionEngine")
            .field("tools", &self.registry.all_tools().len())
            .field("sessions", &self.audit.session_count())
            .finish()
    }
}

impl ToolExecutionEngine {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            registry,
            audit: AuditLog::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ToolRegistry> {
        &self.registry
    }

    /// Run every pre-execution check and return the resolved tool.
    ///
    /// Checks run in order: exposure and registry lookup, category
    /// permission, path arguments, content size, declared schema. A tool the
    /// context does not expose is reported as unknown.
    pub fn validate(
        &self,
        call: &ToolCall,
        ctx: &ExecutionContext,
    ) -> Result<Arc<dyn Tool>, ToolError> {
        let tool = ctx
            .exposes(&call.name)
            .then(|| self.registry.get_tool(&call.name))
            .flatten()
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;

        security::check_permission(&call.name, tool.category(), &ctx.security)?;
        security::validate_path_arguments(&call.arguments, &ctx.working_directory, &ctx.security)?;
        security::check_content_size(&call.arguments, &ctx.security)?;

        let definition = tool.definition();
        if definition.parameters.is_object() {
            validate_json(&definition.parameters, &Value::Object(call.arguments.clone())).map_err(
                |errors| ToolError::SchemaMismatch {
                    tool: call.name.clone(),
                    details: errors.join("; "),
                },
            )?;
        }
        Ok(tool)
    }

    /// Validate and execute one call. Never fails: errors become a result
    /// with `is_error` set.
    pub async fn execute_tool_call(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = self.run(call, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(value) => ToolResult::success(call, value),
            Err(e) => {
                debug!("[tool] {} failed: {e}", call.name);
                ToolResult::failure(call, e.to_string())
            }
        };

        self.audit.record(
            &ctx.session_id,
            AuditEntry {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                started_at,
                duration_ms,
                success: !result.is_error,
                error: result.error.clone(),
            },
        );
        result
    }

    async fn run(&self, call: &ToolCall, ctx: &ExecutionContext) -> Result<Value, ToolError> {
        let tool = self.validate(call, ctx)?;
        log_tool_call(&call.name, &Value::Object(call.arguments.clone()).to_string());

        let cancel = ctx.cancel.child_token();
        let limit = ctx.security.max_execution_time;
        let execution = tool.execute(&call.arguments, cancel.clone());

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled(call.name.clone())),
            outcome = with_timeout(limit, execution) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(ToolError::Execution(message)),
                Err(TimeoutError(after)) => {
                    cancel.cancel();
                    warn!("[tool] {} timed out after {}ms", call.name, after.as_millis());
                    Err(ToolError::Timeout {
                        tool: call.name.clone(),
                        after,
                    })
                }
            },
        }
    }

    /// Execute a batch.
    ///
    /// With `parallel`, every call is dispatched at once and results come back
    /// in input order. Otherwise calls run one at a time and the batch stops
    /// after the first critical failure, so the result list may be shorter
    /// than `calls`.
    pub async fn execute_tool_calls(
        &self,
        calls: &[ToolCall],
        ctx: &ExecutionContext,
        parallel: bool,
    ) -> Vec<ToolResult> {
        if parallel && calls.len() > 1 {
            let futures: Vec<_> = calls
                .iter()
                .map(|call| self.execute_tool_call(call, ctx))
                .collect();
            return futures::future::join_all(futures).await;
        }

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.execute_tool_call(call, ctx).await;
            let critical = result.error.as_deref().is_some_and(is_critical_error);
            results.push(result);
            if critical {
                warn!(
                    "[tool] critical failure in '{}', skipping {} remaining call(s)",
                    call.name,
                    calls.len() - results.len()
                );
                break;
            }
        }
        results
    }

    pub fn session_stats(&self, session_id: &str) -> SessionStats {
        self.audit.stats(session_id)
    }

    pub fn audit_log(&self, session_id: &str) -> Vec<AuditEntry> {
        self.audit.entries(session_id)
    }

    pub fn clear_session(&self, session_id: &str) {
        self.audit.clear(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FnTool, ToolCategory, ToolSet};
    use crate::{Arguments, ToolDefinition};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap_or_default()
    }

    fn read_file() -> FnTool {
        FnTool::new(
            ToolDefinition::new(
                "read_file",
                "Read a file",
                json!({
                    "type": "object",
                    "properties": {"path": {"type": "string"}},
                    "required": ["path"]
                }),
            ),
            |a: Value| async move {
                let path = a["path"].as_str().unwrap_or_default();
                Ok(json!(format!("contents of {path}")))
            },
        )
    }

    fn sleeper() -> FnTool {
        FnTool::new(
            ToolDefinition::new("sleep", "Sleep then echo", json!({"type": "object"})),
            |a: Value| async move {
                let ms = a["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(a["tag"].clone())
            },
        )
        .with_category(ToolCategory::General)
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("test-session").with_working_directory("/tmp/work")
    }

    fn engine(tools: ToolSet) -> ToolExecutionEngine {
        ToolExecutionEngine::new(Arc::new(tools))
    }

    #[tokio::test]
    async fn unknown_tool_yields_failure_with_call_id() {
        let engine = engine(ToolSet::new());
        let call = ToolCall::new("nope", Arguments::new());
        let result = engine.execute_tool_call(&call, &ctx()).await;
        assert!(result.is_error);
        assert_eq!(result.id, call.id);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn unexposed_tool_is_unknown_in_context() {
        let engine = engine(ToolSet::new().with(read_file()).with(sleeper()));
        let ctx = ctx().with_exposed_tools(["read_file"]);

        let hidden = ToolCall::new("sleep", args(json!({"tag": "x"})));
        let result = engine.execute_tool_call(&hidden, &ctx).await;
        assert!(result.error.unwrap().contains("unknown tool"));
        assert!(matches!(
            engine.validate(&hidden, &ctx),
            Err(ToolError::UnknownTool(name)) if name == "sleep"
        ));

        let offered = ToolCall::new("read_file", args(json!({"path": "/srv/a"})));
        assert!(!engine.execute_tool_call(&offered, &ctx).await.is_error);
    }

    #[tokio::test]
    async fn path_traversal_rejected_before_execution() {
        let engine = engine(ToolSet::new().with(read_file()));
        let call = ToolCall::new("read_file", args(json!({"path": "../../etc/passwd"})));
        let result = engine.execute_tool_call(&call, &ctx()).await;
        assert!(result.is_error);
        assert!(result.error.unwrap().contains("security violation"));

        let ok = ToolCall::new("read_file", args(json!({"path": "/home/user/data.txt"})));
        let result = engine.execute_tool_call(&ok, &ctx()).await;
        assert!(!result.is_error);
        assert_eq!(result.result, json!("contents of /home/user/data.txt"));
    }

    #[tokio::test]
    async fn allow_list_applies_to_execution() {
        let engine = engine(ToolSet::new().with(read_file()));
        let ctx = ctx().with_security(SecurityConfig::default().with_allowed_paths(["/srv"]));
        let call = ToolCall::new("read_file", args(json!({"path": "/home/user/data.txt"})));
        let result = engine.execute_tool_call(&call, &ctx).await;
        assert!(result.error.unwrap().contains("outside allowed paths"));
    }

    #[tokio::test]
    async fn schema_mismatch_reported() {
        let engine = engine(ToolSet::new().with(read_file()));
        let call = ToolCall::new("read_file", args(json!({"path": 5})));
        let result = engine.execute_tool_call(&call, &ctx()).await;
        assert!(result.error.unwrap().contains("argument validation failed"));

        let missing = ToolCall::new("read_file", Arguments::new());
        assert!(engine.execute_tool_call(&missing, &ctx()).await.is_error);
    }

    #[tokio::test]
    async fn timeout_resolves_failure_and_cancels_token() {
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::default();
        let slot = Arc::clone(&seen);
        let slow = FnTool::with_cancellation(
            ToolDefinition::new("slow", "Never finishes in time", json!({"type": "object"})),
            move |_: Value, cancel: CancellationToken| {
                *slot.lock().unwrap() = Some(cancel);
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }
            },
        );
        let engine = engine(ToolSet::new().with(slow));
        let ctx = ctx().with_security(
            SecurityConfig::default().with_max_execution_time(Duration::from_millis(20)),
        );
        let call = ToolCall::new("slow", Arguments::new());
        let result = engine.execute_tool_call(&call, &ctx).await;

        assert!(result.is_error);
        assert!(result.error.unwrap().contains("timed out after 20ms"));
        assert!(seen.lock().unwrap().as_ref().unwrap().is_cancelled());
        assert!(!ctx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn caller_cancellation_short_circuits() {
        let engine = engine(ToolSet::new().with(sleeper()));
        let ctx = ctx();
        ctx.cancel.cancel();
        let call = ToolCall::new("sleep", args(json!({"ms": 1000})));
        let result = engine.execute_tool_call(&call, &ctx).await;
        assert!(result.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn parallel_batch_preserves_input_order() {
        let engine = engine(ToolSet::new().with(sleeper()));
        let calls = vec![
            ToolCall::new("sleep", args(json!({"ms": 60, "tag": "first"}))),
            ToolCall::new("sleep", args(json!({"ms": 1, "tag": "second"}))),
            ToolCall::new("sleep", args(json!({"ms": 30, "tag": "third"}))),
        ];
        let results = engine.execute_tool_calls(&calls, &ctx(), true).await;
        let tags: Vec<_> = results.iter().map(|r| r.result.clone()).collect();
        assert_eq!(tags, vec![json!("first"), json!("second"), json!("third")]);
        for (call, result) in calls.iter().zip(&results) {
            assert_eq!(call.id, result.id);
        }
    }

    #[tokio::test]
    async fn sequential_batch_stops_after_critical_failure() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        let count = FnTool::new(
            ToolDefinition::new("count", "Count invocations", json!({"type": "object"})),
            move |_: Value| {
                let counter = Arc::clone(&counter);
                async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
            },
        );
        let shell = FnTool::new(
            ToolDefinition::new("run_command", "Run a shell command", json!({"type": "object"})),
            |_: Value| async move { Ok(json!("ran")) },
        );
        let engine = engine(ToolSet::new().with(count).with(shell));

        let calls = vec![
            ToolCall::new("count", Arguments::new()),
            ToolCall::new("run_command", args(json!({"command": "rm -rf /"}))),
            ToolCall::new("count", Arguments::new()),
        ];
        let results = engine.execute_tool_calls(&calls, &ctx(), false).await;

        assert_eq!(results.len(), 2);
        assert!(!results[0].is_error);
        assert!(results[1].error.as_deref().unwrap().contains("permission denied"));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_batch_continues_past_ordinary_failure() {
        let failing = FnTool::new(
            ToolDefinition::new("flaky", "Always fails", json!({"type": "object"})),
            |_: Value| async move { Err("file not found".to_string()) },
        );
        let engine = engine(ToolSet::new().with(failing).with(sleeper()));
        let calls = vec![
            ToolCall::new("flaky", Arguments::new()),
            ToolCall::new("sleep", args(json!({"tag": "after"}))),
        ];
        let results = engine.execute_tool_calls(&calls, &ctx(), false).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].result, json!("after"));
    }

    #[tokio::test]
    async fn audit_log_and_stats() {
        let engine = engine(ToolSet::new().with(read_file()));
        let ctx = ctx();
        let good = ToolCall::new("read_file", args(json!({"path": "/a"})));
        let bad = ToolCall::new("read_file", args(json!({"path": "../a"})));
        engine.execute_tool_calls(&[good.clone(), bad], &ctx, true).await;

        let stats = engine.session_stats(&ctx.session_id);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.success_rate, 0.5);

        let entries = engine.audit_log(&ctx.session_id);
        assert_eq!(entries[0].call_id, good.id);
        assert!(entries.iter().any(|e| !e.success && e.error.is_some()));

        engine.clear_session(&ctx.session_id);
        assert_eq!(engine.session_stats(&ctx.session_id).total, 0);
    }
}
