//! Top-level function-calling loop.
//!
//! [`FunctionCallingCoordinator::execute_coordinated_function_calling`] runs a
//! bounded generate/execute loop against one model:
//!
//! 1. Compress the conversation if it is over the model's context budget.
//! 2. Generate. Native tool callers go through
//!    [`ReliableJsonGenerator::generate_with_tools`]; every other backend is
//!    taught the preferred dialect and its text is parsed with
//!    [`ToolProtocol`], falling back to [`JsonRepairParser`] when the text
//!    looks like a malformed call.
//! 3. No calls means the text is the final answer. Otherwise execute the
//!    calls, retry failed ones, append the results, and go again.
//!
//! Each run opens a [`SessionRecord`], finalizes it, and folds it into the
//! per-model [`CoordinatorMetrics`].

pub mod metrics;
pub mod report;
pub mod session;

pub use metrics::{CoordinatorMetrics, ModelMetrics};
pub use session::{DEFAULT_MAX_SESSION_HISTORY, SessionRecord};

use crate::context::{ContextManagerConfig, SmartContextManager};
use crate::engine::{ExecutionContext, SecurityConfig, ToolExecutionEngine};
use crate::error::is_critical_error;
use crate::generator::{JsonGenerationOptions, ReliableJsonGenerator};
use crate::model::{ContextOptions, GenerateOptions, ModelAdapter, ModelContext, estimate_tokens};
use crate::protocol::ToolProtocol;
use crate::protocol::json::JsonToolProvider;
use crate::repair::JsonRepairParser;
use crate::retry::{RetryConfig, with_retry};
use crate::tools::ToolRegistry;
use crate::{
    DEFAULT_MAX_ITERATIONS, Message, ToolCall, ToolDefinition, ToolFormat, ToolResult,
    generate_session_id,
};
use serde::Serialize;
use serde_json::Value;
use session::SessionHistory;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Confidence assigned to calls recovered by the repair parser.
const REPAIRED_CALL_CONFIDENCE: f64 = 0.85;

// ── Config and result ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Generate/execute rounds before the session is declared failed.
    pub max_iterations: u32,
    /// Dispatch a turn's calls concurrently instead of one at a time.
    pub allow_parallel_calls: bool,
    /// Re-run failed calls that are neither critical nor invalid.
    pub retry_failed_calls: bool,
    /// Backoff for failed calls. `max_retries` counts re-executions after the
    /// first attempt.
    pub call_retry: RetryConfig,
    /// Overrides the model's preferred dialect for text backends.
    pub preferred_format: Option<ToolFormat>,
    /// Sampling and retry settings for generation.
    pub json: JsonGenerationOptions,
    /// Compression policy applied before every generation.
    pub context: ContextManagerConfig,
    /// Policy every tool call is validated against.
    pub security: SecurityConfig,
    /// Base for relative path arguments. Defaults to the process directory.
    pub working_directory: Option<PathBuf>,
    /// Session records kept after each run; older ones are evicted together
    /// with their audit entries.
    pub max_session_history: usize,
    /// Aborts generation and in-flight tools.
    pub cancel: Option<CancellationToken>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            allow_parallel_calls: true,
            retry_failed_calls: true,
            call_retry: RetryConfig::with_retries(1),
            preferred_format: None,
            json: JsonGenerationOptions::default(),
            context: ContextManagerConfig::default(),
            security: SecurityConfig::default(),
            working_directory: None,
            max_session_history: DEFAULT_MAX_SESSION_HISTORY,
            cancel: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_parallel_calls(mut self, allowed: bool) -> Self {
        self.allow_parallel_calls = allowed;
        self
    }

    pub fn with_retry_failed_calls(mut self, retry: bool) -> Self {
        self.retry_failed_calls = retry;
        self
    }

    pub fn with_call_retry(mut self, retry: RetryConfig) -> Self {
        self.call_retry = retry;
        self
    }

    pub fn with_preferred_format(mut self, format: ToolFormat) -> Self {
        self.preferred_format = Some(format);
        self
    }

    pub fn with_json_options(mut self, options: JsonGenerationOptions) -> Self {
        self.json = options;
        self
    }

    pub fn with_context(mut self, context: ContextManagerConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_max_session_history(mut self, sessions: usize) -> Self {
        self.max_session_history = sessions;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of one coordinated call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatedResult {
    /// The model gave a final answer within the iteration budget.
    pub success: bool,
    /// The final answer, or the last text seen on failure.
    pub final_response: String,
    /// Distinct tool names in first-use order.
    pub tools_used: Vec<String>,
    /// One result per executed call, in execution order.
    pub tool_results: Vec<ToolResult>,
    pub execution_time_ms: u64,
    /// Key for [`FunctionCallingCoordinator::get_session_history`].
    pub session_id: String,
    /// Rounds started.
    pub iterations: u32,
    /// Mean per-turn confidence.
    pub confidence: f64,
    /// Human-readable failures collected along the way.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// One model turn, normalized across the native and text paths.
struct Turn {
    text: String,
    calls: Vec<ToolCall>,
    confidence: f64,
    format: ToolFormat,
}

/// A failed result carried through `with_retry`.
struct FailedCall(ToolResult);

impl fmt::Display for FailedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed: {}",
            self.0.name,
            self.0.error.as_deref().unwrap_or("unknown error")
        )
    }
}

// ── Coordinator ────────────────────────────────────────────────────

pub struct FunctionCallingCoordinator {
    registry: Arc<dyn ToolRegistry>,
    engine: ToolExecutionEngine,
    generator: ReliableJsonGenerator,
    protocol: ToolProtocol,
    repair: JsonRepairParser,
    metrics: Mutex<CoordinatorMetrics>,
    sessions: Mutex<SessionHistory>,
}

impl fmt::Debug for FunctionCallingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCallingCoordinator")
            .field("engine", &self.engine)
            .field("sessions", &self.lock_sessions().len())
            .finish()
    }
}

impl FunctionCallingCoordinator {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            engine: ToolExecutionEngine::new(Arc::clone(&registry)),
            registry,
            generator: ReliableJsonGenerator::new(),
            protocol: ToolProtocol::new(),
            repair: JsonRepairParser::new(),
            metrics: Mutex::new(CoordinatorMetrics::default()),
            sessions: Mutex::new(SessionHistory::default()),
        }
    }

    pub fn engine(&self) -> &ToolExecutionEngine {
        &self.engine
    }

    pub fn generator(&self) -> &ReliableJsonGenerator {
        &self.generator
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, SessionHistory> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Definitions for every registered tool, or the requested subset.
    /// Unknown names are skipped.
    pub fn resolve_tools(&self, requested: Option<&[String]>) -> Vec<ToolDefinition> {
        let Some(names) = requested else {
            return self.registry.definitions();
        };
        names
            .iter()
            .filter_map(|name| match self.registry.get_tool(name) {
                Some(tool) => Some(tool.definition()),
                None => {
                    warn!("Requested tool '{name}' is not registered; skipping");
                    None
                }
            })
            .collect()
    }

    /// Run the generate/execute loop until the model answers without
    /// calling a tool, the iteration budget runs out, or generation fails.
    pub async fn execute_coordinated_function_calling(
        &self,
        model: &dyn ModelAdapter,
        prompt: &str,
        requested_tools: Option<&[String]>,
        config: &CoordinatorConfig,
        session_id: Option<String>,
    ) -> CoordinatedResult {
        let start = Instant::now();
        let session_id = session_id.unwrap_or_else(generate_session_id);
        let tools = self.resolve_tools(requested_tools);
        let capabilities = model.capabilities();
        let native = capabilities.supports_tool_calling;
        let preferred = config
            .preferred_format
            .unwrap_or(capabilities.preferred_tool_format);
        let cancel = config.cancel.clone().unwrap_or_default();

        let mut record = SessionRecord::open(&session_id, model.name(), prompt);
        self.lock_sessions().insert(record.clone());
        info!(
            "Coordinated session started: session={session_id}, model={}, tools={}, \
             native={native}",
            model.name(),
            tools.len()
        );

        let mut exec_ctx = ExecutionContext::new(&session_id)
            .with_security(config.security.clone())
            .with_exposed_tools(tools.iter().map(|t| t.name.clone()))
            .with_cancel(cancel.clone());
        if let Some(ref dir) = config.working_directory {
            exec_ctx = exec_ctx.with_working_directory(dir.clone());
        }

        let mut context_options = ContextOptions::default()
            .with_chars_per_token(config.context.chars_per_token);
        if !native && !tools.is_empty() {
            let instructions = self.protocol.provider(preferred).instructions(&tools);
            context_options = context_options.with_system_prompt(instructions);
        }
        let mut context = model.create_context(&context_options);
        context.add_message(Message::user(prompt));
        let context_manager = SmartContextManager::new(config.context.clone());

        let mut confidences: Vec<f64> = Vec::new();
        let mut final_response: Option<String> = None;
        let mut last_text = String::new();

        for iteration in 1..=config.max_iterations {
            if cancel.is_cancelled() {
                record.errors.push("Cancelled".into());
                break;
            }
            record.iterations = iteration;

            let compression =
                context_manager.check_and_compress(context.as_mut(), capabilities.max_context_size);
            if !compression.success
                && let Some(error) = compression.error
            {
                warn!("Context still over budget: {error}");
            }

            let turn = if native {
                self.native_turn(model, context.as_ref(), &tools, config, &cancel).await
            } else {
                self.text_turn(model, context.as_ref(), preferred, config, &cancel).await
            };
            let turn = match turn {
                Ok(turn) => turn,
                Err(error) => {
                    warn!("Generation failed in session {session_id}: {error}");
                    record.errors.push(error);
                    break;
                }
            };

            let response = [Message::assistant(turn.text.as_str())];
            record.tokens +=
                context.token_count() + estimate_tokens(&response, config.context.chars_per_token);
            confidences.push(turn.confidence);
            last_text.clone_from(&turn.text);

            if turn.calls.is_empty() {
                debug!("Iteration {iteration}: final answer");
                final_response = Some(turn.text);
                break;
            }

            debug!("Iteration {iteration}: {} tool call(s)", turn.calls.len());
            let results = self
                .execute_calls(&turn.calls, &exec_ctx, config)
                .await;
            for result in results.iter().filter(|r| r.is_error) {
                record.errors.push(format!(
                    "{}: {}",
                    result.name,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
            }

            if !turn.text.trim().is_empty() {
                context.add_message(Message::assistant(turn.text.as_str()));
            }
            context.add_message(Message::tool(
                self.protocol.format_results(&results, turn.format),
            ));
            record.tool_calls.extend(turn.calls);
            record.tool_results.extend(results);
        }

        let success = final_response.is_some();
        if !success && !cancel.is_cancelled() && record.iterations == config.max_iterations {
            record
                .errors
                .push(format!("Maximum iterations ({}) reached", config.max_iterations));
        }

        record.success = success;
        record.final_response = final_response.unwrap_or(last_text);
        record.confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };
        record.duration_ms = start.elapsed().as_millis() as u64;
        record.finished_at = Some(chrono::Utc::now());

        let result = CoordinatedResult {
            success,
            final_response: record.final_response.clone(),
            tools_used: record.tools_used(),
            tool_results: record.tool_results.clone(),
            execution_time_ms: record.duration_ms,
            session_id: session_id.clone(),
            iterations: record.iterations,
            confidence: record.confidence,
            errors: record.errors.clone(),
        };

        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(&record);
        let evicted = {
            let mut sessions = self.lock_sessions();
            sessions.insert(record);
            sessions.retain_recent(config.max_session_history)
        };
        self.forget_sessions(&evicted);

        info!(
            "Coordinated session completed: session={session_id}, success={success}, \
             iterations={}, tools={:?}, {}ms",
            result.iterations, result.tools_used, result.execution_time_ms
        );
        result
    }

    async fn native_turn(
        &self,
        model: &dyn ModelAdapter,
        context: &dyn ModelContext,
        tools: &[ToolDefinition],
        config: &CoordinatorConfig,
        cancel: &CancellationToken,
    ) -> Result<Turn, String> {
        let options = config.json.clone().with_cancel(cancel.clone());
        let generation = self
            .generator
            .generate_with_tools(model, &context.transcript(), tools, &options)
            .await;
        if !generation.success {
            return Err(if generation.errors.is_empty() {
                "tool generation failed".to_string()
            } else {
                generation.errors.join("; ")
            });
        }

        let data = generation.data.unwrap_or(Value::Null);
        let calls = JsonToolProvider::calls_from_value(&data);
        let text = if calls.is_empty() {
            answer_text(&data).unwrap_or(generation.raw_text)
        } else {
            generation.raw_text
        };
        Ok(Turn {
            text,
            calls,
            confidence: generation.confidence,
            format: ToolFormat::Json,
        })
    }

    async fn text_turn(
        &self,
        model: &dyn ModelAdapter,
        context: &dyn ModelContext,
        preferred: ToolFormat,
        config: &CoordinatorConfig,
        cancel: &CancellationToken,
    ) -> Result<Turn, String> {
        let options = GenerateOptions::default()
            .with_temperature(config.json.temperature)
            .with_max_tokens(config.json.max_tokens)
            .with_cancel(cancel.clone());
        let text = model
            .generate_text(&context.transcript(), &options)
            .await
            .map_err(|e| e.to_string())?;

        let (calls, format) = self.protocol.parse(&text, preferred);
        if !calls.is_empty() {
            return Ok(Turn {
                text,
                calls,
                confidence: 1.0,
                format,
            });
        }

        if looks_like_call(&text) {
            let repaired = self.repair.repair_and_parse(&text);
            if repaired.success {
                debug!(
                    "Recovered {} call(s) via repair ({})",
                    repaired.function_calls.len(),
                    repaired.attempts.join(", ")
                );
                return Ok(Turn {
                    text,
                    calls: repaired.function_calls,
                    confidence: REPAIRED_CALL_CONFIDENCE,
                    format: ToolFormat::Json,
                });
            }
        }

        Ok(Turn {
            text,
            calls: Vec::new(),
            confidence: 1.0,
            format: preferred,
        })
    }

    /// Execute a turn's calls, then re-run failed ones that are neither
    /// critical nor rejected by validation.
    async fn execute_calls(
        &self,
        calls: &[ToolCall],
        ctx: &ExecutionContext,
        config: &CoordinatorConfig,
    ) -> Vec<ToolResult> {
        let mut results = self
            .engine
            .execute_tool_calls(calls, ctx, config.allow_parallel_calls)
            .await;
        if !config.retry_failed_calls || config.call_retry.max_retries == 0 {
            return results;
        }

        // The batch already made the first attempt.
        let retry = RetryConfig {
            max_retries: config.call_retry.max_retries - 1,
            ..config.call_retry.clone()
        };
        for (call, result) in calls.iter().zip(results.iter_mut()) {
            let retryable = result.is_error
                && !result.error.as_deref().is_some_and(is_critical_error)
                && self.engine.validate(call, ctx).is_ok();
            if !retryable || ctx.cancel.is_cancelled() {
                continue;
            }
            debug!("Retrying failed call {} ({})", call.name, call.id);
            let outcome = with_retry(
                &retry,
                |_| async move {
                    let r = self.engine.execute_tool_call(call, ctx).await;
                    if r.is_error { Err(FailedCall(r)) } else { Ok(r) }
                },
                |failed: &FailedCall| {
                    !failed.0.error.as_deref().is_some_and(is_critical_error)
                },
            )
            .await;
            *result = match outcome {
                Ok(r) | Err(FailedCall(r)) => r,
            };
        }
        results
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get_session_history(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock_sessions().get(session_id).cloned()
    }

    /// Drop all but the `keep` most recently started sessions, along with
    /// their audit entries. Returns the number evicted.
    pub fn cleanup_session_history(&self, keep: usize) -> usize {
        let evicted = self.lock_sessions().retain_recent(keep);
        self.forget_sessions(&evicted);
        evicted.len()
    }

    fn forget_sessions(&self, session_ids: &[String]) {
        for id in session_ids {
            self.engine.clear_session(id);
        }
        if !session_ids.is_empty() {
            debug!("Evicted {} old session record(s)", session_ids.len());
        }
    }

    pub fn generate_performance_report(&self) -> String {
        report::render_report(&self.get_metrics(), &self.generator.all_performance())
    }
}

/// Whether text that no dialect parsed still looks like an attempted call.
fn looks_like_call(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["function_call", "\"name\"", "name:", "'name'", "arguments", "parameters", "execute tool"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Plain answer carried in a JSON payload, if any.
fn answer_text(data: &Value) -> Option<String> {
    match data {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["response", "answer", "content", "text", "result"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}
