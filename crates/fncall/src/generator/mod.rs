//! Reliable structured JSON out of an unreliable model.
//!
//! [`ReliableJsonGenerator::generate_reliable_json`] runs up to
//! `max_attempts` generations. Each attempt tunes the prompt for the backend,
//! requests low-temperature JSON output, and tries direct parsing, then
//! fenced-block extraction, then brace matching. When all three miss, the
//! configured [`FallbackStrategy`] gets a turn before the next attempt.
//!
//! Every outcome is a [`JsonGenerationResult`]; failures carry the collected
//! diagnostics and a confidence of zero.

mod confidence;
mod prompt;

pub use confidence::{ParseMethod, confidence_score};
pub use prompt::{JSON_STOP_SEQUENCES, optimize_prompt, tool_catalog_prompt};

use crate::bias::{BiasPreset, LogitBiasCalculator, LogitBiasConfig};
use crate::error::ModelError;
use crate::model::{GenerateOptions, ModelAdapter, ResponseFormat};
use crate::protocol::json::extract_balanced;
use crate::repair::JsonRepairParser;
use crate::{DEFAULT_MAX_ATTEMPTS, ToolDefinition, validate_json};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// ── Options and results ────────────────────────────────────────────

/// What to do when an attempt's output holds no parseable JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Run the repair pipeline over the raw text.
    #[default]
    Repair,
    /// Try the loose extractors: fenced block, brace pattern, key/value
    /// lines, `result:` label.
    Extract,
    /// Move straight on to the next attempt.
    Regenerate,
}

#[derive(Debug, Clone)]
pub struct JsonGenerationOptions {
    pub max_attempts: u32,
    pub fallback: FallbackStrategy,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Result must validate against this schema when set.
    pub schema: Option<Value>,
    pub example: Option<Value>,
    pub bias_preset: BiasPreset,
    pub cancel: Option<CancellationToken>,
}

impl Default for JsonGenerationOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fallback: FallbackStrategy::Repair,
            temperature: 0.1,
            max_tokens: 1024,
            schema: None,
            example: None,
            bias_preset: BiasPreset::Moderate,
            cancel: None,
        }
    }
}

impl JsonGenerationOptions {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn with_bias_preset(mut self, preset: BiasPreset) -> Self {
        self.bias_preset = preset;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonGenerationResult {
    pub success: bool,
    pub data: Option<Value>,
    /// Raw text of the last generation.
    pub raw_text: String,
    pub attempts: u32,
    pub confidence: f64,
    pub method: Option<ParseMethod>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl JsonGenerationResult {
    fn failure(raw_text: String, attempts: u32, errors: Vec<String>, start: Instant) -> Self {
        Self {
            success: false,
            data: None,
            raw_text,
            attempts,
            confidence: 0.0,
            method: None,
            errors,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Per-model JSON generation telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelJsonPerformance {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl ModelJsonPerformance {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// A JSON payload located in raw text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJson {
    pub value: Value,
    /// The text span the value was decoded from.
    pub payload: String,
    pub method: ParseMethod,
}

// ── Generator ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ReliableJsonGenerator {
    repair: JsonRepairParser,
    bias: LogitBiasCalculator,
    performance: Mutex<HashMap<String, ModelJsonPerformance>>,
}

impl ReliableJsonGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive `model` until it yields JSON or the attempt budget is spent.
    pub async fn generate_reliable_json(
        &self,
        model: &dyn ModelAdapter,
        prompt: &str,
        options: &JsonGenerationOptions,
    ) -> JsonGenerationResult {
        let start = Instant::now();
        let capabilities = model.capabilities();
        let mut errors = Vec::new();
        let mut raw_text = String::new();
        let mut attempts = 0;

        let mut gen_options = GenerateOptions::default()
            .with_temperature(options.temperature)
            .with_max_tokens(options.max_tokens)
            .with_format(ResponseFormat::Json)
            .with_stop(JSON_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect());
        if capabilities.supports_logit_bias {
            gen_options = gen_options.with_logit_bias(
                self.bias
                    .generate_json_bias(&LogitBiasConfig::preset(options.bias_preset)),
            );
        }
        if let Some(ref token) = options.cancel {
            gen_options = gen_options.with_cancel(token.clone());
        }

        for attempt in 1..=options.max_attempts.max(1) {
            if gen_options.is_cancelled() {
                errors.push("generation cancelled".into());
                break;
            }
            attempts = attempt;
            let tuned = optimize_prompt(
                prompt,
                capabilities,
                options.schema.as_ref(),
                options.example.as_ref(),
                attempt,
            );
            self.record(model.name(), |p| p.attempts += 1);

            let text = match model.generate_text(&tuned, &gen_options).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("JSON generation attempt {attempt} on {} failed: {e}", model.name());
                    errors.push(format!("attempt {attempt}: {e}"));
                    self.record(model.name(), |p| p.failures += 1);
                    if e == ModelError::Cancelled {
                        break;
                    }
                    continue;
                }
            };
            trace!("attempt {attempt} raw output: {}", preview(&text));
            raw_text = text;

            let parsed = self
                .parse_json_response(&raw_text)
                .or_else(|| self.apply_fallback(&raw_text, options.fallback));
            let Some(parsed) = parsed else {
                errors.push(format!("attempt {attempt}: no parseable JSON in response"));
                self.record(model.name(), |p| p.failures += 1);
                continue;
            };

            if let Some(ref schema) = options.schema
                && let Err(violations) = validate_json(schema, &parsed.value)
            {
                errors.push(format!(
                    "attempt {attempt}: schema validation failed: {}",
                    violations.join("; ")
                ));
                self.record(model.name(), |p| p.failures += 1);
                continue;
            }

            let confidence = confidence_score(&raw_text, &parsed.payload, &parsed.value, attempt);
            self.record(model.name(), |p| p.successes += 1);
            debug!(
                "JSON from {} on attempt {attempt} via {:?} (confidence {confidence:.2})",
                model.name(),
                parsed.method
            );
            return JsonGenerationResult {
                success: true,
                data: Some(parsed.value),
                raw_text,
                attempts,
                confidence,
                method: Some(parsed.method),
                errors,
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }

        warn!(
            "JSON generation on {} exhausted after {attempts} attempt(s)",
            model.name()
        );
        JsonGenerationResult::failure(raw_text, attempts, errors, start)
    }

    /// Tool-aware generation. Native tool callers are asked directly and
    /// their calls wrapped as `{"function_calls": [..]}`; other backends get
    /// a textual catalog and the regular JSON pipeline.
    pub async fn generate_with_tools(
        &self,
        model: &dyn ModelAdapter,
        prompt: &str,
        tools: &[ToolDefinition],
        options: &JsonGenerationOptions,
    ) -> JsonGenerationResult {
        let start = Instant::now();
        let mut errors = Vec::new();

        if model.capabilities().supports_tool_calling {
            let mut gen_options = GenerateOptions::default()
                .with_temperature(options.temperature)
                .with_max_tokens(options.max_tokens);
            if let Some(ref token) = options.cancel {
                gen_options = gen_options.with_cancel(token.clone());
            }
            self.record(model.name(), |p| p.attempts += 1);
            match model.generate_with_tools(prompt, tools, &gen_options).await {
                Ok(generation) => {
                    self.record(model.name(), |p| p.successes += 1);
                    info!(
                        "{} returned {} native tool call(s)",
                        model.name(),
                        generation.tool_calls.len()
                    );
                    let calls: Vec<Value> =
                        generation.tool_calls.iter().map(|c| c.to_value()).collect();
                    return JsonGenerationResult {
                        success: true,
                        data: Some(json!({ "function_calls": calls })),
                        raw_text: generation.text,
                        attempts: 1,
                        confidence: 1.0,
                        method: Some(ParseMethod::NativeToolCall),
                        errors,
                        duration_ms: start.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    warn!(
                        "Native tool calling on {} failed: {e}; using text catalog",
                        model.name()
                    );
                    self.record(model.name(), |p| p.failures += 1);
                    errors.push(format!("native tool calling: {e}"));
                }
            }
        }

        let catalog = tool_catalog_prompt(prompt, tools);
        let mut result = self.generate_reliable_json(model, &catalog, options).await;
        errors.append(&mut result.errors);
        result.errors = errors;
        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    /// Direct parse, then fenced block, then first balanced brace span.
    pub fn parse_json_response(&self, text: &str) -> Option<ParsedJson> {
        let trimmed = text.trim();
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Some(ParsedJson {
                value,
                payload: trimmed.to_string(),
                method: ParseMethod::Direct,
            });
        }

        if let Some(value) = self.repair.extract_markdown(text) {
            let payload = serde_json::to_string(&value).unwrap_or_default();
            return Some(ParsedJson {
                value,
                payload,
                method: ParseMethod::Markdown,
            });
        }

        text.char_indices()
            .filter(|(_, c)| *c == '{' || *c == '[')
            .filter_map(|(i, _)| extract_balanced(text, i))
            .find_map(|span| {
                serde_json::from_str::<Value>(span).ok().map(|value| ParsedJson {
                    value,
                    payload: span.to_string(),
                    method: ParseMethod::BracePattern,
                })
            })
    }

    fn apply_fallback(&self, text: &str, strategy: FallbackStrategy) -> Option<ParsedJson> {
        match strategy {
            FallbackStrategy::Repair => {
                let repaired = self.repair.repair_json(text)?;
                debug!("Repaired JSON with {} step(s)", repaired.steps.len());
                Some(ParsedJson {
                    value: repaired.value,
                    payload: repaired.text,
                    method: ParseMethod::Repaired,
                })
            }
            FallbackStrategy::Extract => {
                let value = self
                    .repair
                    .extract_markdown(text)
                    .or_else(|| self.repair.extract_pattern(text))
                    .or_else(|| self.repair.extract_key_values(text))
                    .or_else(|| self.repair.extract_result_field(text))?;
                let payload = serde_json::to_string(&value).unwrap_or_default();
                Some(ParsedJson {
                    value,
                    payload,
                    method: ParseMethod::Extracted,
                })
            }
            FallbackStrategy::Regenerate => None,
        }
    }

    fn record(&self, model: &str, update: impl FnOnce(&mut ModelJsonPerformance)) {
        let mut perf = self.performance.lock().unwrap_or_else(|e| e.into_inner());
        update(perf.entry(model.to_string()).or_default());
    }

    /// Telemetry for one model.
    pub fn performance(&self, model: &str) -> Option<ModelJsonPerformance> {
        self.performance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(model)
            .copied()
    }

    /// Telemetry for every model seen so far.
    pub fn all_performance(&self) -> HashMap<String, ModelJsonPerformance> {
        self.performance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(200).collect();
    if text.chars().count() > 200 {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::model::{FinishReason, ModelCapabilities, ToolGeneration};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays scripted responses in order.
    struct Scripted {
        caps: ModelCapabilities,
        responses: Mutex<VecDeque<Result<String, ModelError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(responses: Vec<Result<String, ModelError>>) -> Self {
            Self {
                caps: ModelCapabilities::default(),
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn ok(responses: &[&str]) -> Self {
            Self::new(responses.iter().map(|r| Ok(r.to_string())).collect())
        }
    }

    #[async_trait]
    impl ModelAdapter for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn capabilities(&self) -> &ModelCapabilities {
            &self.caps
        }

        async fn generate_text(
            &self,
            prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("still no json".into()))
        }

        async fn generate_with_tools(
            &self,
            _prompt: &str,
            _tools: &[ToolDefinition],
            _options: &GenerateOptions,
        ) -> Result<ToolGeneration, ModelError> {
            let mut args = crate::Arguments::new();
            args.insert("path".into(), json!("."));
            Ok(ToolGeneration {
                text: String::new(),
                tool_calls: vec![ToolCall::new("list_directory", args)],
                finish_reason: FinishReason::ToolCalls,
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn direct_json_first_try() {
        let model = Scripted::ok(&[r#"{"users":["ann"]}"#]);
        let r#gen = ReliableJsonGenerator::new();
        let result = r#gen
            .generate_reliable_json(&model, "list users", &JsonGenerationOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"users": ["ann"]})));
        assert_eq!(result.attempts, 1);
        assert_eq!(result.method, Some(ParseMethod::Direct));
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn retries_then_succeeds_with_lower_confidence() {
        let model = Scripted::new(vec![
            Err(ModelError::Generation("overloaded".into())),
            Ok("Sure! ```json\n{\"ok\": true}\n```".into()),
        ]);
        let r#gen = ReliableJsonGenerator::new();
        let result = r#gen
            .generate_reliable_json(&model, "go", &JsonGenerationOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.method, Some(ParseMethod::Markdown));
        assert!(result.confidence < 0.8 + 1e-9);
        assert_eq!(result.errors.len(), 1);

        let perf = r#gen.performance("scripted").unwrap();
        assert_eq!(perf.attempts, 2);
        assert_eq!(perf.successes, 1);
        assert_eq!(perf.failures, 1);
        assert!(model.prompts.lock().unwrap()[1].contains("previous reply"));
    }

    #[tokio::test]
    async fn repair_fallback_recovers_malformed_json() {
        let model = Scripted::ok(&["{name: 'x', tags: ['a', 'b'],}"]);
        let r#gen = ReliableJsonGenerator::new();
        let result = r#gen
            .generate_reliable_json(&model, "go", &JsonGenerationOptions::default())
            .await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.data, Some(json!({"name": "x", "tags": ["a", "b"]})));
        assert_eq!(result.method, Some(ParseMethod::Repaired));
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn extract_fallback_reads_key_values() {
        let model = Scripted::ok(&["status: ok\ncount: 3"]);
        let r#gen = ReliableJsonGenerator::new();
        let options = JsonGenerationOptions::default().with_fallback(FallbackStrategy::Extract);
        let result = r#gen.generate_reliable_json(&model, "go", &options).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"status": "ok", "count": 3})));
    }

    #[tokio::test]
    async fn schema_mismatch_counts_as_failed_attempt() {
        let model = Scripted::ok(&[r#"{"age": "old"}"#, r#"{"age": 42}"#]);
        let r#gen = ReliableJsonGenerator::new();
        let options = JsonGenerationOptions::default().with_schema(json!({
            "type": "object",
            "properties": {"age": {"type": "integer"}},
            "required": ["age"]
        }));
        let result = r#gen.generate_reliable_json(&model, "go", &options).await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.errors[0].contains("schema validation failed"));
    }

    #[tokio::test]
    async fn exhaustion_returns_structured_failure() {
        let model = Scripted::ok(&[]);
        let r#gen = ReliableJsonGenerator::new();
        let options = JsonGenerationOptions::default().with_fallback(FallbackStrategy::Regenerate);
        let result = r#gen.generate_reliable_json(&model, "go", &options).await;
        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.errors.len(), 3);
        assert!(result.data.is_none());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let model = Scripted::ok(&["{}"]);
        let r#gen = ReliableJsonGenerator::new();
        let token = CancellationToken::new();
        token.cancel();
        let options = JsonGenerationOptions::default().with_cancel(token);
        let result = r#gen.generate_reliable_json(&model, "go", &options).await;
        assert!(!result.success);
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn native_tool_calls_are_wrapped() {
        let mut model = Scripted::ok(&[]);
        model.caps = ModelCapabilities::default().with_tool_calling(true);
        let r#gen = ReliableJsonGenerator::new();
        let result = r#gen
            .generate_with_tools(&model, "what's here?", &[], &JsonGenerationOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(result.method, Some(ParseMethod::NativeToolCall));
        let data = result.data.unwrap();
        assert_eq!(data["function_calls"][0]["name"], "list_directory");
        assert_eq!(data["function_calls"][0]["arguments"]["path"], ".");
    }

    #[tokio::test]
    async fn text_backends_get_the_catalog() {
        let model = Scripted::ok(&[r#"{"function_call": {"name": "ls", "arguments": {}}}"#]);
        let r#gen = ReliableJsonGenerator::new();
        let tools = vec![ToolDefinition::new("ls", "List", json!({"type": "object"}))];
        let result = r#gen
            .generate_with_tools(&model, "what's here?", &tools, &JsonGenerationOptions::default())
            .await;
        assert!(result.success);
        assert!(model.prompts.lock().unwrap()[0].contains("function_call"));
    }
}
