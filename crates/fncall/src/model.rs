//! Model backend contract.
//!
//! The core never speaks a backend's wire protocol. Adapters implement
//! [`ModelAdapter`]; conversations live in a [`ModelContext`] the adapter
//! hands out. [`ConversationContext`] is the stock in-memory context.

use crate::bias::BiasMap;
use crate::error::ModelError;
use crate::{Message, MessageRole, ToolCall, ToolDefinition, ToolFormat, generate_id};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default characters per token for context estimates.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

// ── Capabilities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u32>,
}

/// Static description of what a backend supports. One per backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports_tool_calling: bool,
    pub supports_streaming: bool,
    pub supports_system_prompts: bool,
    pub supports_json_mode: bool,
    pub supports_logit_bias: bool,
    /// Context window in tokens.
    pub max_context_size: usize,
    pub preferred_tool_format: ToolFormat,
    pub rate_limits: Option<RateLimits>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            supports_tool_calling: false,
            supports_streaming: false,
            supports_system_prompts: true,
            supports_json_mode: false,
            supports_logit_bias: false,
            max_context_size: 8192,
            preferred_tool_format: ToolFormat::Xml,
            rate_limits: None,
        }
    }
}

impl ModelCapabilities {
    pub fn with_tool_calling(mut self, enabled: bool) -> Self {
        self.supports_tool_calling = enabled;
        self
    }

    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.supports_streaming = enabled;
        self
    }

    pub fn with_json_mode(mut self, enabled: bool) -> Self {
        self.supports_json_mode = enabled;
        self
    }

    pub fn with_logit_bias(mut self, enabled: bool) -> Self {
        self.supports_logit_bias = enabled;
        self
    }

    pub fn with_max_context_size(mut self, tokens: usize) -> Self {
        self.max_context_size = tokens;
        self
    }

    pub fn with_preferred_tool_format(mut self, format: ToolFormat) -> Self {
        self.preferred_tool_format = format;
        self
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = Some(limits);
        self
    }
}

// ── Generation options and outputs ─────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Per-request generation options.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub format: ResponseFormat,
    pub stop: Vec<String>,
    pub logit_bias: Option<BiasMap>,
    /// Cooperative cancellation; backends are expected to observe it.
    pub cancel: Option<CancellationToken>,
}

impl GenerateOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_logit_bias(mut self, bias: BiasMap) -> Self {
        self.logit_bias = Some(bias);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Output of a native tool-calling generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolGeneration {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

// ── Streaming ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(String),
    Completed(String),
    Error(String),
}

/// Receiving half of a streamed generation.
pub struct StreamHandle {
    pub receiver: mpsc::Receiver<StreamEvent>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn new(receiver: mpsc::Receiver<StreamEvent>) -> Self {
        Self { receiver }
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, ModelError> {
        let mut full_text = String::new();
        while let Some(event) = self.receiver.recv().await {
            match event {
                StreamEvent::Delta(chunk) => full_text.push_str(&chunk),
                StreamEvent::Completed(text) => {
                    if full_text.is_empty() {
                        return Ok(text);
                    }
                    return Ok(full_text);
                }
                StreamEvent::Error(e) => return Err(ModelError::Generation(e)),
            }
        }
        Ok(full_text)
    }
}

// ── Health ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub status: HealthStatus,
    pub latency: Option<Duration>,
    pub issues: Vec<String>,
}

impl ModelHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency: None,
            issues: Vec::new(),
        }
    }
}

// ── Context ────────────────────────────────────────────────────────

/// An ordered conversation owned by one caller.
pub trait ModelContext: Send + Sync {
    fn id(&self) -> &str;
    fn messages(&self) -> &[Message];
    fn add_message(&mut self, message: Message);
    fn clear(&mut self);
    /// Estimated tokens currently held.
    fn token_count(&self) -> usize;

    /// The conversation rendered as a plain-text transcript prompt.
    fn transcript(&self) -> String {
        let mut out = String::new();
        for msg in self.messages() {
            let label = match msg.role {
                MessageRole::System => "System",
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::Tool => "Tool",
            };
            out.push_str(label);
            out.push_str(": ");
            out.push_str(&msg.content);
            out.push_str("\n\n");
        }
        out.push_str("Assistant:");
        out
    }
}

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub system_prompt: Option<String>,
    pub chars_per_token: f64,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl ContextOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_chars_per_token(mut self, chars_per_token: f64) -> Self {
        self.chars_per_token = chars_per_token;
        self
    }
}

/// In-memory [`ModelContext`] with a chars-per-token estimate.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    id: String,
    messages: Vec<Message>,
    chars_per_token: f64,
}

impl ConversationContext {
    pub fn new(options: &ContextOptions) -> Self {
        let mut ctx = Self {
            id: generate_id("ctx"),
            messages: Vec::new(),
            chars_per_token: options.chars_per_token,
        };
        if let Some(ref prompt) = options.system_prompt {
            ctx.messages.push(Message::system(prompt.clone()));
        }
        ctx
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new(&ContextOptions::default())
    }
}

impl ModelContext for ConversationContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    fn clear(&mut self) {
        self.messages.clear();
    }

    fn token_count(&self) -> usize {
        estimate_tokens(&self.messages, self.chars_per_token)
    }
}

/// Estimated tokens for a message list.
pub fn estimate_tokens(messages: &[Message], chars_per_token: f64) -> usize {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (chars as f64 / chars_per_token.max(0.1)).ceil() as usize
}

// ── Adapter ────────────────────────────────────────────────────────

/// A language-model backend.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &ModelCapabilities;

    async fn generate_text(&self, prompt: &str, options: &GenerateOptions)
    -> Result<String, ModelError>;

    /// Streamed generation. The default runs [`generate_text`] and emits the
    /// whole text as one `Completed` event.
    ///
    /// [`generate_text`]: ModelAdapter::generate_text
    async fn generate_text_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<StreamHandle, ModelError> {
        let text = self.generate_text(prompt, options).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(StreamEvent::Completed(text)).await;
        Ok(StreamHandle::new(rx))
    }

    /// Native tool calling. Only called when
    /// `capabilities().supports_tool_calling` is set.
    async fn generate_with_tools(
        &self,
        _prompt: &str,
        _tools: &[ToolDefinition],
        _options: &GenerateOptions,
    ) -> Result<ToolGeneration, ModelError> {
        Err(ModelError::Unsupported("native tool calling"))
    }

    fn create_context(&self, options: &ContextOptions) -> Box<dyn ModelContext> {
        Box::new(ConversationContext::new(options))
    }

    async fn health(&self) -> ModelHealth {
        ModelHealth::healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        caps: ModelCapabilities,
    }

    #[async_trait]
    impl ModelAdapter for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> &ModelCapabilities {
            &self.caps
        }

        async fn generate_text(
            &self,
            prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            Ok(format!("echo: {prompt}"))
        }
    }

    #[tokio::test]
    async fn default_stream_wraps_text() {
        let model = Echo {
            caps: ModelCapabilities::default(),
        };
        let stream = model
            .generate_text_stream("hi", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.collect_text().await.unwrap(), "echo: hi");
    }

    #[tokio::test]
    async fn default_tool_generation_is_unsupported() {
        let model = Echo {
            caps: ModelCapabilities::default(),
        };
        let err = model
            .generate_with_tools("hi", &[], &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Unsupported(_)));
        assert_eq!(model.health().await.status, HealthStatus::Healthy);
    }

    #[test]
    fn context_tracks_messages_and_tokens() {
        let options = ContextOptions::default().with_system_prompt("sys!");
        let mut ctx = ConversationContext::new(&options);
        assert_eq!(ctx.messages().len(), 1);
        ctx.add_message(Message::user("a".repeat(16)));
        // 20 chars at 4 chars/token.
        assert_eq!(ctx.token_count(), 5);
        assert!(ctx.transcript().ends_with("Assistant:"));
        ctx.clear();
        assert_eq!(ctx.token_count(), 0);
    }

    #[test]
    fn cancellation_is_observable() {
        let token = CancellationToken::new();
        let opts = GenerateOptions::default().with_cancel(token.clone());
        assert!(!opts.is_cancelled());
        token.cancel();
        assert!(opts.is_cancelled());
    }
}
