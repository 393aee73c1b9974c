//! Context window management.
//!
//! [`SmartContextManager`] keeps a conversation under a utilization ceiling.
//! When a check finds the context over the ceiling it tries up to
//! `max_compression_attempts` strategies, escalating by attempt:
//!
//! 1. [`CompressionStrategy::Truncate`] drops the oldest middle messages.
//! 2. [`CompressionStrategy::Summarize`] folds the middle into one
//!    extractive summary.
//! 3. [`CompressionStrategy::Adaptive`] drops the least important middle
//!    messages and summarizes part of the rest.
//!
//! Each attempt starts from the original messages. The first candidate at or
//! under the ceiling replaces the live context; if none qualifies the context
//! is left as it was.

pub mod metrics;
pub mod strategies;
pub mod summarizer;

pub use metrics::CompressionMetrics;
pub use strategies::{Budget, CompressionStrategy, importance_score};
pub use summarizer::extractive_summary;

use crate::Message;
use crate::model::{DEFAULT_CHARS_PER_TOKEN, ModelContext, estimate_tokens};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ContextManagerConfig {
    /// Utilization above which compression runs.
    pub utilization_ceiling: f64,
    /// Utilization compression aims for.
    pub target_utilization: f64,
    /// Leading messages never dropped or summarized.
    pub preserve_first: usize,
    /// Trailing messages never dropped or summarized.
    pub preserve_last: usize,
    /// Strategies tried before compression reports failure.
    pub max_compression_attempts: u32,
    /// Divisor used by the character-based token estimate.
    pub chars_per_token: f64,
}

impl Default for ContextManagerConfig {
    fn default() -> Self {
        Self {
            utilization_ceiling: 0.85,
            target_utilization: 0.5,
            preserve_first: 2,
            preserve_last: 4,
            max_compression_attempts: 3,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl ContextManagerConfig {
    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.utilization_ceiling = ceiling;
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target_utilization = target;
        self
    }

    pub fn with_preserve(mut self, first: usize, last: usize) -> Self {
        self.preserve_first = first;
        self.preserve_last = last;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_compression_attempts = attempts;
        self
    }

    pub fn with_chars_per_token(mut self, chars_per_token: f64) -> Self {
        self.chars_per_token = chars_per_token;
        self
    }
}

/// What a compression check did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionOutcome {
    /// `false` only when compression was needed and every attempt failed.
    pub success: bool,
    /// Whether the live context was rebuilt.
    pub compressed: bool,
    /// Strategy that produced the kept context, if any ran.
    pub strategy: Option<CompressionStrategy>,
    /// Strategies tried.
    pub attempts: u32,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_removed: usize,
    /// Fraction of the model's context window, before and after.
    pub utilization_before: f64,
    pub utilization_after: f64,
    /// Why the last attempt failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SmartContextManager {
    config: ContextManagerConfig,
    metrics: Mutex<CompressionMetrics>,
}

impl SmartContextManager {
    pub fn new(config: ContextManagerConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(CompressionMetrics::default()),
        }
    }

    pub fn config(&self) -> &ContextManagerConfig {
        &self.config
    }

    fn measure(&self, messages: &[Message]) -> usize {
        estimate_tokens(messages, self.config.chars_per_token)
    }

    fn ratio(&self, tokens: usize, max_tokens: usize) -> f64 {
        if max_tokens == 0 {
            return 0.0;
        }
        tokens as f64 / max_tokens as f64
    }

    /// Fraction of `max_tokens` the context currently uses. Zero when
    /// `max_tokens` is zero.
    pub fn utilization(&self, context: &dyn ModelContext, max_tokens: usize) -> f64 {
        self.ratio(self.measure(context.messages()), max_tokens)
    }

    pub fn needs_compression(&self, context: &dyn ModelContext, max_tokens: usize) -> bool {
        self.utilization(context, max_tokens) > self.config.utilization_ceiling
    }

    /// Compress the context if it is over the ceiling.
    pub fn check_and_compress(
        &self,
        context: &mut dyn ModelContext,
        max_tokens: usize,
    ) -> CompressionOutcome {
        let tokens = self.measure(context.messages());
        let utilization = self.ratio(tokens, max_tokens);
        if utilization <= self.config.utilization_ceiling {
            return CompressionOutcome {
                success: true,
                compressed: false,
                strategy: None,
                attempts: 0,
                tokens_before: tokens,
                tokens_after: tokens,
                messages_removed: 0,
                utilization_before: utilization,
                utilization_after: utilization,
                error: None,
            };
        }
        self.compress(context, max_tokens)
    }

    /// Run the escalating strategies regardless of current utilization.
    pub fn compress(
        &self,
        context: &mut dyn ModelContext,
        max_tokens: usize,
    ) -> CompressionOutcome {
        let original: Vec<Message> = context.messages().to_vec();
        let tokens_before = self.measure(&original);
        let utilization_before = self.ratio(tokens_before, max_tokens);
        let budget = Budget {
            preserve_first: self.config.preserve_first,
            preserve_last: self.config.preserve_last,
            target_tokens: (self.config.target_utilization * max_tokens as f64).floor() as usize,
            chars_per_token: self.config.chars_per_token,
        };
        info!(
            "Compressing context {} ({tokens_before} tokens, {:.0}% of {max_tokens})",
            context.id(),
            utilization_before * 100.0
        );

        let mut attempts = 0;
        while attempts < self.config.max_compression_attempts {
            attempts += 1;
            let strategy = CompressionStrategy::for_attempt(attempts);
            let candidate = strategies::apply(strategy, &original, &budget);
            let tokens_after = self.measure(&candidate.messages);
            let utilization_after = self.ratio(tokens_after, max_tokens);
            debug!(
                "Compression attempt {attempts} ({strategy}): {tokens_before} -> {tokens_after} tokens"
            );
            if utilization_after > self.config.utilization_ceiling {
                continue;
            }

            let bytes_before: usize = original.iter().map(|m| m.content.len()).sum();
            let bytes_after: usize = candidate.messages.iter().map(|m| m.content.len()).sum();
            context.clear();
            for message in candidate.messages {
                context.add_message(message);
            }

            let ratio = if tokens_before == 0 {
                1.0
            } else {
                tokens_after as f64 / tokens_before as f64
            };
            self.metrics.lock().unwrap_or_else(|e| e.into_inner()).record(
                candidate.removed,
                bytes_before.saturating_sub(bytes_after),
                ratio,
            );
            info!(
                "Context compressed with {strategy}: {tokens_before} -> {tokens_after} tokens, {} message(s) removed",
                candidate.removed
            );
            return CompressionOutcome {
                success: true,
                compressed: true,
                strategy: Some(strategy),
                attempts,
                tokens_before,
                tokens_after,
                messages_removed: candidate.removed,
                utilization_before,
                utilization_after,
                error: None,
            };
        }

        let error = format!(
            "Unable to bring utilization under {:.0}% after {attempts} attempt(s)",
            self.config.utilization_ceiling * 100.0
        );
        warn!("{error}");
        CompressionOutcome {
            success: false,
            compressed: false,
            strategy: None,
            attempts,
            tokens_before,
            tokens_after: tokens_before,
            messages_removed: 0,
            utilization_before,
            utilization_after: utilization_before,
            error: Some(error),
        }
    }

    pub fn metrics(&self) -> CompressionMetrics {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
