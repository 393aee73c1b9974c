//! Compression strategies.
//!
//! Every strategy sees the message list as three zones: a preserved head, a
//! compressible middle, and a preserved tail. Head and tail messages are
//! always copied through unmodified.

use super::summarizer::summary_message;
use crate::model::estimate_tokens;
use crate::{Message, MessageRole};
use serde::Serialize;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStrategy {
    /// Drop the oldest middle messages until under budget.
    Truncate,
    /// Replace the whole middle with one extractive summary.
    Summarize,
    /// Drop the least important middle messages, then summarize the older
    /// half of what remains if still over budget.
    Adaptive,
}

impl CompressionStrategy {
    /// Strategy for a 1-based attempt number.
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => CompressionStrategy::Truncate,
            2 => CompressionStrategy::Summarize,
            _ => CompressionStrategy::Adaptive,
        }
    }
}

impl fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionStrategy::Truncate => write!(f, "truncate"),
            CompressionStrategy::Summarize => write!(f, "summarize"),
            CompressionStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Limits a strategy works toward.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub preserve_first: usize,
    pub preserve_last: usize,
    pub target_tokens: usize,
    pub chars_per_token: f64,
}

/// A candidate message list and how many original messages it dropped or
/// folded into a summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub messages: Vec<Message>,
    pub removed: usize,
}

/// Index range of the compressible middle zone.
pub fn middle_range(len: usize, preserve_first: usize, preserve_last: usize) -> Range<usize> {
    let start = preserve_first.min(len);
    let end = len.saturating_sub(preserve_last).max(start);
    start..end
}

/// Heuristic importance of a message at `position` in a list of `total`.
///
/// System messages rank highest; recency, length, code, and questions all
/// raise the score.
pub fn importance_score(message: &Message, position: usize, total: usize) -> f64 {
    let content = &message.content;
    let mut score = match message.role {
        MessageRole::System => 10.0,
        MessageRole::User => 2.0,
        MessageRole::Assistant => 1.5,
        MessageRole::Tool => 1.0,
    };
    score += 3.0 * (position + 1) as f64 / total.max(1) as f64;
    score += (content.len() as f64 / 500.0).min(2.0);
    if ["```", "fn ", "function ", "def ", "class ", "=>"]
        .iter()
        .any(|marker| content.contains(marker))
    {
        score += 2.0;
    }
    if content.contains('?') {
        score += 1.5;
    }
    score
}

pub fn apply(strategy: CompressionStrategy, messages: &[Message], budget: &Budget) -> Compressed {
    let middle = middle_range(messages.len(), budget.preserve_first, budget.preserve_last);
    match strategy {
        CompressionStrategy::Truncate => truncate(messages, middle, budget),
        CompressionStrategy::Summarize => summarize(messages, middle),
        CompressionStrategy::Adaptive => adaptive(messages, middle, budget),
    }
}

fn assemble(messages: &[Message], middle: &Range<usize>, kept: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(middle.start + kept.len() + messages.len() - middle.end);
    out.extend_from_slice(&messages[..middle.start]);
    out.extend(kept);
    out.extend_from_slice(&messages[middle.end..]);
    out
}

fn over_budget(messages: &[Message], budget: &Budget) -> bool {
    estimate_tokens(messages, budget.chars_per_token) > budget.target_tokens
}

fn truncate(messages: &[Message], middle: Range<usize>, budget: &Budget) -> Compressed {
    let span = &messages[middle.clone()];
    let mut dropped = 0;
    let mut candidate = messages.to_vec();
    while dropped < span.len() && over_budget(&candidate, budget) {
        dropped += 1;
        candidate = assemble(messages, &middle, span[dropped..].to_vec());
    }
    Compressed {
        messages: candidate,
        removed: dropped,
    }
}

fn summarize(messages: &[Message], middle: Range<usize>) -> Compressed {
    let span = &messages[middle.clone()];
    if span.is_empty() {
        return Compressed {
            messages: messages.to_vec(),
            removed: 0,
        };
    }
    Compressed {
        messages: assemble(messages, &middle, vec![summary_message(span)]),
        removed: span.len(),
    }
}

fn adaptive(messages: &[Message], middle: Range<usize>, budget: &Budget) -> Compressed {
    let span = &messages[middle.clone()];
    let mut ranked: Vec<(usize, f64)> = span
        .iter()
        .enumerate()
        .map(|(i, m)| (i, importance_score(m, middle.start + i, messages.len())))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

    // Discard at most half the span by importance; summarization handles the rest.
    let mut dropped = vec![false; span.len()];
    let mut removed = 0;
    let keep = |dropped: &[bool]| -> Vec<Message> {
        span.iter()
            .zip(dropped)
            .filter(|(_, d)| !**d)
            .map(|(m, _)| m.clone())
            .collect()
    };
    for (i, _) in ranked.iter().take(span.len().div_ceil(2)) {
        if !over_budget(&assemble(messages, &middle, keep(&dropped)), budget) {
            break;
        }
        dropped[*i] = true;
        removed += 1;
    }

    let kept = keep(&dropped);
    let mut candidate = assemble(messages, &middle, kept.clone());
    if over_budget(&candidate, budget) && kept.len() >= 2 {
        let (older, newer) = kept.split_at(kept.len() / 2);
        let mut folded = vec![summary_message(older)];
        folded.extend_from_slice(newer);
        removed += older.len();
        candidate = assemble(messages, &middle, folded);
    }
    Compressed {
        messages: candidate,
        removed,
    }
}
