//! Extractive summarization of a message span.
//!
//! No model call: the summary is built from the first, middle, and last
//! sentences of the span, so output is deterministic for a given input.

use crate::Message;

/// Prefix of every synthetic summary message.
pub const SUMMARY_PREFIX: &str = "[Summary of";

/// Longest sentence carried into a summary, in characters.
const MAX_SENTENCE_CHARS: usize = 240;

/// Split text into sentences on `.`, `!`, `?` followed by whitespace, and on
/// newlines. Empty fragments are dropped.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                None => Some(i + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = boundary {
            if let Some(s) = text.get(start..end).map(str::trim)
                && !s.is_empty()
            {
                sentences.push(s);
            }
            start = end;
        }
    }
    if let Some(s) = text.get(start..).map(str::trim)
        && !s.is_empty()
    {
        sentences.push(s);
    }
    sentences
}

fn clip(sentence: &str) -> String {
    if sentence.chars().count() <= MAX_SENTENCE_CHARS {
        sentence.to_string()
    } else {
        let clipped: String = sentence.chars().take(MAX_SENTENCE_CHARS).collect();
        format!("{clipped}...")
    }
}

/// Summarize `span` from its first, middle, and last sentences.
pub fn extractive_summary(span: &[Message]) -> String {
    let sentences: Vec<&str> = span
        .iter()
        .flat_map(|m| split_sentences(&m.content))
        .collect();

    let mut picked: Vec<usize> = Vec::new();
    if !sentences.is_empty() {
        for idx in [0, sentences.len() / 2, sentences.len() - 1] {
            if !picked.contains(&idx) {
                picked.push(idx);
            }
        }
    }

    let body: Vec<String> = picked
        .into_iter()
        .filter_map(|i| sentences.get(i))
        .map(|s| clip(s))
        .collect();

    let noun = if span.len() == 1 { "message" } else { "messages" };
    if body.is_empty() {
        format!("{SUMMARY_PREFIX} {} earlier {noun}]", span.len())
    } else {
        format!("{SUMMARY_PREFIX} {} earlier {noun}] {}", span.len(), body.join(" ... "))
    }
}

/// A system message holding the extractive summary of `span`.
pub fn summary_message(span: &[Message]) -> Message {
    Message::system(extractive_summary(span))
}
