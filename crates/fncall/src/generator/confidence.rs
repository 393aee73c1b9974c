//! Confidence scoring for recovered JSON.

use serde::Serialize;
use serde_json::Value;

/// How the JSON payload was obtained from the raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMethod {
    Direct,
    Markdown,
    BracePattern,
    Repaired,
    Extracted,
    NativeToolCall,
}

/// Score in `[0, 1]` for a payload recovered from `raw` on attempt
/// `attempts` (1-based).
///
/// How the payload was recovered does not enter the score; it is reported
/// separately as [`ParseMethod`].
pub fn confidence_score(raw: &str, payload: &str, value: &Value, attempts: u32) -> f64 {
    let mut score = 1.0;
    score *= (1.0 - 0.2 * f64::from(attempts.saturating_sub(1))).max(0.3);

    if raw.contains("```") {
        score *= 0.9;
    }

    let raw_len = raw.trim().len();
    let payload_len = payload.trim().len();
    if raw_len > payload_len * 2 && raw_len - payload_len > 50 {
        score *= 0.8;
    }

    if serde_json::to_string(value).is_ok_and(|canonical| canonical == payload.trim()) {
        score *= 1.1;
    }

    score.clamp(0.0, 1.0)
}
