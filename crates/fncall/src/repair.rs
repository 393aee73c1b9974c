//! Tolerant recovery of function calls from malformed model output.
//!
//! [`JsonRepairParser::repair_and_parse`] runs a fixed sequence of text
//! transformations over the response, testing for a recognizable call after
//! every step and carrying the transformed text forward. When every step is
//! spent, a last pass looks for informal phrasings such as
//! `Execute tool: read_file with arguments: {"path": "/a"}`.
//!
//! The parser never fails: the [`RepairResult`] reports whether anything was
//! recovered along with the steps applied and the diagnostics gathered.

use crate::protocol::json::{JsonToolProvider, extract_balanced};
use crate::protocol::parse_parameter_value;
use crate::{ToolCall, ToolFormat};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, trace};

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("valid regex"));

static UNQUOTED_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_\-]*)(\s*:)").expect("valid regex")
});

static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

static DOUBLED_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(?:\s*,)+").expect("valid regex"));

static BARE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*"name"\s*:"#).expect("valid regex"));

// Call shapes embedded in markdown or prose.
static MARKDOWN_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)```(?:json)?\s*(\{.*?"(?:function_call|name)".*?\})\s*```"#)
        .expect("valid regex")
});

static PROSE_ENVELOPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"function_call"\s*:"#).expect("valid regex"));

static PROSE_NAMED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\s*"name"\s*:\s*"[^"]+"\s*,\s*"(?:arguments|parameters)"\s*:"#)
        .expect("valid regex")
});

// Informal phrasings.
static EXECUTE_TOOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)execute\s+(?:the\s+)?tool\s*:?\s*["'`]?([A-Za-z_][\w.\-]*)["'`]?\s+with\s+(?:the\s+)?arguments\s*:?\s*"#,
    )
    .expect("valid regex")
});

static CALL_TOOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\bcall\s+(?:the\s+)?(?:tool\s+)?["'`]?([A-Za-z_][\w.\-]*)["'`]?\s+(?:with\s+)?(?:the\s+)?arguments?\s*:?\s*"#,
    )
    .expect("valid regex")
});

// Loose extractors.
static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*[-*]?\s*["']?([A-Za-z_][\w\- ]*?)["']?\s*[:=]\s*(.+?)\s*,?\s*$"#)
        .expect("valid regex")
});

static RESULT_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b"?result"?\s*[:=]\s*"#).expect("valid regex"));

// ── Repair steps ───────────────────────────────────────────────────

/// One text transformation in the repair pipeline, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    UnwrapFences,
    ExtractObject,
    QuoteKeys,
    StripTrailingCommas,
    NormalizeQuotes,
    InsertMissingCommas,
    WrapBareFragment,
    CollapseCommas,
}

impl RepairStep {
    pub const PIPELINE: [RepairStep; 8] = [
        RepairStep::UnwrapFences,
        RepairStep::ExtractObject,
        RepairStep::QuoteKeys,
        RepairStep::StripTrailingCommas,
        RepairStep::NormalizeQuotes,
        RepairStep::InsertMissingCommas,
        RepairStep::WrapBareFragment,
        RepairStep::CollapseCommas,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RepairStep::UnwrapFences => "unwrap_fences",
            RepairStep::ExtractObject => "extract_object",
            RepairStep::QuoteKeys => "quote_keys",
            RepairStep::StripTrailingCommas => "strip_trailing_commas",
            RepairStep::NormalizeQuotes => "normalize_quotes",
            RepairStep::InsertMissingCommas => "insert_missing_commas",
            RepairStep::WrapBareFragment => "wrap_bare_fragment",
            RepairStep::CollapseCommas => "collapse_commas",
        }
    }

    pub fn apply(self, text: &str) -> String {
        match self {
            RepairStep::UnwrapFences => unwrap_fences(text),
            RepairStep::ExtractObject => extract_object(text),
            RepairStep::QuoteKeys => map_outside_strings(text, |seg| {
                UNQUOTED_KEY_RE.replace_all(seg, "$1\"$2\"$3").into_owned()
            }),
            RepairStep::StripTrailingCommas => map_outside_strings(text, |seg| {
                TRAILING_COMMA_RE.replace_all(seg, "$1").into_owned()
            }),
            RepairStep::NormalizeQuotes => normalize_quotes(text),
            RepairStep::InsertMissingCommas => insert_missing_commas(text),
            RepairStep::WrapBareFragment => wrap_bare_fragment(text),
            RepairStep::CollapseCommas => map_outside_strings(text, |seg| {
                DOUBLED_COMMA_RE.replace_all(seg, ",").into_owned()
            }),
        }
    }
}

fn unwrap_fences(text: &str) -> String {
    match FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => text.to_string(),
    }
}

fn extract_object(text: &str) -> String {
    let Some(start) = text.find('{') else {
        return text.to_string();
    };
    let prefix = text.get(..start).unwrap_or_default();
    // A bare `"name": ..` fragment is wrapped later, not cut down to its
    // arguments object.
    if BARE_NAME_RE.is_match(prefix) {
        return text.to_string();
    }
    if let Some(object) = extract_balanced(text, start) {
        return object.to_string();
    }
    // Unbalanced: keep through the last closing brace, or everything after
    // the opening one if it never closes.
    match text.rfind('}') {
        Some(end) if end > start => text.get(start..=end).unwrap_or(text).to_string(),
        _ => text.get(start..).unwrap_or(text).trim_end().to_string(),
    }
}

fn wrap_bare_fragment(text: &str) -> String {
    let trimmed = text.trim();
    if BARE_NAME_RE.is_match(trimmed) {
        format!("{{{trimmed}}}")
    } else {
        text.to_string()
    }
}

/// Apply `f` to every span of `text` outside double-quoted string literals.
fn map_outside_strings(text: &str, f: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                out.push_str(text.get(segment_start..=i).unwrap_or_default());
                segment_start = i + 1;
            }
        } else if ch == '"' {
            out.push_str(&f(text.get(segment_start..i).unwrap_or_default()));
            in_string = true;
            segment_start = i;
        }
    }
    let tail = text.get(segment_start..).unwrap_or_default();
    if in_string {
        out.push_str(tail);
    } else {
        out.push_str(&f(tail));
    }
    out
}

/// Turn single-quoted strings into double-quoted ones, escaping any double
/// quotes they contain.
fn normalize_quotes(text: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Outside,
        Double,
        Single,
    }
    let mut out = String::with_capacity(text.len());
    let mut state = State::Outside;
    let mut escaped = false;
    for ch in text.chars() {
        match state {
            State::Outside => match ch {
                '"' => {
                    state = State::Double;
                    out.push(ch);
                }
                '\'' => {
                    state = State::Single;
                    out.push('"');
                }
                _ => out.push(ch),
            },
            State::Double => {
                out.push(ch);
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    state = State::Outside;
                }
            }
            State::Single => {
                if escaped {
                    escaped = false;
                    // `\'` needs no escape once the delimiter is `"`.
                    if ch == '\'' {
                        out.pop();
                    }
                    out.push(ch);
                } else if ch == '\\' {
                    escaped = true;
                    out.push(ch);
                } else if ch == '\'' {
                    state = State::Outside;
                    out.push('"');
                } else if ch == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(ch);
                }
            }
        }
    }
    out
}

/// Insert a comma between a completed value and a following string, object
/// or array when no separator is present.
fn insert_missing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    // Byte offset in `out` just past the last completed value, if the last
    // significant token outside a string was one.
    let mut value_end: Option<usize> = None;
    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                value_end = Some(out.len());
            }
            continue;
        }
        if ch.is_whitespace() {
            out.push(ch);
            continue;
        }
        if let Some(end) = value_end
            && matches!(ch, '"' | '{' | '[')
        {
            out.insert(end, ',');
        }
        out.push(ch);
        value_end = match ch {
            '"' => {
                in_string = true;
                None
            }
            '}' | ']' => Some(out.len()),
            c if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+' => Some(out.len()),
            _ => None,
        };
    }
    out
}

// ── Shape tests ────────────────────────────────────────────────────

/// Calls carried by a decoded value in one of the recognized shapes:
/// a `function_call(s)` envelope or an object with both `name` and
/// `arguments`.
fn calls_in_value(value: &Value) -> Vec<ToolCall> {
    match value {
        Value::Array(items) => items.iter().flat_map(calls_in_value).collect(),
        Value::Object(map) => {
            let envelope = ["function_call", "function_calls", "tool_calls"]
                .iter()
                .any(|k| map.contains_key(*k));
            let named = map.contains_key("name")
                && (map.contains_key("arguments") || map.contains_key("parameters"));
            if envelope || named {
                JsonToolProvider::calls_from_value(value)
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    }
}

/// Test `text` against both JSON shapes and the three embedded patterns.
fn detect_calls(text: &str) -> Vec<ToolCall> {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        let calls = calls_in_value(&value);
        if !calls.is_empty() {
            return calls;
        }
    }

    for cap in MARKDOWN_CALL_RE.captures_iter(text) {
        let Some(inner) = cap.get(1) else { continue };
        if let Some(object) = extract_balanced(inner.as_str(), 0)
            && let Ok(value) = serde_json::from_str::<Value>(object)
        {
            let calls = calls_in_value(&value);
            if !calls.is_empty() {
                return calls;
            }
        }
    }

    for re in [&*PROSE_ENVELOPE_RE, &*PROSE_NAMED_RE] {
        for m in re.find_iter(text) {
            if let Some(object) = extract_balanced(text, m.start())
                && let Ok(value) = serde_json::from_str::<Value>(object)
            {
                let calls = calls_in_value(&value);
                if !calls.is_empty() {
                    return calls;
                }
            }
        }
    }
    Vec::new()
}

fn parse_informal(text: &str) -> Option<ToolCall> {
    for re in [&*EXECUTE_TOOL_RE, &*CALL_TOOL_RE] {
        for cap in re.captures_iter(text) {
            let Some(whole) = cap.get(0) else { continue };
            let rest = text.get(whole.end()..).unwrap_or_default();
            if let Some(span) = extract_balanced(rest, 0)
                && let Ok(Value::Object(arguments)) = serde_json::from_str::<Value>(span)
            {
                return Some(ToolCall::new(cap[1].trim(), arguments).with_format(ToolFormat::Json));
            }
        }
    }
    None
}

// ── Parser ─────────────────────────────────────────────────────────

/// Outcome of [`JsonRepairParser::repair_and_parse`].
#[derive(Debug, Clone, Serialize)]
pub struct RepairResult {
    pub success: bool,
    pub function_calls: Vec<ToolCall>,
    /// The text as finally transformed.
    pub repaired_text: String,
    /// Steps that changed the text, in order.
    pub attempts: Vec<String>,
    pub errors: Vec<String>,
}

/// A JSON value recovered by [`JsonRepairParser::repair_json`].
#[derive(Debug, Clone)]
pub struct RepairedJson {
    pub value: Value,
    pub text: String,
    pub steps: Vec<RepairStep>,
}

/// Best-effort recovery of function calls and JSON values from malformed
/// text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRepairParser;

impl JsonRepairParser {
    pub fn new() -> Self {
        Self
    }

    /// Recover function calls from `input`.
    pub fn repair_and_parse(&self, input: &str) -> RepairResult {
        let mut attempts = Vec::new();
        let mut errors = Vec::new();

        let calls = detect_calls(input);
        if !calls.is_empty() {
            return RepairResult {
                success: true,
                function_calls: calls,
                repaired_text: input.to_string(),
                attempts,
                errors,
            };
        }

        let mut current = input.trim().to_string();
        for step in RepairStep::PIPELINE {
            let next = step.apply(&current);
            if next == current {
                continue;
            }
            trace!("repair step {}: {}", step.name(), preview(&next));
            attempts.push(step.name().to_string());
            current = next;

            let calls = detect_calls(&current);
            if !calls.is_empty() {
                debug!("Recovered {} call(s) after {}", calls.len(), step.name());
                return RepairResult {
                    success: true,
                    function_calls: calls,
                    repaired_text: current,
                    attempts,
                    errors,
                };
            }
            if let Err(e) = serde_json::from_str::<Value>(&current) {
                errors.push(format!("{}: {e}", step.name()));
            }
        }

        attempts.push("informal_phrasing".into());
        if let Some(call) = parse_informal(input) {
            debug!("Recovered call '{}' from informal phrasing", call.name);
            return RepairResult {
                success: true,
                function_calls: vec![call],
                repaired_text: current,
                attempts,
                errors,
            };
        }

        errors.push("no function call recognized after all repair steps".into());
        RepairResult {
            success: false,
            function_calls: Vec::new(),
            repaired_text: current,
            attempts,
            errors,
        }
    }

    /// Run the transformation pipeline until the text decodes as any JSON
    /// value, regardless of shape.
    pub fn repair_json(&self, input: &str) -> Option<RepairedJson> {
        let mut current = input.trim().to_string();
        let mut steps = Vec::new();
        if let Ok(value) = serde_json::from_str(&current) {
            return Some(RepairedJson {
                value,
                text: current,
                steps,
            });
        }
        for step in RepairStep::PIPELINE {
            let next = step.apply(&current);
            if next == current {
                continue;
            }
            steps.push(step);
            current = next;
            if let Ok(value) = serde_json::from_str(&current) {
                return Some(RepairedJson {
                    value,
                    text: current,
                    steps,
                });
            }
        }
        None
    }

    // ── Extractors ─────────────────────────────────────────────────

    /// First fenced block that decodes as JSON.
    pub fn extract_markdown(&self, text: &str) -> Option<Value> {
        FENCE_RE
            .captures_iter(text)
            .filter_map(|cap| cap.get(1))
            .find_map(|m| serde_json::from_str(m.as_str().trim()).ok())
    }

    /// First balanced `{..}` or `[..]` span that decodes as JSON.
    pub fn extract_pattern(&self, text: &str) -> Option<Value> {
        text.char_indices()
            .filter(|(_, c)| *c == '{' || *c == '[')
            .filter_map(|(i, _)| extract_balanced(text, i))
            .find_map(|span| serde_json::from_str(span).ok())
    }

    /// `key: value` or `key = value` lines collected into an object.
    pub fn extract_key_values(&self, text: &str) -> Option<Value> {
        let mut map = serde_json::Map::new();
        for cap in KEY_VALUE_RE.captures_iter(text) {
            let key = cap[1].trim().to_string();
            let raw = cap[2].trim();
            let value = match raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
                Some(inner) => Value::String(inner.to_string()),
                None => parse_parameter_value(raw),
            };
            map.entry(key).or_insert(value);
        }
        (!map.is_empty()).then_some(Value::Object(map))
    }

    /// The value following a `result:` label.
    pub fn extract_result_field(&self, text: &str) -> Option<Value> {
        let m = RESULT_FIELD_RE.find(text)?;
        let rest = text.get(m.end()..)?.trim_start();
        if let Some(span) = extract_balanced(rest, 0)
            && let Ok(value) = serde_json::from_str(span)
        {
            return Some(value);
        }
        let line = rest.lines().next()?.trim().trim_end_matches(',');
        (!line.is_empty()).then(|| parse_parameter_value(line))
    }
}

fn preview(text: &str) -> String {
    let head: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        format!("{head}...")
    } else {
        head
    }
}
