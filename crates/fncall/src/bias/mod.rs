//! Decoding-time logit biases that steer a model toward valid JSON.
//!
//! [`LogitBiasCalculator::generate_json_bias`] composes three additive
//! sources, clamping to `[-100, 100]` after each one:
//!
//! 1. the structural toggles (boost JSON structure, suppress breaking tokens),
//! 2. per-value overrides (e.g. favor `true`/`false`/`null`),
//! 3. explicit biases keyed by token id or token text.
//!
//! [`LogitBiasCalculator::generate_contextual_bias`] layers position-specific
//! nudges on top, driven by [`detect_json_context`] on the partial output.

mod context;
mod vocab;

pub use context::{JsonContext, detect_json_context};
pub use vocab::{INVALID_TOKENS, STRUCTURAL_TOKENS, TokenVocab, VALUE_START_TOKENS};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::trace;

pub const MAX_BIAS: f64 = 100.0;
pub const MIN_BIAS: f64 = -100.0;

/// Token id to bias. Ordered so output is deterministic.
pub type BiasMap = BTreeMap<u32, f64>;

pub fn clamp_bias(value: f64) -> f64 {
    value.clamp(MIN_BIAS, MAX_BIAS)
}

// ── Configuration ──────────────────────────────────────────────────

/// Named strength levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BiasPreset {
    Light,
    #[default]
    Moderate,
    Aggressive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogitBiasConfig {
    /// Explicit bias by token id.
    pub token_bias: HashMap<u32, f64>,
    /// Explicit bias by token text; unknown text is interned.
    pub text_bias: HashMap<String, f64>,
    pub boost_structural: bool,
    pub suppress_invalid: bool,
    /// Added to every structural token when `boost_structural` is set.
    pub structural_boost: f64,
    /// Added to every invalid token when `suppress_invalid` is set.
    pub invalid_penalty: f64,
    /// Per-value overrides keyed by token text.
    pub value_bias: HashMap<String, f64>,
}

impl Default for LogitBiasConfig {
    fn default() -> Self {
        Self::moderate()
    }
}

impl LogitBiasConfig {
    /// No sources enabled.
    pub fn none() -> Self {
        Self {
            token_bias: HashMap::new(),
            text_bias: HashMap::new(),
            boost_structural: false,
            suppress_invalid: false,
            structural_boost: 0.0,
            invalid_penalty: 0.0,
            value_bias: HashMap::new(),
        }
    }

    pub fn light() -> Self {
        Self {
            boost_structural: true,
            suppress_invalid: true,
            structural_boost: 5.0,
            invalid_penalty: -10.0,
            ..Self::none()
        }
    }

    pub fn moderate() -> Self {
        let value_bias = ["true", "false", "null"]
            .iter()
            .map(|t| (t.to_string(), 5.0))
            .collect();
        Self {
            boost_structural: true,
            suppress_invalid: true,
            structural_boost: 10.0,
            invalid_penalty: -50.0,
            value_bias,
            ..Self::none()
        }
    }

    pub fn aggressive() -> Self {
        let value_bias = ["true", "false", "null"]
            .iter()
            .map(|t| (t.to_string(), 10.0))
            .collect();
        Self {
            boost_structural: true,
            suppress_invalid: true,
            structural_boost: 20.0,
            invalid_penalty: -100.0,
            value_bias,
            ..Self::none()
        }
    }

    pub fn preset(preset: BiasPreset) -> Self {
        match preset {
            BiasPreset::Light => Self::light(),
            BiasPreset::Moderate => Self::moderate(),
            BiasPreset::Aggressive => Self::aggressive(),
        }
    }

    pub fn with_token_bias(mut self, id: u32, bias: f64) -> Self {
        self.token_bias.insert(id, bias);
        self
    }

    pub fn with_text_bias(mut self, token: impl Into<String>, bias: f64) -> Self {
        self.text_bias.insert(token.into(), bias);
        self
    }

    pub fn with_value_bias(mut self, token: impl Into<String>, bias: f64) -> Self {
        self.value_bias.insert(token.into(), bias);
        self
    }
}

/// Boost and penalty applied in one parse position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextNudge {
    pub boost: f64,
    pub penalty: f64,
}

impl ContextNudge {
    pub const fn new(boost: f64, penalty: f64) -> Self {
        Self { boost, penalty }
    }
}

/// Strengths for [`LogitBiasCalculator::generate_contextual_bias`], keyed by
/// parse position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextualBiasConfig {
    pub in_object: ContextNudge,
    pub in_array: ContextNudge,
    pub in_string: ContextNudge,
    pub in_value: ContextNudge,
    pub at_root: ContextNudge,
}

impl Default for ContextualBiasConfig {
    fn default() -> Self {
        Self {
            in_object: ContextNudge::new(5.0, -20.0),
            in_array: ContextNudge::new(5.0, -20.0),
            in_string: ContextNudge::new(5.0, -10.0),
            in_value: ContextNudge::new(3.0, -10.0),
            at_root: ContextNudge::new(10.0, -10.0),
        }
    }
}

// ── Calculator ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LogitBiasCalculator {
    vocab: Mutex<TokenVocab>,
}

impl LogitBiasCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a token, interning it if needed.
    pub fn token_id(&self, token: &str) -> u32 {
        self.vocab
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .intern(token)
    }

    /// Token text for an id.
    pub fn token_text(&self, id: u32) -> Option<String> {
        self.vocab
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .token(id)
            .map(str::to_string)
    }

    /// Compose the configured bias sources into one clamped map.
    pub fn generate_json_bias(&self, config: &LogitBiasConfig) -> BiasMap {
        let mut vocab = self.vocab.lock().unwrap_or_else(|e| e.into_inner());
        let mut bias = BiasMap::new();

        if config.boost_structural {
            let ids: Vec<u32> = vocab.ids_of(STRUCTURAL_TOKENS).collect();
            add_all(&mut bias, &ids, config.structural_boost);
        }
        if config.suppress_invalid {
            let ids: Vec<u32> = vocab.ids_of(INVALID_TOKENS).collect();
            add_all(&mut bias, &ids, config.invalid_penalty);
        }

        for (text, value) in sorted(&config.value_bias) {
            add(&mut bias, vocab.intern(text), *value);
        }

        // Explicit biases are applied last.
        for (id, value) in sorted(&config.token_bias) {
            add(&mut bias, *id, *value);
        }
        for (text, value) in sorted(&config.text_bias) {
            add(&mut bias, vocab.intern(text), *value);
        }

        trace!("json bias: {} token(s)", bias.len());
        bias
    }

    /// Base bias from `base` plus nudges for the position `partial` ends in.
    pub fn generate_contextual_bias(
        &self,
        partial: &str,
        config: &ContextualBiasConfig,
        base: &LogitBiasConfig,
    ) -> BiasMap {
        let mut bias = self.generate_json_bias(base);
        let context = detect_json_context(partial);
        let vocab = self.vocab.lock().unwrap_or_else(|e| e.into_inner());
        let ids =
            |tokens: &[&str]| -> Vec<u32> { tokens.iter().filter_map(|t| vocab.id(t)).collect() };

        match context {
            JsonContext::Object => {
                add_all(&mut bias, &ids(&[":", "\""]), config.in_object.boost);
                add_all(&mut bias, &ids(&["[", "]"]), config.in_object.penalty);
            }
            JsonContext::Array => {
                add_all(&mut bias, &ids(&[",", "]"]), config.in_array.boost);
                add_all(&mut bias, &ids(&[":"]), config.in_array.penalty);
            }
            JsonContext::String => {
                add_all(&mut bias, &ids(&["\""]), config.in_string.boost);
                let others: Vec<&str> = STRUCTURAL_TOKENS
                    .iter()
                    .copied()
                    .filter(|t| *t != "\"")
                    .collect();
                add_all(&mut bias, &ids(&others), config.in_string.penalty);
            }
            JsonContext::Value => {
                add_all(&mut bias, &ids(VALUE_START_TOKENS), config.in_value.boost);
                add_all(&mut bias, &ids(INVALID_TOKENS), config.in_value.penalty);
            }
            JsonContext::Root => {
                add_all(&mut bias, &ids(&["{"]), config.at_root.boost);
                add_all(&mut bias, &ids(INVALID_TOKENS), config.at_root.penalty);
            }
        }
        trace!("contextual bias for {context:?}: {} token(s)", bias.len());
        bias
    }

    /// Render a bias map keyed by token text.
    pub fn describe(&self, bias: &BiasMap) -> BTreeMap<String, f64> {
        let vocab = self.vocab.lock().unwrap_or_else(|e| e.into_inner());
        bias.iter()
            .map(|(id, value)| {
                let key = vocab
                    .token(*id)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{id}"));
                (key, *value)
            })
            .collect()
    }
}

fn add(bias: &mut BiasMap, id: u32, value: f64) {
    let entry = bias.entry(id).or_insert(0.0);
    *entry = clamp_bias(*entry + value);
}

fn add_all(bias: &mut BiasMap, ids: &[u32], value: f64) {
    for id in ids {
        add(bias, *id, value);
    }
}

fn sorted<K: Ord, V>(map: &HashMap<K, V>) -> Vec<(&K, &V)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}
