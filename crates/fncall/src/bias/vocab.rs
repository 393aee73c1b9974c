//! Symbol table for bias keys.
//!
//! Ids are assigned in a fixed order: the JSON structural tokens first, then
//! the tokens known to break JSON. Text keys outside that set are interned on
//! first use and keep their id for the table's lifetime.

use std::collections::HashMap;

/// Tokens that make up valid JSON structure and literals.
pub const STRUCTURAL_TOKENS: &[&str] = &[
    "{", "}", "[", "]", "\"", ":", ",", "true", "false", "null", "0", "1", "2", "3", "4", "5",
    "6", "7", "8", "9",
];

/// Tokens that commonly derail JSON output.
pub const INVALID_TOKENS: &[&str] = &["'", "\\", "`", "=", ";", "(", ")", "<", ">"];

/// Tokens that can open a JSON value.
pub const VALUE_START_TOKENS: &[&str] = &[
    "\"", "{", "[", "true", "false", "null", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9",
];

#[derive(Debug, Clone)]
pub struct TokenVocab {
    ids: HashMap<String, u32>,
    tokens: Vec<String>,
}

impl Default for TokenVocab {
    fn default() -> Self {
        let mut vocab = Self {
            ids: HashMap::new(),
            tokens: Vec::new(),
        };
        for token in STRUCTURAL_TOKENS.iter().chain(INVALID_TOKENS) {
            vocab.intern(token);
        }
        vocab
    }
}

impl TokenVocab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    /// Id for `token`, assigning the next free one if it is new.
    pub fn intern(&mut self, token: &str) -> u32 {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        let id = self.tokens.len() as u32;
        self.tokens.push(token.to_string());
        self.ids.insert(token.to_string(), id);
        id
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    pub fn ids_of<'a>(&'a self, tokens: &'a [&str]) -> impl Iterator<Item = u32> + 'a {
        tokens.iter().filter_map(|t| self.id(t))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ids_in_declaration_order() {
        let vocab = TokenVocab::new();
        assert_eq!(vocab.id("{"), Some(0));
        assert_eq!(vocab.id("}"), Some(1));
        assert_eq!(vocab.id("'"), Some(STRUCTURAL_TOKENS.len() as u32));
        assert_eq!(vocab.len(), STRUCTURAL_TOKENS.len() + INVALID_TOKENS.len());
    }

    #[test]
    fn interning_is_stable() {
        let mut vocab = TokenVocab::new();
        let a = vocab.intern("undefined");
        let b = vocab.intern("undefined");
        assert_eq!(a, b);
        assert_eq!(vocab.token(a), Some("undefined"));
        assert_eq!(vocab.intern(":"), 5);
    }
}
