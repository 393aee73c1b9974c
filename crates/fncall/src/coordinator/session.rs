//! Session records and the bounded history table.

use crate::{ToolCall, ToolResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Sessions kept by default when history is cleaned up.
pub const DEFAULT_MAX_SESSION_HISTORY: usize = 100;

/// One coordinated call, from open to finalize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// [`ModelAdapter::name`](crate::model::ModelAdapter::name) of the backend.
    pub model: String,
    pub prompt: String,
    /// Eviction order key.
    pub started_at: DateTime<Utc>,
    /// `None` while the session is still running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Generate/execute rounds started.
    pub iterations: u32,
    /// Every call the model made, across all rounds.
    pub tool_calls: Vec<ToolCall>,
    /// One result per executed call, in execution order.
    pub tool_results: Vec<ToolResult>,
    /// The model produced a final answer within the iteration budget.
    pub success: bool,
    /// Mean per-turn confidence.
    pub confidence: f64,
    /// Estimated tokens across every generation in the session.
    pub tokens: usize,
    pub duration_ms: u64,
    /// Final answer, or the last text seen when the session failed.
    pub final_response: String,
    /// Generation failures, failed calls, and budget exhaustion, in order.
    pub errors: Vec<String>,
}

impl SessionRecord {
    pub fn open(
        session_id: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model: model.into(),
            prompt: prompt.into(),
            started_at: Utc::now(),
            finished_at: None,
            iterations: 0,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            success: false,
            confidence: 0.0,
            tokens: 0,
            duration_ms: 0,
            final_response: String::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Distinct tool names in first-use order.
    pub fn tools_used(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for call in &self.tool_calls {
            if !names.contains(&call.name) {
                names.push(call.name.clone());
            }
        }
        names
    }
}

#[derive(Debug, Default)]
pub struct SessionHistory {
    records: HashMap<String, SessionRecord>,
}

impl SessionHistory {
    pub fn insert(&mut self, record: SessionRecord) {
        self.records.insert(record.session_id.clone(), record);
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionRecord> {
        self.records.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Keep the `keep` most recently started sessions; returns the ids of
    /// the evicted ones, oldest first.
    pub fn retain_recent(&mut self, keep: usize) -> Vec<String> {
        if self.records.len() <= keep {
            return Vec::new();
        }
        let mut by_start: Vec<(DateTime<Utc>, String)> = self
            .records
            .values()
            .map(|r| (r.started_at, r.session_id.clone()))
            .collect();
        by_start.sort();
        let evict = by_start.len() - keep;
        by_start
            .into_iter()
            .take(evict)
            .map(|(_, id)| {
                self.records.remove(&id);
                id
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Arguments;
    use chrono::Duration;

    #[test]
    fn oldest_sessions_evicted_first() {
        let mut history = SessionHistory::default();
        let base = Utc::now();
        for i in 0..5 {
            let mut record = SessionRecord::open(format!("s{i}"), "m", "p");
            record.started_at = base + Duration::seconds(i);
            history.insert(record);
        }
        assert_eq!(history.retain_recent(3), vec!["s0", "s1"]);
        assert!(history.get("s0").is_none());
        assert!(history.get("s1").is_none());
        assert!(history.get("s4").is_some());
        assert!(history.retain_recent(3).is_empty());
    }

    #[test]
    fn tools_used_are_distinct() {
        let mut record = SessionRecord::open("s", "m", "p");
        for name in ["ls", "cat", "ls"] {
            record.tool_calls.push(ToolCall::new(name, Arguments::new()));
        }
        assert_eq!(record.tools_used(), vec!["ls", "cat"]);
        assert!(!record.is_finished());
    }
}
