//! Running per-model statistics.

use super::session::SessionRecord;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Recent error strings retained per model.
pub const MAX_RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelMetrics {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub success_rate: f64,
    pub average_iterations: f64,
    pub average_confidence: f64,
    pub average_tokens: f64,
    pub average_response_time_ms: f64,
    pub recent_errors: VecDeque<String>,
}

impl ModelMetrics {
    /// Fold one finished session into the running averages.
    pub fn record(&mut self, session: &SessionRecord) {
        self.total_sessions += 1;
        if session.success {
            self.successful_sessions += 1;
        }
        let n = self.total_sessions as f64;
        self.success_rate = self.successful_sessions as f64 / n;
        self.average_iterations += (f64::from(session.iterations) - self.average_iterations) / n;
        self.average_confidence += (session.confidence - self.average_confidence) / n;
        self.average_tokens += (session.tokens as f64 - self.average_tokens) / n;
        self.average_response_time_ms +=
            (session.duration_ms as f64 - self.average_response_time_ms) / n;

        for error in &session.errors {
            if self.recent_errors.len() == MAX_RECENT_ERRORS {
                self.recent_errors.pop_front();
            }
            self.recent_errors.push_back(error.clone());
        }
    }
}

/// Everything the coordinator accumulates across sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorMetrics {
    pub models: BTreeMap<String, ModelMetrics>,
    /// Executions per tool name, including failed ones.
    pub tool_usage: BTreeMap<String, u64>,
}

impl CoordinatorMetrics {
    pub fn record(&mut self, session: &SessionRecord) {
        self.models
            .entry(session.model.clone())
            .or_default()
            .record(session);
        for result in &session.tool_results {
            *self.tool_usage.entry(result.name.clone()).or_default() += 1;
        }
    }

    pub fn total_sessions(&self) -> u64 {
        self.models.values().map(|m| m.total_sessions).sum()
    }

    pub fn successful_sessions(&self) -> u64 {
        self.models.values().map(|m| m.successful_sessions).sum()
    }

    /// Tool usage sorted by count, most used first.
    pub fn tool_usage_ranked(&self) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> =
            self.tool_usage.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
    }
}
