//! Per-session execution audit log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// One tool execution, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub call_id: String,
    pub tool: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Statistics derived from a session's audit entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Default)]
pub struct AuditLog {
    sessions: Mutex<HashMap<String, Vec<AuditEntry>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str, entry: AuditEntry) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .push(entry);
    }

    pub fn entries(&self, session_id: &str) -> Vec<AuditEntry> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self, session_id: &str) -> SessionStats {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = sessions.get(session_id).filter(|e| !e.is_empty()) else {
            return SessionStats::default();
        };
        let total = entries.len();
        let successful = entries.iter().filter(|e| e.success).count();
        let total_ms: u64 = entries.iter().map(|e| e.duration_ms).sum();
        SessionStats {
            total,
            successful,
            failed: total - successful,
            success_rate: successful as f64 / total as f64,
            average_duration_ms: total_ms as f64 / total as f64,
        }
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(success: bool, duration_ms: u64) -> AuditEntry {
        AuditEntry {
            call_id: "c".into(),
            tool: "t".into(),
            started_at: Utc::now(),
            duration_ms,
            success,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn stats_derived_on_demand() {
        let log = AuditLog::new();
        log.record("s1", entry(true, 10));
        log.record("s1", entry(false, 30));
        log.record("s2", entry(true, 5));

        let stats = log.stats("s1");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.average_duration_ms, 20.0);

        assert_eq!(log.stats("missing"), SessionStats::default());
        log.clear("s1");
        assert!(log.entries("s1").is_empty());
        assert_eq!(log.session_count(), 1);
    }
}
