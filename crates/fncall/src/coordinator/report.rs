//! Human-readable performance report.

use super::metrics::CoordinatorMetrics;
use crate::generator::ModelJsonPerformance;
use std::collections::HashMap;
use std::fmt::Write;

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

pub fn render_report(
    metrics: &CoordinatorMetrics,
    json_performance: &HashMap<String, ModelJsonPerformance>,
) -> String {
    let mut out = String::new();
    let total = metrics.total_sessions();
    let successful = metrics.successful_sessions();
    let overall_rate = if total == 0 { 0.0 } else { successful as f64 / total as f64 };
    let tool_calls: u64 = metrics.tool_usage.values().sum();

    let _ = writeln!(out, "Function Calling Performance Report");
    let _ = writeln!(out, "===================================");
    let _ = writeln!(
        out,
        "Sessions: {total} ({successful} successful, {})",
        percent(overall_rate)
    );
    let _ = writeln!(out, "Tool calls: {tool_calls}");

    if metrics.models.is_empty() {
        let _ = writeln!(out, "\nNo sessions recorded.");
        return out;
    }

    let _ = writeln!(out, "\nModels:");
    for (name, m) in &metrics.models {
        let _ = writeln!(out, "  {name}");
        let _ = writeln!(
            out,
            "    sessions: {}, success rate: {}",
            m.total_sessions,
            percent(m.success_rate)
        );
        let _ = writeln!(
            out,
            "    avg iterations: {:.1}, avg confidence: {:.2}",
            m.average_iterations, m.average_confidence
        );
        let _ = writeln!(
            out,
            "    avg tokens: {:.0}, avg response time: {:.0}ms",
            m.average_tokens, m.average_response_time_ms
        );
        if let Some(json) = json_performance.get(name) {
            let _ = writeln!(
                out,
                "    json generation: {} attempts, {} success",
                json.attempts,
                percent(json.success_rate())
            );
        }
        if !m.recent_errors.is_empty() {
            let _ = writeln!(out, "    recent errors:");
            for error in &m.recent_errors {
                let _ = writeln!(out, "      - {error}");
            }
        }
    }

    let ranked = metrics.tool_usage_ranked();
    if !ranked.is_empty() {
        let _ = writeln!(out, "\nTool usage:");
        for (tool, count) in ranked {
            let _ = writeln!(out, "  {tool}: {count}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::session::SessionRecord;
    use crate::{Arguments, ToolCall, ToolResult};

    #[test]
    fn empty_report() {
        let report = render_report(&CoordinatorMetrics::default(), &HashMap::new());
        assert!(report.contains("Sessions: 0 (0 successful, 0.0%)"));
        assert!(report.contains("No sessions recorded."));
    }

    #[test]
    fn report_lists_models_errors_and_tools() {
        let mut metrics = CoordinatorMetrics::default();
        let mut record = SessionRecord::open("s1", "local-llm", "p");
        record.success = false;
        record.iterations = 5;
        record.errors = vec!["Maximum iterations (5) reached".into()];
        let call = ToolCall::new("list_directory", Arguments::new());
        record.tool_results = vec![ToolResult::success(&call, serde_json::json!([]))];
        metrics.record(&record);

        let mut json = HashMap::new();
        json.insert(
            "local-llm".to_string(),
            ModelJsonPerformance {
                attempts: 4,
                successes: 3,
                failures: 1,
            },
        );

        let report = render_report(&metrics, &json);
        assert!(report.contains("  local-llm\n"));
        assert!(report.contains("success rate: 0.0%"));
        assert!(report.contains("avg iterations: 5.0"));
        assert!(report.contains("json generation: 4 attempts, 75.0% success"));
        assert!(report.contains("- Maximum iterations (5) reached"));
        assert!(report.contains("list_directory: 1"));
    }
}
