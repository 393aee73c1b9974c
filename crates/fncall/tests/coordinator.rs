//! End-to-end coordinator runs against scripted models.

use async_trait::async_trait;
use fncall::model::{FinishReason, ToolGeneration};
use fncall::prelude::*;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ── Mock model ─────────────────────────────────────────────────────

struct MockModel {
    name: &'static str,
    caps: ModelCapabilities,
    text: Mutex<VecDeque<String>>,
    native: Mutex<VecDeque<ToolGeneration>>,
    /// Returned once the script runs out.
    repeat: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl MockModel {
    fn text(name: &'static str, format: ToolFormat, responses: &[&str]) -> Self {
        Self {
            name,
            caps: ModelCapabilities::default().with_preferred_tool_format(format),
            text: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            native: Mutex::new(VecDeque::new()),
            repeat: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn native(name: &'static str, generations: Vec<ToolGeneration>) -> Self {
        Self {
            name,
            caps: ModelCapabilities::default().with_tool_calling(true),
            text: Mutex::new(VecDeque::new()),
            native: Mutex::new(generations.into()),
            repeat: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn repeating(mut self, response: &str) -> Self {
        self.repeat = Some(response.to_string());
        self
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelAdapter for MockModel {
    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> &ModelCapabilities {
        &self.caps
    }

    async fn generate_text(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.text
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| ModelError::Generation("script exhausted".into()))
    }

    async fn generate_with_tools(
        &self,
        prompt: &str,
        _tools: &[ToolDefinition],
        _options: &GenerateOptions,
    ) -> Result<ToolGeneration, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.native
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ModelError::Generation("script exhausted".into()))
    }
}

// ── Tools ──────────────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct PathArgs {
    path: String,
}

fn tools() -> Arc<ToolSet> {
    let list = FnTool::new(
        ToolDefinition::for_args::<PathArgs>("list_directory", "List the entries of a directory"),
        |args: PathArgs| async move {
            Ok(json!({"path": args.path, "entries": ["Cargo.toml", "src"]}))
        },
    );
    let read = FnTool::new(
        ToolDefinition::for_args::<PathArgs>("read_file", "Read a file"),
        |args: PathArgs| async move { Ok(json!(format!("contents of {}", args.path))) },
    );
    let shell = FnTool::new(
        ToolDefinition::new("run_command", "Run a shell command", json!({"type": "object"})),
        |_: serde_json::Value| async move { Ok(json!("ran")) },
    );
    Arc::new(ToolSet::new().with(list).with(read).with(shell))
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig::default().with_working_directory("/tmp/project")
}

fn args(value: serde_json::Value) -> Arguments {
    value.as_object().cloned().unwrap_or_default()
}

const XML_LIST_CALL: &str = r#"Let me look.
<function_calls>
<invoke name="list_directory">
<parameter name="path">.</parameter>
</invoke>
</function_calls>"#;

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn xml_dialect_round_trip() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let model = MockModel::text(
        "mock-xml",
        ToolFormat::Xml,
        &[XML_LIST_CALL, "The project root holds Cargo.toml and src."],
    );

    let prompt = "What is in the project root?";
    let result = coordinator
        .execute_coordinated_function_calling(&model, prompt, None, &config(), None)
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.tools_used, vec!["list_directory"]);
    assert_eq!(result.final_response, "The project root holds Cargo.toml and src.");
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.tool_results[0].result["path"], ".");

    let prompts = model.prompts();
    assert!(prompts[0].contains("<function_calls>"));
    assert!(prompts[0].contains("list_directory"));
    assert!(prompts[1].contains("<function_results>"));
    assert!(prompts[1].contains("Cargo.toml"));
}

#[tokio::test]
async fn json_dialect_parallel_calls_keep_order() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let batch = r#"{"function_calls": [
        {"name": "read_file", "arguments": {"path": "/srv/a.txt"}},
        {"name": "read_file", "arguments": {"path": "/srv/b.txt"}}
    ]}"#;
    let model = MockModel::text("mock-json", ToolFormat::Json, &[batch, "Both files read."]);

    let result = coordinator
        .execute_coordinated_function_calling(&model, "Read a and b", None, &config(), None)
        .await;

    assert!(result.success);
    let contents: Vec<_> = result.tool_results.iter().map(|r| r.result.clone()).collect();
    assert_eq!(
        contents,
        vec![json!("contents of /srv/a.txt"), json!("contents of /srv/b.txt")]
    );
    assert!(model.prompts()[1].contains("function_result"));
}

#[tokio::test]
async fn native_tool_calling_model() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let model = MockModel::native(
        "mock-native",
        vec![
            ToolGeneration {
                text: String::new(),
                tool_calls: vec![ToolCall::new("list_directory", args(json!({"path": "."})))],
                finish_reason: FinishReason::ToolCalls,
                usage: None,
            },
            ToolGeneration {
                text: "Cargo.toml and src.".into(),
                tool_calls: Vec::new(),
                finish_reason: FinishReason::Stop,
                usage: None,
            },
        ],
    );

    let result = coordinator
        .execute_coordinated_function_calling(&model, "List the root", None, &config(), None)
        .await;

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.final_response, "Cargo.toml and src.");
    assert_eq!(result.tools_used, vec!["list_directory"]);
    assert_eq!(result.confidence, 1.0);
    assert!(!model.prompts()[0].contains("<function_calls>"));
}

#[tokio::test]
async fn iteration_budget_is_enforced() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let model = MockModel::text("mock-loop", ToolFormat::Xml, &[]).repeating(XML_LIST_CALL);
    let config = config().with_max_iterations(2);

    let result = coordinator
        .execute_coordinated_function_calling(&model, "loop forever", None, &config, None)
        .await;

    assert!(!result.success);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.tool_results.len(), 2);
    assert!(result.errors.iter().any(|e| e == "Maximum iterations (2) reached"));
}

#[tokio::test]
async fn sequential_batch_halts_on_denied_shell() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let batch = r#"{"function_calls": [
        {"name": "run_command", "arguments": {"command": "ls"}},
        {"name": "list_directory", "arguments": {"path": "."}}
    ]}"#;
    let model = MockModel::text("mock-shell", ToolFormat::Json, &[batch, "Could not run it."]);
    let config = config().with_parallel_calls(false);

    let result = coordinator
        .execute_coordinated_function_calling(&model, "run ls", None, &config, None)
        .await;

    assert!(result.success);
    assert_eq!(result.tool_results.len(), 1);
    assert!(result.tool_results[0].error.as_deref().unwrap().contains("permission denied"));
    assert!(result.errors[0].starts_with("run_command:"));
}

#[tokio::test]
async fn requested_subset_and_format_override() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let model = MockModel::text("mock-subset", ToolFormat::Xml, &["Nothing to do."]);
    let requested = vec!["read_file".to_string()];
    let config = config().with_preferred_format(ToolFormat::Json);

    let result = coordinator
        .execute_coordinated_function_calling(&model, "hello", Some(&requested), &config, None)
        .await;

    assert!(result.success);
    assert!(result.tools_used.is_empty());
    let prompt = &model.prompts()[0];
    assert!(prompt.contains("\"function_call\""));
    assert!(prompt.contains("read_file"));
    assert!(!prompt.contains("list_directory"));
}

#[tokio::test]
async fn tools_outside_requested_subset_never_run() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let model = MockModel::text("mock-hidden", ToolFormat::Xml, &[XML_LIST_CALL, "Gave up."]);
    let requested = vec!["read_file".to_string()];

    let result = coordinator
        .execute_coordinated_function_calling(&model, "list it", Some(&requested), &config(), None)
        .await;

    assert!(result.success);
    assert_eq!(result.tool_results.len(), 1);
    let rejected = &result.tool_results[0];
    assert!(rejected.is_error);
    assert!(rejected.error.as_deref().unwrap().contains("unknown tool 'list_directory'"));
    assert!(rejected.result.get("entries").is_none());
    assert!(!model.prompts()[1].contains("Cargo.toml"));
}

async fn run_sessions(
    coordinator: &FunctionCallingCoordinator,
    count: usize,
    config: &CoordinatorConfig,
) {
    for i in 0..count {
        let model = MockModel::text("mock-history", ToolFormat::Xml, &[XML_LIST_CALL, "done"]);
        let session_id = Some(format!("s{i}"));
        coordinator
            .execute_coordinated_function_calling(&model, "list", None, config, session_id)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn session_history_evicts_earliest_beyond_limit() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let config = config().with_max_session_history(3);
    run_sessions(&coordinator, 4, &config).await;

    assert!(coordinator.get_session_history("s0").is_none());
    for id in ["s1", "s2", "s3"] {
        assert!(coordinator.get_session_history(id).is_some(), "{id} evicted");
    }
}

#[tokio::test]
async fn default_history_limit_is_one_hundred() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let config = config();
    assert_eq!(config.max_session_history, 100);
    for i in 0..=100 {
        let model = MockModel::text("mock-history", ToolFormat::Xml, &["done"]);
        let session_id = Some(format!("s{i}"));
        coordinator
            .execute_coordinated_function_calling(&model, "hi", None, &config, session_id)
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    assert!(coordinator.get_session_history("s0").is_none());
    assert!(coordinator.get_session_history("s1").is_some());
    assert!(coordinator.get_session_history("s100").is_some());
}

#[tokio::test]
async fn evicted_sessions_drop_their_audit_entries() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let config = config().with_max_session_history(2);
    run_sessions(&coordinator, 5, &config).await;

    for id in ["s0", "s1", "s2"] {
        assert!(coordinator.get_session_history(id).is_none());
        assert!(coordinator.engine().audit_log(id).is_empty(), "{id} audit kept");
    }
    assert_eq!(coordinator.engine().audit_log("s4").len(), 1);

    assert_eq!(coordinator.cleanup_session_history(1), 1);
    assert!(coordinator.engine().audit_log("s3").is_empty());
    assert_eq!(coordinator.engine().audit_log("s4").len(), 1);
}

#[tokio::test]
async fn sessions_metrics_and_report() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let first = MockModel::text("mock-a", ToolFormat::Xml, &[XML_LIST_CALL, "done"]);
    let second = MockModel::text("mock-a", ToolFormat::Xml, &[]);

    let ok = coordinator
        .execute_coordinated_function_calling(
            &first,
            "one",
            None,
            &config(),
            Some("session-1".into()),
        )
        .await;
    let failed = coordinator
        .execute_coordinated_function_calling(&second, "two", None, &config(), None)
        .await;
    assert_eq!(ok.session_id, "session-1");
    assert!(!failed.success);

    let record = coordinator.get_session_history("session-1").unwrap();
    assert!(record.success);
    assert!(record.finished_at.is_some());
    assert_eq!(record.tool_calls.len(), 1);

    let metrics = coordinator.get_metrics();
    let model = &metrics.models["mock-a"];
    assert_eq!(model.total_sessions, 2);
    assert_eq!(model.success_rate, 0.5);
    assert_eq!(model.recent_errors.len(), 1);
    assert_eq!(metrics.tool_usage["list_directory"], 1);

    let report = coordinator.generate_performance_report();
    assert!(report.contains("Sessions: 2 (1 successful, 50.0%)"));
    assert!(report.contains("mock-a"));
    assert!(report.contains("list_directory: 1"));

    assert_eq!(coordinator.cleanup_session_history(1), 1);
    assert!(coordinator.get_session_history(&failed.session_id).is_some());
    assert!(coordinator.get_session_history("session-1").is_none());
}

#[tokio::test]
async fn cancelled_session_stops_before_generating() {
    let coordinator = FunctionCallingCoordinator::new(tools());
    let model = MockModel::text("mock-cancel", ToolFormat::Xml, &["unused"]);
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();

    let config = config().with_cancel(token);
    let result = coordinator
        .execute_coordinated_function_calling(&model, "hi", None, &config, None)
        .await;

    assert!(!result.success);
    assert!(model.prompts().is_empty());
    assert_eq!(result.errors, vec!["Cancelled".to_string()]);
}
