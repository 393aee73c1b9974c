//! Tool abstraction and the stock registry.
//!
//! The [`Tool`] trait defines what the engine needs from a tool: a static
//! [`ToolDefinition`], a permission [`ToolCategory`], and an async
//! [`Tool::execute`] that observes a cancellation token. Tools are collected
//! into a [`ToolSet`], which implements the [`ToolRegistry`] lookup contract
//! the engine and coordinator consume.

use crate::{Arguments, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a tool returns: a JSON payload or a human-readable error.
pub type ToolOutput = Result<Value, String>;

/// Future produced by [`Tool::execute`]; borrows the tool for `'a`.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = ToolOutput> + Send + 'a>>;

// ── ToolCategory ───────────────────────────────────────────────────

/// Permission class checked against the security policy before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    FileSystem,
    Shell,
    Network,
    General,
}

impl ToolCategory {
    /// Classify a tool from its name.
    ///
    /// Only whole words count: `read_file` is a file tool, `thread_dump` is not.
    pub fn infer(name: &str) -> Self {
        let words = name_words(name);
        let has = |vocab: &[&str]| words.iter().any(|w| vocab.contains(&w.as_str()));
        if has(&["shell", "bash", "sh", "exec", "execute", "command", "cmd", "run", "terminal"]) {
            ToolCategory::Shell
        } else if has(&["http", "https", "fetch", "web", "url", "download", "request", "curl"]) {
            ToolCategory::Network
        } else if has(&[
            "file", "files", "dir", "directory", "read", "write", "path", "list", "grep", "find",
            "glob", "ls", "mkdir", "delete", "move", "copy",
        ]) {
            ToolCategory::FileSystem
        } else {
            ToolCategory::General
        }
    }
}

/// Lowercase words of an identifier, split on punctuation and camelCase humps.
fn name_words(name: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCategory::FileSystem => write!(f, "file"),
            ToolCategory::Shell => write!(f, "shell"),
            ToolCategory::Network => write!(f, "network"),
            ToolCategory::General => write!(f, "general"),
        }
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool a model can invoke.
///
/// # Example
///
/// ```ignore
/// struct ReadFile;
///
/// impl Tool for ReadFile {
///     fn definition(&self) -> ToolDefinition { /* ... */ }
///
///     fn execute(&self, arguments: &Arguments, cancel: CancellationToken) -> ToolFuture<'_> {
///         let path = arguments.get("path").cloned();
///         Box::pin(async move {
///             tokio::select! {
///                 _ = cancel.cancelled() => Err("cancelled".into()),
///                 content = read(path) => Ok(content.into()),
///             }
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Run the tool. Arguments have already passed validation.
    ///
    /// `cancel` fires when the engine gives up on the call (timeout or
    /// caller abort); long-running tools should select on it.
    fn execute(&self, arguments: &Arguments, cancel: CancellationToken) -> ToolFuture<'_>;

    /// The tool's name, taken from its definition.
    fn name(&self) -> String {
        self.definition().name
    }

    /// Permission class. Inferred from the name unless overridden.
    fn category(&self) -> ToolCategory {
        ToolCategory::infer(&self.name())
    }
}

/// Lookup contract consumed by the engine and coordinator.
pub trait ToolRegistry: Send + Sync {
    fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>>;

    fn all_tools(&self) -> Vec<Arc<dyn Tool>>;

    /// Definitions of every tool, sorted by name.
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.all_tools().iter().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools addressable by name.
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with(ReadFile::new())
///     .with_if(allow_shell, Shell::new());
/// ```
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolSet").field("tools", &names).finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tool`, replacing a previously registered tool of the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Arc::new(tool));
    }

    /// Chained form of [`ToolSet::register`].
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Register `tool` only when `condition` holds.
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolRegistry for ToolSet {
    fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    fn all_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Handler after argument decoding has been erased.
type ErasedToolHandler = Box<
    dyn Fn(Arguments, CancellationToken) -> Pin<Box<dyn Future<Output = ToolOutput> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool that deserializes its arguments and delegates to a
/// handler.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct EchoArgs { text: String }
///
/// let echo = FnTool::new(
///     ToolDefinition::for_args::<EchoArgs>("echo", "Echo text back"),
///     |args: EchoArgs| async move { Ok(json!(args.text)) },
/// );
/// ```
pub struct FnTool {
    def: ToolDefinition,
    handler: ErasedToolHandler,
    category: Option<ToolCategory>,
}

impl FnTool {
    /// Create a tool whose handler ignores cancellation.
    pub fn new<A, F, Fut>(def: ToolDefinition, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        Self::with_cancellation(def, move |args: A, _cancel| handler(args))
    }

    /// Create a tool whose handler also receives the cancellation token.
    pub fn with_cancellation<A, F, Fut>(def: ToolDefinition, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ToolOutput> + Send + 'static,
    {
        let erased = move |raw: Arguments,
                           cancel: CancellationToken|
              -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> {
            match serde_json::from_value::<A>(Value::Object(raw)) {
                Ok(args) => Box::pin(handler(args, cancel)),
                Err(e) => Box::pin(async move { Err(format!("invalid tool arguments: {e}")) }),
            }
        };
        Self {
            def,
            handler: Box::new(erased),
            category: None,
        }
    }

    /// Override the inferred permission category (builder pattern).
    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = Some(category);
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.def.clone()
    }

    fn execute(&self, arguments: &Arguments, cancel: CancellationToken) -> ToolFuture<'_> {
        (self.handler)(arguments.clone(), cancel)
    }

    fn category(&self) -> ToolCategory {
        self.category.unwrap_or_else(|| ToolCategory::infer(&self.def.name))
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.name)
            .field("category", &Tool::category(self))
            .finish()
    }
}
