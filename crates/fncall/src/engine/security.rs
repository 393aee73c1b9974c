//! Security policy and the checks that enforce it.

use crate::Arguments;
use crate::error::ToolError;
use crate::tools::ToolCategory;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default per-call time limit.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

/// Default ceiling for content-bearing arguments (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Argument names treated as paths regardless of suffix.
const PATH_ARGUMENT_KEYS: &[&str] = &[
    "path",
    "file",
    "filename",
    "filepath",
    "directory",
    "dir",
    "folder",
    "source",
    "destination",
    "target",
    "cwd",
];

/// Argument names whose size is checked against `max_file_size`.
const CONTENT_ARGUMENT_KEYS: &[&str] = &["content", "contents", "data", "body", "text"];

/// Raw path fragments rejected outright.
const TRAVERSAL_FRAGMENTS: &[&str] = &["..", "./", ".\\"];

/// Capability policy for one execution context. Never mutated mid-execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityConfig {
    /// Permit [`ToolCategory::FileSystem`] tools.
    pub allow_file_access: bool,
    /// Permit [`ToolCategory::Network`] tools.
    pub allow_network_access: bool,
    /// Permit [`ToolCategory::Shell`] tools.
    pub allow_shell_execution: bool,
    /// Wall-clock limit for one tool call.
    pub max_execution_time: Duration,
    /// When set, every path argument must fall under one of these.
    pub allowed_paths: Option<Vec<PathBuf>>,
    /// Takes precedence over `allowed_paths`.
    pub blocked_paths: Vec<PathBuf>,
    /// Byte ceiling for content-bearing string arguments.
    pub max_file_size: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allow_file_access: true,
            allow_network_access: false,
            allow_shell_execution: false,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            allowed_paths: None,
            blocked_paths: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl SecurityConfig {
    /// Every category allowed, longer time limit.
    pub fn permissive() -> Self {
        Self {
            allow_file_access: true,
            allow_network_access: true,
            allow_shell_execution: true,
            max_execution_time: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Files only, short time limit, 1 MiB content ceiling, system
    /// directories blocked.
    pub fn restrictive() -> Self {
        Self {
            allow_file_access: true,
            allow_network_access: false,
            allow_shell_execution: false,
            max_execution_time: Duration::from_secs(10),
            allowed_paths: None,
            blocked_paths: ["/etc", "/proc", "/sys", "/dev", "/boot", "/root"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            max_file_size: 1024 * 1024,
        }
    }

    pub fn allow_file_access(mut self, allowed: bool) -> Self {
        self.allow_file_access = allowed;
        self
    }

    pub fn allow_network_access(mut self, allowed: bool) -> Self {
        self.allow_network_access = allowed;
        self
    }

    pub fn allow_shell_execution(mut self, allowed: bool) -> Self {
        self.allow_shell_execution = allowed;
        self
    }

    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    pub fn with_allowed_paths<P: Into<PathBuf>>(
        mut self,
        paths: impl IntoIterator<Item = P>,
    ) -> Self {
        self.allowed_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_blocked_paths<P: Into<PathBuf>>(
        mut self,
        paths: impl IntoIterator<Item = P>,
    ) -> Self {
        self.blocked_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_file_size(mut self, bytes: usize) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Whether a category may run under this policy.
    pub fn permits(&self, category: ToolCategory) -> bool {
        match category {
            ToolCategory::FileSystem => self.allow_file_access,
            ToolCategory::Shell => self.allow_shell_execution,
            ToolCategory::Network => self.allow_network_access,
            ToolCategory::General => true,
        }
    }
}

/// Scope of one coordinated call. Not persisted.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Audit log key.
    pub session_id: String,
    /// Base for relative path arguments.
    pub working_directory: PathBuf,
    pub security: SecurityConfig,
    /// Tools callable in this context. `None` admits every registered tool;
    /// anything else is rejected as unknown.
    pub exposed_tools: Option<HashSet<String>>,
    /// Free-form caller data, not read by the engine.
    pub metadata: HashMap<String, Value>,
    /// Caller abort; every tool receives a child of this token.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            security: SecurityConfig::default(),
            exposed_tools: None,
            metadata: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    /// Restrict execution to `names`.
    pub fn with_exposed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exposed_tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Whether `name` may be called in this context.
    pub fn exposes(&self, name: &str) -> bool {
        self.exposed_tools
            .as_ref()
            .is_none_or(|names| names.contains(name))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

// ── Checks ─────────────────────────────────────────────────────────

pub fn check_permission(
    tool: &str,
    category: ToolCategory,
    security: &SecurityConfig,
) -> Result<(), ToolError> {
    if security.permits(category) {
        Ok(())
    } else {
        Err(ToolError::PermissionDenied {
            tool: tool.to_string(),
            category: category.to_string(),
        })
    }
}

pub fn is_path_argument(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    PATH_ARGUMENT_KEYS.contains(&key.as_str())
        || key.ends_with("_path")
        || key.ends_with("_file")
        || key.ends_with("_dir")
        || key.ends_with("_directory")
}

/// Validate one path argument and return its resolved absolute form.
///
/// Relative paths resolve against `working_directory`. Block-list entries win
/// over allow-list entries.
pub fn validate_path(
    raw: &str,
    working_directory: &Path,
    security: &SecurityConfig,
) -> Result<PathBuf, ToolError> {
    let violation = |reason: &str| ToolError::PathViolation {
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.trim().is_empty() {
        return Err(violation("empty path"));
    }
    if TRAVERSAL_FRAGMENTS.iter().any(|f| raw.contains(f)) {
        return Err(violation("path traversal"));
    }

    let joined = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        working_directory.join(raw)
    };
    let resolved = normalize(&joined);
    if !resolved.is_absolute() {
        return Err(violation("path must be absolute"));
    }

    if security.blocked_paths.iter().any(|b| resolved.starts_with(b)) {
        return Err(violation("blocked path"));
    }
    if let Some(ref allowed) = security.allowed_paths
        && !allowed.iter().any(|a| resolved.starts_with(a))
    {
        return Err(violation("outside allowed paths"));
    }
    Ok(resolved)
}

/// Validate every path-like string argument.
pub fn validate_path_arguments(
    arguments: &Arguments,
    working_directory: &Path,
    security: &SecurityConfig,
) -> Result<(), ToolError> {
    for (key, value) in arguments {
        if !is_path_argument(key) {
            continue;
        }
        match value {
            Value::String(s) => {
                validate_path(s, working_directory, security)?;
            }
            Value::Array(items) => {
                for s in items.iter().filter_map(Value::as_str) {
                    validate_path(s, working_directory, security)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Reject content-bearing arguments larger than `max_file_size`.
pub fn check_content_size(
    arguments: &Arguments,
    security: &SecurityConfig,
) -> Result<(), ToolError> {
    for key in CONTENT_ARGUMENT_KEYS {
        if let Some(Value::String(s)) = arguments.get(*key)
            && s.len() > security.max_file_size
        {
            return Err(ToolError::FileTooLarge {
                argument: key.to_string(),
                size: s.len(),
                limit: security.max_file_size,
            });
        }
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
