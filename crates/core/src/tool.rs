//! Tool trait: the abstraction over agent capabilities.
//!
//! Tools are what give the agent the ability to act: read and write files,
//! run shell commands. Each tool also answers the questions the permission
//! logic asks (is this call read-only? which strings do allow/deny patterns
//! match against?) so the agent never inspects a tool's internals.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::ToolDefinition;
use crate::error::ToolError;

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// Tool-level permission, before any approval prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPermission {
    /// Execute without asking
    Always,
    /// Never execute
    Never,
    /// Ask the approval collaborator
    #[default]
    Ask,
}

/// Broad category of side effects, used by execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Execute,
    Other,
}

/// Per-tool overrides loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<ToolPermission>,

    /// Glob patterns that force execution
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Glob patterns that force a skip; checked before the allowlist
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Default execution timeout for tools that run commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Argument keys whose string values are matched against allow/deny patterns.
const PATTERN_KEYS: &[&str] = &["path", "file_path", "command", "url", "pattern"];

/// The core Tool trait.
///
/// Each tool implements this trait and is registered in the [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "bash", "read_file").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Other
    }

    /// Permission used when configuration does not override it.
    fn default_permission(&self) -> ToolPermission {
        ToolPermission::Ask
    }

    /// Whether this particular call has no side effects.
    fn is_read_only(&self, _arguments: &serde_json::Value) -> bool {
        self.kind() == ToolKind::Read
    }

    /// Strings that allow/deny patterns are matched against.
    fn pattern_subjects(&self, arguments: &serde_json::Value) -> Vec<String> {
        PATTERN_KEYS
            .iter()
            .filter_map(|key| arguments.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// The tool catalog: a lookup table of registered tools plus their settings.
///
/// Tools are kept in name order so the definitions sent to the model, and
/// therefore the system prompt, are stable across runs.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
    settings: HashMap<String, ToolSettings>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            settings: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn set_settings(&mut self, name: impl Into<String>, settings: ToolSettings) {
        self.settings.insert(name.into(), settings);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Configured settings for a tool, empty when none were given.
    pub fn settings(&self, name: &str) -> ToolSettings {
        self.settings.get(name).cloned().unwrap_or_default()
    }

    /// Effective permission: configuration first, then the tool's default.
    pub fn permission(&self, name: &str) -> ToolPermission {
        self.settings
            .get(name)
            .and_then(|s| s.permission)
            .or_else(|| self.get(name).map(|t| t.default_permission()))
            .unwrap_or_default()
    }

    /// Get all tool definitions (for sending to the model).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// Invoke a tool by name.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments).await
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
