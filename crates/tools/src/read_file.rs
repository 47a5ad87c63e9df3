//! `read_file`: read file contents inside the working directory.

use async_trait::async_trait;
use tiller_core::error::ToolError;
use tiller_core::tool::{Tool, ToolKind, ToolPermission, ToolResult};
use tiller_security::PathPolicy;

/// Output beyond this many bytes is cut and marked as truncated.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

pub struct ReadFileTool {
    policy: PathPolicy,
}

impl ReadFileTool {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file. Optionally start at a 0-based line `offset` and return at most `limit` lines."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read, relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "First line to return (0-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["path"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    fn default_permission(&self) -> ToolPermission {
        ToolPermission::Always
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let offset = arguments["offset"].as_u64().unwrap_or(0) as usize;
        let limit = arguments["limit"].as_u64().map(|l| l as usize);

        let resolved = self.policy.resolve(path)?;

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "read_file".into(),
                reason: format!("Failed to read '{path}': {e}"),
            })?;

        let total_lines = content.lines().count();
        let selected: Vec<&str> = content
            .lines()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        let mut output = selected.join("\n");

        let truncated = output.len() > MAX_OUTPUT_BYTES;
        if truncated {
            let mut cut = MAX_OUTPUT_BYTES;
            while !output.is_char_boundary(cut) {
                cut -= 1;
            }
            output.truncate(cut);
            output.push_str("\n... [truncated]");
        }

        Ok(ToolResult {
            success: true,
            output,
            data: Some(serde_json::json!({
                "path": resolved.to_string_lossy(),
                "lines_read": selected.len(),
                "total_lines": total_lines,
                "truncated": truncated,
            })),
        })
    }
}
