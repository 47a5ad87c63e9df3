//! `write_file`: create or overwrite a file inside the working directory.

use async_trait::async_trait;
use tiller_core::error::ToolError;
use tiller_core::tool::{Tool, ToolKind, ToolResult};
use tiller_security::PathPolicy;
use tracing::debug;

pub struct WriteFileTool {
    policy: PathPolicy,
}

impl WriteFileTool {
    pub fn new(policy: PathPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file and missing parent directories. \
         Refuses to replace an existing file unless `overwrite` is true."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to, relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                },
                "overwrite": {
                    "type": "boolean",
                    "description": "Replace the file if it already exists",
                    "default": false
                }
            },
            "required": ["path", "content"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let overwrite = arguments["overwrite"].as_bool().unwrap_or(false);

        let resolved = self.policy.resolve(path)?;
        let existed = tokio::fs::try_exists(&resolved).await.unwrap_or(false);

        if existed && !overwrite {
            return Ok(ToolResult::failed(format!(
                "File '{path}' already exists. Set overwrite to true to replace it."
            )));
        }

        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: "write_file".into(),
            reason,
        };

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(format!("Failed to create directory: {e}")))?;
        }

        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| failed(format!("Failed to write '{path}': {e}")))?;

        debug!(path = %resolved.display(), bytes = content.len(), "Wrote file");
        let verb = if existed { "Overwrote" } else { "Created" };
        Ok(ToolResult {
            success: true,
            output: format!("{verb} {path} ({} bytes)", content.len()),
            data: Some(serde_json::json!({
                "path": resolved.to_string_lossy(),
                "bytes_written": content.len(),
                "file_existed": existed,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_in(dir: &tempfile::TempDir) -> WriteFileTool {
        WriteFileTool::new(PathPolicy::new(dir.path(), vec![]))
    }

    #[test]
    fn tool_definition() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool_in(&dir);
        assert_eq!(tool.name(), "write_file");
        assert_eq!(tool.kind(), ToolKind::Edit);
        assert!(!tool.is_read_only(&serde_json::json!({"path": "a", "content": "b"})));
    }

    #[tokio::test]
    async fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool_in(&dir)
            .execute(serde_json::json!({"path": "sub/dir/test.txt", "content": "Hello!"}))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.output.starts_with("Created"));
        let written = std::fs::read_to_string(dir.path().join("sub/dir/test.txt")).unwrap();
        assert_eq!(written, "Hello!");
    }

    #[tokio::test]
    async fn existing_file_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();
        let tool = tool_in(&dir);

        let refused = tool
            .execute(serde_json::json!({"path": "a.txt", "content": "new"}))
            .await
            .unwrap();
        assert!(!refused.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "old");

        let replaced = tool
            .execute(serde_json::json!({"path": "a.txt", "content": "new", "overwrite": true}))
            .await
            .unwrap();
        assert!(replaced.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn missing_content_argument() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool_in(&dir).execute(serde_json::json!({"path": "x.txt"})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn write_outside_workdir_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let target = other.path().join("escape.txt");
        let result = tool_in(&dir)
            .execute(serde_json::json!({"path": target.to_str().unwrap(), "content": "x"}))
            .await;
        assert!(matches!(result, Err(ToolError::SandboxViolation(_))));
        assert!(!target.exists());
    }
}
