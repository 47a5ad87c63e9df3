//! `bash`: run a shell command in the working directory.
//!
//! Commands run through `sh -c` (`cmd /C` on Windows) with a per-call
//! timeout; the child is killed when the timeout fires or the call is
//! dropped. A small set of inspection commands counts as read-only so
//! planning mode can still use them.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tiller_core::error::ToolError;
use tiller_core::tool::{Tool, ToolKind, ToolResult};
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_OUTPUT_CHARS: usize = 30_000;

const READ_ONLY_COMMANDS: &[&str] = &[
    "cat", "head", "tail", "ls", "pwd", "wc", "grep", "rg", "find", "which", "echo", "stat",
    "file", "tree", "du", "df", "whoami", "date",
];

const READ_ONLY_GIT: &[&str] = &["status", "diff", "log", "show", "branch", "blame"];

/// Shell metacharacters that redirect, chain or substitute.
const CHAINING: &[&str] = &[">", "<", "|", ";", "&", "`", "$(", "\n"];

/// `find` actions that delete, run commands or write files.
const FIND_ACTIONS: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fls"];

/// `git branch` flags that only list.
const GIT_BRANCH_LIST_FLAGS: &[&str] = &[
    "-a", "--all", "-r", "--remotes", "-l", "--list", "-v", "-vv", "--verbose", "--show-current",
    "--merged", "--no-merged", "--contains", "--no-contains", "--sort", "--color", "--no-color",
];

pub struct BashTool {
    workdir: PathBuf,
    default_timeout: Duration,
}

impl BashTool {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Whether `command` only inspects state.
pub fn is_read_only_command(command: &str) -> bool {
    if CHAINING.iter().any(|c| command.contains(c)) {
        return false;
    }
    let mut words = command.split_whitespace();
    match words.next() {
        Some("git") => match words.next() {
            Some("branch") => words.all(is_branch_list_arg),
            Some(sub) => READ_ONLY_GIT.contains(&sub) && !words.any(|w| w.starts_with("--output")),
            None => false,
        },
        Some("find") => !words.any(|w| FIND_ACTIONS.iter().any(|a| w.starts_with(a))),
        Some(base) => READ_ONLY_COMMANDS.contains(&base),
        None => false,
    }
}

/// Without a flag, `git branch <name>` creates a branch; only list flags and
/// their patterns are allowed.
fn is_branch_list_arg(word: &str) -> bool {
    word.starts_with('-')
        && GIT_BRANCH_LIST_FLAGS
            .iter()
            .any(|flag| word == *flag || word.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
}

fn truncate(mut text: String) -> String {
    if text.chars().count() > MAX_OUTPUT_CHARS {
        text = text.chars().take(MAX_OUTPUT_CHARS).collect();
        text.push_str("\n... [output truncated]");
    }
    text
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory and return stdout/stderr. \
         Use this for running programs, builds, tests and git operations."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 300)"
                }
            },
            "required": ["command"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }

    fn is_read_only(&self, arguments: &serde_json::Value) -> bool {
        arguments["command"].as_str().is_some_and(is_read_only_command)
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;
        let timeout = arguments["timeout"]
            .as_u64()
            .map(|s| Duration::from_secs(s.clamp(1, MAX_TIMEOUT_SECS)))
            .unwrap_or(self.default_timeout);

        debug!(command = %command, workdir = %self.workdir.display(), "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ToolError::ExecutionFailed {
            tool_name: "bash".into(),
            reason: e.to_string(),
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: "bash".into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: "bash".into(),
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().unwrap_or(-1);
        let success = output.status.success();

        let text = if success {
            if stderr.is_empty() {
                stdout.clone()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };

        Ok(ToolResult {
            success,
            output: truncate(text.trim().to_string()),
            data: Some(serde_json::json!({ "returncode": code })),
        })
    }
}
