//! System prompt assembly and fixed utility prompts.

use tiller_config::AppConfig;
use tiller_core::tool::ToolRegistry;

const DEFAULT_SYSTEM_PROMPT: &str = "You are tiller, a coding assistant working inside the user's \
project. Use the available tools to inspect and change files and to run commands. Keep answers \
short and concrete. When a tool result is wrapped in <tool_error>, read the error and adjust \
instead of repeating the same call.";

/// Asks the model to summarize the conversation so far for compaction.
pub const COMPACT_PROMPT: &str = "Summarize the conversation so far so that it can replace the \
full history. Include the user's goals, decisions made, files read or changed with their paths, \
commands run and their outcomes, and any work still pending. Write the summary as plain text \
addressed to yourself. Do not call tools.";

/// Builds the system prompt from the tool catalog and configuration.
///
/// Implementations must be pure: same inputs, same text.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, registry: &ToolRegistry, config: &AppConfig) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPromptBuilder;

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, registry: &ToolRegistry, config: &AppConfig) -> String {
        let base = config
            .system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let mut sections = vec![base.to_string()];

        let definitions = registry.definitions();
        if !definitions.is_empty() {
            let mut tools = String::from("## Tools\n");
            for def in &definitions {
                tools.push_str(&format!("- {}: {}\n", def.name, def.description));
            }
            sections.push(tools.trim_end().to_string());
        }

        sections.push(format!(
            "## Environment\nWorking directory: {}",
            config.effective_workdir().display()
        ));

        sections.join("\n\n")
    }
}
