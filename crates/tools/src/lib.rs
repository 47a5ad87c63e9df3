//! Built-in tool implementations for tiller.
//!
//! A closed set: read files, write files, run shell commands. File tools are
//! confined to the working directory by a [`PathPolicy`].

pub mod bash;
pub mod read_file;
pub mod write_file;

use std::time::Duration;

use tiller_config::AppConfig;
use tiller_core::tool::ToolRegistry;
use tiller_security::PathPolicy;

pub use bash::BashTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

/// Create the tool registry for a configuration.
///
/// Per-tool settings (`[tools.<name>]`) are applied on top of each tool's
/// default permission; `tools.bash.timeout_secs` sets the default command
/// timeout.
pub fn default_registry(config: &AppConfig) -> ToolRegistry {
    let workdir = config.effective_workdir();
    let policy = PathPolicy::new(workdir.clone(), config.forbidden_paths.clone());

    let mut bash = BashTool::new(workdir);
    if let Some(secs) = config.tools.get("bash").and_then(|s| s.timeout_secs) {
        bash = bash.with_default_timeout(Duration::from_secs(secs));
    }

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ReadFileTool::new(policy.clone())));
    registry.register(Box::new(WriteFileTool::new(policy)));
    registry.register(Box::new(bash));

    for (name, settings) in &config.tools {
        registry.set_settings(name.clone(), settings.clone());
    }
    registry
}
