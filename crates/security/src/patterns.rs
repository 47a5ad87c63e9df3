//! Allow/deny pattern policies over tool arguments.
//!
//! Each tool can carry glob patterns in its settings. A call's pattern
//! subjects (paths, commands) are matched against them: any denylist hit
//! forces a skip, otherwise any allowlist hit forces execution.

use glob::Pattern;
use tiller_core::ToolSettings;

/// Outcome of matching a call against a tool's patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternVerdict {
    Denied { pattern: String, subject: String },
    Allowed { pattern: String },
    /// No pattern matched; fall through to the tool permission
    NoMatch,
}

#[derive(Debug, Clone, Default)]
pub struct PatternPolicy {
    allow: Vec<(String, Pattern)>,
    deny: Vec<(String, Pattern)>,
}

impl PatternPolicy {
    /// Compile a tool's patterns. Invalid globs are logged and skipped.
    pub fn from_settings(tool_name: &str, settings: &ToolSettings) -> Self {
        Self {
            allow: compile(tool_name, &settings.allowlist),
            deny: compile(tool_name, &settings.denylist),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Check every subject. Denylist wins over allowlist.
    pub fn check(&self, subjects: &[String]) -> PatternVerdict {
        for subject in subjects {
            if let Some((raw, _)) = self.deny.iter().find(|(_, p)| p.matches(subject)) {
                return PatternVerdict::Denied {
                    pattern: raw.clone(),
                    subject: subject.clone(),
                };
            }
        }

        for subject in subjects {
            if let Some((raw, _)) = self.allow.iter().find(|(_, p)| p.matches(subject)) {
                return PatternVerdict::Allowed { pattern: raw.clone() };
            }
        }

        PatternVerdict::NoMatch
    }
}

fn compile(tool_name: &str, raw: &[String]) -> Vec<(String, Pattern)> {
    raw.iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(compiled) => Some((p.clone(), compiled)),
            Err(e) => {
                tracing::warn!(tool = %tool_name, pattern = %p, error = %e, "Ignoring invalid tool pattern");
                None
            }
        })
        .collect()
}
