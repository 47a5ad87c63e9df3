//! Path validation for file tools.
//!
//! Relative paths resolve against the working directory. Resolved paths must
//! stay under one of the allowed roots and outside every forbidden prefix.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the working directory")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' matches forbidden path '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to resolve path '{path}': {reason}")]
    ResolveFailed { path: String, reason: String },
}

impl From<PathValidationError> for tiller_core::ToolError {
    fn from(err: PathValidationError) -> Self {
        tiller_core::ToolError::SandboxViolation(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PathPolicy {
    workdir: PathBuf,
    forbidden: Vec<String>,
}

impl PathPolicy {
    /// Confine access to `workdir`.
    pub fn new(workdir: impl Into<PathBuf>, forbidden: Vec<String>) -> Self {
        Self {
            workdir: canonical_or_raw(&workdir.into()),
            forbidden,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Resolve `path` and check it. Returns the absolute path on success.
    ///
    /// Files that do not exist yet (writes) are resolved through their
    /// nearest existing ancestor so symlinked parents cannot escape.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathValidationError> {
        let raw = Path::new(path);
        if raw.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathValidationError::PathTraversal { path: path.into() });
        }

        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.workdir.join(raw)
        };
        let resolved = resolve_existing_ancestor(&joined).map_err(|e| {
            PathValidationError::ResolveFailed {
                path: path.into(),
                reason: e.to_string(),
            }
        })?;

        let normalized = normalize(&resolved);

        for forbidden in &self.forbidden {
            let prefix = normalize(Path::new(&expand_tilde(forbidden)));
            if is_under(&normalized, &prefix) {
                return Err(PathValidationError::ForbiddenPath {
                    path: path.into(),
                    pattern: forbidden.clone(),
                });
            }
        }

        if !is_under(&normalized, &normalize(&self.workdir)) {
            return Err(PathValidationError::OutsideAllowedRoots { path: path.into() });
        }

        Ok(resolved)
    }
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Canonicalize the longest existing prefix, then re-append the rest.
fn resolve_existing_ancestor(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
    let mut resolved = existing.canonicalize()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Lowercased, forward-slash form without a Windows verbatim prefix.
fn normalize(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/").to_lowercase();
    let s = s.strip_prefix("//?/").unwrap_or(&s);
    s.trim_end_matches('/').to_string()
}

fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/")) || prefix.is_empty()
}

/// Expand ~ to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if (path.starts_with("~/") || path == "~")
        && let Ok(home) = home_dir()
    {
        return path.replacen('~', &home, 1);
    }
    path.to_string()
}

fn home_dir() -> Result<String, std::env::VarError> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
    }
}
