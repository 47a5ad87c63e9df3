//! Session persistence collaborator.
//!
//! The agent saves its history after every turn and can resume from a saved
//! session. The storage format belongs to the implementation; the agent only
//! sees snapshots, handles, and metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::agent::AgentStats;
use crate::message::Message;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    /// First eight characters, used in file names and logs.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything written on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub stats: AgentStats,
    /// Resolved configuration at save time
    pub config: serde_json::Value,
    /// Names of the tools available to the session
    pub tools: Vec<String>,
    pub auto_approve: bool,
}

/// Metadata returned alongside messages on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_messages: usize,
    pub stats: AgentStats,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub auto_approve: bool,
}

/// Opaque pointer to a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub location: String,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session file is corrupt: {0}")]
    Corrupt(String),

    #[error("Session not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, snapshot: &SessionSnapshot) -> std::result::Result<(), SessionError>;

    async fn find_latest(&self) -> std::result::Result<Option<SessionHandle>, SessionError>;

    /// Look a session up by full id or id prefix.
    async fn find_by_id(&self, id: &str) -> std::result::Result<Option<SessionHandle>, SessionError>;

    async fn load(
        &self,
        handle: &SessionHandle,
    ) -> std::result::Result<(Vec<Message>, SessionMetadata), SessionError>;
}
