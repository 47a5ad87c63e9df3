//! JSON-file session store.
//!
//! One file per session, named `<prefix>_<YYYYmmdd_HHMMSS>_<id8>.json` after
//! the session's start time and short id, holding `{metadata, messages}`.
//! Every save rewrites the whole file through a temp file and a rename, so
//! a crash mid-save leaves the previous version readable.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tiller_config::AppConfig;
use tiller_core::message::Message;
use tiller_core::session::{
    SessionError, SessionHandle, SessionMetadata, SessionSnapshot, SessionStore,
};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    metadata: SessionMetadata,
    messages: Vec<Message>,
}

pub struct JsonSessionStore {
    dir: PathBuf,
    prefix: String,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Store described by `[session_logging]`, or `None` when logging is off.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        config
            .session_logging
            .enabled
            .then(|| Self::new(config.session_dir(), &config.session_logging.session_prefix))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, snapshot: &SessionSnapshot) -> PathBuf {
        let stamp = snapshot.start_time.format("%Y%m%d_%H%M%S");
        self.dir.join(format!(
            "{}_{}_{}.json",
            self.prefix,
            stamp,
            snapshot.session_id.short()
        ))
    }

    /// Session files in the directory with their modification times.
    async fn session_files(&self) -> Result<Vec<(PathBuf, SystemTime)>, SessionError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let name_prefix = format!("{}_", self.prefix);
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_session = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&name_prefix) && n.ends_with(".json"));
            if !is_session {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }
        Ok(files)
    }

    async fn read_file(path: &Path) -> Result<SessionFile, SessionError> {
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw)
            .map_err(|e| SessionError::Corrupt(format!("{}: {e}", path.display())))
    }

    fn handle(path: PathBuf, session_id: String) -> SessionHandle {
        SessionHandle {
            session_id,
            location: path.to_string_lossy().into_owned(),
        }
    }
}

/// The `<id8>` part of a session file name.
fn short_id_of(path: &Path) -> Option<&str> {
    path.file_stem()?.to_str()?.rsplit('_').next()
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let file = SessionFile {
            metadata: SessionMetadata {
                session_id: snapshot.session_id.clone(),
                start_time: snapshot.start_time,
                end_time: Utc::now(),
                total_messages: snapshot.messages.len(),
                stats: snapshot.stats.clone(),
                config: snapshot.config.clone(),
                tools: snapshot.tools.clone(),
                auto_approve: snapshot.auto_approve,
            },
            messages: snapshot.messages.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| SessionError::Corrupt(format!("failed to serialize session: {e}")))?;

        let path = self.path_for(snapshot);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            session_id = %snapshot.session_id,
            path = %path.display(),
            messages = snapshot.messages.len(),
            "Session saved"
        );
        Ok(())
    }

    async fn find_latest(&self) -> Result<Option<SessionHandle>, SessionError> {
        let newest = self
            .session_files()
            .await?
            .into_iter()
            .max_by_key(|(_, modified)| *modified);

        let Some((path, _)) = newest else {
            return Ok(None);
        };
        let file = Self::read_file(&path).await?;
        Ok(Some(Self::handle(path, file.metadata.session_id.0)))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SessionHandle>, SessionError> {
        if id.is_empty() {
            return Ok(None);
        }
        let short: String = id.chars().take(8).collect();

        let mut candidates: Vec<_> = self
            .session_files()
            .await?
            .into_iter()
            .filter(|(path, _)| short_id_of(path).is_some_and(|s| s.starts_with(&short)))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in candidates {
            match Self::read_file(&path).await {
                Ok(file) if file.metadata.session_id.0.starts_with(id) => {
                    return Ok(Some(Self::handle(path, file.metadata.session_id.0)));
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        Ok(None)
    }

    async fn load(&self, handle: &SessionHandle) -> Result<(Vec<Message>, SessionMetadata), SessionError> {
        let path = PathBuf::from(&handle.location);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SessionError::NotFound(handle.session_id.clone()));
        }
        let file = Self::read_file(&path).await?;
        Ok((file.messages, file.metadata))
    }
}
