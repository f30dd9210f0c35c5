//! File-backed list of session descriptors.
//!
//! Every mutation loads the full list, splices it, and rewrites the file. This
//! registry is the only writer; several gateway processes sharing one state
//! directory are not supported.

use crate::error::Result;
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

/// What runs inside the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Shell,
    Tool,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Shell => "shell",
            SessionKind::Tool => "tool",
        }
    }
}

/// A persisted session descriptor. Its backend process is not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub folder: PathBuf,
    pub tool_id: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Truncated id used to tag log lines.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[derive(Debug)]
pub struct SessionRegistry {
    path: PathBuf,
    guard: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            guard: Mutex::new(()),
        }
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        Ok(persist::read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.list().await?.into_iter().find(|s| s.id == id))
    }

    pub async fn insert(&self, session: Session) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut sessions = self.list().await?;
        sessions.retain(|s| s.id != session.id);
        info!(session = %session.short_id(), folder = %session.folder.display(), "Registered session");
        sessions.push(session);
        persist::write_json(&self.path, &sessions).await?;
        Ok(())
    }

    /// Remove a descriptor; returns it when it existed.
    pub async fn remove(&self, id: &str) -> Result<Option<Session>> {
        let _guard = self.guard.lock().await;
        let mut sessions = self.list().await?;
        let Some(pos) = sessions.iter().position(|s| s.id == id) else {
            return Ok(None);
        };
        let removed = sessions.remove(pos);
        persist::write_json(&self.path, &sessions).await?;
        info!(session = %removed.short_id(), "Removed session");
        Ok(Some(removed))
    }
}
