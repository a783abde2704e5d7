//! Filesystem-backed artifact store
//!
//! Everything the engine exposes outside the process lands under one root:
//!
//! ```text
//! <root>/<session_id>/
//!     status.json                  polled status snapshot
//!     events.jsonl                 durable coordination event log
//!     session.json                 archived session aggregate
//!     final/<winner_id>/answer.md  final answer artifact
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::types::Session;
use crate::ensemble::status::StatusSnapshot;
use crate::events::{EventSink, SessionEvent};

/// Error type for artifact store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid path component: {0:?}")]
    InvalidKey(String),
}

/// Result type for artifact store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to an artifact store
pub type SharedArtifactStore = Arc<dyn ArtifactStore>;

/// Destination for everything a session publishes outside the engine.
pub trait ArtifactStore: Send + Sync {
    /// Persist the winning answer, returning where it was written.
    fn write_final_answer(
        &self,
        session_id: &str,
        winner: &str,
        answer: &str,
    ) -> StoreResult<PathBuf>;

    /// Replace the session's status document.
    fn write_status(&self, snapshot: &StatusSnapshot) -> StoreResult<()>;

    /// Archive the full session aggregate once it is terminal.
    fn archive_session(&self, session: &Session) -> StoreResult<()>;

    /// Append one event to the session's durable log.
    fn append_event(&self, event: &SessionEvent) -> StoreResult<()>;
}

/// Reject anything that could escape the store root.
fn component(key: &str) -> StoreResult<&str> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0'])
        || Path::new(key).is_absolute();
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Artifact store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open or create a store at the given path
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self { root })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> StoreResult<PathBuf> {
        Ok(self.root.join(component(session_id)?))
    }

    pub fn final_answer_path(&self, session_id: &str, winner: &str) -> StoreResult<PathBuf> {
        Ok(self
            .session_dir(session_id)?
            .join("final")
            .join(component(winner)?)
            .join("answer.md"))
    }

    pub fn status_path(&self, session_id: &str) -> StoreResult<PathBuf> {
        Ok(self.session_dir(session_id)?.join("status.json"))
    }

    pub fn event_log_path(&self, session_id: &str) -> StoreResult<PathBuf> {
        Ok(self.session_dir(session_id)?.join("events.jsonl"))
    }

    pub fn session_path(&self, session_id: &str) -> StoreResult<PathBuf> {
        Ok(self.session_dir(session_id)?.join("session.json"))
    }

    /// Write via a sibling temp file and rename, so pollers never see a
    /// half-written document.
    fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(())
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(path, &bytes)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn write_final_answer(
        &self,
        session_id: &str,
        winner: &str,
        answer: &str,
    ) -> StoreResult<PathBuf> {
        let path = self.final_answer_path(session_id, winner)?;
        Self::write_atomic(&path, answer.as_bytes())?;
        debug!(session_id, winner, path = %path.display(), "Final answer written");
        Ok(path)
    }

    fn write_status(&self, snapshot: &StatusSnapshot) -> StoreResult<()> {
        let path = self.status_path(&snapshot.session_id)?;
        Self::write_json(&path, snapshot)
    }

    fn archive_session(&self, session: &Session) -> StoreResult<()> {
        let path = self.session_path(&session.id)?;
        Self::write_json(&path, session)?;
        debug!(session_id = %session.id, "Session archived");
        Ok(())
    }

    fn append_event(&self, event: &SessionEvent) -> StoreResult<()> {
        let path = self.event_log_path(&event.session_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.write_all(&line).map_err(io_err(&path))
    }
}

impl EventSink for FsArtifactStore {
    fn append(&self, event: &SessionEvent) -> StoreResult<()> {
        self.append_event(event)
    }
}
