//! Workspace isolation for concurrent runs
//!
//! Every allocation gets its own directory under the manager's base path:
//! `<base>/<session-prefix>[-<agent>]-<suffix>`, where the suffix is random.
//! Identical inputs running in parallel therefore never share a path.
//! Releasing a slot only reclaims it; the directory is left on disk.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

const SUFFIX_LEN: usize = 8;
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Error type for workspace operations
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create workspace {}: {source}", .path.display())]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not find a free workspace slot under {}", .0.display())]
    Exhausted(PathBuf),
}

/// Result type for workspace operations
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Shared reference to WorkspaceManager
pub type SharedWorkspaceManager = Arc<WorkspaceManager>;

/// An allocated isolation unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceSlot {
    pub path: PathBuf,
    pub suffix: String,
    pub session_id: String,
    pub agent_id: Option<String>,
}

/// Allocates collision-free working directories
pub struct WorkspaceManager {
    base: PathBuf,
    live: Mutex<HashSet<WorkspaceSlot>>,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Manager rooted in the system temp directory
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("quorum-workspaces"))
    }

    /// Create a shared reference to this manager
    pub fn shared(self) -> SharedWorkspaceManager {
        Arc::new(self)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<WorkspaceSlot>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh slot for a session, optionally scoped to one agent.
    ///
    /// Fails fast when the directory cannot be created; callers must not fall
    /// back to a shared path.
    pub fn allocate(&self, session_id: &str, agent_id: Option<&str>) -> WorkspaceResult<WorkspaceSlot> {
        std::fs::create_dir_all(&self.base).map_err(|source| WorkspaceError::CreateFailed {
            path: self.base.clone(),
            source,
        })?;

        let prefix: String = session_id.chars().take(SUFFIX_LEN).collect();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let suffix: String = Uuid::new_v4().simple().to_string()[..SUFFIX_LEN].to_string();
            let name = match agent_id {
                Some(agent) => format!("{prefix}-{agent}-{suffix}"),
                None => format!("{prefix}-{suffix}"),
            };
            let path = self.base.join(name);

            // create_dir (not create_dir_all) so an existing directory is a collision
            match std::fs::create_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(path = %path.display(), "Workspace suffix collision, retrying");
                    continue;
                }
                Err(source) => {
                    warn!(path = %path.display(), "Workspace allocation failed: {}", source);
                    return Err(WorkspaceError::CreateFailed { path, source });
                }
            }

            let slot = WorkspaceSlot {
                path,
                suffix,
                session_id: session_id.to_string(),
                agent_id: agent_id.map(String::from),
            };
            self.lock().insert(slot.clone());
            debug!(session_id, agent_id, path = %slot.path.display(), "Workspace allocated");
            return Ok(slot);
        }

        Err(WorkspaceError::Exhausted(self.base.clone()))
    }

    /// Reclaim a slot. Releasing twice is a no-op.
    pub fn release(&self, slot: &WorkspaceSlot) {
        if self.lock().remove(slot) {
            debug!(path = %slot.path.display(), "Workspace released");
        }
    }

    /// Reclaim every slot owned by a session, returning how many were live.
    pub fn release_session(&self, session_id: &str) -> usize {
        let mut live = self.lock();
        let before = live.len();
        live.retain(|slot| slot.session_id != session_id);
        let released = before - live.len();
        if released > 0 {
            debug!(session_id, released, "Session workspaces released");
        }
        released
    }

    pub fn is_live(&self, slot: &WorkspaceSlot) -> bool {
        self.lock().contains(slot)
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
}
