//! Session-level error taxonomy
//!
//! Per-agent failures never appear here: they stay on the agent's record.
//! Only conditions that end the whole session become a [`SessionError`].
//!
//! | Variant          | Phase reached      | Exit code |
//! |------------------|--------------------|-----------|
//! | Validation       | never leaves init  | 1         |
//! | AllAgentsFailed  | error              | 2         |
//! | NoConsensus      | error              | 2         |
//! | Persistence      | error              | 2         |
//! | Internal         | error              | 2         |
//! | Timeout          | error              | 3         |
//! | Cancelled        | error              | 4         |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session ended without a winner.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SessionError {
    /// Malformed task or agent set; no worker was started.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every agent ended the coordination round in error.
    #[error("All agents failed: {0}")]
    AllAgentsFailed(String),

    /// No winner and the restart budget is exhausted.
    #[error("No consensus: {0}")]
    NoConsensus(String),

    /// The final answer could not be committed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A deadline passed with no winner.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Externally interrupted.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 1,
            Self::AllAgentsFailed(_)
            | Self::NoConsensus(_)
            | Self::Persistence(_)
            | Self::Internal(_) => 2,
            Self::Timeout(_) => 3,
            Self::Cancelled(_) => 4,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Short machine-readable kind, matching the serialized tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AllAgentsFailed(_) => "all_agents_failed",
            Self::NoConsensus(_) => "no_consensus",
            Self::Persistence(_) => "persistence",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
