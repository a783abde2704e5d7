//! Backend collaborator interface
//!
//! The engine never speaks a provider's wire format. A backend turns an
//! [`InvocationRequest`] into a stream of [`BackendChunk`]s; concrete
//! providers live with the CLI, and [`scripted::ScriptedBackend`] drives
//! sessions deterministically in tests and dry runs.

pub mod scripted;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::state::{AgentId, RoundAnswer, SessionId, VoteTarget};

pub use scripted::{RoundScript, ScriptedBackend};

/// Error type for backend invocations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Network failure, rate limiting, overloaded provider. Retried with backoff.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend cannot serve this request at all.
    #[error("Fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Returns `true` if the worker may retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// One item of a backend's streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendChunk {
    Content {
        text: String,
    },
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: String,
    },
    FinalAnswer {
        answer: String,
    },
    Vote {
        target: VoteTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Explicit unrecoverable failure signalled in-band.
    FatalError {
        message: String,
    },
}

/// Streamed response from a backend
pub type BackendStream = BoxStream<'static, BackendResult<BackendChunk>>;

/// What the agent is being asked for
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationKind {
    /// Produce an answer to the task
    Answer,
    /// Vote for one of the candidate answers
    Vote { candidates: Vec<RoundAnswer> },
}

/// Everything a backend needs for one call
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub task: String,
    pub kind: InvocationKind,
    /// Answers from earlier rounds, oldest first
    pub prior_context: Vec<RoundAnswer>,
    pub workspace: Option<PathBuf>,
    pub round: u32,
}

impl InvocationRequest {
    pub fn is_vote(&self) -> bool {
        matches!(self.kind, InvocationKind::Vote { .. })
    }
}

/// Invocation capability bound to one agent's provider/model class
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name for logging (e.g. `"openai_compatible"`, `"scripted"`).
    fn name(&self) -> &str;

    /// Start one invocation. Errors returned here, or yielded by the stream,
    /// are classified by [`BackendError::is_retriable`].
    async fn invoke(&self, request: InvocationRequest) -> BackendResult<BackendStream>;
}

/// Shared reference to a backend
pub type SharedBackend = Arc<dyn Backend>;
