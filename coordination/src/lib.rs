//! Quorum Coordination Library
//!
//! Runs one task through several AI agents at once and settles on a single
//! answer by vote.
//!
//! # Components
//!
//! - `admission`: per-backend sliding-window rate limiting
//! - `worker`: drives one agent through a round (admission, streaming, retries)
//! - `workspace`: isolated scratch directories per agent
//! - `events`: ordered per-session event timelines with bounded subscribers
//! - `ensemble`: phase machine, vote resolution, status reporting
//! - `state`: session aggregate and on-disk artifacts
//! - `backend`: the agent backend trait and a scripted backend
//!
//! # Usage
//!
//! ```ignore
//! let coordinator = Coordinator::new(CoordinatorConfig::default(), store, workspaces);
//! let outcome = coordinator.run("task", agents).await?;
//! std::process::exit(outcome.exit_code());
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod admission;
pub mod backend;
pub mod config;
pub mod ensemble;
pub mod events;
pub mod state;
pub mod worker;
pub mod workspace;

pub use admission::{AdmissionController, AdmissionError, SharedAdmissionController};
pub use backend::{
    Backend, BackendChunk, BackendError, BackendResult, BackendStream, InvocationKind,
    InvocationRequest, RoundScript, ScriptedBackend, SharedBackend,
};
pub use config::{CoordinatorConfig, RateLimitConfig, RetryPolicy};

pub use ensemble::{
    AgentSpec, Coordinator, SessionError, SessionHandle, SessionOutcome, SharedCoordinator,
    StatusSnapshot, VoteResolver, VoteTally,
};

pub use events::{
    CoordinationEvent, EventAggregator, EventFilter, EventHistory, EventStream, SessionEvent,
    SharedEventAggregator,
};

pub use state::{
    AgentId, AgentStatus, ArtifactStore, FsArtifactStore, Phase, Session, SessionId,
    SharedArtifactStore, VoteTarget,
};

pub use worker::{AgentWorker, WorkerContext, WorkerOutcome};
pub use workspace::{SharedWorkspaceManager, WorkspaceManager};
