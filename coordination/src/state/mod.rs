//! Session state and its persistence
//!
//! - `types`: the `Session` aggregate, agent records, votes and round history
//! - `store`: filesystem artifact store for final answers, status documents,
//!   archived sessions and the durable event log
//!
//! # Usage
//!
//! ```ignore
//! use coordination::state::{FsArtifactStore, Session};
//!
//! let store = FsArtifactStore::open("./quorum-state")?;
//! let session = Session::new("Summarise the RFC", [("a", "openai:gpt-4o")]);
//! store.archive_session(&session)?;
//! ```

pub mod store;
pub mod types;

// Re-export core types
pub use store::{ArtifactStore, FsArtifactStore, SharedArtifactStore, StoreError, StoreResult};
pub use types::{
    AgentId, AgentRecord, AgentStatus, AnswerAlreadySet, IllegalAgentTransition, Phase,
    RoundAnswer, RoundSummary, Session, SessionId, SharedSession, Vote, VoteLedger, VoteTarget,
    RESERVED_AGENT_IDS,
};
