//! Session orchestration
//!
//! Drives a single task through concurrent agents until one answer wins.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Coordinator                          │
//! │  • Validates the task and agent set                        │
//! │  • Owns the phase machine                                  │
//! │  • Fans rounds out to workers, waits on the aggregate      │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!           ┌───────────────┼───────────────┐
//!           ▼               ▼               ▼
//!     ┌───────────┐   ┌───────────┐   ┌───────────┐
//!     │   Phase   │   │   Vote    │   │  Status   │
//!     │  Machine  │   │ Resolver  │   │ Reporter  │
//!     └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Workflow
//!
//! 1. `Coordinator::launch` validates input and creates the session
//! 2. Every agent answers concurrently under the coordination timeout
//! 3. Agents with an answer vote for one of the candidates
//! 4. The resolver tallies; ties go to the agent configured first
//! 5. A restart vote from the designated agent starts a new round,
//!    with earlier answers passed along as context
//! 6. The winning answer is persisted and the session completes
//!
//! # Usage
//!
//! ```ignore
//! use coordination::ensemble::{AgentSpec, Coordinator};
//! use coordination::state::FsArtifactStore;
//! use coordination::workspace::WorkspaceManager;
//!
//! let store = FsArtifactStore::open("./quorum-state")?.shared();
//! let workspaces = WorkspaceManager::in_temp_dir().shared();
//! let coordinator = Coordinator::new(config, store.clone(), workspaces)
//!     .with_event_sink(store);
//!
//! let handle = coordinator.launch("Summarize the design", agents).await?;
//! let outcome = handle.wait().await;
//! println!("Winner: {:?}", outcome.winner);
//! ```

pub mod coordinator;
pub mod error;
pub mod machine;
pub mod status;
pub mod voting;

pub use coordinator::{AgentSpec, Coordinator, SessionHandle, SessionOutcome, SharedCoordinator};
pub use error::{SessionError, SessionResult};
pub use machine::{IllegalTransition, PhaseMachine, TransitionRecord};
pub use status::{AgentStatusEntry, StatusReporter, StatusSnapshot};
pub use voting::{Resolution, VoteResolver, VoteTally, VotingError, VotingResult};
