//! Status reporting
//!
//! Projects live session state into a polling-friendly [`StatusSnapshot`]
//! and keeps `status.json` fresh while the session runs. The reporter only
//! reads; it never influences coordination.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::voting::VoteTally;
use crate::events::EventStream;
use crate::state::{AgentId, AgentStatus, Phase, Session, SharedArtifactStore, SharedSession};

/// Per-agent slice of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatusEntry {
    pub id: AgentId,
    pub backend_key: String,
    pub status: AgentStatus,
    pub has_answer: bool,
    pub error: Option<String>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub elapsed_secs: f64,
    pub task: String,
    pub phase: Phase,
    pub round: u32,
    pub restart_count: u32,
    pub completion_pct: f32,
    /// Agent whose event was delivered most recently
    pub active_agent: Option<AgentId>,
    /// Agents in configuration order
    pub agents: Vec<AgentStatusEntry>,
    pub vote_tally: Option<VoteTally>,
    /// Active votes for the current round, voter to target
    pub votes: BTreeMap<AgentId, String>,
    pub winner: Option<AgentId>,
    /// Most specific known session error
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl StatusSnapshot {
    /// Capture a snapshot from a consistent view of the session.
    pub fn capture(session: &Session, active_agent: Option<AgentId>) -> Self {
        Self {
            session_id: session.id.clone(),
            elapsed_secs: session.elapsed().num_milliseconds().max(0) as f64 / 1000.0,
            task: session.task.clone(),
            phase: session.phase,
            round: session.round,
            restart_count: session.restart_count,
            completion_pct: session.completion_percentage(),
            active_agent,
            agents: session
                .agents
                .iter()
                .map(|a| AgentStatusEntry {
                    id: a.id.clone(),
                    backend_key: a.backend_key.clone(),
                    status: a.status,
                    has_answer: a.has_answer(),
                    error: a.last_error.clone(),
                })
                .collect(),
            vote_tally: session.tally.clone(),
            votes: session
                .votes
                .active()
                .map(|v| (v.voter.clone(), v.target.to_string()))
                .collect(),
            winner: session.winner.clone(),
            error: session.error.as_ref().map(|e| e.to_string()),
            warnings: session.warnings.clone(),
        }
    }
}

/// Periodically persists status snapshots
pub struct StatusReporter {
    store: SharedArtifactStore,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(store: SharedArtifactStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Capture and persist one snapshot.
    pub async fn report(&self, session: &SharedSession, active_agent: Option<AgentId>) -> StatusSnapshot {
        let snapshot = StatusSnapshot::capture(&*session.read().await, active_agent);
        if let Err(e) = self.store.write_status(&snapshot) {
            warn!(session_id = %snapshot.session_id, "Failed to write status: {}", e);
        }
        snapshot
    }

    /// Refresh the status document every interval until the event stream
    /// ends, then write once more so the final state is on disk.
    pub fn spawn(self, session: SharedSession, mut events: EventStream) -> JoinHandle<StatusSnapshot> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut active_agent: Option<AgentId> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.report(&session, active_agent.clone()).await;
                    }
                    event = events.recv() => match event {
                        Some(event) => {
                            if let Some(agent) = &event.agent_id {
                                active_agent = Some(agent.clone());
                            }
                        }
                        None => break,
                    }
                }
            }

            let snapshot = self.report(&session, active_agent).await;
            debug!(session_id = %snapshot.session_id, phase = %snapshot.phase, "Final status written");
            snapshot
        })
    }
}
