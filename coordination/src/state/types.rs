//! Core types for coordination sessions
//!
//! A [`Session`] is the single owned aggregate for one coordination run. The
//! state machine holds it behind a [`SharedSession`] handle; each agent worker
//! receives the same handle but only ever writes its own [`AgentRecord`] and
//! its own entry in the [`VoteLedger`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::ensemble::error::SessionError;
use crate::ensemble::machine::TransitionRecord;
use crate::ensemble::voting::VoteTally;

/// Unique identifier for coordination sessions
pub type SessionId = String;

/// Agent identifier, unique within a session
pub type AgentId = String;

/// Shared handle to a session aggregate
pub type SharedSession = Arc<RwLock<Session>>;

/// Agent ids that collide with vote markers and are therefore rejected.
pub const RESERVED_AGENT_IDS: &[&str] = &["abstain", "none", "restart"];

/// Session phases, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    Coordinating,
    Voting,
    Enforcement,
    Presentation,
    /// Terminal: a winner was presented.
    Completed,
    /// Terminal: the session failed or was cancelled.
    Error,
}

impl Phase {
    /// Whether this is a terminal phase (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => write!(f, "initialization"),
            Self::Coordinating => write!(f, "coordinating"),
            Self::Voting => write!(f, "voting"),
            Self::Enforcement => write!(f, "enforcement"),
            Self::Presentation => write!(f, "presentation"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Observable status of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Waiting,
    Streaming,
    Answered,
    Voted,
    Error,
    Completed,
}

impl AgentStatus {
    /// Whether the agent has stopped working for the current coordination round.
    pub fn is_settled(self) -> bool {
        !matches!(self, Self::Waiting | Self::Streaming)
    }

    /// Legal status edges.
    ///
    /// ```text
    /// Waiting   → Streaming | Error | Completed
    /// Streaming → Answered | Error | Completed
    /// Answered  → Voted | Completed | Waiting (restart)
    /// Voted     → Completed | Waiting (restart)
    /// Error     → Completed | Waiting (restart)
    /// ```
    pub fn can_transition_to(self, to: AgentStatus) -> bool {
        use AgentStatus::*;

        if self == to {
            return true;
        }

        matches!(
            (self, to),
            (Waiting, Streaming)
                | (Waiting, Error)
                | (Waiting, Completed)
                | (Streaming, Answered)
                | (Streaming, Error)
                | (Streaming, Completed)
                | (Answered, Voted)
                | (Answered, Completed)
                | (Answered, Waiting)
                | (Voted, Completed)
                | (Voted, Waiting)
                | (Error, Completed)
                | (Error, Waiting)
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Answered => write!(f, "answered"),
            Self::Voted => write!(f, "voted"),
            Self::Error => write!(f, "error"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Error returned when an agent status edge is not in the table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal agent transition for {agent_id}: {from} → {to}")]
pub struct IllegalAgentTransition {
    pub agent_id: AgentId,
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// An answer produced by one agent in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAnswer {
    pub round: u32,
    pub agent_id: AgentId,
    pub answer: String,
}

/// One worker's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    /// Opaque key naming the provider/model class; also the admission key.
    pub backend_key: String,
    pub status: AgentStatus,
    /// Answer for the current round. Set once per round.
    pub answer: Option<String>,
    /// Answers from earlier rounds, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_answers: Vec<RoundAnswer>,
    pub vote: Option<VoteTarget>,
    pub last_error: Option<String>,
    pub workspace: Option<PathBuf>,
    pub round: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn new(id: impl Into<AgentId>, backend_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend_key: backend_key.into(),
            status: AgentStatus::Waiting,
            answer: None,
            previous_answers: Vec::new(),
            vote: None,
            last_error: None,
            workspace: None,
            round: 0,
            started_at: None,
            ended_at: None,
        }
    }

    /// Move to `to`, returning the previous status.
    pub fn set_status(&mut self, to: AgentStatus) -> Result<AgentStatus, IllegalAgentTransition> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(IllegalAgentTransition {
                agent_id: self.id.clone(),
                from,
                to,
            });
        }

        let now = Utc::now();
        match to {
            AgentStatus::Streaming if from != to => self.started_at = Some(now),
            AgentStatus::Answered | AgentStatus::Error | AgentStatus::Completed => {
                self.ended_at.get_or_insert(now);
            }
            _ => {}
        }

        self.status = to;
        Ok(from)
    }

    /// Record the round's answer. A second answer in the same round is rejected.
    pub fn set_answer(&mut self, answer: impl Into<String>) -> Result<(), AnswerAlreadySet> {
        if self.answer.is_some() {
            return Err(AnswerAlreadySet {
                agent_id: self.id.clone(),
                round: self.round,
            });
        }
        self.answer = Some(answer.into());
        Ok(())
    }

    /// Record a failure and move to `Error`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), IllegalAgentTransition> {
        self.last_error = Some(error.into());
        self.set_status(AgentStatus::Error).map(|_| ())
    }

    /// Reset for a new coordination round. The current answer is archived
    /// into `previous_answers`, which is the revision protocol for answers.
    pub fn begin_round(&mut self, round: u32) -> Result<(), IllegalAgentTransition> {
        self.set_status(AgentStatus::Waiting)?;
        if let Some(answer) = self.answer.take() {
            self.previous_answers.push(RoundAnswer {
                round: self.round,
                agent_id: self.id.clone(),
                answer,
            });
        }
        self.round = round;
        self.vote = None;
        self.last_error = None;
        self.started_at = None;
        self.ended_at = None;
        Ok(())
    }

    pub fn has_answer(&self) -> bool {
        self.answer.is_some()
    }
}

/// Error returned when an agent tries to overwrite its answer within a round.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("agent {agent_id} already answered in round {round}")]
pub struct AnswerAlreadySet {
    pub agent_id: AgentId,
    pub round: u32,
}

/// What a vote points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteTarget {
    /// Support for another agent's (or one's own) answer.
    Agent(AgentId),
    /// Explicit non-vote.
    Abstain,
    /// Demand another coordination round.
    Restart,
}

impl VoteTarget {
    /// Parse a backend-supplied target. `"abstain"`/`"none"` and `"restart"`
    /// are markers; anything else names an agent.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "abstain" | "none" => Self::Abstain,
            "restart" => Self::Restart,
            _ => Self::Agent(trimmed.to_string()),
        }
    }

    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::Agent(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for VoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{id}"),
            Self::Abstain => write!(f, "abstain"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// A cast vote. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: AgentId,
    pub target: VoteTarget,
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    pub fn new(voter: impl Into<AgentId>, target: VoteTarget, round: u32) -> Self {
        Self {
            voter: voter.into(),
            target,
            round,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Active votes for the current round plus the full audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoteLedger {
    active: BTreeMap<AgentId, Vote>,
    history: Vec<Vote>,
}

impl VoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vote. A later vote from the same agent replaces the earlier
    /// one for tallying; both stay in the history.
    pub fn cast(&mut self, vote: Vote) -> Option<Vote> {
        self.history.push(vote.clone());
        self.active.insert(vote.voter.clone(), vote)
    }

    /// Active targets keyed by voter.
    pub fn targets(&self) -> HashMap<AgentId, VoteTarget> {
        self.active
            .iter()
            .map(|(voter, vote)| (voter.clone(), vote.target.clone()))
            .collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &Vote> {
        self.active.values()
    }

    pub fn get(&self, voter: &str) -> Option<&Vote> {
        self.active.get(voter)
    }

    pub fn history(&self) -> &[Vote] {
        &self.history
    }

    /// Drop active votes at the end of a round. History is kept.
    pub fn clear_round(&mut self) -> Vec<Vote> {
        std::mem::take(&mut self.active).into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Summary of one finished coordination round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u32,
    pub answers: Vec<RoundAnswer>,
    pub votes: Vec<Vote>,
    pub tally: Option<VoteTally>,
    pub winner: Option<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_requested_by: Option<AgentId>,
}

/// One coordination run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub task: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Agent records in configuration order.
    pub agents: Vec<AgentRecord>,
    pub votes: VoteLedger,
    pub tally: Option<VoteTally>,
    pub winner: Option<AgentId>,
    /// Current coordination round, starting at 1 once coordinating.
    pub round: u32,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rounds: Vec<RoundSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub error: Option<SessionError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRecord>,
}

impl Session {
    /// Create a session with agents in configuration order.
    pub fn new<I, A, B>(task: impl Into<String>, agents: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<AgentId>,
        B: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            phase: Phase::Initialization,
            created_at: now,
            updated_at: now,
            agents: agents
                .into_iter()
                .map(|(id, key)| AgentRecord::new(id, key))
                .collect(),
            votes: VoteLedger::new(),
            tally: None,
            winner: None,
            round: 0,
            restart_count: 0,
            rounds: Vec::new(),
            warnings: Vec::new(),
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Wrap into a shared handle.
    pub fn shared(self) -> SharedSession {
        Arc::new(RwLock::new(self))
    }

    /// Touch the session to update last activity
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn agent(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn agent_mut(&mut self, id: &str) -> Option<&mut AgentRecord> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    /// Agent ids in configuration order.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.iter().map(|a| a.id.clone()).collect()
    }

    /// Share of agents no longer waiting or streaming, as a percentage.
    pub fn completion_percentage(&self) -> f32 {
        if self.agents.is_empty() {
            return 0.0;
        }
        let settled = self.agents.iter().filter(|a| a.status.is_settled()).count();
        settled as f32 * 100.0 / self.agents.len() as f32
    }

    /// Whether every agent has settled for the current round.
    pub fn all_settled(&self) -> bool {
        self.agents.iter().all(|a| a.status.is_settled())
    }

    /// Current-round answers in configuration order.
    pub fn answers(&self) -> Vec<RoundAnswer> {
        self.agents
            .iter()
            .filter_map(|a| {
                a.answer.as_ref().map(|answer| RoundAnswer {
                    round: a.round,
                    agent_id: a.id.clone(),
                    answer: answer.clone(),
                })
            })
            .collect()
    }

    /// Every answer from finished rounds, oldest first.
    pub fn prior_answers(&self) -> Vec<RoundAnswer> {
        self.rounds
            .iter()
            .flat_map(|r| r.answers.iter().cloned())
            .collect()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}
