//! Event types for the coordination timeline
//!
//! Every event travels inside a [`SessionEvent`] envelope carrying the session
//! id, the emitting agent (if any), that agent's sequence number, and the
//! arrival index assigned by the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ensemble::voting::VoteTally;
use crate::state::{AgentId, AgentStatus, Phase, SessionId, VoteTarget};

/// Arrival index, unique and increasing within a session
pub type EventId = u64;

/// How the aggregator treats an event under subscriber backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// May be dropped (oldest first) when a subscriber falls behind.
    Telemetry,
    /// Never dropped.
    Critical,
}

/// All coordination events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// A session was created and validated
    SessionCreated {
        task_preview: String,
        agents: Vec<AgentId>,
    },

    /// The session moved between phases
    PhaseChanged {
        from: Phase,
        to: Phase,
        round: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A coordination round started
    RoundStarted { round: u32 },

    /// An agent was admitted by the rate limiter
    AgentAdmitted { backend_key: String, waited_ms: u64 },

    /// An agent's status changed
    AgentStatusChanged { status: AgentStatus },

    /// Streamed content from the backend
    ContentChunk { text: String },

    /// The backend invoked a tool
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },

    /// A tool returned
    ToolResult { name: String, output: String },

    /// A recoverable transport failure is being retried
    Retrying {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },

    /// An agent produced its answer for the round
    AnswerSubmitted { round: u32, answer: String },

    /// An agent cast a vote
    VoteCast {
        target: VoteTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// An agent failed
    AgentFailed { error: String, fatal: bool },

    /// Votes for a round were tallied
    VotesTallied {
        round: u32,
        tally: VoteTally,
        winner: Option<AgentId>,
    },

    /// A restart round was granted
    RestartRequested {
        requested_by: Option<AgentId>,
        restart_count: u32,
    },

    /// Non-fatal condition worth surfacing
    Warning { message: String },

    /// The winning answer was persisted
    WinnerSelected {
        winner: AgentId,
        artifact: String,
    },

    /// The session reached a terminal phase
    SessionEnded {
        phase: Phase,
        winner: Option<AgentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl CoordinationEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinationEvent::SessionCreated { .. } => "session_created",
            CoordinationEvent::PhaseChanged { .. } => "phase_changed",
            CoordinationEvent::RoundStarted { .. } => "round_started",
            CoordinationEvent::AgentAdmitted { .. } => "agent_admitted",
            CoordinationEvent::AgentStatusChanged { .. } => "agent_status_changed",
            CoordinationEvent::ContentChunk { .. } => "content_chunk",
            CoordinationEvent::ToolCall { .. } => "tool_call",
            CoordinationEvent::ToolResult { .. } => "tool_result",
            CoordinationEvent::Retrying { .. } => "retrying",
            CoordinationEvent::AnswerSubmitted { .. } => "answer_submitted",
            CoordinationEvent::VoteCast { .. } => "vote_cast",
            CoordinationEvent::AgentFailed { .. } => "agent_failed",
            CoordinationEvent::VotesTallied { .. } => "votes_tallied",
            CoordinationEvent::RestartRequested { .. } => "restart_requested",
            CoordinationEvent::Warning { .. } => "warning",
            CoordinationEvent::WinnerSelected { .. } => "winner_selected",
            CoordinationEvent::SessionEnded { .. } => "session_ended",
        }
    }

    /// Backpressure class of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            CoordinationEvent::AgentAdmitted { .. }
            | CoordinationEvent::AgentStatusChanged { .. }
            | CoordinationEvent::ContentChunk { .. }
            | CoordinationEvent::ToolCall { .. }
            | CoordinationEvent::ToolResult { .. }
            | CoordinationEvent::Retrying { .. } => EventPriority::Telemetry,
            _ => EventPriority::Critical,
        }
    }

    /// Whether this event closes the session's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinationEvent::SessionEnded { .. })
    }
}

/// Envelope placed on the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Arrival index within the session.
    pub id: EventId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Per-agent emission sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: CoordinationEvent,
}

impl SessionEvent {
    pub fn new(
        id: EventId,
        session_id: SessionId,
        agent_id: Option<AgentId>,
        seq: Option<u64>,
        event: CoordinationEvent,
    ) -> Self {
        Self {
            id,
            session_id,
            agent_id,
            seq,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }

    pub fn priority(&self) -> EventPriority {
        self.event.priority()
    }
}
