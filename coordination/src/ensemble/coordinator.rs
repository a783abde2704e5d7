//! Session coordinator - drives a coordination run from start to finish
//!
//! [`Coordinator::launch`] validates the task and agent set, creates the
//! [`Session`], and spawns a driver task that walks the phase machine:
//!
//! ```text
//! initialization → coordinating → voting → enforcement → presentation → completed
//!                       ▲                       │
//!                       └──── restart ──────────┘        (any) → error
//! ```
//!
//! The driver never waits on a single worker: each round fans out into a
//! `JoinSet` and waits on the aggregate, racing a phase deadline. Phase
//! deadlines cancel a child of the session token, so timeouts and session
//! cancellation share one primitive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{SessionError, SessionResult};
use super::machine::PhaseMachine;
use super::status::{StatusReporter, StatusSnapshot};
use super::voting::VoteResolver;
use crate::admission::{AdmissionController, SharedAdmissionController};
use crate::backend::SharedBackend;
use crate::config::CoordinatorConfig;
use crate::events::{
    CoordinationEvent, EventAggregator, EventBusResult, EventSink, EventStream,
    SharedEventAggregator,
};
use crate::state::{
    AgentId, AgentStatus, Phase, RoundSummary, Session, SessionId, SharedArtifactStore,
    SharedSession, VoteTarget, RESERVED_AGENT_IDS,
};
use crate::worker::{AgentWorker, WorkerContext, WorkerOutcome};
use crate::workspace::SharedWorkspaceManager;

const TASK_PREVIEW_CHARS: usize = 100;

fn event_aggregator(config: &CoordinatorConfig) -> EventAggregator {
    EventAggregator::with_capacity(config.event_buffer).with_retention(config.retained_sessions)
}

/// Shared reference to Coordinator
pub type SharedCoordinator = Arc<Coordinator>;

/// One configured agent
#[derive(Clone)]
pub struct AgentSpec {
    pub id: AgentId,
    /// Provider/model class; also the admission key
    pub backend_key: String,
    pub backend: SharedBackend,
}

impl AgentSpec {
    pub fn new(id: impl Into<AgentId>, backend_key: impl Into<String>, backend: SharedBackend) -> Self {
        Self {
            id: id.into(),
            backend_key: backend_key.into(),
            backend,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub phase: Phase,
    pub winner: Option<AgentId>,
    pub answer: Option<String>,
    /// Final answer artifact
    pub artifact: Option<PathBuf>,
    pub error: Option<SessionError>,
    pub warnings: Vec<String>,
    pub rounds: u32,
    pub restart_count: u32,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.phase == Phase::Completed && self.winner.is_some()
    }

    /// Process exit code: 0 winner, 2 execution error, 3 timeout, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            return 0;
        }
        self.error.as_ref().map_or(2, SessionError::exit_code)
    }
}

/// Handle to a running session
pub struct SessionHandle {
    id: SessionId,
    session: SharedSession,
    cancel: CancellationToken,
    events: SharedEventAggregator,
    driver: JoinHandle<SessionOutcome>,
    reporter: JoinHandle<StatusSnapshot>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Subscribe to the session timeline (history first, then live events).
    pub fn subscribe(&self) -> EventBusResult<EventStream> {
        self.events.subscribe(&self.id)
    }

    /// Capture the current status without touching disk.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let active = self.events.last_agent(&self.id);
        StatusSnapshot::capture(&*self.session.read().await, active)
    }

    /// Request cancellation. Every live worker stops and the session ends in
    /// `error` with a cancellation reason.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the session to reach a terminal phase.
    pub async fn wait(self) -> SessionOutcome {
        let outcome = match self.driver.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session_id = %self.id, "Session driver failed: {}", e);
                self.events.close(&self.id);
                let session = self.session.read().await;
                SessionOutcome {
                    session_id: self.id.clone(),
                    phase: Phase::Error,
                    winner: None,
                    answer: None,
                    artifact: None,
                    error: Some(SessionError::Internal(e.to_string())),
                    warnings: session.warnings.clone(),
                    rounds: session.round,
                    restart_count: session.restart_count,
                }
            }
        };
        if let Err(e) = self.reporter.await {
            warn!(session_id = %self.id, "Status reporter failed: {}", e);
        }
        outcome
    }
}

/// Central coordinator for agent sessions
pub struct Coordinator {
    config: CoordinatorConfig,
    admission: SharedAdmissionController,
    workspaces: SharedWorkspaceManager,
    events: SharedEventAggregator,
    store: SharedArtifactStore,
}

impl Coordinator {
    /// Create a coordinator. Admission limits come from `config.rate_limits`.
    pub fn new(
        config: CoordinatorConfig,
        store: SharedArtifactStore,
        workspaces: SharedWorkspaceManager,
    ) -> Self {
        let admission = AdmissionController::new(&config.rate_limits).shared();
        let events = event_aggregator(&config).shared();
        Self {
            config,
            admission,
            workspaces,
            events,
            store,
        }
    }

    /// Persist every delivered event through `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = event_aggregator(&self.config).with_sink(sink).shared();
        self
    }

    /// Share an admission controller with other coordinators
    pub fn with_admission(mut self, admission: SharedAdmissionController) -> Self {
        self.admission = admission;
        self
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedCoordinator {
        Arc::new(self)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &SharedEventAggregator {
        &self.events
    }

    pub fn admission(&self) -> &SharedAdmissionController {
        &self.admission
    }

    /// Reject malformed tasks and agent sets before anything starts.
    pub fn validate(&self, task: &str, agents: &[AgentSpec]) -> SessionResult<()> {
        let invalid = |msg: String| Err(SessionError::Validation(msg));

        if task.trim().is_empty() {
            return invalid("task is empty".to_string());
        }
        if agents.is_empty() {
            return invalid("no agents configured".to_string());
        }
        if self.config.coordination_timeout_secs == 0 || self.config.voting_timeout_secs == 0 {
            return invalid("phase timeouts must be positive".to_string());
        }
        let mut limits: Vec<_> = self.config.rate_limits.iter().collect();
        limits.sort_by(|a, b| a.0.cmp(b.0));
        for (key, limit) in limits {
            if limit.max_starts == 0 || limit.window_secs == 0 {
                return invalid(format!(
                    "rate limit for {key:?} needs max_starts and window_secs above zero"
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for agent in agents {
            let id = agent.id.as_str();
            let well_formed = !id.is_empty()
                && id != "."
                && id != ".."
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !well_formed {
                return invalid(format!("invalid agent id {id:?}"));
            }
            if RESERVED_AGENT_IDS.contains(&id.to_ascii_lowercase().as_str()) {
                return invalid(format!("agent id {id:?} is reserved for vote markers"));
            }
            if !seen.insert(id) {
                return invalid(format!("duplicate agent id {id:?}"));
            }
            if agent.backend_key.trim().is_empty() {
                return invalid(format!("agent {id:?} has an empty backend key"));
            }
        }

        if let Some(designated) = &self.config.designated_agent {
            if !seen.contains(designated.as_str()) {
                return invalid(format!("designated agent {designated:?} is not configured"));
            }
        }
        Ok(())
    }

    /// Validate, create the session and start driving it.
    pub async fn launch(
        &self,
        task: impl Into<String>,
        agents: Vec<AgentSpec>,
    ) -> SessionResult<SessionHandle> {
        let task = task.into();
        if let Err(e) = self.validate(&task, &agents) {
            warn!("Session rejected: {}", e);
            return Err(e);
        }

        let session = Session::new(
            task.clone(),
            agents.iter().map(|a| (a.id.clone(), a.backend_key.clone())),
        );
        let session_id = session.id.clone();
        let agent_ids = session.agent_ids();
        let shared = session.shared();

        self.events
            .register(&session_id)
            .map_err(|e| SessionError::Internal(e.to_string()))?;
        let status_stream = self
            .events
            .subscribe(&session_id)
            .map_err(|e| SessionError::Internal(e.to_string()))?;

        let cancel = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            session_id: session_id.clone(),
            task: task.clone(),
            session: shared.clone(),
            events: self.events.clone(),
            admission: self.admission.clone(),
            workspaces: self.workspaces.clone(),
            retry: self.config.retry.clone(),
            cancel: cancel.clone(),
        });
        let workers = agents
            .into_iter()
            .map(|a| AgentWorker::new(ctx.clone(), a.id, a.backend_key, a.backend))
            .collect();

        let _ = self.events.publish_session(
            &session_id,
            CoordinationEvent::SessionCreated {
                task_preview: task.chars().take(TASK_PREVIEW_CHARS).collect(),
                agents: agent_ids.clone(),
            },
        );
        info!(session_id = %session_id, agents = agent_ids.len(), "Session started");

        let reporter = StatusReporter::new(self.store.clone(), self.config.status_interval())
            .spawn(shared.clone(), status_stream);

        let driver = SessionDriver {
            config: self.config.clone(),
            ctx,
            workers,
            machine: PhaseMachine::new(),
            store: self.store.clone(),
            timed_out: Arc::new(AtomicBool::new(false)),
        };
        let driver = tokio::spawn(driver.run());

        Ok(SessionHandle {
            id: session_id,
            session: shared,
            cancel,
            events: self.events.clone(),
            driver,
            reporter,
        })
    }

    /// Launch a session and wait for it to finish.
    pub async fn run(
        &self,
        task: impl Into<String>,
        agents: Vec<AgentSpec>,
    ) -> SessionResult<SessionOutcome> {
        Ok(self.launch(task, agents).await?.wait().await)
    }
}

/// Result of the enforcement phase
enum Decision {
    Present {
        winner: AgentId,
        warning: Option<String>,
    },
    Restart {
        requested_by: Option<AgentId>,
        winner: Option<AgentId>,
    },
}

/// Owns the phase machine for one session
struct SessionDriver {
    config: CoordinatorConfig,
    ctx: Arc<WorkerContext>,
    /// Workers in configuration order
    workers: Vec<AgentWorker>,
    machine: PhaseMachine,
    store: SharedArtifactStore,
    timed_out: Arc<AtomicBool>,
}

impl SessionDriver {
    async fn run(mut self) -> SessionOutcome {
        let timer = self.config.session_timeout().map(|limit| {
            let cancel = self.ctx.cancel.clone();
            let timed_out = self.timed_out.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(limit_secs = limit.as_secs(), "Session deadline exceeded");
                        timed_out.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                }
            })
        });

        let result = self.drive().await;
        if let Some(timer) = timer {
            timer.abort();
        }

        let artifact = match result {
            Ok(path) => Some(path),
            Err(e) => {
                self.abort(e).await;
                None
            }
        };
        self.finish(artifact).await
    }

    // =========================================================================
    // Phases
    // =========================================================================

    async fn drive(&mut self) -> SessionResult<PathBuf> {
        let mut round = 1;
        self.machine.set_round(round);
        self.advance(Phase::Coordinating, Some("session started")).await?;

        loop {
            self.coordinate(round).await?;
            self.advance(Phase::Voting, None).await?;
            self.collect_votes(round).await?;
            self.advance(Phase::Enforcement, None).await?;

            match self.enforce(round).await? {
                Decision::Present { winner, warning } => {
                    if let Some(warning) = warning {
                        self.warn(warning).await;
                    }
                    let reason = format!("winner {winner}");
                    self.advance(Phase::Presentation, Some(&reason)).await?;
                    return self.present(&winner).await;
                }
                Decision::Restart {
                    requested_by,
                    winner,
                } => {
                    round = self.archive_round(round, requested_by.clone(), winner).await;
                    self.machine.set_round(round);
                    let reason = match &requested_by {
                        Some(agent) => format!("restart requested by {agent}"),
                        None => "no consensus".to_string(),
                    };
                    self.advance(Phase::Coordinating, Some(&reason)).await?;
                }
            }
        }
    }

    /// Run one answer round and wait for every worker or the deadline.
    async fn coordinate(&mut self, round: u32) -> SessionResult<()> {
        self.ensure_live()?;
        self.publish(CoordinationEvent::RoundStarted { round });
        info!(session_id = %self.ctx.session_id, round, "Coordination round started");

        let prior = self.ctx.session.read().await.prior_answers();
        let phase = self.ctx.cancel.child_token();
        let mut set = JoinSet::new();
        for worker in &self.workers {
            let worker = worker.clone();
            let prior = prior.clone();
            let phase = phase.clone();
            set.spawn(async move {
                let outcome = worker.answer(round, prior, phase).await;
                (worker.agent_id().to_string(), outcome)
            });
        }

        let deadline = Instant::now() + self.config.coordination_timeout();
        let timed_out = self.join_round(&mut set, &phase, deadline, "coordination").await;
        self.ensure_live()?;
        self.sweep_unsettled("worker ended without settling").await;

        let session = self.ctx.session.read().await;
        if !session.answers().is_empty() {
            return Ok(());
        }
        if timed_out {
            return Err(SessionError::Timeout(format!(
                "no agent answered within {}s",
                self.config.coordination_timeout_secs
            )));
        }
        let reasons: Vec<String> = session
            .agents
            .iter()
            .map(|a| format!("{}: {}", a.id, a.last_error.as_deref().unwrap_or("unknown")))
            .collect();
        Err(SessionError::AllAgentsFailed(reasons.join("; ")))
    }

    /// Ask every answered agent for a vote.
    async fn collect_votes(&mut self, round: u32) -> SessionResult<()> {
        self.ensure_live()?;

        let (eligible, candidates, prior) = {
            let session = self.ctx.session.read().await;
            let eligible: Vec<AgentId> = session
                .agents
                .iter()
                .filter(|a| a.status == AgentStatus::Answered)
                .map(|a| a.id.clone())
                .collect();
            (eligible, session.answers(), session.prior_answers())
        };

        let phase = self.ctx.cancel.child_token();
        let mut set = JoinSet::new();
        for worker in self.workers.iter().filter(|w| eligible.iter().any(|id| id == w.agent_id())) {
            let worker = worker.clone();
            let candidates = candidates.clone();
            let prior = prior.clone();
            let phase = phase.clone();
            set.spawn(async move {
                let outcome = worker.vote(round, candidates, prior, phase).await;
                (worker.agent_id().to_string(), outcome)
            });
        }

        let deadline = Instant::now() + self.config.voting_timeout();
        self.join_round(&mut set, &phase, deadline, "voting").await;
        self.ensure_live()
    }

    /// Wait for every task in `set`, cancelling `phase` at `deadline`.
    /// Returns whether the deadline fired.
    async fn join_round(
        &self,
        set: &mut JoinSet<(AgentId, WorkerOutcome)>,
        phase: &CancellationToken,
        deadline: Instant,
        label: &'static str,
    ) -> bool {
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((agent_id, outcome))) => {
                        let completion = self.ctx.session.read().await.completion_percentage();
                        debug!(
                            session_id = %self.ctx.session_id,
                            agent_id = %agent_id,
                            ?outcome,
                            completion,
                            "{} worker finished",
                            label
                        );
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %self.ctx.session_id, "{} worker panicked: {}", label, e);
                    }
                },
                _ = &mut timeout, if !timed_out => {
                    timed_out = true;
                    warn!(
                        session_id = %self.ctx.session_id,
                        remaining = set.len(),
                        "{} timeout elapsed",
                        label
                    );
                    phase.cancel();
                }
            }
        }
        timed_out
    }

    /// Resolve the round and decide between presentation and restart.
    async fn enforce(&mut self, round: u32) -> SessionResult<Decision> {
        self.ensure_live()?;

        let (votes, answers, order, restart_count) = {
            let session = self.ctx.session.read().await;
            let answers: HashMap<AgentId, String> = session
                .answers()
                .into_iter()
                .map(|a| (a.agent_id, a.answer))
                .collect();
            (
                session.votes.targets(),
                answers,
                session.agent_ids(),
                session.restart_count,
            )
        };

        let resolution = VoteResolver::resolve(&votes, &answers, &order)
            .map_err(|e| SessionError::Internal(e.to_string()))?;
        if resolution.was_tie() {
            info!(tied = ?resolution.tied, winner = ?resolution.winner, "Tie broken by configuration order");
        }

        {
            let mut session = self.ctx.session.write().await;
            session.tally = Some(resolution.tally.clone());
            session.touch();
        }
        self.publish(CoordinationEvent::VotesTallied {
            round,
            tally: resolution.tally.clone(),
            winner: resolution.winner.clone(),
        });

        let authority = self
            .config
            .designated_agent
            .clone()
            .or_else(|| resolution.winner.clone());
        let requested_by = authority.filter(|a| votes.get(a) == Some(&VoteTarget::Restart));
        let budget_left = restart_count < self.config.max_restarts;

        match (requested_by, resolution.winner) {
            (Some(agent), winner) if budget_left => Ok(Decision::Restart {
                requested_by: Some(agent),
                winner,
            }),
            (Some(agent), winner) => {
                let best = winner
                    .or_else(|| order.iter().find(|id| answers.contains_key(*id)).cloned())
                    .ok_or_else(|| SessionError::Internal("no answer to present".to_string()))?;
                Ok(Decision::Present {
                    warning: Some(format!(
                        "{agent} requested a restart but the restart budget ({}) is exhausted; presenting {best}",
                        self.config.max_restarts
                    )),
                    winner: best,
                })
            }
            (None, Some(winner)) => Ok(Decision::Present {
                winner,
                warning: None,
            }),
            (None, None) if budget_left => Ok(Decision::Restart {
                requested_by: None,
                winner: None,
            }),
            (None, None) => Err(SessionError::NoConsensus(format!(
                "no answer received a supporting vote after {} round(s)",
                round
            ))),
        }
    }

    /// Close the round's books and return the next round number.
    async fn archive_round(
        &mut self,
        round: u32,
        requested_by: Option<AgentId>,
        winner: Option<AgentId>,
    ) -> u32 {
        let restart_count = {
            let mut session = self.ctx.session.write().await;
            let summary = RoundSummary {
                round,
                answers: session.answers(),
                votes: session.votes.clear_round(),
                tally: session.tally.take(),
                winner,
                restart_requested_by: requested_by.clone(),
            };
            session.rounds.push(summary);
            session.restart_count += 1;
            session.winner = None;
            session.touch();
            session.restart_count
        };

        info!(
            session_id = %self.ctx.session_id,
            round,
            restart_count,
            requested_by = ?requested_by,
            "Restarting coordination"
        );
        self.publish(CoordinationEvent::RestartRequested {
            requested_by,
            restart_count,
        });
        round + 1
    }

    /// Persist the winning answer and complete.
    async fn present(&mut self, winner: &str) -> SessionResult<PathBuf> {
        self.ensure_live()?;

        let answer = {
            let mut session = self.ctx.session.write().await;
            session.winner = Some(winner.to_string());
            session
                .agent(winner)
                .and_then(|a| a.answer.clone())
                .ok_or_else(|| SessionError::Internal(format!("winner {winner} has no answer")))?
        };

        let path = self
            .store
            .write_final_answer(&self.ctx.session_id, winner, &answer)
            .map_err(|e| {
                error!(session_id = %self.ctx.session_id, winner, "Failed to persist final answer: {}", e);
                SessionError::Persistence(e.to_string())
            })?;

        info!(session_id = %self.ctx.session_id, winner, path = %path.display(), "Winner selected");
        self.publish(CoordinationEvent::WinnerSelected {
            winner: winner.to_string(),
            artifact: path.display().to_string(),
        });
        self.advance(Phase::Completed, None).await?;
        Ok(path)
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Move to `error`, recording the most specific reason.
    async fn abort(&mut self, err: SessionError) {
        let reason = err.to_string();
        match &err {
            SessionError::Cancelled(_) | SessionError::Timeout(_) => {
                warn!(session_id = %self.ctx.session_id, "Session stopped: {}", reason)
            }
            _ => error!(session_id = %self.ctx.session_id, "Session failed: {}", reason),
        }

        // workers of a failed session must not keep running
        self.ctx.cancel.cancel();

        let from = self.machine.current();
        let record = match self.machine.fail(&reason) {
            Ok(record) => Some(record.clone()),
            Err(e) => {
                warn!(session_id = %self.ctx.session_id, "{}", e);
                None
            }
        };

        let mut session = self.ctx.session.write().await;
        session.phase = Phase::Error;
        session.error = Some(err);
        if let Some(record) = record {
            session.transitions.push(record);
        }
        session.touch();
        drop(session);

        self.publish(CoordinationEvent::PhaseChanged {
            from,
            to: Phase::Error,
            round: self.machine.round(),
            reason: Some(reason),
        });
    }

    /// Sweep agents, release resources, archive and close the timeline.
    async fn finish(self, artifact: Option<PathBuf>) -> SessionOutcome {
        let outcome = {
            let mut session = self.ctx.session.write().await;
            for record in session.agents.iter_mut() {
                if let Err(e) = record.set_status(AgentStatus::Completed) {
                    warn!("{}", e);
                }
            }
            session.touch();

            let answer = session
                .winner
                .as_deref()
                .and_then(|w| session.agent(w))
                .and_then(|a| a.answer.clone());
            SessionOutcome {
                session_id: session.id.clone(),
                phase: session.phase,
                winner: session.winner.clone(),
                answer,
                artifact,
                error: session.error.clone(),
                warnings: session.warnings.clone(),
                rounds: session.round,
                restart_count: session.restart_count,
            }
        };

        self.ctx.workspaces.release_session(&self.ctx.session_id);

        if let Err(e) = self.store.archive_session(&*self.ctx.session.read().await) {
            warn!(session_id = %self.ctx.session_id, "Failed to archive session: {}", e);
        }

        let _ = self.ctx.events.publish_session(
            &self.ctx.session_id,
            CoordinationEvent::SessionEnded {
                phase: outcome.phase,
                winner: outcome.winner.clone(),
                error: outcome.error.as_ref().map(|e| e.to_string()),
            },
        );
        self.ctx.events.close(&self.ctx.session_id);
        self.ctx.events.flush().await;

        info!(
            session_id = %outcome.session_id,
            phase = %outcome.phase,
            winner = ?outcome.winner,
            summary = %self.machine.summary(),
            "Session finished"
        );
        outcome
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn advance(&mut self, to: Phase, reason: Option<&str>) -> SessionResult<()> {
        let record = self
            .machine
            .advance(to, reason)
            .map_err(|e| SessionError::Internal(e.to_string()))?
            .clone();

        {
            let mut session = self.ctx.session.write().await;
            session.phase = to;
            session.round = record.round;
            session.transitions.push(record.clone());
            session.touch();
        }

        self.publish(CoordinationEvent::PhaseChanged {
            from: record.from,
            to: record.to,
            round: record.round,
            reason: record.reason,
        });
        Ok(())
    }

    /// Error out if the session was cancelled or its deadline passed.
    fn ensure_live(&self) -> SessionResult<()> {
        if !self.ctx.cancel.is_cancelled() {
            return Ok(());
        }
        if self.timed_out.load(Ordering::SeqCst) {
            let limit = self.config.session_timeout_secs.unwrap_or_default();
            return Err(SessionError::Timeout(format!(
                "session deadline of {limit}s exceeded"
            )));
        }
        Err(SessionError::Cancelled("session cancelled".to_string()))
    }

    /// Fail any agent still waiting or streaming after its worker returned.
    async fn sweep_unsettled(&self, reason: &str) {
        let mut session = self.ctx.session.write().await;
        for record in session.agents.iter_mut().filter(|a| !a.status.is_settled()) {
            warn!(agent_id = %record.id, "{}", reason);
            let _ = record.fail(reason);
        }
    }

    async fn warn(&self, message: String) {
        warn!(session_id = %self.ctx.session_id, "{}", message);
        self.ctx.session.write().await.warnings.push(message.clone());
        self.publish(CoordinationEvent::Warning { message });
    }

    fn publish(&self, event: CoordinationEvent) {
        if let Err(e) = self.ctx.events.publish_session(&self.ctx.session_id, event) {
            debug!(session_id = %self.ctx.session_id, "Event not published: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RoundScript, ScriptedBackend};
    use crate::state::FsArtifactStore;
    use crate::workspace::WorkspaceManager;
    use tempfile::TempDir;

    fn coordinator(config: CoordinatorConfig) -> (Coordinator, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path().join("state")).unwrap().shared();
        let workspaces = WorkspaceManager::new(dir.path().join("ws")).shared();
        (Coordinator::new(config, store, workspaces), dir)
    }

    fn scripted(id: &str, script: RoundScript) -> AgentSpec {
        AgentSpec::new(id, "scripted", Arc::new(ScriptedBackend::new(script)))
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let (c, _dir) = coordinator(CoordinatorConfig::default());
        let ok = || scripted("a", RoundScript::answer("x"));

        let cases: Vec<(&str, Vec<AgentSpec>)> = vec![
            ("   ", vec![ok()]),
            ("task", vec![]),
            ("task", vec![ok(), ok()]),
            ("task", vec![scripted("restart", RoundScript::answer("x"))]),
            ("task", vec![scripted("../etc", RoundScript::answer("x"))]),
            ("task", vec![AgentSpec::new("a", " ", Arc::new(ScriptedBackend::new(RoundScript::answer("x"))))]),
        ];
        for (task, agents) in cases {
            assert!(matches!(
                c.launch(task, agents).await,
                Err(SessionError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_designated_agent_must_exist() {
        let config = CoordinatorConfig {
            designated_agent: Some("ghost".into()),
            ..CoordinatorConfig::default()
        };
        let (c, _dir) = coordinator(config);
        let err = c
            .launch("task", vec![scripted("a", RoundScript::answer("x"))])
            .await
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_zero_rate_limit_is_rejected() {
        let (c, _dir) = coordinator(CoordinatorConfig::default().with_rate_limit("scripted", 0, 60));
        let err = c
            .launch("task", vec![scripted("a", RoundScript::answer("x"))])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Validation(ref m) if m.contains("\"scripted\"")));
        assert_eq!(c.events().session_count(), 0);
    }

    #[tokio::test]
    async fn test_single_agent_session() {
        let (c, _dir) = coordinator(CoordinatorConfig::default());
        let outcome = c
            .run("task", vec![scripted("a", RoundScript::answer("42").vote("a"))])
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.answer.as_deref(), Some("42"));
        assert_eq!(
            std::fs::read_to_string(outcome.artifact.unwrap()).unwrap(),
            "42"
        );
    }
}
