//! Agent worker supervision
//!
//! An [`AgentWorker`] drives one agent through a round:
//!
//! ```text
//! answer round:  waiting → (admission) → streaming → answered | error
//! voting round:  answered → voted            (failure = abstention)
//! ```
//!
//! A worker only ever writes its own [`AgentRecord`] and its own vote. Every
//! backend chunk it forwards carries the agent's next sequence number; the
//! counter lives for the whole session so numbers stay monotonic across
//! restart rounds.
//!
//! Each round runs under a phase token that is a child of the session token.
//! When the phase token fires because of a timeout the worker records a
//! timeout error; when the session itself was cancelled the worker moves to
//! `completed` and stays silent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::SharedAdmissionController;
use crate::backend::{
    BackendChunk, BackendError, BackendResult, InvocationKind, InvocationRequest, SharedBackend,
};
use crate::config::RetryPolicy;
use crate::events::{CoordinationEvent, SharedEventAggregator};
use crate::state::{
    AgentId, AgentRecord, AgentStatus, RoundAnswer, SessionId, SharedSession, Vote, VoteTarget,
};
use crate::workspace::SharedWorkspaceManager;

/// Session-wide collaborators shared by every worker
pub struct WorkerContext {
    pub session_id: SessionId,
    pub task: String,
    pub session: SharedSession,
    pub events: SharedEventAggregator,
    pub admission: SharedAdmissionController,
    pub workspaces: SharedWorkspaceManager,
    pub retry: RetryPolicy,
    /// Session-level cancellation
    pub cancel: CancellationToken,
}

/// How a worker's round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Answered(String),
    Voted(VoteTarget),
    /// No usable vote; counted as a non-vote
    Abstained(String),
    Failed { error: String, fatal: bool },
    /// The phase deadline passed first
    TimedOut,
    /// The session was cancelled
    Cancelled,
}

impl WorkerOutcome {
    pub fn is_answer(&self) -> bool {
        matches!(self, Self::Answered(_))
    }
}

/// Successful reply to one invocation
enum Reply {
    Answer(String),
    Vote(VoteTarget, Option<String>),
}

/// Supervises one agent. Cheap to clone; clones share the sequence counter.
#[derive(Clone)]
pub struct AgentWorker {
    ctx: Arc<WorkerContext>,
    agent_id: AgentId,
    backend_key: String,
    backend: SharedBackend,
    seq: Arc<AtomicU64>,
}

impl AgentWorker {
    pub fn new(
        ctx: Arc<WorkerContext>,
        agent_id: impl Into<AgentId>,
        backend_key: impl Into<String>,
        backend: SharedBackend,
    ) -> Self {
        Self {
            ctx,
            agent_id: agent_id.into(),
            backend_key: backend_key.into(),
            backend,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Run one answer round.
    pub async fn answer(
        &self,
        round: u32,
        prior_context: Vec<RoundAnswer>,
        phase: CancellationToken,
    ) -> WorkerOutcome {
        let reset = self.update(|record| record.begin_round(round)).await;
        if let Some(Err(e)) = reset {
            warn!(agent_id = %self.agent_id, "Cannot start round: {}", e);
            return self.fail(e.to_string(), true).await;
        }
        self.emit(CoordinationEvent::AgentStatusChanged {
            status: AgentStatus::Waiting,
        });

        match self.ctx.admission.acquire(&self.backend_key, &phase).await {
            Ok(admission) => {
                self.emit(CoordinationEvent::AgentAdmitted {
                    backend_key: self.backend_key.clone(),
                    waited_ms: admission.waited.as_millis() as u64,
                });
            }
            Err(_) => return self.interrupted().await,
        }

        let workspace = match self.ensure_workspace().await {
            Ok(path) => path,
            Err(error) => return self.fail(error, true).await,
        };

        self.transition(AgentStatus::Streaming).await;
        debug!(agent_id = %self.agent_id, round, backend = self.backend.name(), "Agent streaming");

        let request = InvocationRequest {
            session_id: self.ctx.session_id.clone(),
            agent_id: self.agent_id.clone(),
            task: self.ctx.task.clone(),
            kind: InvocationKind::Answer,
            prior_context,
            workspace: Some(workspace),
            round,
        };

        let result = tokio::select! {
            biased;
            _ = phase.cancelled() => None,
            reply = self.invoke_with_retry(request) => Some(reply),
        };

        match result {
            None => self.interrupted().await,
            Some(Ok(Reply::Answer(answer))) => self.submit_answer(round, answer).await,
            Some(Ok(Reply::Vote(..))) => {
                self.fail("backend returned a vote instead of an answer", true)
                    .await
            }
            Some(Err(e)) => self.fail(e.to_string(), !e.is_retriable()).await,
        }
    }

    /// Ask the agent to vote for one of `candidates`.
    pub async fn vote(
        &self,
        round: u32,
        candidates: Vec<RoundAnswer>,
        prior_context: Vec<RoundAnswer>,
        phase: CancellationToken,
    ) -> WorkerOutcome {
        let workspace = self
            .ctx
            .session
            .read()
            .await
            .agent(&self.agent_id)
            .and_then(|r| r.workspace.clone());

        let request = InvocationRequest {
            session_id: self.ctx.session_id.clone(),
            agent_id: self.agent_id.clone(),
            task: self.ctx.task.clone(),
            kind: InvocationKind::Vote { candidates },
            prior_context,
            workspace,
            round,
        };

        let result = tokio::select! {
            biased;
            _ = phase.cancelled() => None,
            reply = self.invoke_with_retry(request) => Some(reply),
        };

        let reason = match result {
            None if self.ctx.cancel.is_cancelled() => {
                self.complete_silently().await;
                return WorkerOutcome::Cancelled;
            }
            None => "voting timeout".to_string(),
            Some(Ok(Reply::Vote(target, reason))) => {
                return self.record_vote(round, target, reason).await;
            }
            Some(Ok(Reply::Answer(_))) => "backend returned an answer instead of a vote".to_string(),
            Some(Err(e)) => e.to_string(),
        };

        warn!(agent_id = %self.agent_id, round, "Agent did not vote: {}", reason);
        let message = format!("{} did not vote: {}", self.agent_id, reason);
        self.ctx.session.write().await.warnings.push(message.clone());
        self.emit(CoordinationEvent::Warning { message });
        WorkerOutcome::Abstained(reason)
    }

    async fn invoke_with_retry(&self, request: InvocationRequest) -> BackendResult<Reply> {
        let mut attempt = 0;
        loop {
            match self.invoke_once(request.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retriable() && attempt < self.ctx.retry.max_retries => {
                    attempt += 1;
                    let delay = self.ctx.retry.delay_for(attempt);
                    warn!(
                        agent_id = %self.agent_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transport failure, retrying: {}",
                        e
                    );
                    self.emit(CoordinationEvent::Retrying {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One invocation: forward chunks until the answer or vote arrives.
    async fn invoke_once(&self, request: InvocationRequest) -> BackendResult<Reply> {
        let voting = request.is_vote();
        let mut stream = self.backend.invoke(request).await?;
        let mut content = String::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                BackendChunk::Content { text } => {
                    content.push_str(&text);
                    self.emit(CoordinationEvent::ContentChunk { text });
                }
                BackendChunk::ToolCall { name, arguments } => {
                    self.emit(CoordinationEvent::ToolCall { name, arguments });
                }
                BackendChunk::ToolResult { name, output } => {
                    self.emit(CoordinationEvent::ToolResult { name, output });
                }
                BackendChunk::FinalAnswer { answer } if !voting => {
                    return Ok(Reply::Answer(answer));
                }
                BackendChunk::Vote { target, reason } if voting => {
                    return Ok(Reply::Vote(target, reason));
                }
                BackendChunk::FatalError { message } => {
                    return Err(BackendError::Fatal(message));
                }
                other => {
                    debug!(agent_id = %self.agent_id, ?other, "Ignoring chunk for other round kind");
                }
            }
        }

        if voting {
            return Err(BackendError::Fatal("stream ended without a vote".to_string()));
        }
        if content.trim().is_empty() {
            return Err(BackendError::Transport(
                "stream ended without an answer".to_string(),
            ));
        }
        Ok(Reply::Answer(content))
    }

    async fn ensure_workspace(&self) -> Result<PathBuf, String> {
        if let Some(Some(path)) = self.update(|r| r.workspace.clone()).await {
            return Ok(path);
        }

        let slot = self
            .ctx
            .workspaces
            .allocate(&self.ctx.session_id, Some(&self.agent_id))
            .map_err(|e| e.to_string())?;
        let path = slot.path.clone();
        self.update(|r| r.workspace = Some(slot.path)).await;
        Ok(path)
    }

    async fn submit_answer(&self, round: u32, answer: String) -> WorkerOutcome {
        let stored = self
            .update(|record| {
                record.set_answer(answer.clone()).map_err(|e| e.to_string())?;
                record
                    .set_status(AgentStatus::Answered)
                    .map_err(|e| e.to_string())
            })
            .await;

        match stored {
            Some(Ok(_)) => {
                info!(agent_id = %self.agent_id, round, chars = answer.len(), "Answer submitted");
                self.emit(CoordinationEvent::AnswerSubmitted {
                    round,
                    answer: answer.clone(),
                });
                self.emit(CoordinationEvent::AgentStatusChanged {
                    status: AgentStatus::Answered,
                });
                WorkerOutcome::Answered(answer)
            }
            Some(Err(e)) => self.fail(e, true).await,
            None => WorkerOutcome::Failed {
                error: "agent record missing".to_string(),
                fatal: true,
            },
        }
    }

    async fn record_vote(
        &self,
        round: u32,
        target: VoteTarget,
        reason: Option<String>,
    ) -> WorkerOutcome {
        let mut vote = Vote::new(self.agent_id.clone(), target.clone(), round);
        if let Some(reason) = &reason {
            vote = vote.with_reason(reason.clone());
        }

        {
            let mut session = self.ctx.session.write().await;
            session.votes.cast(vote);
            if let Some(record) = session.agent_mut(&self.agent_id) {
                record.vote = Some(target.clone());
                if let Err(e) = record.set_status(AgentStatus::Voted) {
                    warn!(agent_id = %self.agent_id, "{}", e);
                }
            }
            session.touch();
        }

        debug!(agent_id = %self.agent_id, round, target = %target, "Vote cast");
        self.emit(CoordinationEvent::VoteCast {
            target: target.clone(),
            reason,
        });
        self.emit(CoordinationEvent::AgentStatusChanged {
            status: AgentStatus::Voted,
        });
        WorkerOutcome::Voted(target)
    }

    async fn fail(&self, error: impl Into<String>, fatal: bool) -> WorkerOutcome {
        let error = error.into();
        let recorded = self.update(|record| record.fail(error.clone())).await;
        if let Some(Err(e)) = recorded {
            warn!(agent_id = %self.agent_id, "{}", e);
        }

        warn!(agent_id = %self.agent_id, fatal, "Agent failed: {}", error);
        self.emit(CoordinationEvent::AgentFailed {
            error: error.clone(),
            fatal,
        });
        self.emit(CoordinationEvent::AgentStatusChanged {
            status: AgentStatus::Error,
        });
        WorkerOutcome::Failed { error, fatal }
    }

    /// The phase token fired before the round finished.
    async fn interrupted(&self) -> WorkerOutcome {
        if self.ctx.cancel.is_cancelled() {
            self.complete_silently().await;
            return WorkerOutcome::Cancelled;
        }
        self.fail("coordination timeout", false).await;
        WorkerOutcome::TimedOut
    }

    async fn complete_silently(&self) {
        self.update(|record| record.set_status(AgentStatus::Completed))
            .await;
        debug!(agent_id = %self.agent_id, "Agent stopped by cancellation");
    }

    async fn transition(&self, to: AgentStatus) {
        match self.update(|record| record.set_status(to)).await {
            Some(Ok(_)) => self.emit(CoordinationEvent::AgentStatusChanged { status: to }),
            Some(Err(e)) => warn!(agent_id = %self.agent_id, "{}", e),
            None => {}
        }
    }

    /// Apply `f` to this worker's own record.
    async fn update<R>(&self, f: impl FnOnce(&mut AgentRecord) -> R) -> Option<R> {
        let mut session = self.ctx.session.write().await;
        session.touch();
        session.agent_mut(&self.agent_id).map(f)
    }

    /// Publish with the next sequence number. Nothing is forwarded once the
    /// session is cancelled.
    fn emit(&self, event: CoordinationEvent) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self
            .ctx
            .events
            .publish(&self.ctx.session_id, &self.agent_id, seq, event)
        {
            debug!(agent_id = %self.agent_id, seq, "Event not published: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::backend::{RoundScript, ScriptedBackend};
    use crate::events::EventAggregator;
    use crate::state::Session;
    use crate::workspace::WorkspaceManager;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        ctx: Arc<WorkerContext>,
        _dir: TempDir,
    }

    fn harness(retry: RetryPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new("task", [("a", "scripted")]);
        let session_id = session.id.clone();
        let events = EventAggregator::new().shared();
        events.register(&session_id).unwrap();

        let ctx = Arc::new(WorkerContext {
            session_id,
            task: "task".into(),
            session: session.shared(),
            events,
            admission: AdmissionController::unlimited().shared(),
            workspaces: WorkspaceManager::new(dir.path()).shared(),
            retry,
            cancel: CancellationToken::new(),
        });
        Harness { ctx, _dir: dir }
    }

    fn worker(h: &Harness, backend: ScriptedBackend) -> AgentWorker {
        AgentWorker::new(h.ctx.clone(), "a", "scripted", Arc::new(backend))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    async fn status(h: &Harness) -> AgentStatus {
        h.ctx.session.read().await.agent("a").unwrap().status
    }

    #[tokio::test]
    async fn test_answer_round() {
        let h = harness(fast_retry());
        let w = worker(&h, ScriptedBackend::new(RoundScript::answer("42").chunks(["thinking"])));

        let outcome = w.answer(1, vec![], h.ctx.cancel.child_token()).await;
        assert_eq!(outcome, WorkerOutcome::Answered("42".into()));

        let session = h.ctx.session.read().await;
        let record = session.agent("a").unwrap();
        assert_eq!(record.status, AgentStatus::Answered);
        assert_eq!(record.answer.as_deref(), Some("42"));
        assert!(record.workspace.as_ref().unwrap().is_dir());

        let seqs: Vec<_> = h
            .ctx
            .events
            .history(&h.ctx.session_id)
            .iter()
            .map(|e| e.seq.unwrap())
            .collect();
        assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_content_only_stream_is_the_answer() {
        let h = harness(fast_retry());
        let script = RoundScript::default().chunks(["4", "2"]);
        let w = worker(&h, ScriptedBackend::new(script));

        let outcome = w.answer(1, vec![], h.ctx.cancel.child_token()).await;
        assert_eq!(outcome, WorkerOutcome::Answered("42".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let h = harness(fast_retry());
        let backend = ScriptedBackend::new(RoundScript::answer("ok")).with_transport_failures(2);
        let w = worker(&h, backend);

        let outcome = w.answer(1, vec![], h.ctx.cancel.child_token()).await;
        assert!(outcome.is_answer());

        let retries = h
            .ctx
            .events
            .history(&h.ctx.session_id)
            .iter()
            .filter(|e| e.event_type() == "retrying")
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_into_error() {
        let h = harness(fast_retry());
        let backend = ScriptedBackend::new(RoundScript::answer("ok")).with_transport_failures(5);
        let w = worker(&h, backend);

        let outcome = w.answer(1, vec![], h.ctx.cancel.child_token()).await;
        assert!(matches!(outcome, WorkerOutcome::Failed { fatal: false, .. }));
        assert_eq!(status(&h).await, AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_fatal_error_is_immediate() {
        let h = harness(fast_retry());
        let w = worker(&h, ScriptedBackend::new(RoundScript::fatal("bad key")));

        let outcome = w.answer(1, vec![], h.ctx.cancel.child_token()).await;
        assert_eq!(
            outcome,
            WorkerOutcome::Failed {
                error: "Fatal backend error: bad key".into(),
                fatal: true
            }
        );
        let session = h.ctx.session.read().await;
        assert_eq!(
            session.agent("a").unwrap().last_error.as_deref(),
            Some("Fatal backend error: bad key")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_timeout_records_error() {
        let h = harness(fast_retry());
        let w = worker(&h, ScriptedBackend::new(RoundScript::hang().chunks(["partial"])));
        let phase = h.ctx.cancel.child_token();

        let task = {
            let w = w.clone();
            let phase = phase.clone();
            tokio::spawn(async move { w.answer(1, vec![], phase).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        phase.cancel();

        assert_eq!(task.await.unwrap(), WorkerOutcome::TimedOut);
        let session = h.ctx.session.read().await;
        let record = session.agent("a").unwrap();
        assert_eq!(record.status, AgentStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("coordination timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_cancel_completes_silently() {
        let h = harness(fast_retry());
        let w = worker(&h, ScriptedBackend::new(RoundScript::hang().chunks(["partial"])));
        let phase = h.ctx.cancel.child_token();

        let task = {
            let w = w.clone();
            tokio::spawn(async move { w.answer(1, vec![], phase).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = h.ctx.events.history(&h.ctx.session_id).len();
        h.ctx.cancel.cancel();

        assert_eq!(task.await.unwrap(), WorkerOutcome::Cancelled);
        assert_eq!(status(&h).await, AgentStatus::Completed);
        assert_eq!(h.ctx.events.history(&h.ctx.session_id).len(), before);
    }

    #[tokio::test]
    async fn test_vote_is_recorded() {
        let h = harness(fast_retry());
        let w = worker(&h, ScriptedBackend::new(RoundScript::answer("42").vote("a")));
        w.answer(1, vec![], h.ctx.cancel.child_token()).await;

        let candidates = h.ctx.session.read().await.answers();
        let outcome = w
            .vote(1, candidates, vec![], h.ctx.cancel.child_token())
            .await;
        assert_eq!(outcome, WorkerOutcome::Voted(VoteTarget::Agent("a".into())));

        let session = h.ctx.session.read().await;
        assert_eq!(session.agent("a").unwrap().status, AgentStatus::Voted);
        assert_eq!(
            session.votes.get("a").map(|v| v.target.clone()),
            Some(VoteTarget::Agent("a".into()))
        );
    }

    #[tokio::test]
    async fn test_failed_vote_is_abstention() {
        let h = harness(fast_retry());
        let w = worker(&h, ScriptedBackend::new(RoundScript::answer("42")));
        w.answer(1, vec![], h.ctx.cancel.child_token()).await;

        let outcome = w.vote(1, vec![], vec![], h.ctx.cancel.child_token()).await;
        assert!(matches!(outcome, WorkerOutcome::Abstained(_)));

        let session = h.ctx.session.read().await;
        assert_eq!(session.agent("a").unwrap().status, AgentStatus::Answered);
        assert!(session.votes.is_empty());
    }

    #[tokio::test]
    async fn test_workspace_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();

        let session = Session::new("task", [("a", "scripted")]);
        let session_id = session.id.clone();
        let events = EventAggregator::new().shared();
        events.register(&session_id).unwrap();
        let ctx = Arc::new(WorkerContext {
            session_id,
            task: "task".into(),
            session: session.shared(),
            events,
            admission: AdmissionController::unlimited().shared(),
            workspaces: WorkspaceManager::new(blocker.join("ws")).shared(),
            retry: fast_retry(),
            cancel: CancellationToken::new(),
        });
        let w = AgentWorker::new(
            ctx.clone(),
            "a",
            "scripted",
            Arc::new(ScriptedBackend::new(RoundScript::answer("42"))),
        );

        let outcome = w.answer(1, vec![], ctx.cancel.child_token()).await;
        assert!(matches!(outcome, WorkerOutcome::Failed { fatal: true, .. }));
    }
}
