//! Deterministic backend driven by per-round scripts
//!
//! Round `n` plays `rounds[n - 1]`; the last script repeats for any later
//! round. Every request is recorded so callers can inspect what the engine
//! sent (prior context, candidates, workspace).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::{Backend, BackendChunk, BackendError, BackendResult, BackendStream, InvocationRequest};
use crate::state::VoteTarget;

/// Behaviour of one agent in one round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundScript {
    /// Content chunks streamed before anything else
    pub chunks: Vec<String>,
    /// Final answer. When absent the concatenated chunks are the answer.
    pub answer: Option<String>,
    /// Fail fatally after streaming the chunks
    pub fatal: Option<String>,
    /// Never finish after streaming the chunks
    pub hang: bool,
    /// Never finish the vote invocation
    pub hang_vote: bool,
    /// Vote target (`<agent-id>`, `abstain` or `restart`). When absent the
    /// vote invocation fails.
    pub vote: Option<String>,
    pub vote_reason: Option<String>,
}

impl RoundScript {
    pub fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: Some(answer.into()),
            ..Self::default()
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    pub fn vote(mut self, target: impl Into<String>) -> Self {
        self.vote = Some(target.into());
        self
    }

    pub fn hang_vote(mut self) -> Self {
        self.hang_vote = true;
        self
    }

    pub fn vote_reason(mut self, reason: impl Into<String>) -> Self {
        self.vote_reason = Some(reason.into());
        self
    }
}

/// Backend that replays scripted rounds
pub struct ScriptedBackend {
    rounds: Vec<RoundScript>,
    transport_failures: AtomicU32,
    chunk_delay: Duration,
    requests: Mutex<Vec<InvocationRequest>>,
}

impl ScriptedBackend {
    pub fn new(first_round: RoundScript) -> Self {
        Self::from_rounds(vec![first_round])
    }

    pub fn from_rounds(rounds: Vec<RoundScript>) -> Self {
        Self {
            rounds,
            transport_failures: AtomicU32::new(0),
            chunk_delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script for the next round
    pub fn then(mut self, round: RoundScript) -> Self {
        self.rounds.push(round);
        self
    }

    /// Fail the first `n` invocations with a transport error
    pub fn with_transport_failures(self, n: u32) -> Self {
        self.transport_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Sleep before yielding each chunk
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Requests received so far, in call order
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn script_for(&self, round: u32) -> RoundScript {
        let index = (round.max(1) as usize - 1).min(self.rounds.len().saturating_sub(1));
        self.rounds.get(index).cloned().unwrap_or_default()
    }

    fn take_transport_failure(&self) -> bool {
        self.transport_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn answer_items(script: &RoundScript) -> Vec<BackendResult<BackendChunk>> {
        let mut items: Vec<_> = script
            .chunks
            .iter()
            .map(|text| Ok(BackendChunk::Content { text: text.clone() }))
            .collect();
        if let Some(message) = &script.fatal {
            items.push(Ok(BackendChunk::FatalError {
                message: message.clone(),
            }));
        } else if let (Some(answer), false) = (&script.answer, script.hang) {
            items.push(Ok(BackendChunk::FinalAnswer {
                answer: answer.clone(),
            }));
        }
        items
    }

    fn vote_items(script: &RoundScript) -> Vec<BackendResult<BackendChunk>> {
        if script.hang_vote {
            return Vec::new();
        }
        match &script.vote {
            Some(raw) => vec![Ok(BackendChunk::Vote {
                target: VoteTarget::parse(raw),
                reason: script.vote_reason.clone(),
            })],
            None => vec![Err(BackendError::Fatal("no vote scripted".to_string()))],
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: InvocationRequest) -> BackendResult<BackendStream> {
        let script = self.script_for(request.round);
        let is_vote = request.is_vote();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        if self.take_transport_failure() {
            return Err(BackendError::Transport("scripted transport failure".to_string()));
        }

        let items = if is_vote {
            Self::vote_items(&script)
        } else {
            Self::answer_items(&script)
        };
        let delay = self.chunk_delay;
        let stream = futures::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });

        let hangs = if is_vote { script.hang_vote } else { script.hang };
        if hangs {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream.boxed())
        }
    }
}
