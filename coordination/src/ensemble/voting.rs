//! Vote resolution
//!
//! A pure tally over agent-cast references; answer content is never
//! inspected. The candidate with the strict plurality wins. Ties go to the
//! tied candidate that comes first in configuration order, so resolution is
//! deterministic and independent of vote arrival order.
//!
//! Counting rules:
//! - a vote for an agent without an answer this round counts as an abstention
//! - `abstain` is an abstention, `restart` is a restart request; neither
//!   supports a candidate
//! - an agent with no recorded vote (failed, timed out) is a non-vote
//! - zero supporting votes means no winner

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::{AgentId, VoteTarget};

/// Error type for voting operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VotingError {
    #[error("No candidate answers to vote on")]
    NoCandidates,

    #[error("Vote from unknown agent: {0}")]
    UnknownVoter(AgentId),
}

/// Result type for voting operations
pub type VotingResult<T> = Result<T, VotingError>;

/// Vote counts for one round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    /// Supporting votes per candidate. Every candidate is present, even at 0.
    pub counts: BTreeMap<AgentId, u32>,
    pub abstentions: u32,
    pub restart_requests: u32,
    /// Agents that never cast a vote
    pub non_votes: u32,
}

impl VoteTally {
    pub fn votes_for(&self, agent_id: &str) -> u32 {
        self.counts.get(agent_id).copied().unwrap_or(0)
    }

    /// Votes that supported some candidate
    pub fn supporting_votes(&self) -> u32 {
        self.counts.values().sum()
    }
}

/// Outcome of resolving one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Option<AgentId>,
    pub tally: VoteTally,
    /// Candidates sharing the top count, in configuration order. More than
    /// one entry means the tie-break decided.
    pub tied: Vec<AgentId>,
}

impl Resolution {
    pub fn was_tie(&self) -> bool {
        self.tied.len() > 1
    }
}

/// Resolves votes into a winner
pub struct VoteResolver;

impl VoteResolver {
    /// Tally `votes` (voter → target) over the agents that answered.
    ///
    /// `order` is the session's configuration order and decides ties;
    /// `answers` names the candidates.
    pub fn resolve<A>(
        votes: &HashMap<AgentId, VoteTarget>,
        answers: &HashMap<AgentId, A>,
        order: &[AgentId],
    ) -> VotingResult<Resolution> {
        let candidates: Vec<&AgentId> = order.iter().filter(|id| answers.contains_key(*id)).collect();
        if candidates.is_empty() {
            return Err(VotingError::NoCandidates);
        }

        let mut tally = VoteTally {
            counts: candidates.iter().map(|id| ((*id).clone(), 0)).collect(),
            ..VoteTally::default()
        };

        for (voter, target) in votes {
            if !order.contains(voter) {
                return Err(VotingError::UnknownVoter(voter.clone()));
            }
            match target {
                VoteTarget::Agent(id) => match tally.counts.get_mut(id) {
                    Some(count) => *count += 1,
                    None => tally.abstentions += 1,
                },
                VoteTarget::Abstain => tally.abstentions += 1,
                VoteTarget::Restart => tally.restart_requests += 1,
            }
        }
        tally.non_votes = order.iter().filter(|id| !votes.contains_key(*id)).count() as u32;

        let top = tally.counts.values().copied().max().unwrap_or(0);
        let (winner, tied) = if top == 0 {
            (None, Vec::new())
        } else {
            let tied: Vec<AgentId> = candidates
                .iter()
                .filter(|id| tally.votes_for(id) == top)
                .map(|id| (*id).clone())
                .collect();
            (tied.first().cloned(), tied)
        };

        debug!(
            winner = ?winner,
            top,
            tied = tied.len(),
            abstentions = tally.abstentions,
            restarts = tally.restart_requests,
            "Votes resolved"
        );

        Ok(Resolution {
            winner,
            tally,
            tied,
        })
    }
}
