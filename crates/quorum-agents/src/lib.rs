//! Quorum command-line support
//!
//! Run-file parsing and the concrete backends behind the `quorum` binary.
//! The coordination engine itself lives in the `coordination` crate.

pub mod backends;
pub mod config;

use anyhow::{Context, Result};
use coordination::ensemble::AgentSpec;

use crate::config::RunConfig;

/// Build the agent set a run file describes, in configuration order.
pub fn build_agents(config: &RunConfig) -> Result<Vec<AgentSpec>> {
    config
        .agents
        .iter()
        .map(|agent| {
            let backend = backends::build_backend(&agent.backend)
                .with_context(|| format!("Failed to build backend for agent {}", agent.id))?;
            Ok(AgentSpec::new(agent.id.clone(), agent.backend_key(), backend))
        })
        .collect()
}
