//! Event history and replay
//!
//! Reads a session's durable `events.jsonl` log back into memory for
//! post-mortem inspection and replay.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{CoordinationEvent, SessionEvent};

/// Error type for history operations
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Event parsing error on line {line}: {message}")]
    ParseError { line: usize, message: String },
}

/// Result type for history operations
pub type HistoryResult<T> = Result<T, HistoryError>;

/// A loaded event log
#[derive(Debug, Clone, Default)]
pub struct EventHistory {
    events: Vec<SessionEvent>,
}

impl EventHistory {
    pub fn new(events: Vec<SessionEvent>) -> Self {
        Self { events }
    }

    /// Load a JSONL event log. Blank lines are skipped. A torn final line
    /// (the process died mid-append) is ignored; corruption elsewhere is an
    /// error.
    pub fn load(path: impl AsRef<Path>) -> HistoryResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let lines: Vec<&str> = raw.lines().collect();
        let mut events = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) if index + 1 == lines.len() && !raw.ends_with('\n') => {
                    warn!(path = %path.display(), "Ignoring torn trailing event: {}", e);
                }
                Err(e) => {
                    return Err(HistoryError::ParseError {
                        line: index + 1,
                        message: e.to_string(),
                    })
                }
            }
        }

        debug!(count = events.len(), path = %path.display(), "Loaded event history");
        Ok(Self { events })
    }

    pub fn events(&self) -> &[SessionEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events emitted by one agent, in arrival order
    pub fn for_agent<'a>(&'a self, agent_id: &'a str) -> impl Iterator<Item = &'a SessionEvent> {
        self.events
            .iter()
            .filter(move |e| e.agent_id.as_deref() == Some(agent_id))
    }

    /// Events of one type, in arrival order
    pub fn of_type<'a>(&'a self, event_type: &'a str) -> impl Iterator<Item = &'a SessionEvent> {
        self.events
            .iter()
            .filter(move |e| e.event_type() == event_type)
    }

    /// Replay events through a callback
    pub async fn replay<F, Fut>(&self, mut callback: F) -> ReplayStats
    where
        F: FnMut(SessionEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        info!(total = self.events.len(), "Starting event replay");

        let mut stats = ReplayStats::new();
        for event in &self.events {
            stats.record_event(event);
            callback(event.clone()).await;
        }

        info!(
            total = stats.total_events,
            agents = stats.agents_seen,
            failures = stats.failures,
            "Event replay complete"
        );
        stats
    }

    /// Aggregate statistics for the loaded events
    pub fn stats(&self) -> EventStats {
        EventStats::from_events(&self.events)
    }
}

/// Statistics from replay
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub total_events: usize,
    pub agents_seen: usize,
    pub failures: usize,
    agents: HashSet<String>,
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &SessionEvent) {
        self.total_events += 1;

        if let Some(agent_id) = &event.agent_id {
            if self.agents.insert(agent_id.clone()) {
                self.agents_seen += 1;
            }
        }

        if matches!(event.event, CoordinationEvent::AgentFailed { .. }) {
            self.failures += 1;
        }
    }
}

/// Aggregate statistics for events
#[derive(Debug, Default, Serialize)]
pub struct EventStats {
    pub total_events: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub unique_agents: usize,
    pub answers: usize,
    pub votes: usize,
    pub retries: usize,
    pub failures: usize,
    pub restarts: usize,
}

impl EventStats {
    pub fn from_events(events: &[SessionEvent]) -> Self {
        let mut stats = Self::default();
        let mut agents = HashSet::new();

        for event in events {
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;

            if let Some(agent_id) = &event.agent_id {
                agents.insert(agent_id.as_str());
            }

            match event.event {
                CoordinationEvent::AnswerSubmitted { .. } => stats.answers += 1,
                CoordinationEvent::VoteCast { .. } => stats.votes += 1,
                CoordinationEvent::Retrying { .. } => stats.retries += 1,
                CoordinationEvent::AgentFailed { .. } => stats.failures += 1,
                CoordinationEvent::RestartRequested { .. } => stats.restarts += 1,
                _ => {}
            }
        }

        stats.unique_agents = agents.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn event(id: u64, agent: Option<&str>, event: CoordinationEvent) -> SessionEvent {
        SessionEvent::new(id, "s".into(), agent.map(String::from), None, event)
    }

    fn sample() -> Vec<SessionEvent> {
        vec![
            event(0, Some("a"), CoordinationEvent::ContentChunk { text: "x".into() }),
            event(
                1,
                Some("a"),
                CoordinationEvent::AnswerSubmitted {
                    round: 1,
                    answer: "42".into(),
                },
            ),
            event(
                2,
                Some("b"),
                CoordinationEvent::AgentFailed {
                    error: "boom".into(),
                    fatal: true,
                },
            ),
            event(
                3,
                None,
                CoordinationEvent::Warning {
                    message: "w".into(),
                },
            ),
        ]
    }

    #[test]
    fn test_stats() {
        let stats = EventStats::from_events(&sample());
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.unique_agents, 2);
        assert_eq!(stats.answers, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.events_by_type.get("warning"), Some(&1));
    }

    #[test]
    fn test_load_skips_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut file = fs::File::create(&path).unwrap();
        for e in sample() {
            writeln!(file, "{}", serde_json::to_string(&e).unwrap()).unwrap();
        }
        write!(file, "{{\"id\":4,\"sess").unwrap();
        drop(file);

        let history = EventHistory::load(&path).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.for_agent("a").count(), 2);
        assert_eq!(history.of_type("agent_failed").count(), 1);
    }

    #[test]
    fn test_load_rejects_corrupt_middle_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let first = serde_json::to_string(&sample()[0]).unwrap();
        fs::write(&path, format!("{first}\nnot json\n{first}\n")).unwrap();

        assert!(matches!(
            EventHistory::load(&path),
            Err(HistoryError::ParseError { line: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_replay() {
        let history = EventHistory::new(sample());
        let mut seen = Vec::new();
        let stats = history
            .replay(|e| {
                seen.push(e.id);
                async {}
            })
            .await;

        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.agents_seen, 2);
        assert_eq!(stats.failures, 1);
    }
}
