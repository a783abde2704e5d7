//! Session phase machine with legal transition guards.
//!
//! Every phase change goes through [`PhaseMachine::advance`], which checks the
//! edge against the transition table and appends it to the transition log.
//! The restart cycle (`enforcement → coordinating`) is an explicit edge; the
//! restart budget is enforced by the driver, not by recursion.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::state::Phase;

/// Legal transitions between session phases.
///
/// ```text
/// Initialization → Coordinating
/// Coordinating   → Voting
/// Voting         → Enforcement
/// Enforcement    → Presentation | Coordinating
/// Presentation   → Completed
/// <non-terminal> → Error
/// ```
fn is_legal_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if to == Error && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Initialization, Coordinating)
            | (Coordinating, Voting)
            | (Voting, Enforcement)
            | (Enforcement, Presentation)
            // restart requested by the designated agent
            | (Enforcement, Coordinating)
            | (Presentation, Completed)
    )
}

/// A single recorded phase transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    /// Coordination round at the time of transition (0 before the first round).
    pub round: u32,
    /// Milliseconds since the machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal phase transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The session phase machine.
pub struct PhaseMachine {
    current: Phase,
    round: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl PhaseMachine {
    /// Create a machine in `Initialization`.
    pub fn new() -> Self {
        Self {
            current: Phase::Initialization,
            round: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn set_round(&mut self, round: u32) {
        self.round = round;
    }

    /// Attempt to move to `to`, returning the recorded transition.
    pub fn advance(
        &mut self,
        to: Phase,
        reason: Option<&str>,
    ) -> Result<&TransitionRecord, IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            round = self.round,
            "Phase transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            round: self.round,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(&self.transitions[self.transitions.len() - 1])
    }

    /// Move to `Error` from any non-terminal phase.
    pub fn fail(&mut self, reason: &str) -> Result<&TransitionRecord, IllegalTransition> {
        self.advance(Phase::Error, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Number of times the machine re-entered `Coordinating` from `Enforcement`.
    pub fn restarts(&self) -> u32 {
        self.transitions
            .iter()
            .filter(|t| t.from == Phase::Enforcement && t.to == Phase::Coordinating)
            .count() as u32
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line history, e.g. `initialization → completed (12ms, 5 transitions)`.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} → {} ({}ms, {} transitions)",
            Phase::Initialization,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !self.transitions.is_empty() {
            let path: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
            summary.push_str(&format!(" [{}]", path.join(" → ")));
        }
        summary
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let m = PhaseMachine::new();
        assert_eq!(m.current(), Phase::Initialization);
        assert!(!m.is_terminal());
        assert!(m.transitions().is_empty());
    }

    #[test]
    fn test_happy_path() {
        let mut m = PhaseMachine::new();
        m.set_round(1);
        m.advance(Phase::Coordinating, None).unwrap();
        m.advance(Phase::Voting, Some("all agents settled")).unwrap();
        m.advance(Phase::Enforcement, None).unwrap();
        m.advance(Phase::Presentation, Some("winner a")).unwrap();
        m.advance(Phase::Completed, None).unwrap();

        assert!(m.is_terminal());
        assert_eq!(m.transitions().len(), 5);
        assert_eq!(m.restarts(), 0);
    }

    #[test]
    fn test_restart_cycle() {
        let mut m = PhaseMachine::new();
        m.set_round(1);
        m.advance(Phase::Coordinating, None).unwrap();
        m.advance(Phase::Voting, None).unwrap();
        m.advance(Phase::Enforcement, None).unwrap();
        m.set_round(2);
        let record = m.advance(Phase::Coordinating, Some("restart")).unwrap();
        assert_eq!(record.round, 2);

        m.advance(Phase::Voting, None).unwrap();
        m.advance(Phase::Enforcement, None).unwrap();
        m.advance(Phase::Presentation, None).unwrap();
        m.advance(Phase::Completed, None).unwrap();
        assert_eq!(m.restarts(), 1);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut m = PhaseMachine::new();
        assert!(m.advance(Phase::Voting, None).is_err());
        assert!(m.advance(Phase::Presentation, None).is_err());

        m.advance(Phase::Coordinating, None).unwrap();
        let err = m.advance(Phase::Completed, None).unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                from: Phase::Coordinating,
                to: Phase::Completed
            }
        );
        // state unchanged after rejection
        assert_eq!(m.current(), Phase::Coordinating);
    }

    #[test]
    fn test_error_reachable_from_any_non_terminal() {
        for path in [
            vec![],
            vec![Phase::Coordinating],
            vec![Phase::Coordinating, Phase::Voting],
            vec![Phase::Coordinating, Phase::Voting, Phase::Enforcement],
            vec![
                Phase::Coordinating,
                Phase::Voting,
                Phase::Enforcement,
                Phase::Presentation,
            ],
        ] {
            let mut m = PhaseMachine::new();
            for phase in path {
                m.advance(phase, None).unwrap();
            }
            m.fail("boom").unwrap();
            assert_eq!(m.current(), Phase::Error);
        }
    }

    #[test]
    fn test_terminal_is_final() {
        let mut m = PhaseMachine::new();
        m.fail("validation").unwrap();
        assert!(m.fail("again").is_err());
        assert!(m.advance(Phase::Coordinating, None).is_err());
    }

    #[test]
    fn test_summary() {
        let mut m = PhaseMachine::new();
        m.advance(Phase::Coordinating, None).unwrap();
        let summary = m.summary();
        assert!(summary.starts_with("initialization → coordinating"));
        assert!(summary.contains("[coordinating]"));
    }
}
