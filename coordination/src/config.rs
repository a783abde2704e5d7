//! Engine configuration
//!
//! Defaults come from [`CoordinatorConfig::default`]. Run files deserialize
//! into the same struct with `#[serde(default)]`, so any field may be
//! omitted. `QUORUM_*` environment variables are applied on top by
//! [`CoordinatorConfig::with_env_overrides`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-backend admission limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum starts admitted in any window
    pub max_starts: u32,
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl RateLimitConfig {
    pub fn new(max_starts: u32, window_secs: u64) -> Self {
        Self {
            max_starts,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Transport retry policy for agent workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): doubles from the base
    /// delay, capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Coordination engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Deadline for one coordination round
    pub coordination_timeout_secs: u64,
    /// Deadline for one voting round
    pub voting_timeout_secs: u64,
    /// Optional deadline for the whole session
    pub session_timeout_secs: Option<u64>,
    /// Maximum restart rounds
    pub max_restarts: u32,
    /// Agent allowed to demand a restart. When unset, the round's winner.
    pub designated_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Per-subscriber event queue capacity
    pub event_buffer: usize,
    /// Finished sessions whose event timelines stay in memory for replay
    pub retained_sessions: usize,
    /// Status document refresh interval
    pub status_interval_secs: u64,
    /// Admission limits keyed by backend key. Unlisted keys are unlimited.
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordination_timeout_secs: 600,
            voting_timeout_secs: 120,
            session_timeout_secs: None,
            max_restarts: 2,
            designated_agent: None,
            retry: RetryPolicy::default(),
            event_buffer: 1024,
            retained_sessions: 16,
            status_interval_secs: 2,
            rate_limits: HashMap::new(),
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl CoordinatorConfig {
    /// Apply `QUORUM_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = env_number("QUORUM_COORDINATION_TIMEOUT") {
            self.coordination_timeout_secs = secs;
        }
        if let Some(secs) = env_number("QUORUM_VOTING_TIMEOUT") {
            self.voting_timeout_secs = secs;
        }
        if let Some(n) = env_number("QUORUM_MAX_RESTARTS") {
            self.max_restarts = n;
        }
        if let Some(secs) = env_number("QUORUM_STATUS_INTERVAL") {
            self.status_interval_secs = secs;
        }
        self
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_secs(self.coordination_timeout_secs)
    }

    pub fn voting_timeout(&self) -> Duration {
        Duration::from_secs(self.voting_timeout_secs)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs.map(Duration::from_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    /// Add an admission limit for a backend key
    pub fn with_rate_limit(mut self, backend_key: &str, max_starts: u32, window_secs: u64) -> Self {
        self.rate_limits.insert(
            backend_key.to_string(),
            RateLimitConfig::new(max_starts, window_secs),
        );
        self
    }
}
