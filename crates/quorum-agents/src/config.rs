//! Run configuration
//!
//! One TOML file describes a run:
//!
//! ```toml
//! [coordination]
//! max_restarts = 1
//! designated_agent = "architect"
//!
//! [coordination.rate_limits.gpt-4o]
//! max_starts = 2
//! window_secs = 60
//!
//! [storage]
//! state_dir = "./quorum-state"
//!
//! [[agents]]
//! id = "architect"
//! backend = { type = "openai_compatible", base_url = "http://localhost:8000/v1", model = "gpt-4o" }
//!
//! [[agents]]
//! id = "dry-run"
//! backend = { type = "scripted", rounds = [{ answer = "42", vote = "architect" }] }
//! ```
//!
//! Missing `[coordination]` keys fall back to the engine defaults. The
//! `QUORUM_*` environment variables win over both.

use std::path::{Path, PathBuf};

use coordination::backend::RoundScript;
use coordination::config::CoordinatorConfig;
use serde::Deserialize;

/// Default directory for artifacts, status and event logs.
const DEFAULT_STATE_DIR: &str = "quorum-state";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Error type for run configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub coordination: CoordinatorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Where a run keeps its files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base for per-agent workspaces (None = system temp dir).
    pub workspace_root: Option<PathBuf>,
    pub state_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    /// Admission key override. Agents sharing a key share a rate limit.
    #[serde(default)]
    pub backend_key: Option<String>,
    pub backend: BackendConfig,
}

impl AgentConfig {
    pub fn backend_key(&self) -> String {
        self.backend_key
            .clone()
            .unwrap_or_else(|| self.backend.default_key())
    }
}

/// Backend selection, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Any server speaking the OpenAI chat completions protocol.
    OpenaiCompatible {
        base_url: String,
        model: String,
        /// Environment variable holding the API key, if one is needed.
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_request_timeout_secs")]
        timeout_secs: u64,
        #[serde(default)]
        system_prompt: Option<String>,
    },
    /// Canned responses, for dry runs.
    Scripted {
        rounds: Vec<RoundScript>,
        #[serde(default)]
        chunk_delay_ms: u64,
    },
}

impl BackendConfig {
    /// Admission key when the agent does not set one: the model name, so
    /// agents on the same model share its limit.
    pub fn default_key(&self) -> String {
        match self {
            Self::OpenaiCompatible { model, .. } => model.clone(),
            Self::Scripted { .. } => "scripted".to_string(),
        }
    }
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl RunConfig {
    /// Read and check a run file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.check()?;
        Ok(config)
    }

    /// Structural checks the engine cannot make: backend settings. Agent ids
    /// and the task are validated by the coordinator itself.
    fn check(&self) -> ConfigResult<()> {
        for agent in &self.agents {
            match &agent.backend {
                BackendConfig::OpenaiCompatible {
                    base_url, model, ..
                } => {
                    if base_url.trim().is_empty() || model.trim().is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "agent {:?}: base_url and model are required",
                            agent.id
                        )));
                    }
                }
                BackendConfig::Scripted { rounds, .. } => {
                    if rounds.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "agent {:?}: scripted backend needs at least one round",
                            agent.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn with_state_dir(mut self, state_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = state_dir {
            self.storage.state_dir = dir;
        }
        self
    }

    /// Apply the `QUORUM_*` environment overrides to `[coordination]`.
    pub fn with_env_overrides(mut self) -> Self {
        self.coordination = self.coordination.with_env_overrides();
        self
    }

    pub fn with_workspace_root(mut self, root: Option<PathBuf>) -> Self {
        if root.is_some() {
            self.storage.workspace_root = root;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_sections() {
        let config = RunConfig::from_toml(
            r#"
            [[agents]]
            id = "a"
            backend = { type = "scripted", rounds = [{ answer = "x" }] }
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.coordination.event_buffer, 1024);
        assert_eq!(config.agents[0].backend_key(), "scripted");
    }

    #[test]
    fn test_key_override() {
        let config = RunConfig::from_toml(
            r#"
            [[agents]]
            id = "a"
            backend_key = "shared-pool"
            backend = { type = "openai_compatible", base_url = "http://h/v1", model = "m" }
            "#,
        )
        .unwrap();
        assert_eq!(config.agents[0].backend_key(), "shared-pool");
    }

    #[test]
    fn test_rejects_empty_script() {
        let err = RunConfig::from_toml(
            r#"
            [[agents]]
            id = "a"
            backend = { type = "scripted", rounds = [] }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_environment_wins_over_file() {
        let config = RunConfig::from_toml("[coordination]\nvoting_timeout_secs = 30").unwrap();
        std::env::set_var("QUORUM_VOTING_TIMEOUT", "45");
        let overridden = config.clone().with_env_overrides();
        std::env::remove_var("QUORUM_VOTING_TIMEOUT");

        assert_eq!(config.coordination.voting_timeout_secs, 30);
        assert_eq!(overridden.coordination.voting_timeout_secs, 45);
    }

    #[test]
    fn test_cli_overrides() {
        let config = RunConfig::from_toml("")
            .unwrap()
            .with_state_dir(Some("/tmp/s".into()))
            .with_workspace_root(None);
        assert_eq!(config.storage.state_dir, PathBuf::from("/tmp/s"));
        assert!(config.storage.workspace_root.is_none());
    }
}
