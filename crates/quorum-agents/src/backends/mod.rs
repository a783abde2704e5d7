//! Concrete backends selected by the run configuration

pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use coordination::backend::{ScriptedBackend, SharedBackend};

use crate::config::BackendConfig;

pub use openai::{OpenAiBackend, OpenAiSettings};

/// Error type for backend construction
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("API key variable {0} is not set")]
    MissingApiKey(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Instantiate the backend an agent entry describes.
pub fn build_backend(config: &BackendConfig) -> Result<SharedBackend, BuildError> {
    match config {
        BackendConfig::OpenaiCompatible {
            base_url,
            model,
            api_key_env,
            temperature,
            max_tokens,
            timeout_secs,
            system_prompt,
        } => {
            let api_key = api_key_env
                .as_deref()
                .map(|var| std::env::var(var).map_err(|_| BuildError::MissingApiKey(var.to_string())))
                .transpose()?;
            let backend = OpenAiBackend::new(OpenAiSettings {
                base_url: base_url.clone(),
                model: model.clone(),
                api_key,
                temperature: *temperature,
                max_tokens: *max_tokens,
                timeout: Duration::from_secs(*timeout_secs),
                system_prompt: system_prompt.clone(),
            })?;
            Ok(Arc::new(backend))
        }
        BackendConfig::Scripted {
            rounds,
            chunk_delay_ms,
        } => Ok(Arc::new(
            ScriptedBackend::from_rounds(rounds.clone())
                .with_chunk_delay(Duration::from_millis(*chunk_delay_ms)),
        )),
    }
}
