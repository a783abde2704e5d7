//! OpenAI-compatible chat completions backend
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! (vLLM, llama.cpp, LiteLLM, hosted APIs). One request per invocation; the
//! reply is forwarded as a single content chunk followed by the answer or the
//! parsed vote.

use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use coordination::backend::{
    Backend, BackendChunk, BackendError, BackendResult, BackendStream, InvocationKind,
    InvocationRequest,
};
use coordination::state::{RoundAnswer, VoteTarget};
use futures::StreamExt;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `VOTE: <agent-id|abstain|restart>` on its own line.
static VOTE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*VOTE:\s*([A-Za-z0-9_.\-]+)\s*$").expect("VOTE_LINE regex should compile")
});

/// Optional `REASON: ...` line accompanying a vote.
static REASON_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*REASON:\s*(.+?)\s*$").expect("REASON_LINE regex should compile")
});

const DEFAULT_SYSTEM_PROMPT: &str = "You are one of several independent agents working on the same task. \
Answer the task as well as you can. Be complete and precise.";

/// Connection and sampling settings
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub system_prompt: Option<String>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Chat completions client bound to one model
pub struct OpenAiBackend {
    http: reqwest::Client,
    endpoint: String,
    settings: OpenAiSettings,
}

impl OpenAiBackend {
    pub fn new(settings: OpenAiSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(settings.timeout).build()?;
        let endpoint = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            endpoint,
            settings,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn complete(&self, request: &InvocationRequest) -> BackendResult<String> {
        let system = self
            .settings
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let body = ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: render_prompt(request),
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let mut call = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.settings.api_key {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transport(format!("malformed response: {e}")))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(BackendError::Transport("empty completion".to_string()));
        }
        Ok(content)
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn invoke(&self, request: InvocationRequest) -> BackendResult<BackendStream> {
        debug!(
            agent_id = %request.agent_id,
            model = %self.settings.model,
            round = request.round,
            vote = request.is_vote(),
            "Chat completion request"
        );
        let content = self.complete(&request).await?;

        let last = if request.is_vote() {
            match parse_vote(&content) {
                Some((target, reason)) => BackendChunk::Vote { target, reason },
                None => {
                    return Err(BackendError::Fatal(
                        "response has no VOTE line".to_string(),
                    ))
                }
            }
        } else {
            BackendChunk::FinalAnswer {
                answer: content.clone(),
            }
        };

        let chunks = vec![Ok(BackendChunk::Content { text: content }), Ok(last)];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// 429 and 5xx are worth retrying; any other failure status is not.
pub fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = format!("HTTP {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        BackendError::Transport(message)
    } else {
        BackendError::Fatal(message)
    }
}

/// Last `VOTE:` line wins; a `REASON:` line is attached when present.
pub fn parse_vote(text: &str) -> Option<(VoteTarget, Option<String>)> {
    let target = VOTE_LINE
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| VoteTarget::parse(m.as_str()))?;
    let reason = REASON_LINE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    Some((target, reason))
}

fn push_answers(prompt: &mut String, heading: &str, answers: &[RoundAnswer]) {
    if answers.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "\n## {heading}");
    for a in answers {
        let _ = writeln!(prompt, "\n### {} (round {})\n{}", a.agent_id, a.round, a.answer);
    }
}

/// User message for one invocation.
pub fn render_prompt(request: &InvocationRequest) -> String {
    let mut prompt = format!("# Task\n{}\n", request.task);
    if let Some(dir) = &request.workspace {
        let _ = writeln!(prompt, "\nYour private working directory: {}", dir.display());
    }
    push_answers(&mut prompt, "Answers from earlier rounds", &request.prior_context);

    match &request.kind {
        InvocationKind::Answer => {
            prompt.push_str("\nWrite your answer to the task.\n");
        }
        InvocationKind::Vote { candidates } => {
            push_answers(&mut prompt, "Candidate answers", candidates);
            let ids: Vec<&str> = candidates.iter().map(|c| c.agent_id.as_str()).collect();
            let _ = write!(
                prompt,
                "\nYou are agent `{}`. Pick the best candidate. End your reply with a line \
                 `VOTE: <id>` where <id> is one of: {}. Use `VOTE: abstain` if none is \
                 acceptable, or `VOTE: restart` if the task should be attempted again. \
                 You may add a line `REASON: <one sentence>`.\n",
                request.agent_id,
                ids.join(", ")
            );
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: InvocationKind) -> InvocationRequest {
        InvocationRequest {
            session_id: "s".into(),
            agent_id: "a".into(),
            task: "Add two numbers".into(),
            kind,
            prior_context: vec![],
            workspace: None,
            round: 1,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retriable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retriable());
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "bad key").is_retriable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retriable());
    }

    #[test]
    fn test_parse_vote() {
        let text = "B is clearer.\nREASON: covers edge cases\nVOTE: b\n";
        assert_eq!(
            parse_vote(text),
            Some((
                VoteTarget::Agent("b".into()),
                Some("covers edge cases".into())
            ))
        );
        assert_eq!(
            parse_vote("vote: RESTART").map(|v| v.0),
            Some(VoteTarget::Restart)
        );
        assert_eq!(parse_vote("I like a"), None);
    }

    #[test]
    fn test_last_vote_line_wins() {
        let text = "VOTE: a\nOn reflection...\nVOTE: c";
        assert_eq!(
            parse_vote(text).map(|v| v.0),
            Some(VoteTarget::Agent("c".into()))
        );
    }

    #[test]
    fn test_vote_prompt_lists_candidates() {
        let prompt = render_prompt(&request(InvocationKind::Vote {
            candidates: vec![RoundAnswer {
                round: 1,
                agent_id: "b".into(),
                answer: "4".into(),
            }],
        }));
        assert!(prompt.contains("### b (round 1)"));
        assert!(prompt.contains("one of: b."));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let backend = OpenAiBackend::new(OpenAiSettings {
            base_url: "http://localhost:8000/v1/".into(),
            model: "m".into(),
            api_key: None,
            temperature: 0.3,
            max_tokens: 16,
            timeout: Duration::from_secs(1),
            system_prompt: None,
        })
        .unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:8000/v1/chat/completions");
    }
}
