//! Completion transport.
//!
//! `LlmBackend` is the seam between the retrying client and the wire: the
//! production implementation speaks the OpenAI chat-completions protocol over
//! HTTP, tests script completions directly.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::types::{ChatMessage, Completion, LlmError, LlmErrorKind, Usage};

/// One completion request, already flattened to provider shape.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
    pub temperature: Option<f32>,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// OpenAI-compatible chat-completions backend.
pub struct OpenAiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning text exposed by thinking models; surfaced inside `<think>`
    /// tags so downstream stripping stays uniform.
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        debug!(url = %self.completions_url(), model = %self.model, "sending completion request");

        let mut req = self.http.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::new(
                classify_status(status.as_u16()),
                format!("LLM API returned {status}: {text}"),
            ));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::new(LlmErrorKind::Transport, format!("invalid response body: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::new(LlmErrorKind::Server, "response carried no choices"))?;

        let mut text = choice.message.content.unwrap_or_default();
        if let Some(reasoning) = choice.message.reasoning_content {
            if !reasoning.is_empty() {
                text = format!("<think>\n{reasoning}\n</think>\n\n{text}");
            }
        }

        Ok(Completion {
            text,
            usage: parsed.usage.unwrap_or_default(),
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> LlmError {
    let kind = if err.is_timeout() {
        LlmErrorKind::Timeout
    } else {
        LlmErrorKind::Transport
    };
    LlmError::new(kind, err.to_string())
}

fn classify_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::Server,
        _ => LlmErrorKind::Request,
    }
}
