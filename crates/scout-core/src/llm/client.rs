//! Retrying LLM client with token accounting.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

use crate::constants::llm as limits;

use super::backend::{CompletionRequest, LlmBackend};
use super::types::{ChatMessage, Completion, LlmError, LlmErrorKind};

/// Window, in chars, used by the degenerate-repetition guard.
const REPEAT_TAIL_CHARS: usize = 50;
const REPEAT_THRESHOLD: usize = 5;

/// LLM client: wraps a [`LlmBackend`] with bounded retries, a per-call
/// timeout, and a stable tokenizer for context accounting.
///
/// No message is ever dropped silently; on retry exhaustion the last error is
/// surfaced to the caller.
pub struct LlmClient {
    backend: Arc<dyn LlmBackend>,
    bpe: Option<CoreBPE>,
    pub max_context_length: usize,
    pub max_completion_tokens: usize,
    temperature: Option<f32>,
}

impl LlmClient {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        max_context_length: usize,
        max_completion_tokens: usize,
        temperature: Option<f32>,
    ) -> Self {
        let bpe = match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!("tokenizer unavailable, falling back to chars/4 estimation: {e}");
                None
            }
        };
        Self {
            backend,
            bpe,
            max_context_length,
            max_completion_tokens,
            temperature,
        }
    }

    /// Generate a completion for `system_prompt` + `history`.
    ///
    /// Retries transient failures up to [`limits::MAX_RETRIES`] times with
    /// exponential backoff and jitter. A response whose trailing 50 chars
    /// repeat more than 5 times is treated as a degenerate sample and
    /// retried too.
    pub async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        max_tokens: Option<usize>,
    ) -> Result<Completion, LlmError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend_from_slice(history);

        let request = CompletionRequest {
            messages,
            max_tokens: max_tokens.unwrap_or(self.max_completion_tokens),
            temperature: self.temperature,
        };

        let mut last_error = LlmError::new(LlmErrorKind::Transport, "no attempt made");

        for attempt in 0..limits::MAX_RETRIES {
            let call = self.backend.complete(&request);
            let result = tokio::time::timeout(
                Duration::from_secs(limits::CALL_TIMEOUT_SECS),
                call,
            )
            .await
            .unwrap_or_else(|_| {
                Err(LlmError::new(
                    LlmErrorKind::Timeout,
                    format!("completion call exceeded {}s", limits::CALL_TIMEOUT_SECS),
                ))
            });

            match result {
                Ok(completion) => {
                    if is_degenerate_repeat(&completion.text)
                        && attempt + 1 < limits::MAX_RETRIES
                    {
                        warn!(attempt, "degenerate repetition in completion, retrying");
                        sleep_backoff(attempt).await;
                        continue;
                    }
                    return Ok(completion);
                }
                Err(e) if e.is_transient() && attempt + 1 < limits::MAX_RETRIES => {
                    warn!(attempt, error = %e, "transient LLM error, retrying");
                    last_error = e;
                    sleep_backoff(attempt).await;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "LLM call failed terminally");
                    return Err(e);
                }
            }
        }

        Err(last_error)
    }

    /// Estimate the token count of `text`. Within ±10% of the serving model;
    /// stable for the process lifetime.
    pub fn estimate_tokens(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len() / 4,
        }
    }
}

fn is_degenerate_repeat(text: &str) -> bool {
    if text.len() < REPEAT_TAIL_CHARS {
        return false;
    }
    let tail_start = text
        .char_indices()
        .rev()
        .nth(REPEAT_TAIL_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[tail_start..];
    text.matches(tail).count() > REPEAT_THRESHOLD
}

async fn sleep_backoff(attempt: usize) {
    let exp = limits::RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(limits::RETRY_MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
    tokio::time::sleep(Duration::from_millis(capped + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyBackend {
        failures_before_success: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmBackend for FlakyBackend {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(LlmError::new(LlmErrorKind::Server, "boom"))
            } else {
                Ok(Completion {
                    text: "ok".to_string(),
                    usage: Default::default(),
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let backend = Arc::new(FlakyBackend {
            failures_before_success: 3,
            calls: AtomicUsize::new(0),
        });
        let client = LlmClient::new(backend.clone(), 8192, 512, None);
        let completion = client
            .generate("sys", &[ChatMessage::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(completion.text, "ok");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    struct RejectingBackend;

    #[async_trait]
    impl LlmBackend for RejectingBackend {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            Err(LlmError::new(LlmErrorKind::Request, "bad request"))
        }
    }

    #[tokio::test]
    async fn does_not_retry_request_errors() {
        let client = LlmClient::new(Arc::new(RejectingBackend), 8192, 512, None);
        let err = client
            .generate("sys", &[ChatMessage::user("hi")], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::Request);
    }

    #[test]
    fn token_estimation_is_monotone() {
        let client = LlmClient::new(Arc::new(RejectingBackend), 8192, 512, None);
        let short = client.estimate_tokens("hello world");
        let long = client.estimate_tokens(&"hello world ".repeat(50));
        assert!(long > short);
        assert!(short >= 1);
    }

    #[test]
    fn degenerate_repeat_detection() {
        let tail = "the same fifty characters repeated over and over!!";
        assert_eq!(tail.len(), 50);
        let degenerate = tail.repeat(8);
        assert!(is_degenerate_repeat(&degenerate));
        assert!(!is_degenerate_repeat("a perfectly ordinary response"));
    }
}
