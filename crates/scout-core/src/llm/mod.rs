//! LLM client layer: chat-completions transport, bounded retry, token
//! accounting.

mod backend;
mod client;
pub mod types;

pub use backend::{CompletionRequest, LlmBackend, OpenAiBackend};
pub use client::LlmClient;
pub use types::{ChatMessage, Completion, LlmError, LlmErrorKind, Role, Usage};
