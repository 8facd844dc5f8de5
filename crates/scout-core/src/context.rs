//! Context management: sliding-window demotion, overflow prediction,
//! mid-run compaction, and condensing of incoming multi-turn histories.

use std::sync::Arc;

use tracing::{info, warn};

use crate::constants::llm as limits;
use crate::llm::{ChatMessage, LlmClient, Role, Usage};
use crate::prompts::OMITTED_TOOL_RESULT;

/// Tool-result retention strategy for one task. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStrategy {
    /// Keep the full history; on predicted overflow the orchestrator pops
    /// the trailing pair and forces finalization.
    KeepAll,
    /// Demote all but the most recent N tool results after every append.
    SlidingWindow(usize),
}

impl ContextStrategy {
    pub fn from_keep_tool_result(keep_tool_result: i64) -> Self {
        if keep_tool_result < 0 {
            ContextStrategy::KeepAll
        } else {
            ContextStrategy::SlidingWindow(keep_tool_result as usize)
        }
    }
}

/// Demote stale tool results in place.
///
/// Every user-role message after the first one (the task itself) is a tool
/// result; all but the most recent `keep` are overwritten with a short
/// placeholder. Ordering and roles are preserved, so the history stays
/// valid for the next assistant turn.
pub fn demote_stale_tool_results(messages: &mut [ChatMessage], keep: usize) {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m.role, Role::User | Role::Tool))
        .map(|(i, _)| i)
        .collect();

    if user_indices.len() <= 1 {
        return;
    }

    let tool_result_indices = &user_indices[1..];
    let demote_until = tool_result_indices.len().saturating_sub(keep);

    for &idx in &tool_result_indices[..demote_until] {
        if messages[idx].content != OMITTED_TOOL_RESULT {
            messages[idx].content = OMITTED_TOOL_RESULT.to_string();
        }
    }
}

/// Predict whether the next finalization call would overflow the context.
///
/// `estimate = prompt_tokens_last + completion_tokens_last + user_tokens_last
///           + summary_tokens_estimate + reserved_completion_budget + 1000`
pub fn predict_overflow(
    last_usage: &Usage,
    last_user_tokens: usize,
    summary_tokens_estimate: usize,
    reserved_completion_budget: usize,
    max_context_length: usize,
) -> bool {
    let estimate = last_usage.prompt_tokens
        + last_usage.completion_tokens
        + last_user_tokens
        + summary_tokens_estimate
        + reserved_completion_budget
        + limits::CONTEXT_SAFETY_BUFFER;

    let overflow = estimate >= max_context_length;
    if overflow {
        info!(estimate, max_context_length, "context overflow predicted");
    }
    overflow
}

/// Apply the ±10% tokenizer error band to an estimate.
pub fn buffered_estimate(tokens: usize) -> usize {
    (tokens as f64 * limits::ESTIMATE_BUFFER_FACTOR) as usize
}

/// Mid-run compactor: rewrites the conversation prefix into one compressed
/// user message via the summary LLM.
pub struct Compactor {
    summarizer: Arc<LlmClient>,
}

impl Compactor {
    pub fn new(summarizer: Arc<LlmClient>) -> Self {
        Self { summarizer }
    }

    /// Compress `messages` into a single replacement user message carrying
    /// the findings so far plus the task. Falls back to a truncating
    /// summary when the summarizer is unavailable.
    pub async fn compact(&self, task: &str, messages: &[ChatMessage]) -> ChatMessage {
        let transcript = render_transcript(messages);
        let prompt = format!(
            "You are a context compression assistant. The conversation below is an agent's research trace for a task that is still in progress. Extract every fact, intermediate result, source, and conclusion worth keeping; drop tool mechanics and dead ends.\n\n\
**Task (still to be solved):**\n{task}\n\n\
**Research trace:**\n{transcript}\n\n\
Output a concise summary (max 500 words) of the findings so far."
        );

        let summary = match self
            .summarizer
            .generate("", &[ChatMessage::user(prompt)], Some(1000))
            .await
        {
            Ok(completion) => completion.text,
            Err(e) => {
                warn!(error = %e, "compaction summarizer failed, using truncating fallback");
                truncating_summary(messages)
            }
        };

        ChatMessage::user(format!(
            "# Compressed research context\n\n{}\n\n# Current Task\n\n{}",
            summary.trim(),
            task
        ))
    }
}

/// Condenses an incoming multi-turn request into a single task string.
///
/// Short histories are formatted verbatim; long ones are semantically
/// compressed by the summary LLM with a relevance gate, falling back to
/// truncation when the summarizer fails.
pub struct HistoryCondenser {
    summarizer: Arc<LlmClient>,
    max_history_tokens: usize,
    compression_enabled: bool,
}

impl HistoryCondenser {
    pub fn new(
        summarizer: Arc<LlmClient>,
        max_history_tokens: usize,
        compression_enabled: bool,
    ) -> Self {
        Self {
            summarizer,
            max_history_tokens,
            compression_enabled,
        }
    }

    pub async fn condense(&self, messages: &[ChatMessage]) -> Option<String> {
        let relevant: Vec<&ChatMessage> = messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .collect();

        let current = relevant.last()?;
        if relevant.len() == 1 {
            return Some(current.content.clone());
        }

        let total_tokens: usize = relevant
            .iter()
            .map(|m| self.summarizer.estimate_tokens(&m.content))
            .sum();

        if !self.compression_enabled || total_tokens <= self.max_history_tokens {
            return Some(format_simple_history(&relevant));
        }

        info!(
            total_tokens,
            threshold = self.max_history_tokens,
            "condensing conversation history"
        );

        let history = &relevant[..relevant.len() - 1];
        let transcript: String = history
            .iter()
            .enumerate()
            .map(|(idx, m)| format!("[Turn {}] {:?}: {}\n\n", idx + 1, m.role, m.content))
            .collect();

        let prompt = format!(
            "You are a context compression assistant. Determine whether the conversation history is relevant to the current question. If relevant, extract only the key facts, constraints, and conclusions that directly help answer it (max 500 words). If not relevant, output ONLY: \"No relevant context from previous conversation.\" Do not force connections between unrelated topics.\n\n\
**Current Question:**\n{}\n\n\
**Conversation History:**\n{}",
            current.content, transcript
        );

        let compressed = match self
            .summarizer
            .generate("", &[ChatMessage::user(prompt)], Some(1000))
            .await
        {
            Ok(completion) => completion.text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "history compression failed, using truncating fallback");
                truncating_summary_refs(history)
            }
        };

        Some(format!(
            "{}\n\n# Current Question\n\n{}",
            compressed, current.content
        ))
    }
}

fn format_simple_history(messages: &[&ChatMessage]) -> String {
    let mut parts = vec!["# Conversation History\n".to_string()];
    for (idx, message) in messages[..messages.len() - 1].iter().enumerate() {
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
            Role::Tool => "Tool",
        };
        parts.push(format!(
            "\n**{} (Turn {}):**\n{}\n",
            speaker,
            idx + 1,
            message.content
        ));
    }
    parts.push(format!(
        "\n# Current Question\n\n{}",
        messages[messages.len() - 1].content
    ));
    parts.join("")
}

fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .enumerate()
        .map(|(idx, m)| format!("[Turn {}] {:?}: {}\n\n", idx + 1, m.role, m.content))
        .collect()
}

fn truncating_summary(messages: &[ChatMessage]) -> String {
    let refs: Vec<&ChatMessage> = messages.iter().collect();
    truncating_summary_refs(&refs)
}

fn truncating_summary_refs(messages: &[&ChatMessage]) -> String {
    let mut lines = vec!["# Previous Conversation Summary\n".to_string()];
    for message in messages {
        let snippet: String = message.content.chars().take(200).collect();
        let ellipsis = if message.content.chars().count() > 200 {
            "..."
        } else {
            ""
        };
        lines.push(format!("- {:?}: {}{}", message.role, snippet, ellipsis));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with_tool_results(count: usize) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::user("the task")];
        for i in 0..count {
            messages.push(ChatMessage::assistant(format!("calling tool {i}")));
            messages.push(ChatMessage::user(format!("tool result {i}")));
        }
        messages
    }

    #[test]
    fn sliding_window_keeps_recent_results_and_the_task() {
        let mut messages = history_with_tool_results(4);
        demote_stale_tool_results(&mut messages, 2);

        assert_eq!(messages[0].content, "the task");
        assert_eq!(messages[2].content, OMITTED_TOOL_RESULT);
        assert_eq!(messages[4].content, OMITTED_TOOL_RESULT);
        assert_eq!(messages[6].content, "tool result 2");
        assert_eq!(messages[8].content, "tool result 3");
    }

    #[test]
    fn window_of_zero_demotes_everything_but_the_task() {
        let mut messages = history_with_tool_results(2);
        demote_stale_tool_results(&mut messages, 0);
        assert_eq!(messages[0].content, "the task");
        assert_eq!(messages[2].content, OMITTED_TOOL_RESULT);
        assert_eq!(messages[4].content, OMITTED_TOOL_RESULT);
    }

    #[test]
    fn demotion_is_a_noop_without_tool_results() {
        let mut messages = vec![ChatMessage::user("the task")];
        demote_stale_tool_results(&mut messages, 0);
        assert_eq!(messages[0].content, "the task");
    }

    #[test]
    fn overflow_prediction_includes_the_safety_buffer() {
        let usage = Usage {
            prompt_tokens: 2000,
            completion_tokens: 500,
            total_tokens: 2500,
        };
        // 2000 + 500 + 300 + 100 + 100 + 1000 = 4000 >= 4000
        assert!(predict_overflow(&usage, 300, 100, 100, 4000));
        assert!(!predict_overflow(&usage, 300, 100, 100, 4001));
    }

    #[test]
    fn strategy_from_settings() {
        assert_eq!(
            ContextStrategy::from_keep_tool_result(-1),
            ContextStrategy::KeepAll
        );
        assert_eq!(
            ContextStrategy::from_keep_tool_result(3),
            ContextStrategy::SlidingWindow(3)
        );
        assert_eq!(
            ContextStrategy::from_keep_tool_result(0),
            ContextStrategy::SlidingWindow(0)
        );
    }
}
