//! Canonical event protocol for the agent loop.
//!
//! `AgentEvent` is the single source of truth for everything the
//! orchestrator emits. Transport layers (the SSE adapters) consume these
//! events and map them to their own presentation format; nothing flows the
//! other way. Events are strictly time-ordered per task.

use serde::Serialize;
use serde_json::Value;

use crate::llm::Usage;
use crate::mcp::ErrorKind;
use crate::parser::ToolCall;

/// Why an attempt rolled back one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    /// Tool-call block present but unparseable (bad JSON arguments).
    Parse,
    /// Protocol tags present without a complete tool call.
    Format,
    /// Refusal phrase in the response.
    Refusal,
    /// The extracted query string was already executed.
    DuplicateQuery,
    /// The invoked tool reported an error.
    ToolError,
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Success,
    MaxTurns,
    TooManyRollbacks,
    Fatal,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A task (or attempt) began.
    AgentStarted { agent: String, task: String },

    /// An LLM call is in flight.
    LlmStarted,

    /// Model text produced during the research phase.
    LlmChunk { text: String },

    /// The LLM call finished with usage accounting.
    LlmEnded { usage: Usage },

    /// Parser output for the latest response.
    ParseResult {
        tool_calls: Vec<ToolCall>,
        #[serde(skip_serializing_if = "Option::is_none")]
        boxed: Option<String>,
    },

    /// A tool invocation began.
    ToolStarted {
        server: String,
        tool: String,
        args: Value,
    },

    /// The tool call succeeded.
    ToolSucceeded { payload: String },

    /// The tool call (or an LLM call, for terminal transport failures)
    /// failed.
    ToolFailed { error_kind: ErrorKind, message: String },

    /// One step was undone.
    Rollback { reason: RollbackReason },

    /// A nested browsing agent was spawned.
    SubAgentStarted { agent: String, subtask: String },

    /// The nested agent returned its report.
    SubAgentEnded { summary: String },

    /// The loop ended; the finalization call is next.
    FinalizationStarted,

    /// The extracted final answer (empty on failure).
    FinalAnswer { text: String },

    /// The task is over.
    AgentEnded { outcome: AgentOutcome },
}
