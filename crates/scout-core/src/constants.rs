//! Process-wide constants, grouped by subsystem.

pub mod agent {
    /// Hard cap on consecutive rollbacks before the task aborts.
    pub const MAX_CONSECUTIVE_ROLLBACKS: usize = 5;

    /// Extra LLM calls allowed beyond `max_turns` to absorb rollbacks.
    pub const EXTRA_ATTEMPTS_BUFFER: usize = 10;

    /// Default main-loop turn budget.
    pub const DEFAULT_MAX_TURNS: usize = 20;

    /// Default number of end-to-end attempts (first run + retries with
    /// injected failure experience).
    pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

    /// Summary-phase retries when the full history is available.
    pub const MAX_FINAL_ANSWER_RETRIES: usize = 3;

    /// Tool name that delegates to a nested browsing agent.
    pub const SUB_AGENT_TOOL: &str = "search_and_browse";

    pub const DEFAULT_SUB_AGENT_MAX_TURNS: usize = 10;

    /// Global per-task deadline.
    pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1800;
}

pub mod llm {
    /// Bounded retry budget for one logical completion call.
    pub const MAX_RETRIES: usize = 10;

    pub const RETRY_BASE_DELAY_MS: u64 = 1000;
    pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

    /// Per-call timeout for a single completion request.
    pub const CALL_TIMEOUT_SECS: u64 = 600;

    /// Flat token buffer added to every overflow prediction.
    pub const CONTEXT_SAFETY_BUFFER: usize = 1000;

    /// Multiplier applied to token estimates; the tokenizer is only
    /// guaranteed to be within ±10% of the serving model.
    pub const ESTIMATE_BUFFER_FACTOR: f64 = 1.5;

    pub const DEFAULT_MAX_TOKENS: usize = 8192;
    pub const DEFAULT_MAX_CONTEXT_LENGTH: usize = 131_072;
}

pub mod tools {
    /// Per-tool-call timeout. Browsing and code-execution tools can be slow.
    pub const CALL_TIMEOUT_SECS: u64 = 1200;

    /// Demo-mode cap on textual tool output.
    pub const DEMO_TRUNCATE_CHARS: usize = 50_000;
}

pub mod server {
    pub const DEFAULT_POOL_SIZE: usize = 5;
    pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;
    pub const DEFAULT_PORT: u16 = 8000;
    pub const DEFAULT_MAX_HISTORY_TOKENS: usize = 30_000;
    pub const SHUTDOWN_GRACE_SECS: u64 = 30;
    pub const SSE_CHANNEL_BUFFER: usize = 256;
}
