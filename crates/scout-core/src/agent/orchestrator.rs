//! The orchestrator — the single canonical research loop.
//!
//! One orchestrator drives one task: LLM call → parse → at most one tool
//! invocation per turn, bounded by seven independent termination and
//! rollback conditions, followed by a finalization pass and (on failure)
//! retry attempts seeded with a post-mortem of what went wrong.
//!
//! The loop is a state machine over guards, evaluated in precedence order:
//!
//! 1. max turns            → break, finalize
//! 2. no tool calls        → normal termination
//! 3. format error         → rollback
//! 4. refusal              → rollback
//! 5. duplicate query      → rollback (while rollback budget remains)
//! 6. tool execution error → rollback
//! 7. context overflow     → pop pair, force finalization
//!
//! Rollback is a single pop of the trailing assistant message on an
//! append-only log, never a snapshot restore. Every await point doubles as
//! a cancellation point: the consumer dropping the event receiver stops the
//! loop within one step.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::constants::agent as limits;
use crate::context::{
    self, buffered_estimate, Compactor, ContextStrategy,
};
use crate::dedup::{self, QueryIndex};
use crate::llm::{ChatMessage, LlmClient, LlmErrorKind, Role, Usage};
use crate::mcp::{ErrorKind, ToolManager, ToolResult};
use crate::parser::{self, ToolCall};
use crate::prompts::{self, AgentRole, FAILURE_SUMMARY_PROMPT};

use super::events::{AgentEvent, AgentOutcome, RollbackReason};

/// Configuration for one orchestrator run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub role: AgentRole,
    pub max_turns: usize,
    /// -1 keeps the full history; N >= 0 keeps the last N tool results.
    pub keep_tool_result: i64,
    /// Compact the conversation every K turns; 0 disables compaction.
    pub context_compress_limit: usize,
    /// End-to-end attempts (first run + failure-experience retries).
    pub max_attempts: usize,
    /// Tool name that delegates to a nested browsing agent.
    pub sub_agent_tool: Option<String>,
    pub sub_agent_max_turns: usize,
    /// Global per-task deadline.
    pub deadline: Option<Instant>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            role: AgentRole::Main,
            max_turns: limits::DEFAULT_MAX_TURNS,
            keep_tool_result: -1,
            context_compress_limit: 0,
            max_attempts: limits::DEFAULT_MAX_ATTEMPTS,
            sub_agent_tool: Some(limits::SUB_AGENT_TOOL.to_string()),
            sub_agent_max_turns: limits::DEFAULT_SUB_AGENT_MAX_TURNS,
            deadline: None,
        }
    }
}

/// Shared services the orchestrator needs.
#[derive(Clone)]
pub struct OrchestratorServices {
    pub llm: Arc<LlmClient>,
    pub summarizer: Arc<LlmClient>,
    pub tools: Arc<ToolManager>,
    /// Tool manager handed to nested browsing agents; None disables
    /// sub-agent delegation.
    pub sub_agent_tools: Option<Arc<ToolManager>>,
}

/// The orchestrator runs one task end to end.
pub struct Orchestrator {
    services: OrchestratorServices,
    config: OrchestratorConfig,
    /// Shared across main and nested agents of one task; never across tasks.
    used_queries: Arc<Mutex<QueryIndex>>,
}

/// Per-attempt mutable state. All of it is discarded between attempts.
struct AttemptState {
    messages: Vec<ChatMessage>,
    turn_count: usize,
    llm_calls: usize,
    consecutive_rollbacks: usize,
    last_usage: Usage,
    intermediate_answers: Vec<String>,
    reached_max_turns: bool,
}

impl AttemptState {
    fn new(task: &str) -> Self {
        Self {
            messages: vec![ChatMessage::user(task)],
            turn_count: 0,
            llm_calls: 0,
            consecutive_rollbacks: 0,
            last_usage: Usage::default(),
            intermediate_answers: Vec::new(),
            reached_max_turns: false,
        }
    }
}

/// How one attempt ended.
enum AttemptEnd {
    /// A final answer was produced.
    Answer(String),
    /// The attempt failed; a fresh attempt may follow.
    Failed {
        experience: Option<String>,
        reached_max_turns: bool,
    },
    /// The whole task must stop with this outcome.
    Aborted(AgentOutcome),
    /// The consumer went away.
    Cancelled,
}

impl Orchestrator {
    pub fn new(services: OrchestratorServices, config: OrchestratorConfig) -> Self {
        Self {
            services,
            config,
            used_queries: Arc::new(Mutex::new(QueryIndex::new())),
        }
    }

    fn with_shared_queries(mut self, queries: Arc<Mutex<QueryIndex>>) -> Self {
        self.used_queries = queries;
        self
    }

    /// Start the loop. Events arrive on the returned receiver; dropping it
    /// cancels the task within one step.
    pub fn run(self, task: String) -> mpsc::UnboundedReceiver<AgentEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let fut: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(self.run_inner(task, event_tx));
        tokio::spawn(fut);
        event_rx
    }

    async fn run_inner(self, task: String, event_tx: mpsc::UnboundedSender<AgentEvent>) {
        let agent = self.config.role.agent_name();
        send(
            &event_tx,
            AgentEvent::AgentStarted {
                agent: agent.to_string(),
                task: task.clone(),
            },
        );

        let catalog = self.services.tools.catalog().await;
        let mut failure_experiences: Vec<String> = Vec::new();

        for attempt in 1..=self.config.max_attempts.max(1) {
            let system_prompt = prompts::system_prompt(
                Utc::now().date_naive(),
                &catalog,
                self.config.role,
                &failure_experiences,
            );

            info!(agent, attempt, "starting attempt");

            match self
                .run_attempt(&task, &system_prompt, &event_tx)
                .await
            {
                AttemptEnd::Answer(text) => {
                    send(&event_tx, AgentEvent::FinalAnswer { text });
                    send(
                        &event_tx,
                        AgentEvent::AgentEnded {
                            outcome: AgentOutcome::Success,
                        },
                    );
                    return;
                }
                AttemptEnd::Aborted(outcome) => {
                    send(&event_tx, AgentEvent::FinalAnswer { text: String::new() });
                    send(&event_tx, AgentEvent::AgentEnded { outcome });
                    return;
                }
                AttemptEnd::Cancelled => {
                    info!(agent, "task cancelled by consumer");
                    return;
                }
                AttemptEnd::Failed {
                    experience,
                    reached_max_turns,
                } => {
                    if let Some(experience) = experience {
                        failure_experiences.push(experience);
                    }
                    if attempt == self.config.max_attempts.max(1) {
                        let outcome = if reached_max_turns {
                            AgentOutcome::MaxTurns
                        } else {
                            AgentOutcome::Fatal
                        };
                        send(&event_tx, AgentEvent::FinalAnswer { text: String::new() });
                        send(&event_tx, AgentEvent::AgentEnded { outcome });
                        return;
                    }
                    info!(agent, attempt, "attempt failed, retrying with failure experience");
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        task: &str,
        system_prompt: &str,
        event_tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> AttemptEnd {
        let agent = self.config.role.agent_name();
        let strategy = ContextStrategy::from_keep_tool_result(self.config.keep_tool_result);
        let compactor = (self.config.context_compress_limit > 0)
            .then(|| Compactor::new(self.services.summarizer.clone()));

        let mut st = AttemptState::new(task);

        loop {
            if event_tx.is_closed() {
                return AttemptEnd::Cancelled;
            }
            if self.deadline_exceeded() {
                send(
                    event_tx,
                    AgentEvent::ToolFailed {
                        error_kind: ErrorKind::Timeout,
                        message: "task deadline exceeded".to_string(),
                    },
                );
                return AttemptEnd::Aborted(AgentOutcome::Fatal);
            }

            // Guard 1: turn budget (with the rollback absorption buffer).
            if st.turn_count >= self.config.max_turns
                || st.llm_calls >= self.config.max_turns + limits::EXTRA_ATTEMPTS_BUFFER
            {
                st.reached_max_turns = true;
                break;
            }

            if let Some(compactor) = &compactor {
                let limit = self.config.context_compress_limit;
                if st.turn_count > 0 && st.turn_count % limit == 0 {
                    info!(agent, turn = st.turn_count, "compacting conversation");
                    let compressed = compactor.compact(task, &st.messages).await;
                    st.messages = vec![compressed];
                    st.turn_count = 0;
                }
            }

            st.llm_calls += 1;
            send(event_tx, AgentEvent::LlmStarted);
            let completion = match self
                .services
                .llm
                .generate(system_prompt, &st.messages, None)
                .await
            {
                Ok(completion) => completion,
                Err(e) => {
                    warn!(agent, error = %e, "LLM call failed terminally");
                    send(
                        event_tx,
                        AgentEvent::ToolFailed {
                            error_kind: map_llm_error(e.kind),
                            message: e.message,
                        },
                    );
                    return AttemptEnd::Aborted(AgentOutcome::Fatal);
                }
            };

            send(
                event_tx,
                AgentEvent::LlmChunk {
                    text: completion.text.clone(),
                },
            );
            send(
                event_tx,
                AgentEvent::LlmEnded {
                    usage: completion.usage,
                },
            );

            st.last_usage = completion.usage;
            st.messages.push(ChatMessage::assistant(&completion.text));
            st.turn_count += 1;

            let text = completion.text;
            let boxed = parser::extract_boxed_answer(&parser::strip_think_tags(&text));
            if let Some(answer) = &boxed {
                st.intermediate_answers.push(answer.clone());
            }

            let calls = match parser::parse_tool_calls(&text) {
                Ok(calls) => calls,
                Err(e) => {
                    warn!(agent, error = %e, "tool-call block failed to parse");
                    send(
                        event_tx,
                        AgentEvent::ParseResult {
                            tool_calls: Vec::new(),
                            boxed: boxed.clone(),
                        },
                    );
                    if !self.rollback(&mut st, RollbackReason::Parse, event_tx) {
                        return AttemptEnd::Aborted(AgentOutcome::TooManyRollbacks);
                    }
                    continue;
                }
            };

            send(
                event_tx,
                AgentEvent::ParseResult {
                    tool_calls: calls.clone(),
                    boxed: boxed.clone(),
                },
            );

            if calls.is_empty() {
                let tagged = parser::contains_protocol_tags(&text);
                let refusing = parser::is_refusal(&text);

                if tagged || refusing {
                    // Guards 3 and 4. When both fire, log both; the tag
                    // check takes precedence for the recorded reason.
                    if tagged && refusing {
                        warn!(agent, "response carries protocol tags and a refusal phrase");
                    }
                    let reason = if tagged {
                        RollbackReason::Format
                    } else {
                        RollbackReason::Refusal
                    };
                    if !self.rollback(&mut st, reason, event_tx) {
                        return AttemptEnd::Aborted(AgentOutcome::TooManyRollbacks);
                    }
                    continue;
                }

                // Guard 2: a well-formed, tool-free response ends the loop.
                break;
            }

            if calls.len() > 1 {
                warn!(agent, count = calls.len(), "multiple tool-call blocks, using the first");
            }
            let call = calls.into_iter().next().expect("non-empty calls");

            if parser::is_refusal(&text) {
                if !self.rollback(&mut st, RollbackReason::Refusal, event_tx) {
                    return AttemptEnd::Aborted(AgentOutcome::TooManyRollbacks);
                }
                continue;
            }

            // Guard 5: duplicate query. Only while rollback budget remains;
            // otherwise the duplicate is allowed to proceed.
            let sub_tool = self.config.sub_agent_tool.as_deref().unwrap_or_default();
            let query = dedup::query_key(&call.tool_name, &call.arguments, sub_tool);
            if let Some(query) = &query {
                let seen = self
                    .used_queries
                    .lock()
                    .expect("query index lock")
                    .count(agent, &call.tool_name, query);
                if seen >= 1 {
                    if st.consecutive_rollbacks + 1 < limits::MAX_CONSECUTIVE_ROLLBACKS {
                        info!(agent, tool = %call.tool_name, query = %query, "duplicate query");
                        if !self.rollback(&mut st, RollbackReason::DuplicateQuery, event_tx) {
                            return AttemptEnd::Aborted(AgentOutcome::TooManyRollbacks);
                        }
                        continue;
                    }
                    warn!(agent, query = %query, "rollback budget exhausted, allowing duplicate");
                }
            }

            if event_tx.is_closed() {
                return AttemptEnd::Cancelled;
            }

            let is_sub_agent_call = self.config.sub_agent_tool.as_deref()
                == Some(call.tool_name.as_str())
                && self.services.sub_agent_tools.is_some();

            let result = if is_sub_agent_call {
                self.invoke_sub_agent(&call, event_tx).await
            } else {
                send(
                    event_tx,
                    AgentEvent::ToolStarted {
                        server: call.server_name.clone(),
                        tool: call.tool_name.clone(),
                        args: call.arguments.clone(),
                    },
                );
                self.services
                    .tools
                    .execute(&call.server_name, &call.tool_name, call.arguments.clone())
                    .await
            };

            // The call has executed; only now does it count for dedup.
            if let Some(query) = &query {
                self.used_queries
                    .lock()
                    .expect("query index lock")
                    .record(agent, &call.tool_name, query);
            }

            if result.is_error {
                send(
                    event_tx,
                    AgentEvent::ToolFailed {
                        error_kind: result.error_kind,
                        message: result.content.clone(),
                    },
                );
                if !self.rollback(&mut st, RollbackReason::ToolError, event_tx) {
                    return AttemptEnd::Aborted(AgentOutcome::TooManyRollbacks);
                }
                continue;
            }

            if !is_sub_agent_call {
                send(
                    event_tx,
                    AgentEvent::ToolSucceeded {
                        payload: result.content.clone(),
                    },
                );
            }

            st.consecutive_rollbacks = 0;
            st.messages.push(ChatMessage::user(result.content));

            if let ContextStrategy::SlidingWindow(keep) = strategy {
                context::demote_stale_tool_results(&mut st.messages, keep);
            }

            // Guard 7: predicted overflow under the keep-all strategy.
            if strategy == ContextStrategy::KeepAll && self.overflow_predicted(task, &st) {
                st.messages.pop();
                if matches!(st.messages.last().map(|m| m.role), Some(Role::Assistant)) {
                    st.messages.pop();
                }
                st.turn_count = self.config.max_turns;
                st.reached_max_turns = true;
                break;
            }
        }

        self.finalize(task, system_prompt, st, event_tx).await
    }

    /// Pop the trailing assistant message and account for the rollback.
    /// Returns false once the consecutive-rollback cap is hit.
    fn rollback(
        &self,
        st: &mut AttemptState,
        reason: RollbackReason,
        event_tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> bool {
        if matches!(st.messages.last().map(|m| m.role), Some(Role::Assistant)) {
            st.messages.pop();
        }
        st.turn_count = st.turn_count.saturating_sub(1);
        st.consecutive_rollbacks += 1;
        send(event_tx, AgentEvent::Rollback { reason });

        if st.consecutive_rollbacks >= limits::MAX_CONSECUTIVE_ROLLBACKS {
            warn!(
                rollbacks = st.consecutive_rollbacks,
                ?reason,
                "too many consecutive rollbacks, aborting task"
            );
            return false;
        }
        true
    }

    fn overflow_predicted(&self, task: &str, st: &AttemptState) -> bool {
        let llm = &self.services.llm;
        let last_user_tokens = st
            .messages
            .last()
            .filter(|m| m.role == Role::User)
            .map(|m| buffered_estimate(llm.estimate_tokens(&m.content)))
            .unwrap_or(0);
        let summary_tokens = buffered_estimate(
            llm.estimate_tokens(&prompts::summary_prompt(task, self.config.role)),
        );

        context::predict_overflow(
            &st.last_usage,
            last_user_tokens,
            summary_tokens,
            llm.max_completion_tokens,
            llm.max_context_length,
        )
    }

    async fn invoke_sub_agent(
        &self,
        call: &ToolCall,
        event_tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> ToolResult {
        let Some(subtask) = call.arguments.get("subtask").and_then(|v| v.as_str()) else {
            return ToolResult {
                tool_name: call.tool_name.clone(),
                content: "Missing required 'subtask' argument.".to_string(),
                is_error: true,
                error_kind: ErrorKind::Schema,
            };
        };

        let sub_tools = self
            .services
            .sub_agent_tools
            .clone()
            .expect("sub-agent tools checked by caller");

        send(
            event_tx,
            AgentEvent::SubAgentStarted {
                agent: AgentRole::Browsing.agent_name().to_string(),
                subtask: subtask.to_string(),
            },
        );

        let sub = Orchestrator::new(
            OrchestratorServices {
                llm: self.services.llm.clone(),
                summarizer: self.services.summarizer.clone(),
                tools: sub_tools,
                sub_agent_tools: None,
            },
            OrchestratorConfig {
                role: AgentRole::Browsing,
                max_turns: self.config.sub_agent_max_turns,
                keep_tool_result: self.config.keep_tool_result,
                // Compaction stays a main-loop concern.
                context_compress_limit: 0,
                max_attempts: 1,
                sub_agent_tool: None,
                sub_agent_max_turns: 0,
                deadline: self.config.deadline,
            },
        )
        .with_shared_queries(self.used_queries.clone());

        let mut sub_rx = sub.run(subtask.to_string());
        let mut summary = String::new();
        while let Some(event) = sub_rx.recv().await {
            // Nested internals stay off the parent transcript; only the
            // delegation boundary is visible.
            if let AgentEvent::FinalAnswer { text } = event {
                summary = text;
            }
        }

        send(
            event_tx,
            AgentEvent::SubAgentEnded {
                summary: summary.clone(),
            },
        );

        if summary.trim().is_empty() {
            ToolResult {
                tool_name: call.tool_name.clone(),
                content: "Sub-agent returned no report.".to_string(),
                is_error: true,
                error_kind: ErrorKind::Server,
            }
        } else {
            ToolResult {
                tool_name: call.tool_name.clone(),
                content: summary,
                is_error: false,
                error_kind: ErrorKind::None,
            }
        }
    }

    /// Finalization. The decision table over (compaction, reached max turns):
    ///
    /// | Compaction | Max turns | Behavior                                   |
    /// |------------|-----------|--------------------------------------------|
    /// | off        | any       | generate answer, fall back to intermediate |
    /// | on         | no        | generate answer, no fallback, post-mortem  |
    /// | on         | yes       | skip generation, post-mortem directly      |
    async fn finalize(
        &self,
        task: &str,
        system_prompt: &str,
        mut st: AttemptState,
        event_tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> AttemptEnd {
        let agent = self.config.role.agent_name();
        send(event_tx, AgentEvent::FinalizationStarted);

        let compaction_on = self.config.context_compress_limit > 0;

        if compaction_on && st.reached_max_turns {
            info!(agent, "max turns under compaction: skipping answer generation");
            let experience = self.post_mortem(system_prompt, &st.messages).await;
            return AttemptEnd::Failed {
                experience,
                reached_max_turns: true,
            };
        }

        if matches!(st.messages.last().map(|m| m.role), Some(Role::User)) {
            st.messages.pop();
        }
        st.messages
            .push(ChatMessage::user(prompts::summary_prompt(task, self.config.role)));

        let retries = if self.config.keep_tool_result == -1 {
            limits::MAX_FINAL_ANSWER_RETRIES
        } else {
            1
        };

        let mut answer: Option<String> = None;

        for retry in 0..retries {
            if event_tx.is_closed() {
                return AttemptEnd::Cancelled;
            }

            match self
                .services
                .llm
                .generate(system_prompt, &st.messages, None)
                .await
            {
                Ok(completion) => {
                    st.messages.push(ChatMessage::assistant(&completion.text));
                    let cleaned = parser::strip_think_tags(&completion.text);

                    answer = match self.config.role {
                        AgentRole::Main => parser::extract_boxed_answer(&cleaned),
                        // The browsing report is the answer; no sentinel.
                        AgentRole::Browsing => {
                            (!cleaned.trim().is_empty()).then(|| cleaned.trim().to_string())
                        }
                    };

                    if answer.is_some() {
                        break;
                    }
                    warn!(agent, retry, "no boxed answer in summary response");
                    if retry + 1 < retries {
                        st.messages.pop();
                    }
                }
                Err(e) => {
                    warn!(agent, retry, error = %e, "finalization LLM call failed");
                    if retry + 1 == retries {
                        send(
                            event_tx,
                            AgentEvent::ToolFailed {
                                error_kind: map_llm_error(e.kind),
                                message: e.message,
                            },
                        );
                        return AttemptEnd::Aborted(AgentOutcome::Fatal);
                    }
                }
            }
        }

        if let Some(answer) = answer {
            return AttemptEnd::Answer(answer);
        }

        // format_missed. Without compaction the last intermediate boxed
        // answer beats returning nothing; with compaction a guess would
        // poison the retry, so none is made.
        if !compaction_on {
            if let Some(intermediate) = st.intermediate_answers.last() {
                info!(agent, "falling back to intermediate boxed answer");
                return AttemptEnd::Answer(intermediate.clone());
            }
        }

        let experience = self.post_mortem(system_prompt, &st.messages).await;
        AttemptEnd::Failed {
            experience,
            reached_max_turns: st.reached_max_turns,
        }
    }

    /// Ask the model for a structured post-mortem of the failed attempt.
    async fn post_mortem(&self, system_prompt: &str, messages: &[ChatMessage]) -> Option<String> {
        let mut history = messages.to_vec();
        if matches!(history.last().map(|m| m.role), Some(Role::User)) {
            history.pop();
        }
        history.push(ChatMessage::user(FAILURE_SUMMARY_PROMPT));

        match self
            .services
            .llm
            .generate(system_prompt, &history, None)
            .await
        {
            Ok(completion) => {
                let summary = parser::strip_think_tags(&completion.text);
                if summary.is_empty() {
                    None
                } else {
                    info!("captured failure experience ({} chars)", summary.len());
                    Some(summary)
                }
            }
            Err(e) => {
                warn!(error = %e, "failure summary generation failed");
                None
            }
        }
    }

    fn deadline_exceeded(&self) -> bool {
        self.config
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

fn map_llm_error(kind: LlmErrorKind) -> ErrorKind {
    match kind {
        LlmErrorKind::Transport | LlmErrorKind::Request => ErrorKind::Transport,
        LlmErrorKind::RateLimited => ErrorKind::RateLimited,
        LlmErrorKind::Server => ErrorKind::Server,
        LlmErrorKind::Timeout => ErrorKind::Timeout,
    }
}

fn send(event_tx: &mpsc::UnboundedSender<AgentEvent>, event: AgentEvent) {
    let _ = event_tx.send(event);
}
