//! End-to-end orchestrator scenarios over scripted LLM and tool stubs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use scout_core::agent::{AgentEvent, AgentOutcome, RollbackReason};
use scout_core::llm::{
    ChatMessage, Completion, CompletionRequest, LlmBackend, LlmClient, LlmError, Role, Usage,
};
use scout_core::mcp::protocol::{McpContent, RawToolResult};
use scout_core::mcp::{ToolDef, ToolManager, ToolTransport, TransportError};
use scout_core::{Orchestrator, OrchestratorConfig, OrchestratorServices};

// ── Stubs ──────────────────────────────────────────────────────────────

type BackendFn =
    dyn Fn(&CompletionRequest, usize) -> Result<Completion, LlmError> + Send + Sync;

/// Scripted LLM backend. The closure receives the request and the
/// zero-based call index; every request's system prompt is recorded for
/// later assertions.
struct ScriptedBackend {
    handler: Box<BackendFn>,
    calls: AtomicUsize,
    system_prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(
        handler: impl Fn(&CompletionRequest, usize) -> Result<Completion, LlmError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
            system_prompts: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn system_prompts(&self) -> Vec<String> {
        self.system_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.system_prompts.lock().unwrap().push(system);
        (self.handler)(request, index)
    }
}

type ToolFn = dyn Fn(&str, &Value) -> Result<RawToolResult, TransportError> + Send + Sync;

struct ScriptedTransport {
    tools: Vec<ToolDef>,
    handler: Box<ToolFn>,
}

impl ScriptedTransport {
    fn new(
        tool_names: &[&str],
        handler: impl Fn(&str, &Value) -> Result<RawToolResult, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            tools: tool_names
                .iter()
                .map(|name| ToolDef {
                    name: name.to_string(),
                    description: Some(format!("stub {name}")),
                    input_schema: json!({"type": "object"}),
                })
                .collect(),
            handler: Box::new(handler),
        })
    }
}

#[async_trait]
impl ToolTransport for ScriptedTransport {
    async fn list_tools(&self) -> Result<Vec<ToolDef>, TransportError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolResult, TransportError> {
        (self.handler)(name, &arguments)
    }
}

fn text_result(text: impl Into<String>) -> RawToolResult {
    RawToolResult {
        content: vec![McpContent::Text { text: text.into() }],
        is_error: false,
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

fn completion(text: impl Into<String>) -> Result<Completion, LlmError> {
    completion_with_usage(text, Usage {
        prompt_tokens: 500,
        completion_tokens: 100,
        total_tokens: 600,
    })
}

fn completion_with_usage(
    text: impl Into<String>,
    usage: Usage,
) -> Result<Completion, LlmError> {
    Ok(Completion {
        text: text.into(),
        usage,
    })
}

fn tool_call_text(server: &str, tool: &str, args: &Value) -> String {
    format!(
        "Let me look this up.\n\n<use_mcp_tool>\n<server_name>{server}</server_name>\n<tool_name>{tool}</tool_name>\n<arguments>\n{args}\n</arguments>\n</use_mcp_tool>"
    )
}

fn is_summary_request(request: &CompletionRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.content.contains("The research phase is over"))
}

fn is_browsing_summary_request(request: &CompletionRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.content.contains("We are now ending this session"))
}

fn is_post_mortem_request(request: &CompletionRequest) -> bool {
    request
        .messages
        .iter()
        .any(|m| m.content.contains("The task was not completed successfully"))
}

async fn services_with(
    backend: Arc<ScriptedBackend>,
    transport: Arc<ScriptedTransport>,
    max_context_length: usize,
    max_completion_tokens: usize,
) -> OrchestratorServices {
    let mut tools = ToolManager::new(None);
    tools.register("search", transport);
    tools.load_catalog().await;

    let llm = Arc::new(LlmClient::new(
        backend,
        max_context_length,
        max_completion_tokens,
        None,
    ));
    OrchestratorServices {
        llm: llm.clone(),
        summarizer: llm,
        tools: Arc::new(tools),
        sub_agent_tools: None,
    }
}

async fn run_and_collect(orchestrator: Orchestrator, task: &str) -> Vec<AgentEvent> {
    let mut rx = orchestrator.run(task.to_string());
    let mut events = Vec::new();
    let deadline = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    });
    deadline.await.expect("orchestrator did not finish in time");
    events
}

fn final_answer(events: &[AgentEvent]) -> Option<String> {
    events.iter().find_map(|e| match e {
        AgentEvent::FinalAnswer { text } => Some(text.clone()),
        _ => None,
    })
}

fn outcome(events: &[AgentEvent]) -> Option<AgentOutcome> {
    events.iter().find_map(|e| match e {
        AgentEvent::AgentEnded { outcome } => Some(*outcome),
        _ => None,
    })
}

fn count<F: Fn(&AgentEvent) -> bool>(events: &[AgentEvent], pred: F) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

// ── S1: direct answer, zero tools ──────────────────────────────────────

#[tokio::test]
async fn s1_direct_answer_without_tools() {
    let backend = ScriptedBackend::new(|request, _| {
        if is_summary_request(request) {
            completion(r"The sum of 2 and 2 is 4. \boxed{4}")
        } else {
            completion("Simple arithmetic, no tools needed: 2+2 = 4.")
        }
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, _| {
        Ok(text_result("unused"))
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "What is 2+2?",
    )
    .await;

    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(final_answer(&events).as_deref(), Some("4"));
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::LlmChunk { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolStarted { .. })), 0);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::FinalizationStarted)));
    // Reasoning chunk precedes finalization.
    let chunk_at = events
        .iter()
        .position(|e| matches!(e, AgentEvent::LlmChunk { .. }))
        .unwrap();
    let finalization_at = events
        .iter()
        .position(|e| matches!(e, AgentEvent::FinalizationStarted))
        .unwrap();
    assert!(chunk_at < finalization_at);
}

// ── S2: one search round, then the answer ──────────────────────────────

#[tokio::test]
async fn s2_single_search_round() {
    let results = json!({
        "organic": [
            {"title": "Result one", "link": "https://a.example", "snippet": "first"},
            {"title": "Result two", "link": "https://b.example", "snippet": "second"},
        ]
    });
    let results_clone = results.clone();

    let backend = ScriptedBackend::new(move |request, index| {
        if is_summary_request(request) {
            completion(r"Based on the findings: \boxed{blue}")
        } else if index == 0 {
            completion(tool_call_text("search", "google_search", &json!({"q": "sky color"})))
        } else {
            completion("The search results settle it; no further tools needed.")
        }
    });
    let transport = ScriptedTransport::new(&["google_search"], move |_, _| {
        Ok(text_result(results_clone.to_string()))
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "What color is the sky?",
    )
    .await;

    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(final_answer(&events).as_deref(), Some("blue"));
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolStarted { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolSucceeded { .. })), 1);

    let payload = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::ToolSucceeded { payload } => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert!(payload.contains("Result one"));
}

// ── S3: duplicate query triggers one rollback, retry diverges ──────────

#[tokio::test]
async fn s3_duplicate_query_rolls_back_then_diverges() {
    let backend = ScriptedBackend::new(|request, index| {
        if is_summary_request(request) {
            return completion(r"\boxed{answer}");
        }
        match index {
            0 | 1 => completion(tool_call_text("search", "google_search", &json!({"q": "X"}))),
            2 => completion(tool_call_text("search", "google_search", &json!({"q": "Y"}))),
            _ => completion("Enough information gathered."),
        }
    });
    let transport =
        ScriptedTransport::new(&["google_search"], |_, args| {
            Ok(text_result(format!("results for {}", args["q"])))
        });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "research X",
    )
    .await;

    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(
        count(&events, |e| matches!(
            e,
            AgentEvent::Rollback {
                reason: RollbackReason::DuplicateQuery
            }
        )),
        1
    );
    // X executes once, Y executes once; the duplicate never reaches a tool.
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolStarted { .. })), 2);
    assert!(final_answer(&events).is_some());
}

// ── S4: max turns, failure-experience retry, format_missed ─────────────

#[tokio::test]
async fn s4_max_turns_then_retry_with_failure_experience() {
    let backend = ScriptedBackend::new(|request, index| {
        if is_post_mortem_request(request) {
            completion(
                "Failure type: incomplete\nWhat happened: kept searching\nUseful findings: none",
            )
        } else if is_summary_request(request) {
            // Never produces the boxed sentinel.
            completion("I was unable to reach a conclusive answer.")
        } else {
            // Always another tool call, with a fresh query each time.
            completion(tool_call_text(
                "search",
                "google_search",
                &json!({ "q": format!("query {index}") }),
            ))
        }
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, args| {
        Ok(text_result(format!("nothing useful for {}", args["q"])))
    });
    let services = services_with(backend.clone(), transport, 131_072, 1024).await;

    let config = OrchestratorConfig {
        max_turns: 3,
        max_attempts: 2,
        ..OrchestratorConfig::default()
    };
    let events = run_and_collect(Orchestrator::new(services, config), "impossible task").await;

    // Each attempt runs exactly max_turns tool executions.
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolStarted { .. })), 6);
    assert_eq!(
        count(&events, |e| matches!(e, AgentEvent::FinalizationStarted)),
        2
    );

    // The retry attempt's system prompt carries the injected post-mortems.
    let prompts = backend.system_prompts();
    assert!(prompts
        .iter()
        .any(|p| p.contains("=== Previous Attempts Analysis ===")));
    assert!(prompts.iter().any(|p| p.contains("[Attempt 1]")));

    // Final failure: empty assistant content, max-turns outcome.
    assert_eq!(final_answer(&events).as_deref(), Some(""));
    assert_eq!(outcome(&events), Some(AgentOutcome::MaxTurns));
}

// ── S5: context overflow forces finalization ───────────────────────────

#[tokio::test]
async fn s5_context_overflow_forces_finalization() {
    let big_usage = Usage {
        prompt_tokens: 2600,
        completion_tokens: 200,
        total_tokens: 2800,
    };
    let backend = ScriptedBackend::new(move |request, _| {
        if is_summary_request(request) {
            completion(r"\boxed{done before overflow}")
        } else {
            completion_with_usage(
                tool_call_text("search", "google_search", &json!({"q": "large"})),
                big_usage,
            )
        }
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, _| {
        Ok(text_result("x".repeat(2048)))
    });
    // max_context_length = 4000, keep_tool_result = -1 (keep all).
    let services = services_with(backend, transport, 4000, 500).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "fill the context",
    )
    .await;

    // The first tool result trips the overflow predictor.
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolSucceeded { .. })), 1);
    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(
        final_answer(&events).as_deref(),
        Some("done before overflow")
    );
}

// ── S6: consumer disconnect cancels within one step ────────────────────

/// Backend whose second call blocks until the test releases it, so the
/// disconnect deterministically lands while a call is in flight.
struct GatedBackend {
    calls: AtomicUsize,
    entered_second: Arc<tokio::sync::Notify>,
    release_second: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl LlmBackend for GatedBackend {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        if index == 1 {
            self.entered_second.notify_one();
            self.release_second.notified().await;
        }
        completion(tool_call_text(
            "search",
            "google_search",
            &json!({ "q": format!("q{index}") }),
        ))
    }
}

#[tokio::test]
async fn s6_dropping_receiver_cancels_the_task() {
    let entered_second = Arc::new(tokio::sync::Notify::new());
    let release_second = Arc::new(tokio::sync::Notify::new());
    let backend = Arc::new(GatedBackend {
        calls: AtomicUsize::new(0),
        entered_second: entered_second.clone(),
        release_second: release_second.clone(),
    });

    let transport = ScriptedTransport::new(&["google_search"], |_, _| {
        Ok(text_result("some result"))
    });
    let mut tools = ToolManager::new(None);
    tools.register("search", transport);
    tools.load_catalog().await;

    let llm = Arc::new(LlmClient::new(backend.clone(), 131_072, 1024, None));
    let services = OrchestratorServices {
        llm: llm.clone(),
        summarizer: llm,
        tools: Arc::new(tools),
        sub_agent_tools: None,
    };

    let mut rx = Orchestrator::new(services, OrchestratorConfig::default())
        .run("endless research".to_string());

    // Drain until the first tool result arrives.
    let mut saw_tool_result = false;
    while let Some(event) = rx.recv().await {
        if matches!(event, AgentEvent::ToolSucceeded { .. }) {
            saw_tool_result = true;
            break;
        }
    }
    assert!(saw_tool_result);

    // The second LLM call is (or will be) in flight; disconnect, then let
    // the call return.
    tokio::time::timeout(Duration::from_secs(5), entered_second.notified())
        .await
        .expect("second LLM call never started");
    drop(rx);
    release_second.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The loop noticed the disconnect right after the in-flight call; no
    // further LLM call or tool execution was issued.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
}

// ── Rollback cap aborts the task ───────────────────────────────────────

#[tokio::test]
async fn refusals_hit_the_rollback_cap() {
    let backend = ScriptedBackend::new(|_, _| {
        completion("I'm sorry, but I can't continue with this task.")
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, _| {
        Ok(text_result("unused"))
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "anything",
    )
    .await;

    assert_eq!(
        count(&events, |e| matches!(
            e,
            AgentEvent::Rollback {
                reason: RollbackReason::Refusal
            }
        )),
        5
    );
    assert_eq!(outcome(&events), Some(AgentOutcome::TooManyRollbacks));
    assert_eq!(final_answer(&events).as_deref(), Some(""));
}

// ── Tool failure rolls back, recovery succeeds ─────────────────────────

#[tokio::test]
async fn tool_error_rolls_back_and_recovers() {
    let backend = ScriptedBackend::new(|request, index| {
        if is_summary_request(request) {
            return completion(r"\boxed{recovered}");
        }
        match index {
            0 => completion(tool_call_text("search", "google_search", &json!({"q": "flaky"}))),
            1 => completion(tool_call_text("search", "google_search", &json!({"q": "stable"}))),
            _ => completion("That worked; research complete."),
        }
    });
    let failures = Arc::new(AtomicUsize::new(0));
    let failures_clone = failures.clone();
    let transport = ScriptedTransport::new(&["google_search"], move |_, args| {
        if args["q"] == "flaky" {
            failures_clone.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::new(
                scout_core::mcp::ErrorKind::Server,
                "upstream exploded",
            ))
        } else {
            Ok(text_result("clean results"))
        }
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "flaky then stable",
    )
    .await;

    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(
        count(&events, |e| matches!(
            e,
            AgentEvent::Rollback {
                reason: RollbackReason::ToolError
            }
        )),
        1
    );
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolFailed { .. })), 1);
    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(final_answer(&events).as_deref(), Some("recovered"));
}

// ── Sub-agent delegation ───────────────────────────────────────────────

#[tokio::test]
async fn sub_agent_report_returns_as_tool_result() {
    let backend = ScriptedBackend::new(|request, index| {
        if is_browsing_summary_request(request) {
            return completion("The population figure found during browsing is 8 million.");
        }
        if is_summary_request(request) {
            return completion(r"\boxed{8 million}");
        }
        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        if system.contains("searching and browsing the web") {
            // Browsing agent answers without tools.
            completion("Checked the sources directly; the figure is 8 million.")
        } else if index == 0 {
            completion(tool_call_text(
                "agent",
                "search_and_browse",
                &json!({"subtask": "find the city's population"}),
            ))
        } else {
            completion("The delegated report is sufficient.")
        }
    });

    let main_transport = ScriptedTransport::new(&["search_and_browse"], |_, _| {
        Ok(text_result("unused"))
    });
    let sub_transport = ScriptedTransport::new(&["google_search"], |_, _| {
        Ok(text_result("browsing data"))
    });

    let mut sub_tools = ToolManager::new(None);
    sub_tools.register("search", sub_transport);
    sub_tools.load_catalog().await;

    let mut services = services_with(backend, main_transport, 131_072, 1024).await;
    services.sub_agent_tools = Some(Arc::new(sub_tools));

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "how many people live there?",
    )
    .await;

    assert_eq!(count(&events, |e| matches!(e, AgentEvent::SubAgentStarted { .. })), 1);
    let summary = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::SubAgentEnded { summary } => Some(summary.clone()),
            _ => None,
        })
        .unwrap();
    assert!(summary.contains("8 million"));
    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(final_answer(&events).as_deref(), Some("8 million"));
}

// ── Periodic compaction rewrites the prefix ────────────────────────────

#[tokio::test]
async fn compaction_rewrites_history_and_restarts_the_loop() {
    // Success is only reachable through the compacted history: the stub
    // keeps issuing tool calls until it sees the compaction marker.
    let backend = ScriptedBackend::new(|request, index| {
        if request
            .messages
            .iter()
            .any(|m| m.content.contains("context compression assistant"))
        {
            return completion("Key findings so far: the figure is 42.");
        }
        if is_summary_request(request) {
            return completion(r"\boxed{42}");
        }
        if request
            .messages
            .iter()
            .any(|m| m.content.contains("# Compressed research context"))
        {
            return completion("The compressed context already answers this.");
        }
        completion(tool_call_text(
            "search",
            "google_search",
            &json!({ "q": format!("angle {index}") }),
        ))
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, args| {
        Ok(text_result(format!("partial data for {}", args["q"])))
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let config = OrchestratorConfig {
        max_turns: 6,
        context_compress_limit: 2,
        ..OrchestratorConfig::default()
    };
    let events = run_and_collect(Orchestrator::new(services, config), "what is the figure?").await;

    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(final_answer(&events).as_deref(), Some("42"));
    // Two tool rounds before compaction, none after.
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolStarted { .. })), 2);
}

// ── Sliding window demotes stale tool results ──────────────────────────

#[tokio::test]
async fn sliding_window_demotes_old_tool_results() {
    // The stub only stops once a demoted placeholder shows up in its
    // request, which requires keep_tool_result to be enforced in place.
    let backend = ScriptedBackend::new(|request, index| {
        if is_summary_request(request) {
            return completion(r"\boxed{windowed}");
        }
        if request
            .messages
            .iter()
            .any(|m| m.content == "Tool result is omitted to save tokens.")
        {
            return completion("Old results were demoted as expected.");
        }
        completion(tool_call_text(
            "search",
            "google_search",
            &json!({ "q": format!("window {index}") }),
        ))
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, args| {
        Ok(text_result(format!("bulk payload for {}", args["q"])))
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let config = OrchestratorConfig {
        keep_tool_result: 1,
        ..OrchestratorConfig::default()
    };
    let events = run_and_collect(Orchestrator::new(services, config), "windowed research").await;

    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
    assert_eq!(final_answer(&events).as_deref(), Some("windowed"));
    // The second tool result triggers the first demotion.
    assert_eq!(count(&events, |e| matches!(e, AgentEvent::ToolStarted { .. })), 2);
}

// ── History condenser ──────────────────────────────────────────────────

#[tokio::test]
async fn condenser_passes_single_message_through() {
    let backend = ScriptedBackend::new(|_, _| completion("never called"));
    let llm = Arc::new(LlmClient::new(backend.clone(), 131_072, 1024, None));
    let condenser = scout_core::context::HistoryCondenser::new(llm, 30_000, true);

    let out = condenser
        .condense(&[ChatMessage::user("just one question")])
        .await;
    assert_eq!(out.as_deref(), Some("just one question"));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn condenser_formats_short_multi_turn_history() {
    let backend = ScriptedBackend::new(|_, _| completion("never called"));
    let llm = Arc::new(LlmClient::new(backend.clone(), 131_072, 1024, None));
    let condenser = scout_core::context::HistoryCondenser::new(llm, 30_000, true);

    let out = condenser
        .condense(&[
            ChatMessage::user("first question"),
            ChatMessage::assistant("first answer"),
            ChatMessage::user("follow-up question"),
        ])
        .await
        .unwrap();

    assert!(out.contains("# Conversation History"));
    assert!(out.contains("first question"));
    assert!(out.ends_with("# Current Question\n\nfollow-up question"));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn condenser_compresses_long_history_via_llm() {
    let backend = ScriptedBackend::new(|request, _| {
        assert!(request
            .messages
            .iter()
            .any(|m| m.content.contains("context compression assistant")));
        completion("Relevant context: the user is researching llamas.")
    });
    let llm = Arc::new(LlmClient::new(backend.clone(), 131_072, 1024, None));
    // Tiny threshold forces compression.
    let condenser = scout_core::context::HistoryCondenser::new(llm, 10, true);

    let out = condenser
        .condense(&[
            ChatMessage::user(&"llama facts ".repeat(50)),
            ChatMessage::assistant(&"many llama details ".repeat(50)),
            ChatMessage::user("so how tall are they?"),
        ])
        .await
        .unwrap();

    assert!(out.contains("Relevant context: the user is researching llamas."));
    assert!(out.ends_with("# Current Question\n\nso how tall are they?"));
    assert_eq!(backend.call_count(), 1);
}

// ── History validity after rollback ────────────────────────────────────

#[tokio::test]
async fn rollback_keeps_history_role_valid() {
    // One format error (tags without a complete block), then a clean run.
    // If rollback left the assistant message in place, the next completion
    // request would end with two assistant messages in a row.
    let saw_invalid_tail = Arc::new(AtomicUsize::new(0));
    let tail_probe = saw_invalid_tail.clone();

    let backend = ScriptedBackend::new(move |request, index| {
        let non_system: Vec<&ChatMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        if non_system.last().map(|m| m.role) != Some(Role::User) {
            tail_probe.fetch_add(1, Ordering::SeqCst);
        }
        if is_summary_request(request) {
            completion(r"\boxed{ok}")
        } else if index == 0 {
            completion("<use_mcp_tool>\n<server_name>search</server_name>\nbroken")
        } else {
            completion("Nothing more to do.")
        }
    });
    let transport = ScriptedTransport::new(&["google_search"], |_, _| {
        Ok(text_result("unused"))
    });
    let services = services_with(backend, transport, 131_072, 1024).await;

    let events = run_and_collect(
        Orchestrator::new(services, OrchestratorConfig::default()),
        "anything",
    )
    .await;

    assert_eq!(
        count(&events, |e| matches!(
            e,
            AgentEvent::Rollback {
                reason: RollbackReason::Format
            }
        )),
        1
    );
    assert_eq!(saw_invalid_tail.load(Ordering::SeqCst), 0);
    assert_eq!(outcome(&events), Some(AgentOutcome::Success));
}
