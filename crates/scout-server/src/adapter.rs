//! Event → chunk adapters.
//!
//! [`AdapterV2`] converts the orchestrator's event stream into the extended
//! chat-completions format: a tree of task blocks rooted at one
//! `research_process_block`, each block emitting `message_start` →
//! `message_process`* → `message_result` with a connection-unique `taskid`
//! and a strictly increasing `index`. The root's `message_result` is held
//! back until the task ends so every other block nests inside it.
//!
//! [`AdapterV1`] is the degenerate case: only the plain assistant content
//! stream.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use scout_core::agent::AgentEvent;
use scout_core::{dedup, parser};

use crate::types::{ChatCompletionChunk, Delta};

const CONTENT_PROCESS_BLOCK: &str = "research_process_block";
const CONTENT_THINK_BLOCK: &str = "research_think_block";
const CONTENT_SEARCH_KEYWORD: &str = "research_web_search_keyword";
const CONTENT_WEB_SEARCH: &str = "research_web_search";
const CONTENT_WEB_BROWSE: &str = "research_web_browse";
const CONTENT_TEXT_BLOCK: &str = "research_text_block";
const CONTENT_COMPLETED: &str = "research_completed";

const ROOT_LABEL: &str = "collecting and analyzing information";
const COMPLETED_LABEL: &str = "collected enough information, preparing the answer";

/// Max unique results surfaced per search.
const MAX_SEARCH_RESULTS: usize = 10;
/// Results per `message_process` chunk.
const SEARCH_BATCH_SIZE: usize = 3;
/// Cap on text-block payloads.
const TEXT_BLOCK_MAX_CHARS: usize = 2000;

struct PendingTool {
    tool: String,
    args: Value,
}

#[derive(Clone)]
struct CachedResult {
    index: u64,
    title: String,
    snippet: String,
}

/// Per-connection state for the extended stream.
pub struct AdapterV2 {
    request_id: String,
    model: String,
    next_taskid: u64,
    current_index: u64,
    root_taskid: String,
    held_root_result: Option<ChatCompletionChunk>,
    open_think: Option<(String, u64)>,
    pending_tool: Option<PendingTool>,
    seen_urls: HashSet<String>,
    result_cache: HashMap<String, CachedResult>,
    global_result_index: u64,
    last_error: Option<String>,
}

impl AdapterV2 {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            // Any monotone unique id works; microseconds keep ids readable
            // in transcripts.
            next_taskid: chrono::Utc::now().timestamp_micros().unsigned_abs(),
            current_index: 0,
            root_taskid: String::new(),
            held_root_result: None,
            open_think: None,
            pending_tool: None,
            seen_urls: HashSet::new(),
            result_cache: HashMap::new(),
            global_result_index: 0,
            last_error: None,
        }
    }

    /// The leading `role: assistant` chunk.
    pub fn initial_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::new(
            &self.request_id,
            &self.model,
            Delta {
                role: Some("assistant".to_string()),
                ..Delta::default()
            },
            None,
        )
    }

    /// Convert one event into zero or more chunks. The chunks of one event
    /// form an atomic group; callers must emit them without interleaving.
    pub fn on_event(&mut self, event: &AgentEvent) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();

        match event {
            AgentEvent::AgentStarted { .. } => {
                if self.root_taskid.is_empty() {
                    self.start_root(&mut out);
                }
            }

            AgentEvent::LlmChunk { text } => {
                let cleaned =
                    parser::remove_tool_call_blocks(&parser::strip_think_tags(text));
                if !cleaned.is_empty() {
                    self.ensure_think_open(&mut out);
                    let (taskid, index) = self.open_think.clone().expect("think block open");
                    out.push(self.task_chunk(
                        "message_process",
                        CONTENT_THINK_BLOCK,
                        &cleaned,
                        &taskid,
                        index,
                    ));
                }
            }

            AgentEvent::ToolStarted { tool, args, .. } => {
                self.close_think(&mut out);
                if dedup::is_search_tool(tool) {
                    let keyword = search_keyword(args);
                    self.emit_simple_block(
                        &mut out,
                        CONTENT_SEARCH_KEYWORD,
                        &json!({"label": "searching the web"}).to_string(),
                        &keyword,
                    );
                }
                self.pending_tool = Some(PendingTool {
                    tool: tool.clone(),
                    args: args.clone(),
                });
            }

            AgentEvent::ToolSucceeded { payload } => {
                let Some(pending) = self.pending_tool.take() else {
                    return out;
                };
                if dedup::is_search_tool(&pending.tool) {
                    self.emit_search_results(&mut out, &pending, payload);
                } else if dedup::is_fetch_tool(&pending.tool) {
                    self.emit_browse_block(&mut out, &pending, payload);
                } else {
                    let label = json!({"label": pending.tool}).to_string();
                    self.emit_simple_block(
                        &mut out,
                        CONTENT_TEXT_BLOCK,
                        &label,
                        &truncate_chars(payload, TEXT_BLOCK_MAX_CHARS),
                    );
                }
            }

            AgentEvent::ToolFailed { message, .. } => {
                self.pending_tool = None;
                self.last_error = Some(message.clone());
                self.close_think(&mut out);
                self.emit_simple_block(
                    &mut out,
                    CONTENT_THINK_BLOCK,
                    &json!({"label": "error"}).to_string(),
                    &format!("Error: {message}"),
                );
            }

            AgentEvent::SubAgentStarted { subtask, .. } => {
                self.close_think(&mut out);
                self.emit_simple_block(
                    &mut out,
                    CONTENT_TEXT_BLOCK,
                    &json!({"label": "delegated research task"}).to_string(),
                    subtask,
                );
            }

            AgentEvent::SubAgentEnded { summary } => {
                self.emit_simple_block(
                    &mut out,
                    CONTENT_TEXT_BLOCK,
                    &json!({"label": "delegated task report"}).to_string(),
                    &truncate_chars(summary, TEXT_BLOCK_MAX_CHARS),
                );
            }

            AgentEvent::FinalizationStarted => {
                self.close_think(&mut out);
            }

            AgentEvent::FinalAnswer { text } => {
                self.close_think(&mut out);

                if text.is_empty() {
                    // Failure path: an error-shaped think block precedes the
                    // root closure and the empty assistant content.
                    let message = self
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "The task could not be completed.".to_string());
                    self.emit_simple_block(
                        &mut out,
                        CONTENT_THINK_BLOCK,
                        &json!({"label": "error"}).to_string(),
                        &format!("Error: {message}"),
                    );
                } else {
                    self.emit_simple_block(
                        &mut out,
                        CONTENT_COMPLETED,
                        &json!({"label": COMPLETED_LABEL}).to_string(),
                        "",
                    );
                }

                if let Some(root_result) = self.held_root_result.take() {
                    out.push(root_result);
                }

                out.push(ChatCompletionChunk::new(
                    &self.request_id,
                    &self.model,
                    Delta {
                        role: Some("assistant".to_string()),
                        content: Some(parser::strip_think_tags(text)),
                        ..Delta::default()
                    },
                    None,
                ));
            }

            // Bookkeeping-only events.
            AgentEvent::LlmStarted
            | AgentEvent::LlmEnded { .. }
            | AgentEvent::ParseResult { .. }
            | AgentEvent::Rollback { .. }
            | AgentEvent::AgentEnded { .. } => {}
        }

        out
    }

    /// Close anything still open and emit the terminating chunk. Called
    /// once, after the event stream ends.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        self.close_think(&mut out);
        if let Some(root_result) = self.held_root_result.take() {
            out.push(root_result);
        }
        out.push(ChatCompletionChunk::new(
            &self.request_id,
            &self.model,
            Delta::default(),
            Some("stop".to_string()),
        ));
        out
    }

    // ── block plumbing ─────────────────────────────────────────────────

    fn start_root(&mut self, out: &mut Vec<ChatCompletionChunk>) {
        let taskid = self.alloc_taskid();
        self.root_taskid = taskid.clone();
        let index = self.alloc_index();
        let label = json!({"label": ROOT_LABEL}).to_string();

        out.push(self.task_chunk("message_start", CONTENT_PROCESS_BLOCK, &label, &taskid, index));
        out.push(self.task_chunk("message_process", CONTENT_PROCESS_BLOCK, "", &taskid, index));
        // Held until the task ends so every other block closes inside it.
        self.held_root_result =
            Some(self.task_chunk("message_result", CONTENT_PROCESS_BLOCK, "", &taskid, index));
    }

    fn ensure_think_open(&mut self, out: &mut Vec<ChatCompletionChunk>) {
        if self.open_think.is_some() {
            return;
        }
        let taskid = self.alloc_taskid();
        let index = self.alloc_index();
        let label = json!({"label": "thinking"}).to_string();
        out.push(self.task_chunk("message_start", CONTENT_THINK_BLOCK, &label, &taskid, index));
        self.open_think = Some((taskid, index));
    }

    fn close_think(&mut self, out: &mut Vec<ChatCompletionChunk>) {
        if let Some((taskid, index)) = self.open_think.take() {
            out.push(self.task_chunk("message_result", CONTENT_THINK_BLOCK, "", &taskid, index));
        }
    }

    /// Emit a complete start/process/result block with one payload.
    fn emit_simple_block(
        &mut self,
        out: &mut Vec<ChatCompletionChunk>,
        content_type: &str,
        start_content: &str,
        process_content: &str,
    ) {
        let taskid = self.alloc_taskid();
        let index = self.alloc_index();
        out.push(self.task_chunk("message_start", content_type, start_content, &taskid, index));
        out.push(self.task_chunk("message_process", content_type, process_content, &taskid, index));
        out.push(self.task_chunk("message_result", content_type, "", &taskid, index));
    }

    fn emit_search_results(
        &mut self,
        out: &mut Vec<ChatCompletionChunk>,
        pending: &PendingTool,
        payload: &str,
    ) {
        let keyword = search_keyword(&pending.args);

        let organic = serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|v| v.get("organic").cloned())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();

        let mut lines: Vec<String> = Vec::new();
        for item in organic.iter().take(MAX_SEARCH_RESULTS * 2) {
            let link = item.get("link").and_then(|v| v.as_str()).unwrap_or("");
            if link.is_empty() || !self.seen_urls.insert(link.to_string()) {
                continue;
            }

            self.global_result_index += 1;
            let result_index = self.global_result_index;

            let mut title = item
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("No title")
                .to_string();
            if title == link || title.starts_with("http://") || title.starts_with("https://") {
                title = "No title".to_string();
            }
            let snippet = item
                .get("snippet")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();

            self.result_cache.insert(
                link.to_string(),
                CachedResult {
                    index: result_index,
                    title: title.clone(),
                    snippet,
                },
            );

            lines.push(
                json!({"index": result_index, "title": title, "link": link}).to_string(),
            );
            if lines.len() >= MAX_SEARCH_RESULTS {
                break;
            }
        }

        let taskid = self.alloc_taskid();
        let index = self.alloc_index();
        let start = json!({
            "label": format!("found {} results", lines.len()),
            "count": lines.len(),
            "keyword": keyword,
        })
        .to_string();
        out.push(self.task_chunk("message_start", CONTENT_WEB_SEARCH, &start, &taskid, index));

        for batch in lines.chunks(SEARCH_BATCH_SIZE) {
            let content = format!("{}\n", batch.join("\n"));
            out.push(self.task_chunk("message_process", CONTENT_WEB_SEARCH, &content, &taskid, index));
        }

        out.push(self.task_chunk("message_result", CONTENT_WEB_SEARCH, "", &taskid, index));
    }

    fn emit_browse_block(
        &mut self,
        out: &mut Vec<ChatCompletionChunk>,
        pending: &PendingTool,
        payload: &str,
    ) {
        let url = pending
            .args
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let taskid = self.alloc_taskid();
        let index = self.alloc_index();
        let start = json!({"label": "browsing the web"}).to_string();
        out.push(self.task_chunk("message_start", CONTENT_WEB_BROWSE, &start, &taskid, index));

        let cached = self.result_cache.get(&url).cloned();
        let parsed = serde_json::from_str::<Value>(payload).ok();

        let title = cached
            .as_ref()
            .map(|c| c.title.clone())
            .filter(|t| !t.is_empty())
            .or_else(|| {
                parsed
                    .as_ref()
                    .and_then(|v| v.get("title"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| host_of(&url));
        let snippet = cached
            .as_ref()
            .map(|c| c.snippet.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| truncate_chars(payload, 200));
        let sitename = parsed
            .as_ref()
            .and_then(|v| v.get("sitename").or_else(|| v.get("site_name")))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let result_index = cached.map(|c| c.index).unwrap_or(index);

        let info = json!({
            "index": result_index,
            "title": title,
            "link": url,
            "snippet": snippet,
            "sitename": sitename,
        })
        .to_string();
        out.push(self.task_chunk("message_process", CONTENT_WEB_BROWSE, &info, &taskid, index));
        out.push(self.task_chunk("message_result", CONTENT_WEB_BROWSE, "", &taskid, index));
    }

    fn task_chunk(
        &self,
        taskstat: &str,
        content_type: &str,
        task_content: &str,
        taskid: &str,
        index: u64,
    ) -> ChatCompletionChunk {
        let parent = if taskid == self.root_taskid {
            String::new()
        } else {
            self.root_taskid.clone()
        };
        ChatCompletionChunk::new(
            &self.request_id,
            &self.model,
            Delta {
                role: Some("task".to_string()),
                content: Some(String::new()),
                taskstat: Some(taskstat.to_string()),
                content_type: Some(content_type.to_string()),
                parent_taskid: Some(parent),
                index: Some(index),
                task_content: Some(task_content.to_string()),
                taskid: Some(taskid.to_string()),
            },
            None,
        )
    }

    fn alloc_taskid(&mut self) -> String {
        let id = self.next_taskid;
        self.next_taskid += 1;
        id.to_string()
    }

    fn alloc_index(&mut self) -> u64 {
        let index = self.current_index;
        self.current_index += 1;
        index
    }
}

/// Degenerate V1 adapter: assistant content only.
pub struct AdapterV1 {
    request_id: String,
    model: String,
}

impl AdapterV1 {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
        }
    }

    pub fn initial_chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::new(
            &self.request_id,
            &self.model,
            Delta {
                role: Some("assistant".to_string()),
                ..Delta::default()
            },
            None,
        )
    }

    pub fn on_event(&mut self, event: &AgentEvent) -> Vec<ChatCompletionChunk> {
        match event {
            AgentEvent::FinalAnswer { text } => vec![ChatCompletionChunk::new(
                &self.request_id,
                &self.model,
                Delta {
                    content: Some(parser::strip_think_tags(text)),
                    ..Delta::default()
                },
                None,
            )],
            _ => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        vec![ChatCompletionChunk::new(
            &self.request_id,
            &self.model,
            Delta::default(),
            Some("stop".to_string()),
        )]
    }
}

fn search_keyword(args: &Value) -> String {
    args.get("q")
        .or_else(|| args.get("query"))
        .or_else(|| args.get("keyword"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn host_of(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("No title")
        .to_string()
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}...")
}
