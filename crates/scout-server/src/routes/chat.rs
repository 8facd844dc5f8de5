//! Chat completions endpoints with SSE streaming.
//!
//! `/v1/chat/completions` streams only the plain assistant content;
//! `/v2/chat/completions` streams the extended research transcript. Both
//! terminate with `data: [DONE]` on every path, including failed tasks.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use scout_core::agent::AgentEvent;
use scout_core::constants::{agent as agent_limits, server as server_limits};
use scout_core::llm::{ChatMessage, Role};
use scout_core::parser;
use scout_core::prompts::AgentRole;
use scout_core::{Orchestrator, OrchestratorConfig, OrchestratorServices};

use crate::adapter::{AdapterV1, AdapterV2};
use crate::error::AppError;
use crate::types::{ChatCompletionResponse, ChatRequest, RequestMessage};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", post(chat_v1))
        .route("/v2/chat/completions", post(chat_v2))
}

#[derive(Clone, Copy)]
enum ApiVersion {
    V1,
    V2,
}

async fn chat_v1(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    chat(state, request, ApiVersion::V1).await
}

async fn chat_v2(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    chat(state, request, ApiVersion::V2).await
}

async fn chat(
    state: AppState,
    request: ChatRequest,
    version: ApiVersion,
) -> Result<Response, AppError> {
    let history = to_core_messages(&request.messages);
    let task = state
        .condenser
        .condense(&history)
        .await
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("No user message found".to_string()))?;

    let request_id = format!("chatcmpl-{}", &Uuid::new_v4().simple().to_string()[..8]);
    tracing::info!(request_id = %request_id, stream = request.stream, "chat request");

    let acquired = state
        .manager
        .acquire()
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    let services = OrchestratorServices {
        llm: state.llm.clone(),
        summarizer: state.summarizer.clone(),
        tools: acquired.instance.tools.clone(),
        sub_agent_tools: acquired.instance.sub_agent_tools.clone(),
    };
    let agent = &state.settings.agent;
    let config = OrchestratorConfig {
        role: AgentRole::Main,
        max_turns: agent.max_turns,
        keep_tool_result: agent.keep_tool_result,
        context_compress_limit: agent.context_compress_limit,
        max_attempts: agent.max_attempts,
        sub_agent_tool: Some(agent_limits::SUB_AGENT_TOOL.to_string()),
        sub_agent_max_turns: agent.sub_agent_max_turns,
        deadline: Some(tokio::time::Instant::now() + agent.task_timeout),
    };

    let mut events = Orchestrator::new(services, config).run(task);

    if !request.stream {
        // Non-streaming: collect the final answer, then release the
        // pipeline.
        let mut answer = String::new();
        while let Some(event) = events.recv().await {
            if let AgentEvent::FinalAnswer { text } = event {
                answer = parser::strip_think_tags(&text);
            }
        }
        drop(acquired);
        return Ok(Json(ChatCompletionResponse::assistant(
            request_id,
            request.model,
            answer,
        ))
        .into_response());
    }

    let (sse_tx, sse_rx) =
        mpsc::channel::<Result<Event, Infallible>>(server_limits::SSE_CHANNEL_BUFFER);
    let model = request.model.clone();

    tokio::spawn(async move {
        // The pipeline instance stays claimed for the task's lifetime.
        let _acquired = acquired;
        match version {
            ApiVersion::V1 => {
                pump_v1(AdapterV1::new(request_id, model), events, sse_tx).await;
            }
            ApiVersion::V2 => {
                pump_v2(AdapterV2::new(request_id, model), events, sse_tx).await;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(sse_rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn pump_v2(
    mut adapter: AdapterV2,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    sse_tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    if !send_chunk(&sse_tx, &adapter.initial_chunk()).await {
        return;
    }
    while let Some(event) = events.recv().await {
        for chunk in adapter.on_event(&event) {
            if !send_chunk(&sse_tx, &chunk).await {
                // Client gone. Dropping `events` cancels the orchestrator
                // within one step.
                return;
            }
        }
    }
    for chunk in adapter.finish() {
        if !send_chunk(&sse_tx, &chunk).await {
            return;
        }
    }
    let _ = sse_tx.send(Ok(Event::default().data("[DONE]"))).await;
}

async fn pump_v1(
    mut adapter: AdapterV1,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    sse_tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    if !send_chunk(&sse_tx, &adapter.initial_chunk()).await {
        return;
    }
    while let Some(event) = events.recv().await {
        for chunk in adapter.on_event(&event) {
            if !send_chunk(&sse_tx, &chunk).await {
                return;
            }
        }
    }
    for chunk in adapter.finish() {
        if !send_chunk(&sse_tx, &chunk).await {
            return;
        }
    }
    let _ = sse_tx.send(Ok(Event::default().data("[DONE]"))).await;
}

async fn send_chunk(
    sse_tx: &mpsc::Sender<Result<Event, Infallible>>,
    chunk: &crate::types::ChatCompletionChunk,
) -> bool {
    match serde_json::to_string(chunk) {
        Ok(json) => sse_tx.send(Ok(Event::default().data(json))).await.is_ok(),
        Err(e) => {
            tracing::error!("failed to serialize chunk: {e}");
            true
        }
    }
}

fn to_core_messages(messages: &[RequestMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .filter_map(|m| {
            let role = match m.role.as_str() {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                // Replayed V2 task blocks carry no conversational content.
                _ => return None,
            };
            Some(ChatMessage {
                role,
                content: m.content.clone(),
            })
        })
        .collect()
}
