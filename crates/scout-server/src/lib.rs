//! Scout server
//!
//! OpenAI-compatible streaming API over the research-agent engine. The
//! server is a thin presentation layer: it owns the pipeline pool and the
//! two SSE adapters, while all task semantics live in `scout-core`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::Method, routing::get, Json, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use scout_core::config::ToolServerSettings;
use scout_core::constants::{server as server_limits, tools as tool_limits};
use scout_core::context::HistoryCondenser;
use scout_core::llm::{LlmClient, OpenAiBackend};
use scout_core::mcp::{HttpMcpClient, ToolDef, ToolManager};
use scout_core::pool::{PipelineInstance, PipelineManager, PipelinePool};
use scout_core::Settings;

pub mod adapter;
pub mod error;
pub mod routes;
pub mod types;

use types::HealthResponse;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<PipelineManager>,
    pub llm: Arc<LlmClient>,
    pub summarizer: Arc<LlmClient>,
    pub condenser: Arc<HistoryCondenser>,
}

/// Build the full application state: LLM clients, pipeline pool with loaded
/// tool catalogs, and the history condenser.
pub async fn build_state(settings: Settings) -> anyhow::Result<AppState> {
    let llm = Arc::new(LlmClient::new(
        Arc::new(OpenAiBackend::new(
            &settings.llm.base_url,
            &settings.llm.api_key,
            &settings.llm.model_name,
        )),
        settings.llm.max_context_length,
        settings.llm.max_tokens,
        settings.llm.temperature,
    ));

    let summarizer = Arc::new(LlmClient::new(
        Arc::new(OpenAiBackend::new(
            &settings.summary_llm.base_url,
            &settings.summary_llm.api_key,
            &settings.summary_llm.model_name,
        )),
        settings.llm.max_context_length,
        1024,
        Some(0.0),
    ));

    let truncate_limit = settings
        .demo_mode
        .then_some(tool_limits::DEMO_TRUNCATE_CHARS);
    let has_sub_agent = !settings.sub_agent_tool_servers.is_empty();

    let mut instances = Vec::with_capacity(settings.pool.pool_size);
    for id in 0..settings.pool.pool_size {
        let mut tools = build_tool_manager(&settings.tool_servers, truncate_limit).await;
        if has_sub_agent {
            tools.add_virtual_tools("agent", vec![sub_agent_tool_def()]);
        }

        let sub_agent_tools = if has_sub_agent {
            Some(Arc::new(
                build_tool_manager(&settings.sub_agent_tool_servers, truncate_limit).await,
            ))
        } else {
            None
        };

        instances.push(PipelineInstance {
            id,
            tools: Arc::new(tools),
            sub_agent_tools,
        });
        tracing::info!(instance = id, "pipeline instance initialized");
    }

    let manager = Arc::new(PipelineManager::new(
        PipelinePool::new(instances),
        settings.pool.max_concurrent_requests,
    ));

    let condenser = Arc::new(HistoryCondenser::new(
        summarizer.clone(),
        settings.summary_llm.max_history_tokens,
        settings.summary_llm.compression_enabled,
    ));

    Ok(AppState {
        settings: Arc::new(settings),
        manager,
        llm,
        summarizer,
        condenser,
    })
}

async fn build_tool_manager(
    servers: &[ToolServerSettings],
    truncate_limit: Option<usize>,
) -> ToolManager {
    let mut manager = ToolManager::new(truncate_limit);
    for server in servers.iter().filter(|s| s.enabled) {
        manager.register(
            server.name.clone(),
            Arc::new(HttpMcpClient::new(&server.name, &server.endpoint)),
        );
    }
    manager.load_catalog().await;
    manager
}

/// Definition of the delegation pseudo-tool surfaced to the main agent.
fn sub_agent_tool_def() -> ToolDef {
    ToolDef {
        name: scout_core::constants::agent::SUB_AGENT_TOOL.to_string(),
        description: Some(
            "Delegate a focused search-and-browse subtask to a browsing agent. \
             Returns a structured report of the facts it found."
                .to_string(),
        ),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "subtask": {
                    "type": "string",
                    "description": "A self-contained description of what to find out"
                }
            },
            "required": ["subtask"]
        }),
    }
}

/// Build the Axum router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(routes::chat::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until shutdown.
pub async fn start_server(settings: Settings) -> anyhow::Result<()> {
    let port = settings.port;
    let state = build_state(settings).await?;
    let manager = state.manager.clone();
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!("scout-server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            manager
                .shutdown(Duration::from_secs(server_limits::SHUTDOWN_GRACE_SECS))
                .await;
        })
        .await?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        active_requests: state.manager.active_requests(),
        pool_size: state.manager.pool_size(),
    })
}
