//! Scout core — research-agent orchestration engine.
//!
//! The engine drives a ReAct loop between a chat-completions LLM and a set of
//! remote MCP tool servers, emitting [`agent::AgentEvent`]s over a one-way
//! channel. Presentation layers (the HTTP server) consume those events and
//! map them to their own wire format; the core never calls back into them.
//!
//! ```text
//!  ┌──────────────┐        AgentEvent        ┌──────────────┐
//!  │ Orchestrator │ ─────────────────────►   │   Consumer   │
//!  │   (core)     │                          │ (SSE server) │
//!  └──────────────┘                          └──────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod constants;
pub mod context;
pub mod dedup;
pub mod llm;
pub mod mcp;
pub mod parser;
pub mod pool;
pub mod prompts;

pub use agent::events::{AgentEvent, AgentOutcome, RollbackReason};
pub use agent::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorServices};
pub use config::Settings;
