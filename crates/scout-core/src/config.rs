//! Environment-driven configuration.
//!
//! Every recognized option has a default so a bare environment still yields a
//! runnable (if toolless) server. Malformed numeric values are hard errors;
//! the launcher maps them to exit code 1.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants;

/// LLM endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: usize,
    pub max_context_length: usize,
    pub temperature: Option<f32>,
}

/// Summarizer endpoint settings (context compression + history condensing).
#[derive(Debug, Clone)]
pub struct SummaryLlmSettings {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_history_tokens: usize,
    pub compression_enabled: bool,
}

/// Pool and concurrency settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub max_concurrent_requests: usize,
}

/// Per-task agent knobs.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_turns: usize,
    /// -1 keeps the full history; N >= 0 keeps the most recent N tool results.
    pub keep_tool_result: i64,
    /// Compact the conversation every K turns; 0 disables compaction.
    pub context_compress_limit: usize,
    pub max_attempts: usize,
    pub sub_agent_max_turns: usize,
    pub task_timeout: Duration,
}

/// One remote MCP tool server.
#[derive(Debug, Clone)]
pub struct ToolServerSettings {
    pub name: String,
    pub endpoint: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub summary_llm: SummaryLlmSettings,
    pub pool: PoolSettings,
    pub agent: AgentSettings,
    /// Main-agent tool servers, from `TOOL_<NAME>_ENDPOINT` variables.
    pub tool_servers: Vec<ToolServerSettings>,
    /// Sub-agent tool servers, from `SUB_AGENT_TOOL_<NAME>_ENDPOINT`.
    pub sub_agent_tool_servers: Vec<ToolServerSettings>,
    /// Truncate large tool results for demo deployments.
    pub demo_mode: bool,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let base_url =
            env_string("BASE_URL").unwrap_or_else(|| "http://localhost:11434/v1".to_string());
        let api_key = env_string("API_KEY").unwrap_or_default();
        let model_name = env_string("MODEL_NAME").unwrap_or_else(|| "scout-research".to_string());

        let llm = LlmSettings {
            base_url: base_url.clone(),
            api_key: api_key.clone(),
            model_name,
            max_tokens: env_parse("MAX_TOKENS", constants::llm::DEFAULT_MAX_TOKENS)?,
            max_context_length: env_parse(
                "MAX_CONTEXT_LENGTH",
                constants::llm::DEFAULT_MAX_CONTEXT_LENGTH,
            )?,
            temperature: env_opt_parse("TEMPERATURE")?,
        };

        let summary_llm = SummaryLlmSettings {
            base_url: env_string("SUMMARY_LLM_BASE_URL").unwrap_or(base_url),
            api_key: env_string("SUMMARY_LLM_API_KEY").unwrap_or(api_key),
            model_name: env_string("SUMMARY_LLM_MODEL_NAME")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_history_tokens: env_parse(
                "MAX_HISTORY_TOKENS",
                constants::server::DEFAULT_MAX_HISTORY_TOKENS,
            )?,
            compression_enabled: env_bool("CONTEXT_COMPRESSION_ENABLED", true),
        };

        let pool = PoolSettings {
            pool_size: env_parse("PIPELINE_POOL_SIZE", constants::server::DEFAULT_POOL_SIZE)?,
            max_concurrent_requests: env_parse(
                "MAX_CONCURRENT_REQUESTS",
                constants::server::DEFAULT_MAX_CONCURRENT_REQUESTS,
            )?,
        };

        let agent = AgentSettings {
            max_turns: env_parse("MAX_TURNS", constants::agent::DEFAULT_MAX_TURNS)?,
            keep_tool_result: env_parse("KEEP_TOOL_RESULT", -1i64)?,
            context_compress_limit: env_parse("CONTEXT_COMPRESS_LIMIT", 0usize)?,
            max_attempts: env_parse("MAX_ATTEMPTS", constants::agent::DEFAULT_MAX_ATTEMPTS)?,
            sub_agent_max_turns: env_parse(
                "SUB_AGENT_MAX_TURNS",
                constants::agent::DEFAULT_SUB_AGENT_MAX_TURNS,
            )?,
            task_timeout: Duration::from_secs(env_parse(
                "TASK_TIMEOUT_SECS",
                constants::agent::DEFAULT_TASK_TIMEOUT_SECS,
            )?),
        };

        Ok(Self {
            llm,
            summary_llm,
            pool,
            agent,
            tool_servers: tool_servers_from_env("TOOL_"),
            sub_agent_tool_servers: tool_servers_from_env("SUB_AGENT_TOOL_"),
            demo_mode: env_bool("DEMO_MODE", false),
            port: env_parse("PORT", constants::server::DEFAULT_PORT)?,
        })
    }
}

/// Collect `<PREFIX><NAME>_ENDPOINT` / `<PREFIX><NAME>_ENABLED` pairs.
fn tool_servers_from_env(prefix: &str) -> Vec<ToolServerSettings> {
    let mut servers: BTreeMap<String, ToolServerSettings> = BTreeMap::new();

    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some(name) = rest.strip_suffix("_ENDPOINT") else {
            continue;
        };
        if name.is_empty() || value.trim().is_empty() {
            continue;
        }
        let name = name.to_ascii_lowercase();
        let enabled = env_bool(&format!("{prefix}{}_ENABLED", name.to_ascii_uppercase()), true);
        servers.insert(
            name.clone(),
            ToolServerSettings {
                name,
                endpoint: value,
                enabled,
            },
        );
    }

    servers.into_values().collect()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn env_opt_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(None),
    }
}
