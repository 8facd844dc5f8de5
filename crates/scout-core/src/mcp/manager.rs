//! Tool manager: catalog loading and dispatch for one pipeline instance.
//!
//! One manager owns the connections of one pipeline instance; it is never
//! shared across concurrently running tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::constants::tools as limits;

use super::client::{ToolTransport, TransportError};
use super::protocol::{ErrorKind, ToolDef};

/// Catalog of one server, as rendered into the system prompt.
#[derive(Debug, Clone)]
pub struct ServerCatalog {
    pub server_name: String,
    pub tools: Vec<ToolDef>,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
    pub error_kind: ErrorKind,
}

impl ToolResult {
    fn ok(tool_name: &str, content: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            content,
            is_error: false,
            error_kind: ErrorKind::None,
        }
    }

    fn err(tool_name: &str, kind: ErrorKind, content: String) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            content,
            is_error: true,
            error_kind: kind,
        }
    }
}

/// Tool manager over a set of remote MCP servers.
pub struct ToolManager {
    transports: HashMap<String, Arc<dyn ToolTransport>>,
    catalog: RwLock<Vec<ServerCatalog>>,
    /// Prompt-only entries (e.g. the sub-agent delegation tool) that no
    /// transport backs; the orchestrator intercepts them before dispatch.
    virtual_catalog: Vec<ServerCatalog>,
    call_timeout: Duration,
    /// Demo-mode cap on textual results; None keeps results whole.
    truncate_limit: Option<usize>,
}

impl ToolManager {
    pub fn new(truncate_limit: Option<usize>) -> Self {
        Self {
            transports: HashMap::new(),
            catalog: RwLock::new(Vec::new()),
            virtual_catalog: Vec::new(),
            call_timeout: Duration::from_secs(limits::CALL_TIMEOUT_SECS),
            truncate_limit,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn register(&mut self, server_name: impl Into<String>, transport: Arc<dyn ToolTransport>) {
        self.transports.insert(server_name.into(), transport);
    }

    /// Advertise tools in the catalog without a backing transport.
    pub fn add_virtual_tools(&mut self, server_name: impl Into<String>, tools: Vec<ToolDef>) {
        self.virtual_catalog.push(ServerCatalog {
            server_name: server_name.into(),
            tools,
        });
    }

    /// Load the tool catalog from every registered server, in parallel.
    ///
    /// A server that fails to answer contributes an empty tool list; the
    /// task can still run with the remaining servers.
    pub async fn load_catalog(&self) {
        let listings: Vec<_> = self
            .transports
            .iter()
            .map(|(name, transport)| {
                let name = name.clone();
                let transport = Arc::clone(transport);
                async move { (name, transport.list_tools().await) }
            })
            .collect();

        let mut catalog = Vec::with_capacity(listings.len());
        for (name, result) in futures::future::join_all(listings).await {
            match result {
                Ok(tools) => {
                    info!(server = %name, count = tools.len(), "loaded tool definitions");
                    catalog.push(ServerCatalog {
                        server_name: name,
                        tools,
                    });
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "unable to list tools, continuing without");
                    catalog.push(ServerCatalog {
                        server_name: name,
                        tools: Vec::new(),
                    });
                }
            }
        }

        catalog.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        *self.catalog.write().await = catalog;
    }

    pub async fn catalog(&self) -> Vec<ServerCatalog> {
        let mut catalog = self.catalog.read().await.clone();
        catalog.extend(self.virtual_catalog.iter().cloned());
        catalog
    }

    async fn knows_tool(&self, server: &str, tool: &str) -> bool {
        self.catalog
            .read()
            .await
            .iter()
            .any(|c| c.server_name == server && c.tools.iter().any(|t| t.name == tool))
    }

    /// Invoke `tool` on `server`.
    ///
    /// Never retries: transient failures are classified and handed to the
    /// orchestrator, which owns the rollback policy.
    pub async fn execute(&self, server: &str, tool: &str, arguments: Value) -> ToolResult {
        let Some(transport) = self.transports.get(server) else {
            return ToolResult::err(
                tool,
                ErrorKind::Schema,
                format!("Server '{server}' not found."),
            );
        };

        if !self.knows_tool(server, tool).await {
            return ToolResult::err(
                tool,
                ErrorKind::Schema,
                format!("Unknown tool '{tool}' on server '{server}'."),
            );
        }

        let call = transport.call_tool(tool, arguments);
        let outcome = tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::new(
                    ErrorKind::Timeout,
                    format!(
                        "tool call timed out after {}s",
                        self.call_timeout.as_secs()
                    ),
                ))
            });

        match outcome {
            Ok(raw) => {
                let content = self.truncate(raw.render());
                if raw.is_error {
                    ToolResult::err(tool, ErrorKind::Server, content)
                } else {
                    ToolResult::ok(tool, content)
                }
            }
            Err(e) => {
                warn!(server = %server, tool = %tool, error = %e, "tool call failed");
                ToolResult::err(tool, e.kind, format!("Tool call failed: {}", e.message))
            }
        }
    }

    fn truncate(&self, content: String) -> String {
        match self.truncate_limit {
            Some(limit) if content.len() > limit => {
                let mut cut = limit;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                format!("{}\n[... output truncated ...]", &content[..cut])
            }
            _ => content,
        }
    }
}
