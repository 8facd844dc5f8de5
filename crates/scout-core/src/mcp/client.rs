//! Remote MCP client over HTTP JSON-RPC.
//!
//! Each logical request is one POST; ids increase monotonically so server
//! logs stay correlatable. Failures are classified into the tool error
//! taxonomy here, once, so the orchestrator only ever sees `ErrorKind`.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::protocol::{
    ErrorKind, McpRequest, McpResponse, RawToolResult, ToolCallParams, ToolDef, ToolsListResult,
};

/// Transport-level failure with its classification.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Seam between the tool manager and the wire. Production uses
/// [`HttpMcpClient`]; tests register scripted transports.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDef>, TransportError>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolResult, TransportError>;
}

/// MCP client for one remote server endpoint.
pub struct HttpMcpClient {
    name: String,
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicI64,
}

impl HttpMcpClient {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = McpRequest::new(id, method, params);

        debug!(server = %self.name, id, method, "MCP request");

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(
                classify_status(status.as_u16()),
                format!("{} returned {status}: {body}", self.name),
            ));
        }

        let parsed: McpResponse = response.json().await.map_err(|e| {
            TransportError::new(ErrorKind::Transport, format!("invalid JSON-RPC body: {e}"))
        })?;

        if let Some(error) = parsed.error {
            return Err(TransportError::new(
                ErrorKind::Server,
                format!("MCP error {}: {}", error.code, error.message),
            ));
        }

        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ToolTransport for HttpMcpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDef>, TransportError> {
        let result = self.request("tools/list", None).await?;
        let listed: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            TransportError::new(ErrorKind::Transport, format!("invalid tools/list result: {e}"))
        })?;
        debug!(server = %self.name, count = listed.tools.len(), "tools listed");
        Ok(listed.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<RawToolResult, TransportError> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        let result = self
            .request(
                "tools/call",
                Some(serde_json::to_value(params).map_err(|e| {
                    TransportError::new(ErrorKind::Schema, format!("unserializable arguments: {e}"))
                })?),
            )
            .await?;

        serde_json::from_value(result).map_err(|e| {
            TransportError::new(ErrorKind::Transport, format!("invalid tools/call result: {e}"))
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Transport
    };
    TransportError::new(kind, err.to_string())
}

fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Transport,
    }
}
