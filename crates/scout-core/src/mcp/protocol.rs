//! MCP protocol types (JSON-RPC 2.0).
//!
//! Defines the wire format for remote tool invocation: `tools/list` and
//! `tools/call` requests plus their results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct McpRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response.
#[derive(Debug, Deserialize)]
pub struct McpResponse {
    pub id: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<McpError>,
}

/// JSON-RPC error object.
#[derive(Debug, Deserialize)]
pub struct McpError {
    pub code: i64,
    pub message: String,
}

/// Tool definition from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Tools list response.
#[derive(Debug, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<ToolDef>,
}

/// Tool call params.
#[derive(Debug, Serialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Content blocks returned by MCP tools. Binary content is unsupported in
/// the core; images render as a placeholder.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(default)]
        text: Option<String>,
    },
}

impl std::fmt::Display for McpContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpContent::Text { text } => write!(f, "{}", text),
            McpContent::Image { mime_type } => write!(f, "[unsupported image content: {}]", mime_type),
            McpContent::Resource { uri, text } => match text {
                Some(t) => write!(f, "{}\n{}", uri, t),
                None => write!(f, "{}", uri),
            },
        }
    }
}

/// Raw tool call result as returned by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawToolResult {
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl RawToolResult {
    /// Flatten content blocks to one display string.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, content) in self.content.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            out.push_str(&content.to_string());
        }
        out
    }
}

/// Failure categories attached to tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    None,
    Transport,
    RateLimited,
    Schema,
    Server,
    Timeout,
}

impl Default for ErrorKind {
    fn default() -> Self {
        ErrorKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_result_renders_text_blocks_in_order() {
        let raw: RawToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"},
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(raw.render(), "first\nsecond");
        assert!(!raw.is_error);
    }

    #[test]
    fn image_content_renders_placeholder() {
        let raw: RawToolResult = serde_json::from_value(json!({
            "content": [{"type": "image", "mimeType": "image/png", "data": "zzz"}],
        }))
        .unwrap();
        assert_eq!(raw.render(), "[unsupported image content: image/png]");
    }

    #[test]
    fn tool_def_reads_input_schema_field() {
        let def: ToolDef = serde_json::from_value(json!({
            "name": "google_search",
            "description": "Search the web",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(def.name, "google_search");
        assert!(def.input_schema.get("properties").is_some());
    }
}
