//! MCP tool layer: JSON-RPC wire types, the remote HTTP client, and the
//! per-pipeline tool manager.

mod client;
mod manager;
pub mod protocol;

pub use client::{HttpMcpClient, ToolTransport, TransportError};
pub use manager::{ServerCatalog, ToolManager, ToolResult};
pub use protocol::{ErrorKind, McpContent, RawToolResult, ToolDef};
