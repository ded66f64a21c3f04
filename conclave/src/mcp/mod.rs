//! MCP connector: scoped sessions to external tool servers.
//!
//! Tools discovered from a server are exposed to the LLM as
//! `mcp__<server>__<tool>`; the prefix is authoritative for routing. A
//! [`McpToolbox`] is opened lazily per request, held for the whole tool
//! loop, and closed on drop (stdio children are killed with the session).
//! A server that fails to connect logs a warning and contributes no tools —
//! the request proceeds without it.

mod session;
mod session_http;
mod wire;

pub use session::McpSession;
pub use session_http::McpHttpSession;

use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::entity::{McpServer, McpTransport};
use crate::provider::ToolSchema;

/// Prefix of MCP tool names on the LLM side.
pub const MCP_PREFIX: &str = "mcp__";

/// Formats the wire name for a discovered tool.
pub fn format_mcp_name(server_name: &str, tool_name: &str) -> String {
    format!("{}{}__{}", MCP_PREFIX, server_name, tool_name)
}

/// Parses `mcp__<server>__<tool>` into `(server, tool)`. The tool part may
/// itself contain `__`.
pub fn parse_mcp_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_PREFIX)?;
    rest.split_once("__")
}

/// True when the name routes to an MCP server.
pub fn is_mcp_name(name: &str) -> bool {
    name.starts_with(MCP_PREFIX)
}

/// Errors from MCP transport and protocol handling.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("initialize: {0}")]
    Initialize(String),
    #[error("json-rpc error {code}: {message}")]
    JsonRpc { code: i64, message: String },
    #[error("timeout waiting for {0}")]
    Timeout(String),
}

enum SessionKind {
    Stdio(Mutex<McpSession>),
    Http(McpHttpSession),
}

/// One live server connection with its discovered (prefixed) tools.
pub struct McpConnection {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<ToolSchema>,
    kind: SessionKind,
}

impl McpConnection {
    async fn call(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<String, McpError> {
        match &self.kind {
            SessionKind::Stdio(session) => {
                let mut session = session.lock().await;
                session.call_tool(tool_name, arguments, timeout).await
            }
            SessionKind::Http(session) => session.call_tool(tool_name, arguments, timeout).await,
        }
    }
}

/// All MCP connections of one request.
#[derive(Default)]
pub struct McpToolbox {
    connections: Vec<McpConnection>,
    call_timeout: Duration,
}

impl McpToolbox {
    pub fn empty() -> Self {
        Self {
            connections: Vec::new(),
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Connects to every configured server, discovering tools. Failures are
    /// logged and skipped; the returned toolbox holds whatever connected.
    pub async fn connect(servers: &[McpServer], call_timeout: Duration) -> Self {
        let mut connections = Vec::new();
        for server in servers {
            match Self::connect_one(server, call_timeout).await {
                Ok(conn) => connections.push(conn),
                Err(e) => {
                    warn!(server = %server.name, error = %e, "failed to connect MCP server; its tools will be absent");
                }
            }
        }
        Self {
            connections,
            call_timeout,
        }
    }

    async fn connect_one(server: &McpServer, timeout: Duration) -> Result<McpConnection, McpError> {
        let (kind, raw_tools) = match &server.transport {
            McpTransport::Stdio { command, args, env } => {
                let mut session = McpSession::connect(command, args, env).await?;
                let tools = session.list_tools(timeout).await?;
                (SessionKind::Stdio(Mutex::new(session)), tools)
            }
            McpTransport::Sse { url, headers } => {
                let session = McpHttpSession::connect(url, headers, timeout).await?;
                let tools = session.list_tools(timeout).await?;
                (SessionKind::Http(session), tools)
            }
        };
        let tools = raw_tools
            .into_iter()
            .map(|t| ToolSchema {
                name: format_mcp_name(&server.name, &t.name),
                description: t.description,
                parameters: t.parameters,
            })
            .collect();
        Ok(McpConnection {
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            tools,
            kind,
        })
    }

    /// All prefixed tool schemas across live connections.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.connections
            .iter()
            .flat_map(|c| c.tools.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Routes a prefixed call to its server. Any failure (unknown server,
    /// bad name, transport error) comes back as `{"error": ...}` JSON so the
    /// loop proceeds.
    pub async fn call(&self, prefixed_name: &str, arguments: Value) -> String {
        let Some((server_name, tool_name)) = parse_mcp_name(prefixed_name) else {
            return json!({"error": format!("Invalid MCP tool name: {}", prefixed_name)})
                .to_string();
        };
        let Some(connection) = self
            .connections
            .iter()
            .find(|c| c.server_name == server_name)
        else {
            return json!({"error": format!("No MCP connection for server '{}'", server_name)})
                .to_string();
        };
        match connection.call(tool_name, arguments, self.call_timeout).await {
            Ok(text) => text,
            Err(e) => json!({"error": e.to_string()}).to_string(),
        }
    }
}

/// An unprefixed tool as discovered from a server.
#[derive(Clone, Debug)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}
