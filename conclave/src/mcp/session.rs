//! MCP session over stdio: spawn the server process, newline-delimited
//! JSON-RPC over its stdin/stdout, initialize handshake on connect.
//!
//! A reader task pumps stdout lines into a channel; requests are matched by
//! id. Server-initiated `roots/list` requests are answered with empty roots
//! (tools-only client). The child is killed when the session drops.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::mcp::wire::{
    parse_tool_call_result, parse_tools_list, Inbound, Notification, Request, PROTOCOL_VERSION,
};
use crate::mcp::{McpError, McpToolInfo};

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

/// One stdio MCP session.
#[derive(Debug)]
pub struct McpSession {
    _child: Child,
    stdin: ChildStdin,
    incoming: mpsc::Receiver<Inbound>,
    next_id: u64,
}

impl McpSession {
    /// Spawns the server and completes the initialize handshake.
    pub async fn connect(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::Transport(format!("spawn {}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;

        let (tx, incoming) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inbound>(&line) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring unparseable MCP line"),
                }
            }
        });

        let mut session = Self {
            _child: child,
            stdin,
            incoming,
            next_id: 0,
        };
        session.initialize().await?;
        Ok(session)
    }

    async fn initialize(&mut self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "clientInfo": {
                "name": "conclave-mcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", params, INITIALIZE_TIMEOUT).await;
        match result {
            Ok(_) => {
                self.send(&Notification::new("notifications/initialized", json!({})))
                    .await?;
                Ok(())
            }
            Err(McpError::Timeout(_)) => {
                Err(McpError::Initialize("timeout waiting for initialize".into()))
            }
            Err(e) => Err(McpError::Initialize(e.to_string())),
        }
    }

    async fn send<T: serde::Serialize>(&mut self, message: &T) -> Result<(), McpError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| McpError::Transport(e.to_string()))?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    /// Sends one request and waits for its response, answering server
    /// `roots/list` requests along the way.
    pub async fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&Request::new(id, method, params)).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(McpError::Timeout(method.to_string()));
            }
            let msg = match tokio::time::timeout(remaining, self.incoming.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(McpError::Transport("server closed stdout".into())),
                Err(_) => return Err(McpError::Timeout(method.to_string())),
            };
            if msg.is_response_to(id) {
                return msg.into_result();
            }
            if msg.method.as_deref() == Some("roots/list") {
                if let Some(req_id) = msg.id.clone() {
                    let reply = json!({"jsonrpc": "2.0", "id": req_id, "result": {"roots": []}});
                    self.send(&reply).await?;
                }
                continue;
            }
            if let Some(method) = &msg.method {
                debug!(method = %method, "ignoring server message");
            } else {
                warn!("ignoring response with unexpected id");
            }
        }
    }

    /// `tools/list`, unprefixed.
    pub async fn list_tools(&mut self, timeout: Duration) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self.request("tools/list", json!({}), timeout).await?;
        parse_tools_list(&result)
    }

    /// `tools/call`, returning concatenated text content.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<String, McpError> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.request("tools/call", params, timeout).await?;
        parse_tool_call_result(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a nonexistent command fails to connect with a transport
    /// error, not a hang.
    #[tokio::test]
    async fn spawn_failure_is_transport_error() {
        let err = McpSession::connect("definitely-not-an-mcp-server", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)), "{:?}", err);
    }

    /// **Scenario**: a process that never speaks MCP times out during
    /// initialize instead of hanging forever.
    #[tokio::test]
    #[ignore = "waits out the 20s initialize deadline"]
    async fn silent_server_times_out() {
        let result = McpSession::connect("sleep", &["30".to_string()], &HashMap::new()).await;
        match result {
            Err(McpError::Initialize(msg)) => assert!(msg.contains("timeout") || !msg.is_empty()),
            Err(other) => panic!("expected initialize error, got {:?}", other),
            Ok(_) => panic!("expected initialize failure"),
        }
    }
}
