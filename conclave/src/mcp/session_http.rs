//! MCP session over Streamable HTTP: POST one JSON-RPC message per request,
//! parse either an `application/json` body or a `text/event-stream` body.
//!
//! The server may assign a session via the `MCP-Session-Id` response header;
//! it is echoed on subsequent requests. Used for `sse`-transport servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::mcp::wire::{
    parse_tool_call_result, parse_tools_list, Inbound, Notification, Request, PROTOCOL_VERSION,
};
use crate::mcp::{McpError, McpToolInfo};

const SESSION_HEADER: &str = "MCP-Session-Id";
const VERSION_HEADER: &str = "MCP-Protocol-Version";

/// One Streamable HTTP MCP session.
#[derive(Debug)]
pub struct McpHttpSession {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl McpHttpSession {
    /// Opens the session: POST `initialize`, then `notifications/initialized`.
    pub async fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, McpError> {
        let session = Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers: headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(0),
        };
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "clientInfo": {
                "name": "conclave-mcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        session
            .request("initialize", params, timeout)
            .await
            .map_err(|e| McpError::Initialize(e.to_string()))?;
        session
            .notify("notifications/initialized", json!({}), timeout)
            .await?;
        Ok(session)
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req
            .header("Accept", "application/json, text/event-stream")
            .header(VERSION_HEADER, PROTOCOL_VERSION);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Ok(guard) = self.session_id.lock() {
            if let Some(id) = guard.as_deref() {
                req = req.header(SESSION_HEADER, id);
            }
        }
        req
    }

    async fn post<T: serde::Serialize>(
        &self,
        body: &T,
        timeout: Duration,
    ) -> Result<reqwest::Response, McpError> {
        let response = self
            .apply_headers(self.client.post(&self.url))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(id.to_string());
            }
        }
        Ok(response)
    }

    async fn notify(&self, method: &str, params: Value, timeout: Duration) -> Result<(), McpError> {
        let _ = self.post(&Notification::new(method, params), timeout).await?;
        Ok(())
    }

    /// Sends one request and parses the first JSON-RPC response from the body
    /// (plain JSON, or SSE data lines).
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let response = self.post(&Request::new(id, method, params), timeout).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!("HTTP {}: {}", status, body)));
        }
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.contains("text/event-stream"))
            .unwrap_or(false);
        let body = response
            .text()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let inbound = if is_sse {
            parse_sse_response(&body)?
        } else {
            serde_json::from_str::<Inbound>(&body)
                .map_err(|e| McpError::Transport(format!("response json: {}", e)))?
        };
        inbound.into_result()
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolInfo>, McpError> {
        let result = self.request("tools/list", json!({}), timeout).await?;
        parse_tools_list(&result)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<String, McpError> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.request("tools/call", params, timeout).await?;
        parse_tool_call_result(&result)
    }
}

/// Finds the first JSON-RPC response (result or error present) among SSE
/// `data:` payloads, accumulating multi-line data blocks.
fn parse_sse_response(body: &str) -> Result<Inbound, McpError> {
    fn try_parse(buffer: &str) -> Option<Inbound> {
        if buffer.is_empty() {
            return None;
        }
        match serde_json::from_str::<Inbound>(buffer) {
            Ok(msg) if msg.result.is_some() || msg.error.is_some() => Some(msg),
            _ => None,
        }
    }

    let mut buffer = String::new();
    for line in body.lines() {
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            if data == "[DONE]" || data.is_empty() {
                if let Some(msg) = try_parse(&buffer) {
                    return Ok(msg);
                }
                buffer.clear();
                continue;
            }
            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(data);
            if let Some(msg) = try_parse(&buffer) {
                return Ok(msg);
            }
        } else if line.trim().is_empty() {
            if let Some(msg) = try_parse(&buffer) {
                return Ok(msg);
            }
            buffer.clear();
        }
    }
    if let Some(msg) = try_parse(&buffer) {
        return Ok(msg);
    }
    Err(McpError::Transport(
        "SSE stream: no JSON-RPC response (result/error) found".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a single-line SSE data payload parses.
    #[test]
    fn sse_single_line_response() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[]}}\n\n";
        let inbound = parse_sse_response(body).unwrap();
        assert!(inbound.result.is_some());
    }

    /// **Scenario**: multi-line data blocks accumulate before parsing.
    #[test]
    fn sse_multi_line_response() {
        let body = "data: {\"jsonrpc\":\"2.0\",\ndata: \"id\":1,\"result\":{}}\n\n";
        let inbound = parse_sse_response(body).unwrap();
        assert!(inbound.result.is_some());
    }

    /// **Scenario**: a stream with no response is a transport error.
    #[test]
    fn sse_without_response_is_error() {
        let err = parse_sse_response("data: {\"method\":\"ping\"}\n\n").unwrap_err();
        assert!(err.to_string().contains("no JSON-RPC response"));
    }

    /// **Scenario**: connecting to an unreachable URL fails with Initialize.
    #[tokio::test]
    async fn unreachable_url_fails_connect() {
        let err = McpHttpSession::connect(
            "http://127.0.0.1:1/mcp",
            &HashMap::new(),
            Duration::from_millis(500),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, McpError::Initialize(_)));
    }
}
