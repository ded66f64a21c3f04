//! JSON-RPC wire shapes shared by the stdio and Streamable HTTP sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::{McpError, McpToolInfo};

/// Protocol revision sent on initialize.
pub const PROTOCOL_VERSION: &str = "2025-11-25";

#[derive(Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Serialize)]
pub struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

/// Any inbound message: a response (id + result/error), a server-initiated
/// request (id + method), or a notification (method only).
#[derive(Debug, Deserialize)]
pub struct Inbound {
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

impl Inbound {
    pub fn is_response_to(&self, id: u64) -> bool {
        (self.result.is_some() || self.error.is_some())
            && self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }

    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::JsonRpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Maps a `tools/list` result to the unprefixed tool list.
pub fn parse_tools_list(result: &Value) -> Result<Vec<McpToolInfo>, McpError> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| McpError::Transport("no tools array in tools/list result".into()))?;
    Ok(tools
        .iter()
        .map(|t| McpToolInfo {
            name: t
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            description: t
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            parameters: t
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
        .collect())
}

/// Extracts concatenated text parts from a `tools/call` result. An `isError`
/// result converts to a JsonRpc error carrying the first text part.
pub fn parse_tool_call_result(result: &Value) -> Result<String, McpError> {
    let first_text = || {
        result
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or("tool returned error")
            .to_string()
    };
    if result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Err(McpError::JsonRpc {
            code: -1,
            message: first_text(),
        });
    }
    let parts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    Ok(parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: responses match on id only when result or error present.
    #[test]
    fn response_matching() {
        let inbound: Inbound =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "result": {}})).unwrap();
        assert!(inbound.is_response_to(3));
        assert!(!inbound.is_response_to(4));

        let request: Inbound =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 9, "method": "roots/list"}))
                .unwrap();
        assert!(!request.is_response_to(9));
    }

    /// **Scenario**: tools/list maps name, description, and inputSchema.
    #[test]
    fn tools_list_mapping() {
        let result = json!({"tools": [
            {"name": "read", "description": "Read a file", "inputSchema": {"type": "object"}},
            {"name": "bare"},
        ]});
        let tools = parse_tools_list(&result).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read");
        assert_eq!(tools[1].parameters["type"], "object");
    }

    /// **Scenario**: call results concatenate text parts; isError converts to
    /// an error.
    #[test]
    fn call_result_mapping() {
        let ok = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(parse_tool_call_result(&ok).unwrap(), "a\nb");

        let err = json!({"isError": true, "content": [{"type": "text", "text": "nope"}]});
        let e = parse_tool_call_result(&err).unwrap_err();
        assert!(e.to_string().contains("nope"));
    }
}
