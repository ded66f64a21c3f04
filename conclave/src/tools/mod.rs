//! Native tool execution and per-session dynamic toolsets.
//!
//! [`ToolExecutor::execute`] looks a tool up by exact name within one owner's
//! active tools and dispatches to the handler: `python` spawns the configured
//! interpreter with a harness that requires a `handler(params)` function;
//! `http` issues the configured request (GET sends arguments as query
//! params, other methods as a JSON body). Every failure converts to an
//! `{"error": "..."}` JSON string fed back to the model — tool errors never
//! abort the loop.
//!
//! MCP-prefixed names never reach this module; the engine routes them to the
//! MCP connector first.
//!
//! Python handlers execute with host-process privileges. Sandboxing is out of
//! scope; deployments needing isolation can point `python_bin` at a jailed
//! interpreter.

mod http;
mod python;
pub mod schema;

pub use schema::{create_tool_schema, tool_to_schema, CREATE_TOOL_NAME};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::entity::HandlerKind;
use crate::store::SqliteStore;

/// Executes python/http tool handlers.
pub struct ToolExecutor {
    store: Arc<SqliteStore>,
    python_bin: String,
    http_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(store: Arc<SqliteStore>, python_bin: impl Into<String>, http_timeout: Duration) -> Self {
        Self {
            store,
            python_bin: python_bin.into(),
            http_timeout,
        }
    }

    /// Runs the named tool with the model's argument JSON and returns the
    /// result string. Never errors; failures come back as `{"error": ...}`.
    pub async fn execute(&self, owner_id: &str, tool_name: &str, arguments_json: &str) -> String {
        let arguments: Value = if arguments_json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments_json).unwrap_or_else(|_| json!({}))
        };

        let tool = match self.store.get_tool_by_name(owner_id, tool_name).await {
            Ok(Some(tool)) => tool,
            Ok(None) => {
                return json!({"error": format!("Tool '{}' not found", tool_name)}).to_string()
            }
            Err(e) => {
                warn!(tool = tool_name, error = %e, "tool lookup failed");
                return json!({"error": e.to_string()}).to_string();
            }
        };

        match tool.handler_kind {
            HandlerKind::Python => {
                let code = tool
                    .handler_config
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if code.trim().is_empty() {
                    return json!({"error": "No code configured for this tool"}).to_string();
                }
                python::run_python_handler(&self.python_bin, code, &arguments, self.http_timeout)
                    .await
            }
            HandlerKind::Http => {
                http::run_http_handler(&tool.handler_config, &arguments, self.http_timeout).await
            }
        }
    }
}

/// Per-session set of tool names approved via proposals in this process.
///
/// The definitions themselves are durable (upserted by owner and name); this
/// map only tracks which names skip the proposal gate for the rest of a
/// session. Process-global, keyed by session id.
#[derive(Default)]
pub struct DynamicToolsets {
    by_session: DashMap<String, HashSet<String>>,
}

impl DynamicToolsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session_id: &str, tool_name: &str) {
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(tool_name.to_string());
    }

    pub fn names(&self, session_id: &str) -> Vec<String> {
        self.by_session
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, session_id: &str, tool_name: &str) -> bool {
        self.by_session
            .get(session_id)
            .map(|set| set.contains(tool_name))
            .unwrap_or(false)
    }

    pub fn clear_session(&self, session_id: &str) {
        self.by_session.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{new_id, ToolDefinition};

    async fn store_with_tool(tool: ToolDefinition) -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("t.db")).unwrap());
        store.put_tool(&tool).await.unwrap();
        (dir, store)
    }

    fn python_tool(owner: &str, name: &str, code: &str) -> ToolDefinition {
        ToolDefinition {
            id: new_id(),
            owner_id: owner.into(),
            name: name.into(),
            description: None,
            parameters: json!({"type": "object"}),
            handler_kind: HandlerKind::Python,
            handler_config: json!({"code": code}),
            requires_confirmation: false,
            is_active: true,
        }
    }

    /// **Scenario**: an unknown tool yields the not-found error JSON.
    #[tokio::test]
    async fn unknown_tool_error_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("t.db")).unwrap());
        let exec = ToolExecutor::new(store, "python3", Duration::from_secs(30));
        let result = exec.execute("u1", "missing", "{}").await;
        let v: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(v["error"], "Tool 'missing' not found");
    }

    /// **Scenario**: a python tool with no code configured reports that.
    #[tokio::test]
    async fn python_tool_without_code() {
        let (_dir, store) = store_with_tool(python_tool("u1", "empty", "  ")).await;
        let exec = ToolExecutor::new(store, "python3", Duration::from_secs(30));
        let result = exec.execute("u1", "empty", "{}").await;
        assert!(result.contains("No code configured"));
    }

    /// **Scenario**: dynamic toolsets are scoped per session.
    #[test]
    fn dynamic_sets_are_per_session() {
        let dyn_tools = DynamicToolsets::new();
        dyn_tools.add("s1", "reverse_string");
        assert!(dyn_tools.contains("s1", "reverse_string"));
        assert!(!dyn_tools.contains("s2", "reverse_string"));
        assert_eq!(dyn_tools.names("s1"), vec!["reverse_string".to_string()]);
        dyn_tools.clear_session("s1");
        assert!(dyn_tools.names("s1").is_empty());
    }

    /// **Scenario**: the reverse_string handler runs end to end (requires a
    /// python3 on PATH).
    #[tokio::test]
    #[ignore = "requires python3 on PATH; run with: cargo test -p conclave reverse_string -- --ignored"]
    async fn reverse_string_executes() {
        let code = "def handler(params):\n    return params.get('text', '')[::-1]";
        let (_dir, store) = store_with_tool(python_tool("u1", "reverse_string", code)).await;
        let exec = ToolExecutor::new(store, "python3", Duration::from_secs(30));
        let result = exec
            .execute("u1", "reverse_string", r#"{"text": "hello"}"#)
            .await;
        assert_eq!(result, "olleh");
    }
}
