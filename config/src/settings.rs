//! Typed runtime settings for the control plane.
//!
//! All values come from the environment (after [`crate::load_and_apply`]) with
//! conservative defaults, so a bare process starts with a local SQLite file
//! and relative storage roots.

use std::path::PathBuf;
use std::time::Duration;

/// Paths and timeout knobs shared by the engine, tools, MCP connector,
/// RAG index, and scheduler.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    /// SQLite database file (`CONCLAVE_DB`).
    pub database_path: PathBuf,
    /// Root directory for uploaded attachments, keyed by session (`CONCLAVE_UPLOADS_DIR`).
    pub uploads_root: PathBuf,
    /// Root directory for RAG index files, keyed `session_<id>` / `kb_<id>` (`CONCLAVE_INDEXES_DIR`).
    pub indexes_root: PathBuf,
    /// Interpreter used by python tool handlers (`CONCLAVE_PYTHON`).
    pub python_bin: String,
    /// Per-call timeout for streaming LLM requests (`CONCLAVE_STREAM_TIMEOUT_SECS`).
    pub stream_timeout: Duration,
    /// Timeout for provider health checks (`CONCLAVE_HEALTH_TIMEOUT_SECS`).
    pub health_timeout: Duration,
    /// Timeout for one MCP tool call (`CONCLAVE_MCP_TIMEOUT_SECS`).
    pub mcp_call_timeout: Duration,
    /// Timeout for one HTTP tool handler call (`CONCLAVE_HTTP_TOOL_TIMEOUT_SECS`).
    pub http_tool_timeout: Duration,
    /// How long a generator waits at the approval gate (`CONCLAVE_APPROVAL_TIMEOUT_SECS`).
    pub approval_timeout: Duration,
    /// Maximum tool rounds per turn (`CONCLAVE_MAX_TOOL_ROUNDS`).
    pub max_tool_rounds: u32,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RuntimeSettings {
    /// Reads settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_path: PathBuf::from(env_string("CONCLAVE_DB", "conclave.db")),
            uploads_root: PathBuf::from(env_string("CONCLAVE_UPLOADS_DIR", "uploads")),
            indexes_root: PathBuf::from(env_string("CONCLAVE_INDEXES_DIR", "indexes")),
            python_bin: env_string("CONCLAVE_PYTHON", "python3"),
            stream_timeout: Duration::from_secs(env_u64("CONCLAVE_STREAM_TIMEOUT_SECS", 120)),
            health_timeout: Duration::from_secs(env_u64("CONCLAVE_HEALTH_TIMEOUT_SECS", 15)),
            mcp_call_timeout: Duration::from_secs(env_u64("CONCLAVE_MCP_TIMEOUT_SECS", 30)),
            http_tool_timeout: Duration::from_secs(env_u64("CONCLAVE_HTTP_TOOL_TIMEOUT_SECS", 30)),
            approval_timeout: Duration::from_secs(env_u64("CONCLAVE_APPROVAL_TIMEOUT_SECS", 600)),
            max_tool_rounds: env_u64("CONCLAVE_MAX_TOOL_ROUNDS", 10) as u32,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        std::env::remove_var("CONCLAVE_MAX_TOOL_ROUNDS");
        let s = RuntimeSettings::from_env();
        assert_eq!(s.max_tool_rounds, 10);
        assert_eq!(s.approval_timeout, Duration::from_secs(600));
        assert_eq!(s.stream_timeout, Duration::from_secs(120));
        assert_eq!(s.health_timeout, Duration::from_secs(15));
        assert_eq!(s.python_bin, "python3");
    }

    #[test]
    fn env_overrides_numeric_knob() {
        std::env::set_var("CONCLAVE_MCP_TIMEOUT_SECS", "5");
        let s = RuntimeSettings::from_env();
        assert_eq!(s.mcp_call_timeout, Duration::from_secs(5));
        std::env::remove_var("CONCLAVE_MCP_TIMEOUT_SECS");
    }

    #[test]
    fn garbage_numeric_value_falls_back() {
        std::env::set_var("CONCLAVE_HTTP_TOOL_TIMEOUT_SECS", "not-a-number");
        let s = RuntimeSettings::from_env();
        assert_eq!(s.http_tool_timeout, Duration::from_secs(30));
        std::env::remove_var("CONCLAVE_HTTP_TOOL_TIMEOUT_SECS");
    }
}
