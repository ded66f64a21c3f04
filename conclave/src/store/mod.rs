//! SQLite persistence for all control-plane entities.
//!
//! One database file, one table per entity. Connections are opened per
//! operation and work runs on the blocking pool, so the store is safe to
//! share as `Arc<SqliteStore>` across the engine, workflow executor,
//! scheduler, and memory reflector.
//!
//! Entities that the engine only reads whole (providers, agents, teams,
//! workflows, MCP servers) are stored as JSON blobs keyed by id; rows the
//! engine filters or aggregates on (sessions, messages, spans, memories,
//! approvals, schedules) get real columns.
//!
//! [`SqliteStore::recover_pending`] implements the startup rule: every
//! pending HITL approval is denied and every pending tool proposal rejected
//! before new work is accepted.

mod approvals;
mod entities;
mod memories;
mod messages;
mod sessions;
mod spans;
mod workflows;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

/// SQLite-backed store. Cheap to clone paths from; open per operation.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) the database and ensures the schema.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { db_path })
    }

    /// Runs `f` with a fresh connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = rusqlite::Connection::open(&db_path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    /// Startup recovery: auto-deny pending HITL approvals and auto-reject
    /// pending tool proposals left by a prior process run. Returns
    /// `(approvals_denied, proposals_rejected)`.
    pub async fn recover_pending(&self) -> Result<(usize, usize), StoreError> {
        let counts = self
            .with_conn(|conn| {
                let denied = conn.execute(
                    "UPDATE hitl_approvals SET status = 'denied' WHERE status = 'pending'",
                    [],
                )?;
                let rejected = conn.execute(
                    "UPDATE tool_proposals SET status = 'rejected' WHERE status = 'pending'",
                    [],
                )?;
                Ok((denied, rejected))
            })
            .await?;
        if counts.0 > 0 || counts.1 > 0 {
            info!(
                approvals_denied = counts.0,
                proposals_rejected = counts.1,
                "recovered stale pending approvals"
            );
        }
        Ok(counts)
    }
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn sql_to_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS providers (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mcp_servers (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    data TEXT NOT NULL,
    UNIQUE (owner_id, name)
);
CREATE TABLE IF NOT EXISTS knowledge_bases (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS kb_documents (
    id TEXT PRIMARY KEY,
    kb_id TEXT NOT NULL,
    indexed INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    total_input_tokens INTEGER NOT NULL DEFAULT 0,
    total_output_tokens INTEGER NOT NULL DEFAULT 0,
    memory_processed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    agent_id TEXT,
    reasoning TEXT,
    metadata TEXT,
    attachment_ids TEXT,
    rating INTEGER,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, created_at);
CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS agent_memories (
    agent_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    category TEXT NOT NULL,
    confidence REAL NOT NULL,
    source_session_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (agent_id, user_id, key)
);
CREATE TABLE IF NOT EXISTS hitl_approvals (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    tool_call_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    tool_arguments TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tool_proposals (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    tool_call_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    handler_kind TEXT NOT NULL,
    parameters TEXT NOT NULL,
    handler_config TEXT,
    status TEXT NOT NULL,
    tool_id TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trace_spans (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    workflow_run_id TEXT,
    message_id TEXT,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    input_preview TEXT NOT NULL DEFAULT '',
    output_preview TEXT NOT NULL DEFAULT '',
    sequence INTEGER NOT NULL,
    round_number INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_spans_session ON trace_spans (session_id, sequence);
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    session_id TEXT,
    status TEXT NOT NULL,
    steps TEXT NOT NULL,
    input TEXT NOT NULL,
    final_output TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE TABLE IF NOT EXISTS workflow_schedules (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    cron_expression TEXT NOT NULL,
    input TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT
);
"#;
