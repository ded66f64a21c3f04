//! Trace span rows and the message-id back-fill.

use rusqlite::{params, Row};

use crate::entity::{SpanKind, TraceSpan};
use crate::store::{sql_to_ts, ts_to_sql, SqliteStore, StoreError};

fn parse_kind(s: &str) -> SpanKind {
    match s {
        "tool_call" => SpanKind::ToolCall,
        "mcp_call" => SpanKind::McpCall,
        "workflow_step" => SpanKind::WorkflowStep,
        _ => SpanKind::LlmCall,
    }
}

fn row_to_span(row: &Row) -> rusqlite::Result<TraceSpan> {
    let kind: String = row.get("kind")?;
    let created: String = row.get("created_at")?;
    Ok(TraceSpan {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        workflow_run_id: row.get("workflow_run_id")?,
        message_id: row.get("message_id")?,
        kind: parse_kind(&kind),
        name: row.get("name")?,
        input_tokens: row.get::<_, i64>("input_tokens")? as u32,
        output_tokens: row.get::<_, i64>("output_tokens")? as u32,
        duration_ms: row.get::<_, i64>("duration_ms")? as u64,
        status: row.get("status")?,
        input_preview: row.get("input_preview")?,
        output_preview: row.get("output_preview")?,
        sequence: row.get::<_, i64>("sequence")? as u32,
        round_number: row.get::<_, i64>("round_number")? as u32,
        created_at: sql_to_ts(&created),
    })
}

impl SqliteStore {
    pub async fn insert_span(&self, span: &TraceSpan) -> Result<(), StoreError> {
        let s = span.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO trace_spans
                 (id, session_id, workflow_run_id, message_id, kind, name,
                  input_tokens, output_tokens, duration_ms, status,
                  input_preview, output_preview, sequence, round_number, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    s.id,
                    s.session_id,
                    s.workflow_run_id,
                    s.message_id,
                    s.kind.as_str(),
                    s.name,
                    s.input_tokens as i64,
                    s.output_tokens as i64,
                    s.duration_ms as i64,
                    s.status,
                    s.input_preview,
                    s.output_preview,
                    s.sequence as i64,
                    s.round_number as i64,
                    ts_to_sql(s.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Sets `message_id` on every span of this session that has none yet.
    /// Runs once per generator invocation, after the assistant message row is
    /// written.
    pub async fn backfill_span_message_id(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<usize, StoreError> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE trace_spans SET message_id = ?2
                 WHERE session_id = ?1 AND message_id IS NULL",
                params![session_id, message_id],
            )?;
            Ok(n)
        })
        .await
    }

    /// Spans of a session ordered by sequence.
    pub async fn list_session_spans(&self, session_id: &str) -> Result<Vec<TraceSpan>, StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM trace_spans WHERE session_id = ?1 ORDER BY sequence ASC",
            )?;
            let rows = stmt
                .query_map(params![id], row_to_span)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Spans of a workflow run ordered by sequence.
    pub async fn list_run_spans(&self, run_id: &str) -> Result<Vec<TraceSpan>, StoreError> {
        let id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM trace_spans WHERE workflow_run_id = ?1 ORDER BY sequence ASC",
            )?;
            let rows = stmt
                .query_map(params![id], row_to_span)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn span(session: &str, sequence: u32, kind: SpanKind) -> TraceSpan {
        TraceSpan {
            id: crate::entity::new_id(),
            session_id: Some(session.into()),
            workflow_run_id: None,
            message_id: None,
            kind,
            name: "llm".into(),
            input_tokens: 10,
            output_tokens: 5,
            duration_ms: 12,
            status: "success".into(),
            input_preview: "in".into(),
            output_preview: "out".into(),
            sequence,
            round_number: 0,
            created_at: Utc::now(),
        }
    }

    /// **Scenario**: back-fill touches only spans without a message id, and
    /// all spans of the invocation end up sharing it.
    #[tokio::test]
    async fn backfill_shares_message_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.insert_span(&span("s1", 0, SpanKind::LlmCall)).await.unwrap();
        store.insert_span(&span("s1", 1, SpanKind::ToolCall)).await.unwrap();

        let n = store.backfill_span_message_id("s1", "m1").await.unwrap();
        assert_eq!(n, 2);

        // A later invocation's span keeps its own back-fill.
        store.insert_span(&span("s1", 0, SpanKind::LlmCall)).await.unwrap();
        let n = store.backfill_span_message_id("s1", "m2").await.unwrap();
        assert_eq!(n, 1);

        let spans = store.list_session_spans("s1").await.unwrap();
        let m1_count = spans
            .iter()
            .filter(|s| s.message_id.as_deref() == Some("m1"))
            .count();
        assert_eq!(m1_count, 2);
    }

    /// **Scenario**: span kinds round-trip through their wire names.
    #[tokio::test]
    async fn kind_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.insert_span(&span("s2", 0, SpanKind::McpCall)).await.unwrap();
        let spans = store.list_session_spans("s2").await.unwrap();
        assert_eq!(spans[0].kind, SpanKind::McpCall);
    }
}
