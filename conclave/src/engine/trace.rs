//! Sequence-numbered span recording for one generator invocation.
//!
//! Spans get contiguous `sequence` values starting at 0. After the assistant
//! message is persisted the engine back-fills `message_id` on every span of
//! the invocation via [`SqliteStore::backfill_span_message_id`].

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::entity::{new_id, SpanKind, TraceSpan};
use crate::provider::TokenUsage;
use crate::store::SqliteStore;

/// Preview cap for span input/output.
const PREVIEW_CHARS: usize = 500;

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Records spans for one invocation (chat turn or workflow run).
pub struct TraceRecorder {
    store: Arc<SqliteStore>,
    session_id: Option<String>,
    workflow_run_id: Option<String>,
    next_sequence: u32,
}

impl TraceRecorder {
    pub fn for_session(store: Arc<SqliteStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: Some(session_id.into()),
            workflow_run_id: None,
            next_sequence: 0,
        }
    }

    pub fn for_run(store: Arc<SqliteStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: None,
            workflow_run_id: Some(run_id.into()),
            next_sequence: 0,
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    async fn insert(&self, span: TraceSpan) {
        if let Err(e) = self.store.insert_span(&span).await {
            warn!(error = %e, "failed to record trace span");
        }
    }

    /// One LLM round.
    pub async fn record_llm(
        &mut self,
        model: &str,
        usage: Option<TokenUsage>,
        duration_ms: u64,
        round_number: u32,
        prompt_preview: &str,
        response_preview: &str,
    ) {
        let usage = usage.unwrap_or_default();
        let span = TraceSpan {
            id: new_id(),
            session_id: self.session_id.clone(),
            workflow_run_id: self.workflow_run_id.clone(),
            message_id: None,
            kind: SpanKind::LlmCall,
            name: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            duration_ms,
            status: "success".into(),
            input_preview: preview(prompt_preview),
            output_preview: preview(response_preview),
            sequence: self.next_seq(),
            round_number,
            created_at: Utc::now(),
        };
        self.insert(span).await;
    }

    /// One tool or MCP call.
    pub async fn record_tool(
        &mut self,
        kind: SpanKind,
        tool_name: &str,
        arguments: &str,
        result: &str,
        duration_ms: u64,
        round_number: u32,
    ) {
        let span = TraceSpan {
            id: new_id(),
            session_id: self.session_id.clone(),
            workflow_run_id: self.workflow_run_id.clone(),
            message_id: None,
            kind,
            name: tool_name.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms,
            status: "success".into(),
            input_preview: preview(arguments),
            output_preview: preview(result),
            sequence: self.next_seq(),
            round_number,
            created_at: Utc::now(),
        };
        self.insert(span).await;
    }

    /// One workflow step.
    pub async fn record_workflow_step(
        &mut self,
        node_name: &str,
        input: &str,
        output: &str,
        duration_ms: u64,
        status: &str,
    ) {
        let span = TraceSpan {
            id: new_id(),
            session_id: self.session_id.clone(),
            workflow_run_id: self.workflow_run_id.clone(),
            message_id: None,
            kind: SpanKind::WorkflowStep,
            name: node_name.to_string(),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms,
            status: status.into(),
            input_preview: preview(input),
            output_preview: preview(output),
            sequence: self.next_seq(),
            round_number: 0,
            created_at: Utc::now(),
        };
        self.insert(span).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: sequences are contiguous from 0 per recorder.
    #[tokio::test]
    async fn sequences_are_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("t.db")).unwrap());
        let mut recorder = TraceRecorder::for_session(store.clone(), "s1");

        recorder
            .record_llm("gpt-4o", None, 10, 0, "prompt", "reply")
            .await;
        recorder
            .record_tool(SpanKind::ToolCall, "reverse_string", "{}", "olleh", 3, 0)
            .await;
        recorder
            .record_llm("gpt-4o", None, 8, 1, "prompt", "final")
            .await;

        let spans = store.list_session_spans("s1").await.unwrap();
        let seqs: Vec<u32> = spans.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(spans[1].kind, SpanKind::ToolCall);
        assert_eq!(spans[1].name, "reverse_string");
    }

    /// **Scenario**: previews cap at 500 chars.
    #[tokio::test]
    async fn previews_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("t.db")).unwrap());
        let mut recorder = TraceRecorder::for_session(store.clone(), "s1");
        let long = "x".repeat(2000);
        recorder.record_llm("m", None, 1, 0, &long, &long).await;
        let spans = store.list_session_spans("s1").await.unwrap();
        assert_eq!(spans[0].input_preview.len(), 500);
        assert_eq!(spans[0].output_preview.len(), 500);
    }
}
