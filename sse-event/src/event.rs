//! The canonical stream-event taxonomy (type + payload).
//!
//! Events serialize as `{"event": "<name>", "data": {...}}`; unit variants
//! (`plan_end`, `done`) carry no `data` key and the SSE writer substitutes
//! an empty object. Consumers must treat unknown event names as ignorable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a tool call as reported over the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Completed,
}

/// Reference to a knowledge base in `kb_context` / `kb_warning` payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbRef {
    pub id: String,
    pub name: String,
}

/// One streamed event.
///
/// Ordering contract (per response): `content_delta`/`reasoning_delta` precede
/// the `tool_call` they caused; `hitl_approval_required` strictly precedes the
/// matching `tool_call{status: running}`; `message_complete` is the last
/// content-bearing event, followed by `token_usage`, then `done`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentDelta {
        content: String,
    },
    ReasoningDelta {
        content: String,
    },
    ToolRound {
        round: u32,
        max_rounds: u32,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    ToolGenerating {
        name: String,
        handler_type: String,
    },
    HitlApprovalRequired {
        approval_id: String,
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        tool_arguments: Value,
    },
    ToolProposalRequired {
        proposal_id: String,
        session_id: String,
        tool_call_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        handler_type: String,
        parameters: Value,
        handler_config: Value,
    },
    ContextCompacted {
        messages_summarized: usize,
        summary_preview: String,
    },
    KbContext {
        kbs: Vec<KbRef>,
    },
    KbWarning {
        kbs: Vec<KbRef>,
    },
    PlanStart {
        title: String,
    },
    PlanStep {
        step: String,
    },
    PlanEnd,
    JsxPreview {
        jsx: String,
        is_complete: bool,
    },
    Artifact {
        id: String,
        title: String,
        #[serde(rename = "type")]
        artifact_type: String,
        content: String,
        is_complete: bool,
    },
    TerminalOutput {
        content: String,
        is_complete: bool,
    },
    FileTree {
        tree: Value,
    },
    SourceUrl {
        url: String,
    },
    AgentStep {
        agent_id: String,
        agent_name: String,
        step: String,
    },
    /// Full persisted assistant message, as the row will be read back.
    MessageComplete(Value),
    TokenUsage {
        input_tokens: u32,
        output_tokens: u32,
        session_total_input: u64,
        session_total_output: u64,
    },
    WorkflowStart {
        run_id: String,
        workflow_name: String,
        total_steps: usize,
    },
    NodeStart {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task: Option<String>,
    },
    NodeContentDelta {
        node_id: String,
        content: String,
    },
    NodeComplete {
        node_id: String,
        output: String,
    },
    NodeError {
        node_id: String,
        error: String,
    },
    WorkflowComplete {
        run_id: String,
        final_output: String,
    },
    WorkflowError {
        run_id: String,
        error: String,
    },
    Error {
        error: String,
    },
    Done,
}

impl StreamEvent {
    /// The wire name of this event (the `event:` field of the SSE frame).
    pub fn name(&self) -> &'static str {
        match self {
            Self::ContentDelta { .. } => "content_delta",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ToolRound { .. } => "tool_round",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolGenerating { .. } => "tool_generating",
            Self::HitlApprovalRequired { .. } => "hitl_approval_required",
            Self::ToolProposalRequired { .. } => "tool_proposal_required",
            Self::ContextCompacted { .. } => "context_compacted",
            Self::KbContext { .. } => "kb_context",
            Self::KbWarning { .. } => "kb_warning",
            Self::PlanStart { .. } => "plan_start",
            Self::PlanStep { .. } => "plan_step",
            Self::PlanEnd => "plan_end",
            Self::JsxPreview { .. } => "jsx_preview",
            Self::Artifact { .. } => "artifact",
            Self::TerminalOutput { .. } => "terminal_output",
            Self::FileTree { .. } => "file_tree",
            Self::SourceUrl { .. } => "source_url",
            Self::AgentStep { .. } => "agent_step",
            Self::MessageComplete(_) => "message_complete",
            Self::TokenUsage { .. } => "token_usage",
            Self::WorkflowStart { .. } => "workflow_start",
            Self::NodeStart { .. } => "node_start",
            Self::NodeContentDelta { .. } => "node_content_delta",
            Self::NodeComplete { .. } => "node_complete",
            Self::NodeError { .. } => "node_error",
            Self::WorkflowComplete { .. } => "workflow_complete",
            Self::WorkflowError { .. } => "workflow_error",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// The JSON payload (the `data:` field). Unit variants yield `{}`.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map
                .get("data")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            _ => Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: adjacent tagging yields {"event", "data"} with snake_case names.
    #[test]
    fn serializes_event_and_data_keys() {
        let ev = StreamEvent::ContentDelta {
            content: "hi".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "content_delta");
        assert_eq!(v["data"]["content"], "hi");
    }

    /// **Scenario**: unit variants have a name but an empty payload.
    #[test]
    fn unit_variants_have_empty_payload() {
        assert_eq!(StreamEvent::Done.name(), "done");
        assert_eq!(StreamEvent::Done.payload(), serde_json::json!({}));
        assert_eq!(StreamEvent::PlanEnd.name(), "plan_end");
        assert_eq!(StreamEvent::PlanEnd.payload(), serde_json::json!({}));
    }

    /// **Scenario**: artifact events expose the reserved word `type` on the wire.
    #[test]
    fn artifact_uses_type_key() {
        let ev = StreamEvent::Artifact {
            id: "lp".into(),
            title: "Landing".into(),
            artifact_type: "html".into(),
            content: "<title>B</title>".into(),
            is_complete: true,
        };
        let v = ev.payload();
        assert_eq!(v["type"], "html");
        assert_eq!(v["id"], "lp");
    }

    /// **Scenario**: tool_call omits `result` while running and includes it on completion.
    #[test]
    fn tool_call_result_only_when_present() {
        let running = StreamEvent::ToolCall {
            id: "call_1".into(),
            name: "send_email".into(),
            arguments: serde_json::json!({"to": "bob@x"}),
            status: ToolCallStatus::Running,
            result: None,
        };
        let v = running.payload();
        assert_eq!(v["status"], "running");
        assert!(v.get("result").is_none());

        let done = StreamEvent::ToolCall {
            id: "call_1".into(),
            name: "send_email".into(),
            arguments: serde_json::json!({"to": "bob@x"}),
            status: ToolCallStatus::Completed,
            result: Some("sent".into()),
        };
        assert_eq!(done.payload()["result"], "sent");
    }

    /// **Scenario**: message_complete carries the persisted message verbatim.
    #[test]
    fn message_complete_is_passthrough() {
        let msg = serde_json::json!({"id": "7", "role": "assistant", "content": "hello"});
        let ev = StreamEvent::MessageComplete(msg.clone());
        assert_eq!(ev.payload(), msg);
        assert_eq!(ev.name(), "message_complete");
    }

    /// **Scenario**: round-trip through serde preserves the variant.
    #[test]
    fn round_trips_through_json() {
        let ev = StreamEvent::TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            session_total_input: 100,
            session_total_output: 50,
        };
        let s = serde_json::to_string(&ev).unwrap();
        let back: StreamEvent = serde_json::from_str(&s).unwrap();
        match back {
            StreamEvent::TokenUsage { input_tokens, .. } => assert_eq!(input_tokens, 10),
            other => panic!("expected token_usage, got {:?}", other),
        }
    }
}
