//! End-to-end chat-turn scenarios driven through a scripted provider.

mod common;

use common::{collect_all, collect_until, event_names, fixture, fixture_with};
use conclave::engine::TurnRequest;
use conclave::entity::{new_id, HandlerKind, ToolDefinition};
use conclave::{ApprovalStatus, ProposalStatus, Role};
use sse_event::{StreamEvent, ToolCallStatus};

fn turn(f: &common::Fixture, message: &str) -> TurnRequest {
    TurnRequest {
        session_id: f.session_id.clone(),
        user_id: f.user_id.clone(),
        message: message.into(),
        attachments: vec![],
    }
}

/// **Scenario**: simple turn, no tools. Content deltas, then
/// message_complete with model metadata, token_usage, done; session totals
/// strictly increase.
#[tokio::test]
async fn simple_turn_without_tools() {
    let f = fixture("gpt-4o").await;
    f.mock.push_text("Hello there!");

    let stream = f.engine.chat_turn(turn(&f, "hello")).await.unwrap();
    let events = collect_all(stream).await;
    let names = event_names(&events);

    assert!(names.contains(&"content_delta"));
    let tail: Vec<_> = names.iter().rev().take(3).rev().collect();
    assert_eq!(tail, vec![&"message_complete", &"token_usage", &"done"]);

    let complete = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageComplete(v) => Some(v.clone()),
            _ => None,
        })
        .expect("message_complete");
    assert_eq!(complete["content"], "Hello there!");
    assert_eq!(complete["metadata"]["model"], "gpt-4o");

    let session = f.store.get_session(&f.session_id).await.unwrap().unwrap();
    assert!(session.total_input_tokens > 0);
    assert!(session.total_output_tokens > 0);

    // Both the user turn and the assistant reply are persisted.
    let messages = f.store.list_messages(&f.session_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content.text(), "Hello there!");
}

/// **Scenario**: trace spans of one invocation share contiguous sequences
/// from 0 and are back-filled with the persisted message id.
#[tokio::test]
async fn spans_backfilled_with_message_id() {
    let f = fixture("gpt-4o").await;
    f.mock.push_text("reply");
    let stream = f.engine.chat_turn(turn(&f, "hi")).await.unwrap();
    let _ = collect_all(stream).await;

    let spans = f.store.list_session_spans(&f.session_id).await.unwrap();
    assert!(!spans.is_empty());
    for (i, span) in spans.iter().enumerate() {
        assert_eq!(span.sequence, i as u32);
        assert!(span.message_id.is_some(), "span missing message back-fill");
    }
    let messages = f.store.list_messages(&f.session_id).await.unwrap();
    let assistant = messages.last().unwrap();
    assert_eq!(spans[0].message_id.as_deref(), Some(assistant.id.as_str()));
}

/// **Scenario**: HITL denial. Event order is tool_round →
/// hitl_approval_required → (deny) → tool_call completed with the denial
/// string → final textual reply.
#[tokio::test]
async fn hitl_denial_flow() {
    let tool_id = new_id();
    let f = fixture_with("gpt-4o", |mut agent| {
        agent.tool_ids = vec![tool_id.clone()];
        agent
    })
    .await;
    f.store
        .put_tool(&ToolDefinition {
            id: tool_id.clone(),
            owner_id: f.user_id.clone(),
            name: "send_email".into(),
            description: Some("Send an email".into()),
            parameters: serde_json::json!({"type": "object", "properties": {"to": {"type": "string"}}}),
            handler_kind: HandlerKind::Http,
            handler_config: serde_json::json!({"url": "https://mail.example.com"}),
            requires_confirmation: true,
            is_active: true,
        })
        .await
        .unwrap();

    f.mock.push_tool_call(
        "call_1",
        "send_email",
        r#"{"to": "bob@x", "subject": "lunch"}"#,
    );
    f.mock.push_text("I was not allowed to send the email.");

    let mut stream = f
        .engine
        .chat_turn(turn(&f, "email bob about lunch"))
        .await
        .unwrap();

    let upto_gate = collect_until(&mut stream, |e| {
        matches!(e, StreamEvent::HitlApprovalRequired { .. })
    })
    .await;
    let names = event_names(&upto_gate);
    assert!(names.contains(&"tool_round"));
    let (approval_id, tool_name) = match upto_gate.last().unwrap() {
        StreamEvent::HitlApprovalRequired {
            approval_id,
            tool_name,
            tool_call_id,
            ..
        } => {
            assert_eq!(tool_call_id, "call_1");
            (approval_id.clone(), tool_name.clone())
        }
        other => panic!("expected hitl_approval_required, got {:?}", other),
    };
    assert_eq!(tool_name, "send_email");

    let row = f
        .engine
        .resolve_hitl(&f.user_id, &approval_id, false)
        .await
        .unwrap();
    assert_eq!(row.status, ApprovalStatus::Denied);

    let rest = collect_all(stream).await;
    let denied_call = rest
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolCall {
                id,
                status: ToolCallStatus::Completed,
                result,
                ..
            } if id == "call_1" => Some(result.clone()),
            _ => None,
        })
        .expect("completed tool_call for denied call");
    assert_eq!(denied_call.as_deref(), Some("User denied this tool call."));

    let complete = rest
        .iter()
        .find_map(|e| match e {
            StreamEvent::MessageComplete(v) => Some(v.clone()),
            _ => None,
        })
        .expect("final reply after denial");
    assert_eq!(complete["content"], "I was not allowed to send the email.");

    // Resolving again is a 404-shaped error.
    let err = f
        .engine
        .resolve_hitl(&f.user_id, &approval_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, conclave::EngineError::Store(
        conclave::StoreError::NotFound(_)
    )));
}

/// **Scenario**: dynamic tool creation. The proposal is approved, the tool
/// is upserted by (owner, name), and the next round offers it without any
/// further approval.
#[tokio::test]
async fn dynamic_tool_creation_flow() {
    let f = fixture_with("gpt-4o", |mut agent| {
        agent.allow_tool_creation = true;
        agent
    })
    .await;

    let proposal_args = serde_json::json!({
        "name": "reverse_string",
        "description": "Reverse a string",
        "handler_type": "python",
        "parameters": {
            "type": "object",
            "properties": {"text": {"type": "string", "description": "Input text"}},
            "required": ["text"],
        },
        "handler_config": {
            "code": "def handler(params):\n    return params.get('text', '')[::-1]"
        },
    });
    f.mock
        .push_tool_call("call_1", "create_tool", &proposal_args.to_string());
    f.mock.push_text("Tool is ready; call it next time.");

    let mut stream = f
        .engine
        .chat_turn(turn(&f, "reverse the string 'hello'"))
        .await
        .unwrap();

    let upto_proposal = collect_until(&mut stream, |e| {
        matches!(e, StreamEvent::ToolProposalRequired { .. })
    })
    .await;
    let proposal_id = match upto_proposal.last().unwrap() {
        StreamEvent::ToolProposalRequired {
            proposal_id, name, ..
        } => {
            assert_eq!(name, "reverse_string");
            proposal_id.clone()
        }
        other => panic!("expected tool_proposal_required, got {:?}", other),
    };

    let row = f
        .engine
        .resolve_proposal(&f.user_id, &proposal_id, true)
        .await
        .unwrap();
    assert_eq!(row.status, ProposalStatus::Approved);
    assert!(row.tool_id.is_some());

    let _ = collect_all(stream).await;

    // The definition is durable and owner-scoped.
    let stored = f
        .store
        .get_tool_by_name(&f.user_id, "reverse_string")
        .await
        .unwrap()
        .expect("tool persisted on approval");
    assert_eq!(stored.handler_kind, HandlerKind::Python);

    // Next turn: the approved tool is offered to the model with no gate.
    f.mock.push_text("olleh");
    let stream = f.engine.chat_turn(turn(&f, "reverse 'hello'")).await.unwrap();
    let events = collect_all(stream).await;
    assert!(!event_names(&events).contains(&"tool_proposal_required"));
    let offered = f.mock.last_tools.lock().unwrap().clone();
    assert!(
        offered.iter().any(|t| t.name == "reverse_string"),
        "approved tool must be offered on later rounds: {:?}",
        offered.iter().map(|t| &t.name).collect::<Vec<_>>()
    );
}

/// **Scenario**: context compaction. A long history triggers a
/// context_compacted event before streaming, summarizing all but the last
/// ten messages.
#[tokio::test]
async fn context_compaction_before_streaming() {
    let f = fixture("gpt-3.5-turbo").await;

    // 16,385-token limit → threshold ≈ 13k tokens ≈ 52k chars. Thirty
    // 3,000-char rows clear it comfortably.
    for i in 0..30 {
        f.store
            .insert_message(&conclave::StoredMessage {
                id: new_id(),
                session_id: f.session_id.clone(),
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: conclave::MessageContent::Text(format!("{}{}", "c".repeat(3000), i)),
                agent_id: None,
                reasoning: None,
                metadata: Default::default(),
                attachment_ids: None,
                rating: None,
                created_at: chrono::Utc::now() + chrono::Duration::seconds(i),
            })
            .await
            .unwrap();
    }

    f.mock.push_text("summary of the early conversation"); // compaction call
    f.mock.push_text("fresh reply"); // the turn itself

    let stream = f.engine.chat_turn(turn(&f, "continue")).await.unwrap();
    let events = collect_all(stream).await;

    match events.first().expect("events") {
        StreamEvent::ContextCompacted {
            messages_summarized,
            summary_preview,
        } => {
            // 30 history rows + the new user message, minus the 10 kept.
            assert_eq!(*messages_summarized, 21);
            assert!(summary_preview.starts_with("summary of the early"));
        }
        other => panic!("expected context_compacted first, got {:?}", other),
    }
    assert!(event_names(&events).contains(&"content_delta"));
}

/// **Scenario**: compaction idempotence — a short history emits no
/// context_compacted event.
#[tokio::test]
async fn no_compaction_below_threshold() {
    let f = fixture("gpt-3.5-turbo").await;
    f.mock.push_text("reply");
    let stream = f.engine.chat_turn(turn(&f, "hi")).await.unwrap();
    let events = collect_all(stream).await;
    assert!(!event_names(&events).contains(&"context_compacted"));
}

/// **Scenario**: artifact edit with a patch. The patch resolves against the
/// previous artifact and the final artifact event carries the edit target's
/// id with the patched content.
#[tokio::test]
async fn artifact_patch_edit_flow() {
    let f = fixture("gpt-4o").await;
    f.store
        .insert_message(&conclave::StoredMessage {
            id: new_id(),
            session_id: f.session_id.clone(),
            role: Role::Assistant,
            content: conclave::MessageContent::Text(
                r#"Here you go: <artifact id="lp" title="Landing" type="html"><title>A</title></artifact>"#
                    .into(),
            ),
            agent_id: Some(f.agent_id.clone()),
            reasoning: None,
            metadata: Default::default(),
            attachment_ids: None,
            rating: None,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    f.mock.push_text(
        "Done. <artifact_patch id=\"lp\" title=\"Landing\" type=\"html\"><<<SEARCH>>><title>A</title><<<REPLACE>>><title>B</title><<<END>>></artifact_patch>",
    );

    let request = TurnRequest {
        session_id: f.session_id.clone(),
        user_id: f.user_id.clone(),
        message: "[EDIT ARTIFACT id=\"lp\" title=\"Landing\" type=\"html\"]\n\nrename title to B"
            .into(),
        attachments: vec![],
    };
    let stream = f.engine.chat_turn(request).await.unwrap();
    let events = collect_all(stream).await;

    let final_artifact = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Artifact {
                id,
                artifact_type,
                content,
                is_complete: true,
                ..
            } => Some((id.clone(), artifact_type.clone(), content.clone())),
            _ => None,
        })
        .last()
        .expect("a complete artifact event");
    assert_eq!(final_artifact.0, "lp");
    assert_eq!(final_artifact.1, "html");
    assert_eq!(final_artifact.2, "<title>B</title>");

    // The edit intent also expanded the outgoing user message with the
    // current artifact content.
    let seen = f.mock.last_messages.lock().unwrap().clone();
    let outgoing = seen.last().unwrap().text();
    assert!(outgoing.contains("Current content:"));
    assert!(outgoing.contains("<title>A</title>"));
}

/// **Scenario**: a provider error mid-stream persists the partial message
/// with error metadata and ends with an error event; token totals stay zero.
#[tokio::test]
async fn provider_error_persists_partial() {
    let f = fixture("gpt-4o").await;
    f.mock.push_script(vec![
        conclave::StreamChunk::Content("partial ".into()),
        conclave::StreamChunk::Error("upstream exploded".into()),
    ]);

    let stream = f.engine.chat_turn(turn(&f, "hi")).await.unwrap();
    let events = collect_all(stream).await;
    assert_eq!(events.last().unwrap().name(), "error");
    assert!(!event_names(&events).contains(&"message_complete"));

    let messages = f.store.list_messages(&f.session_id).await.unwrap();
    let partial = messages.last().unwrap();
    assert_eq!(partial.role, Role::Assistant);
    assert_eq!(partial.content.text(), "partial ");
    assert_eq!(partial.metadata.error.as_deref(), Some("upstream exploded"));

    let session = f.store.get_session(&f.session_id).await.unwrap().unwrap();
    assert_eq!(session.total_input_tokens, 0);
    assert_eq!(session.total_output_tokens, 0);
}

/// **Scenario**: unknown session and foreign session are rejected before any
/// stream starts.
#[tokio::test]
async fn session_validation_errors() {
    let f = fixture("gpt-4o").await;
    let missing = f
        .engine
        .chat_turn(TurnRequest {
            session_id: "nope".into(),
            user_id: f.user_id.clone(),
            message: "hi".into(),
            attachments: vec![],
        })
        .await;
    assert!(matches!(missing, Err(conclave::EngineError::NotFound(_))));

    let foreign = f
        .engine
        .chat_turn(TurnRequest {
            session_id: f.session_id.clone(),
            user_id: "someone-else".into(),
            message: "hi".into(),
            attachments: vec![],
        })
        .await;
    assert!(matches!(
        foreign,
        Err(conclave::EngineError::Authorization(_))
    ));
}

/// **Scenario**: plan blocks stream plan_start/plan_step and close with
/// plan_end before the reply finishes.
#[tokio::test]
async fn plan_block_lifecycle() {
    let f = fixture("gpt-4o").await;
    f.mock.push_script(vec![
        conclave::StreamChunk::Content("```plan\n- fetch\n".into()),
        conclave::StreamChunk::Content("- analyze\n```\ndone".into()),
        conclave::StreamChunk::Done(Some(conclave::TokenUsage {
            input_tokens: 5,
            output_tokens: 5,
        })),
    ]);

    let stream = f.engine.chat_turn(turn(&f, "plan this")).await.unwrap();
    let events = collect_all(stream).await;
    let names = event_names(&events);
    assert!(names.contains(&"plan_start"));
    assert_eq!(names.iter().filter(|n| **n == "plan_step").count(), 2);
    let plan_end = names.iter().position(|n| *n == "plan_end").unwrap();
    let complete = names.iter().position(|n| *n == "message_complete").unwrap();
    assert!(plan_end < complete);
}
