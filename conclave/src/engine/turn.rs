//! The tool loop: drive the provider stream, collect tool calls, gate them,
//! execute, feed results back, repeat up to the round limit.
//!
//! One invocation of [`ToolLoop::run`] produces one assistant message and
//! its trace spans. Event ordering within the invocation is causal:
//! `content_delta`s precede the `tool_call` they caused,
//! `hitl_approval_required` strictly precedes the matching
//! `tool_call{running}`, and `message_complete` → `token_usage` → `done`
//! close the stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use sse_event::{StreamEvent, ToolCallStatus};
use tracing::warn;

use crate::approval::{ApprovalGate, Decision, GateKind, WaitOutcome};
use crate::artifact::{enforce_artifact_target, process_patches, EditTarget};
use crate::engine::elements::ElementScanner;
use crate::engine::infer::tool_element_events;
use crate::engine::prompts::{TOOL_CODEGEN_PROMPT, TOOL_RESULT_PROMPT};
use crate::engine::trace::TraceRecorder;
use crate::engine::EventSink;
use crate::entity::{
    new_id, Agent, ApprovalStatus, HandlerKind, HitlApproval, MessageMetadata, ProposalStatus,
    SpanKind, StoredMessage, ToolProposal,
};
use crate::mcp::{is_mcp_name, McpToolbox};
use crate::message::{ChatMessage, MessageContent, Role};
use crate::provider::{ChatProvider, StreamChunk, TokenUsage, ToolCallRequest, ToolSchema};
use crate::store::SqliteStore;
use crate::tools::{create_tool_schema, tool_to_schema, DynamicToolsets, ToolExecutor, CREATE_TOOL_NAME};
use env_config::RuntimeSettings;

/// Everything one streaming invocation needs.
pub struct ToolLoop {
    pub store: Arc<SqliteStore>,
    pub gate: Arc<ApprovalGate>,
    pub dynamic: Arc<DynamicToolsets>,
    pub executor: Arc<ToolExecutor>,
    pub settings: RuntimeSettings,
    pub provider: Arc<dyn ChatProvider>,
    pub provider_kind: String,
    pub agent: Agent,
    pub session_id: String,
    pub owner_id: String,
    pub system_prompt: String,
    /// Native + MCP tool schemas visible this turn.
    pub static_tools: Vec<ToolSchema>,
    /// Tool names gated by HITL (requires_confirmation or the agent list).
    pub hitl_tools: HashSet<String>,
    pub toolbox: McpToolbox,
    pub edit_target: Option<EditTarget>,
    /// Prior assistant texts, oldest first, for artifact patch resolution.
    pub history_texts: Vec<String>,
    pub started: Instant,
}

impl ToolLoop {
    fn needs_hitl(&self, name: &str) -> bool {
        self.hitl_tools.contains(name) || self.agent.hitl_tool_names.iter().any(|n| n == name)
    }

    /// Tools offered this round: static + dynamically approved (+ the
    /// virtual create_tool). Recomputed per round so a proposal approved in
    /// round N is callable in round N+1.
    async fn round_tools(&self) -> Vec<ToolSchema> {
        let mut tools = self.static_tools.clone();
        for name in self.dynamic.names(&self.session_id) {
            if tools.iter().any(|t| t.name == name) {
                continue;
            }
            match self.store.get_tool_by_name(&self.owner_id, &name).await {
                Ok(Some(def)) => tools.push(tool_to_schema(&def)),
                Ok(None) => {}
                Err(e) => warn!(tool = %name, error = %e, "dynamic tool lookup failed"),
            }
        }
        if self.agent.allow_tool_creation {
            tools.push(create_tool_schema());
        }
        tools
    }

    /// Runs the loop to completion, emitting events into `sink`.
    pub async fn run(mut self, mut messages: Vec<ChatMessage>, sink: &EventSink) {
        let mut scanner = ElementScanner::new(self.edit_target.clone());
        let mut reasoning_parts: Vec<String> = Vec::new();
        let mut usage: Option<TokenUsage> = None;
        let mut trace = TraceRecorder::for_session(self.store.clone(), &self.session_id);
        let max_rounds = self.settings.max_tool_rounds;

        for round in 0..=max_rounds {
            let round_tools = self.round_tools().await;
            let round_started = Instant::now();
            let mut collected: Vec<ToolCallRequest> = Vec::new();
            let mut stream = self
                .provider
                .stream_chat(&messages, Some(&self.system_prompt), &round_tools)
                .await;

            let mut stream_failed = false;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    StreamChunk::Content(text) => {
                        sink.emit(StreamEvent::ContentDelta {
                            content: text.clone(),
                        })
                        .await;
                        for event in scanner.push(&text) {
                            sink.emit(event).await;
                        }
                    }
                    StreamChunk::Reasoning(text) => {
                        sink.emit(StreamEvent::ReasoningDelta {
                            content: text.clone(),
                        })
                        .await;
                        reasoning_parts.push(text);
                    }
                    StreamChunk::ToolCall(tc) => collected.push(tc),
                    StreamChunk::Done(round_usage) => {
                        if round_usage.is_some() {
                            usage = round_usage;
                        }
                        break;
                    }
                    StreamChunk::Error(message) => {
                        self.fail(&scanner, &reasoning_parts, &message, sink).await;
                        stream_failed = true;
                        break;
                    }
                }
            }
            if stream_failed {
                return;
            }

            let prompt_preview = messages.last().map(|m| m.text()).unwrap_or_default();
            trace
                .record_llm(
                    self.provider.model_id(),
                    usage,
                    round_started.elapsed().as_millis() as u64,
                    round,
                    &prompt_preview,
                    scanner.content(),
                )
                .await;

            if collected.is_empty() {
                if scanner.plan_open() {
                    sink.emit(StreamEvent::PlanEnd).await;
                }
                break;
            }
            if round == max_rounds {
                // Round budget exhausted: keep the last reply as the final
                // content instead of burning it on tools we will not run.
                break;
            }

            sink.emit(StreamEvent::ToolRound {
                round: round + 1,
                max_rounds,
            })
            .await;
            messages.push(ChatMessage::assistant(""));

            for tc in collected {
                if tc.name == CREATE_TOOL_NAME {
                    self.handle_proposal(&tc, &mut messages, sink).await;
                    continue;
                }
                if self.needs_hitl(&tc.name) {
                    let approved = self.handle_hitl(&tc, &mut messages, sink).await;
                    if !approved {
                        continue;
                    }
                }
                self.execute_tool(&tc, round, &mut messages, &mut trace, sink)
                    .await;
            }

            scanner.reset();
        }

        self.finish(scanner, reasoning_parts, usage, sink).await;
    }

    /// Persist + emit the terminal trio after a successful loop.
    async fn finish(
        &self,
        scanner: ElementScanner,
        reasoning_parts: Vec<String>,
        usage: Option<TokenUsage>,
        sink: &EventSink,
    ) {
        let mut content = scanner.content().to_string();

        // Resolve patch tags into full artifacts, then pin the edit target.
        if content.contains("<artifact_patch") {
            content = process_patches(&content, &self.history_texts);
            for event in replay_final_artifacts(&content, self.edit_target.as_ref()) {
                sink.emit(event).await;
            }
        }
        if let Some(target) = &self.edit_target {
            if content.contains("<artifact") {
                content = enforce_artifact_target(&content, target);
            }
        }

        let usage = usage.unwrap_or_default();
        let metadata = MessageMetadata {
            model: Some(self.provider.model_id().to_string()),
            provider: Some(self.provider_kind.clone()),
            latency_ms: Some(self.started.elapsed().as_millis() as u64),
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            ..Default::default()
        };
        let reasoning = if reasoning_parts.is_empty() {
            None
        } else {
            Some(json!([{"type": "thinking", "content": reasoning_parts.join("")}]))
        };

        let message = StoredMessage {
            id: new_id(),
            session_id: self.session_id.clone(),
            role: Role::Assistant,
            content: MessageContent::Text(content.clone()),
            agent_id: Some(self.agent.id.clone()),
            reasoning: reasoning.clone(),
            metadata: metadata.clone(),
            attachment_ids: None,
            rating: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_message(&message).await {
            warn!(session = %self.session_id, error = %e, "failed to persist assistant message");
            sink.emit(StreamEvent::Error {
                error: e.to_string(),
            })
            .await;
            return;
        }
        if let Err(e) = self
            .store
            .backfill_span_message_id(&self.session_id, &message.id)
            .await
        {
            warn!(session = %self.session_id, error = %e, "span back-fill failed");
        }
        let totals = match self
            .store
            .add_session_tokens(&self.session_id, usage.input_tokens, usage.output_tokens)
            .await
        {
            Ok(totals) => totals,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "token total update failed");
                (u64::from(usage.input_tokens), u64::from(usage.output_tokens))
            }
        };

        sink.emit(StreamEvent::MessageComplete(json!({
            "id": message.id,
            "session_id": self.session_id,
            "role": "assistant",
            "content": content,
            "agent_id": self.agent.id,
            "reasoning": reasoning,
            "metadata": metadata,
            "created_at": message.created_at.to_rfc3339(),
        })))
        .await;
        sink.emit(StreamEvent::TokenUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            session_total_input: totals.0,
            session_total_output: totals.1,
        })
        .await;
        sink.emit(StreamEvent::Done).await;
    }

    /// Mid-stream provider failure: persist partial content when present,
    /// then emit the fatal error. Partial messages contribute no tokens.
    async fn fail(
        &self,
        scanner: &ElementScanner,
        reasoning_parts: &[String],
        error: &str,
        sink: &EventSink,
    ) {
        let content = scanner.content();
        if !content.is_empty() {
            let message = StoredMessage {
                id: new_id(),
                session_id: self.session_id.clone(),
                role: Role::Assistant,
                content: MessageContent::Text(content.to_string()),
                agent_id: Some(self.agent.id.clone()),
                reasoning: if reasoning_parts.is_empty() {
                    None
                } else {
                    Some(json!([{"type": "thinking", "content": reasoning_parts.join("")}]))
                },
                metadata: MessageMetadata {
                    model: Some(self.provider.model_id().to_string()),
                    provider: Some(self.provider_kind.clone()),
                    latency_ms: Some(self.started.elapsed().as_millis() as u64),
                    error: Some(error.to_string()),
                    ..Default::default()
                },
                attachment_ids: None,
                rating: None,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.insert_message(&message).await {
                warn!(session = %self.session_id, error = %e, "failed to persist partial message");
            }
        }
        sink.emit(StreamEvent::Error {
            error: error.to_string(),
        })
        .await;
    }

    /// `create_tool` interception: persist the proposal, park at the gate,
    /// feed the outcome back as a user turn.
    async fn handle_proposal(
        &mut self,
        tc: &ToolCallRequest,
        messages: &mut Vec<ChatMessage>,
        sink: &EventSink,
    ) {
        let args = tc.arguments_value();
        let name = args
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if name.is_empty() {
            messages.push(ChatMessage::user(format!(
                "[Tool proposal failed: 'name' is required.]\n\n{}",
                TOOL_RESULT_PROMPT
            )));
            return;
        }
        let description = args
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let handler_kind = match args.get("handler_type").and_then(Value::as_str) {
            Some("http") => HandlerKind::Http,
            _ => HandlerKind::Python,
        };
        let parameters = args
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
        let mut handler_config = args.get("handler_config").cloned();

        let config_missing = match handler_kind {
            HandlerKind::Python => handler_config
                .as_ref()
                .and_then(|c| c.get("code"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("")
                .is_empty(),
            HandlerKind::Http => handler_config
                .as_ref()
                .and_then(|c| c.get("url"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("")
                .is_empty(),
        };
        if config_missing {
            sink.emit(StreamEvent::ToolGenerating {
                name: name.clone(),
                handler_type: handler_kind.as_str().to_string(),
            })
            .await;
            handler_config = Some(
                self.generate_handler_config(&name, description.as_deref(), handler_kind, &parameters)
                    .await,
            );
        }

        let proposal = ToolProposal {
            id: new_id(),
            session_id: self.session_id.clone(),
            tool_call_id: tc.id.clone(),
            name: name.clone(),
            description: description.clone(),
            handler_kind,
            parameters: parameters.clone(),
            handler_config: handler_config.clone(),
            status: ProposalStatus::Pending,
            tool_id: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_tool_proposal(&proposal).await {
            warn!(error = %e, "failed to persist tool proposal");
            messages.push(ChatMessage::user(format!(
                "[Tool proposal '{}' could not be saved.]\n\n{}",
                name, TOOL_RESULT_PROMPT
            )));
            return;
        }

        // Register before emitting so an instant approve cannot race the
        // waiter into existence.
        let pending = self
            .gate
            .register(GateKind::Proposal, &self.session_id, &tc.id);
        sink.emit(StreamEvent::ToolProposalRequired {
            proposal_id: proposal.id.clone(),
            session_id: self.session_id.clone(),
            tool_call_id: tc.id.clone(),
            name: name.clone(),
            description,
            handler_type: handler_kind.as_str().to_string(),
            parameters,
            handler_config: handler_config.unwrap_or_else(|| json!({})),
        })
        .await;

        let outcome = pending.wait(self.settings.approval_timeout).await;
        match outcome {
            WaitOutcome::Decision(Decision::Approved) => {
                self.dynamic.add(&self.session_id, &name);
                messages.push(ChatMessage::user(format!(
                    "[Tool '{}' was approved and saved to the toolkit. You can now call it directly.]\n\n{}",
                    name, TOOL_RESULT_PROMPT
                )));
            }
            WaitOutcome::Decision(Decision::Denied) => {
                messages.push(ChatMessage::user(format!(
                    "[Tool proposal '{}' was rejected by the user. Do not propose this tool again.]\n\n{}",
                    name, TOOL_RESULT_PROMPT
                )));
            }
            WaitOutcome::TimedOut => {
                // The generator owns the timeout transition.
                if let Err(e) = self
                    .store
                    .resolve_tool_proposal(&proposal.id, ProposalStatus::Rejected, None)
                    .await
                {
                    warn!(proposal = %proposal.id, error = %e, "timeout rejection failed");
                }
                messages.push(ChatMessage::user(format!(
                    "[Tool proposal '{}' timed out and was not saved.]\n\n{}",
                    name, TOOL_RESULT_PROMPT
                )));
            }
        }
    }

    /// One-shot codegen for a proposal that arrived without a usable handler
    /// config. HTTP proposals get a placeholder; python goes through the LLM.
    async fn generate_handler_config(
        &self,
        name: &str,
        description: Option<&str>,
        handler_kind: HandlerKind,
        parameters: &Value,
    ) -> Value {
        if handler_kind == HandlerKind::Http {
            return json!({
                "url": "https://api.example.com/endpoint",
                "method": "POST",
                "headers": {"Content-Type": "application/json"},
            });
        }
        let params_json =
            serde_json::to_string_pretty(parameters).unwrap_or_else(|_| "{}".to_string());
        let user_prompt = format!(
            "Tool name: {}\nDescription: {}\nParameters schema:\n{}\n\nWrite the complete Python handler function.",
            name,
            description.unwrap_or("(none)"),
            params_json
        );
        let response = self
            .provider
            .chat(
                &[ChatMessage::user(user_prompt)],
                Some(TOOL_CODEGEN_PROMPT),
                &[],
            )
            .await;
        if let Ok(resp) = response {
            let mut raw = resp.content.trim();
            if raw.starts_with("```") {
                let inner = raw.trim_start_matches("```");
                let inner = inner.strip_prefix("json").unwrap_or(inner);
                raw = match inner.find("```") {
                    Some(end) => &inner[..end],
                    None => inner,
                };
            }
            if let Ok(parsed) = serde_json::from_str::<Value>(raw.trim()) {
                if parsed
                    .get("code")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .map(|c| !c.is_empty())
                    .unwrap_or(false)
                {
                    return parsed;
                }
            }
        }
        warn!(tool = name, "handler codegen failed; storing stub");
        json!({
            "code": format!(
                "def handler(params):\n    # TODO: implement {}\n    return {{\"error\": \"Not implemented\"}}",
                name
            )
        })
    }

    /// Gated-tool rendezvous. Returns true when execution should proceed.
    async fn handle_hitl(
        &mut self,
        tc: &ToolCallRequest,
        messages: &mut Vec<ChatMessage>,
        sink: &EventSink,
    ) -> bool {
        let approval = HitlApproval {
            id: new_id(),
            session_id: self.session_id.clone(),
            tool_call_id: tc.id.clone(),
            tool_name: tc.name.clone(),
            tool_arguments: tc.arguments.clone(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_hitl_approval(&approval).await {
            warn!(error = %e, "failed to persist approval row");
            messages.push(ChatMessage::user(format!(
                "[Tool '{}' could not be submitted for approval.]\n\n{}",
                tc.name, TOOL_RESULT_PROMPT
            )));
            return false;
        }

        let pending = self.gate.register(GateKind::Hitl, &self.session_id, &tc.id);
        sink.emit(StreamEvent::HitlApprovalRequired {
            approval_id: approval.id.clone(),
            session_id: self.session_id.clone(),
            tool_call_id: tc.id.clone(),
            tool_name: tc.name.clone(),
            tool_arguments: tc.arguments_value(),
        })
        .await;

        let outcome = pending.wait(self.settings.approval_timeout).await;
        match outcome {
            WaitOutcome::Decision(Decision::Approved) => true,
            WaitOutcome::Decision(Decision::Denied) => {
                sink.emit(StreamEvent::ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments_value(),
                    status: ToolCallStatus::Completed,
                    result: Some("User denied this tool call.".into()),
                })
                .await;
                messages.push(ChatMessage::user(format!(
                    "[Tool '{}' was denied by the user. Do not retry this tool.]\n\n{}",
                    tc.name, TOOL_RESULT_PROMPT
                )));
                false
            }
            WaitOutcome::TimedOut => {
                if let Err(e) = self
                    .store
                    .resolve_hitl_approval(&approval.id, ApprovalStatus::Denied)
                    .await
                {
                    warn!(approval = %approval.id, error = %e, "timeout denial failed");
                }
                messages.push(ChatMessage::user(format!(
                    "[Tool '{}' approval timed out. The action was not performed.]\n\n{}",
                    tc.name, TOOL_RESULT_PROMPT
                )));
                false
            }
        }
    }

    /// Normal execution: run the tool (native or MCP), record the span, emit
    /// events, feed the result back.
    async fn execute_tool(
        &mut self,
        tc: &ToolCallRequest,
        round: u32,
        messages: &mut Vec<ChatMessage>,
        trace: &mut TraceRecorder,
        sink: &EventSink,
    ) {
        sink.emit(StreamEvent::ToolCall {
            id: tc.id.clone(),
            name: tc.name.clone(),
            arguments: tc.arguments_value(),
            status: ToolCallStatus::Running,
            result: None,
        })
        .await;

        let tool_started = Instant::now();
        let (result, span_kind) = if is_mcp_name(&tc.name) {
            (
                self.toolbox.call(&tc.name, tc.arguments_value()).await,
                SpanKind::McpCall,
            )
        } else {
            (
                self.executor
                    .execute(&self.owner_id, &tc.name, &tc.arguments)
                    .await,
                SpanKind::ToolCall,
            )
        };
        trace
            .record_tool(
                span_kind,
                &tc.name,
                &tc.arguments,
                &result,
                tool_started.elapsed().as_millis() as u64,
                round,
            )
            .await;

        sink.emit(StreamEvent::ToolCall {
            id: tc.id.clone(),
            name: tc.name.clone(),
            arguments: tc.arguments_value(),
            status: ToolCallStatus::Completed,
            result: Some(result.clone()),
        })
        .await;
        for event in tool_element_events(&tc.name, &result) {
            sink.emit(event).await;
        }

        messages.push(ChatMessage::user(format!(
            "[Tool '{}' returned: {}]\n\n{}",
            tc.name, result, TOOL_RESULT_PROMPT
        )));
    }
}

/// After patch resolution the final content carries full artifact tags that
/// never streamed; emit them so clients always see the resolved artifact.
fn replay_final_artifacts(
    content: &str,
    edit_target: Option<&EditTarget>,
) -> Vec<StreamEvent> {
    crate::artifact::scan_artifacts(content, edit_target)
        .into_iter()
        .filter(|a| a.is_complete)
        .map(|a| StreamEvent::Artifact {
            id: a.id,
            title: a.title,
            artifact_type: a.artifact_type,
            content: a.content,
            is_complete: true,
        })
        .collect()
}

/// Blocking tool loop for inner workflow nodes and non-final team agents:
/// same round semantics, no events, no gates. Returns the final content.
pub async fn run_blocking_loop(
    provider: &Arc<dyn ChatProvider>,
    mut messages: Vec<ChatMessage>,
    system_prompt: Option<&str>,
    tools: &[ToolSchema],
    toolbox: &McpToolbox,
    executor: &ToolExecutor,
    owner_id: &str,
    max_rounds: u32,
) -> Result<String, String> {
    let mut content = String::new();
    for round in 0..=max_rounds {
        let response = provider
            .chat(&messages, system_prompt, tools)
            .await
            .map_err(|e| e.to_string())?;
        content = response.content;
        if response.tool_calls.is_empty() || round == max_rounds {
            break;
        }
        messages.push(ChatMessage::assistant(""));
        for tc in &response.tool_calls {
            let result = if is_mcp_name(&tc.name) {
                toolbox.call(&tc.name, tc.arguments_value()).await
            } else {
                executor.execute(owner_id, &tc.name, &tc.arguments).await
            };
            messages.push(ChatMessage::user(format!(
                "[Tool '{}' returned: {}]\n\n{}",
                tc.name, result, TOOL_RESULT_PROMPT
            )));
        }
    }
    Ok(content)
}
