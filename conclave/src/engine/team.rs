//! Team-mode dispatch: coordinate, route, collaborate.
//!
//! `coordinate` asks a router LLM (the first agent's provider) for a single
//! agent name and streams that agent through the standard tool loop.
//! `route` runs every agent in parallel with blocking tool loops and streams
//! a synthesizer over their combined output. `collaborate` runs agents
//! sequentially, each seeing the accumulated context, with only the final
//! agent streaming.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use sse_event::StreamEvent;
use tracing::warn;

use crate::artifact::EditTarget;
use crate::engine::prompts::{router_prompt, SYNTHESIS_PROMPT};
use crate::engine::turn::{run_blocking_loop, ToolLoop};
use crate::engine::{AgentResources, EventSink, EventStream, StreamEngine};
use crate::entity::{new_id, MessageMetadata, Session, StoredMessage, Team, TeamMode};
use crate::error::EngineError;
use crate::mcp::McpToolbox;
use crate::message::{ChatMessage, MessageContent, Role};
use crate::provider::StreamChunk;

#[allow(clippy::too_many_arguments)]
pub async fn run_team_turn(
    engine: &StreamEngine,
    team: Team,
    resources: Vec<AgentResources>,
    session: Session,
    messages: Vec<ChatMessage>,
    user_message: String,
    edit_target: Option<EditTarget>,
    history_texts: Vec<String>,
) -> Result<EventStream, EngineError> {
    let (sink, stream) = EventSink::channel();
    let ctx = TeamContext {
        store: engine.store().clone(),
        gate: engine.gate().clone(),
        dynamic: engine.dynamic().clone(),
        executor: engine.executor().clone(),
        settings: engine.settings().clone(),
        session,
        messages,
        user_message,
        edit_target,
        history_texts,
        started: Instant::now(),
    };
    tokio::spawn(async move {
        match team.mode {
            TeamMode::Coordinate => coordinate(ctx, resources, &sink).await,
            TeamMode::Route => route(ctx, resources, &sink).await,
            TeamMode::Collaborate => collaborate(ctx, resources, &sink).await,
        }
    });
    Ok(stream)
}

struct TeamContext {
    store: Arc<crate::store::SqliteStore>,
    gate: Arc<crate::approval::ApprovalGate>,
    dynamic: Arc<crate::tools::DynamicToolsets>,
    executor: Arc<crate::tools::ToolExecutor>,
    settings: env_config::RuntimeSettings,
    session: Session,
    messages: Vec<ChatMessage>,
    user_message: String,
    edit_target: Option<EditTarget>,
    history_texts: Vec<String>,
    started: Instant,
}

async fn coordinate(ctx: TeamContext, mut resources: Vec<AgentResources>, sink: &EventSink) {
    let router = &resources[0];
    sink.emit(StreamEvent::AgentStep {
        agent_id: router.agent.id.clone(),
        agent_name: "Router".into(),
        step: "routing".into(),
    })
    .await;

    let agent_lines: Vec<String> = resources
        .iter()
        .map(|r| {
            format!(
                "- **{}** (id={}): {}",
                r.agent.name,
                r.agent.id,
                r.agent.description.as_deref().unwrap_or("No description")
            )
        })
        .collect();
    let prompt = router_prompt(&agent_lines.join("\n"));

    let answer = match router
        .provider
        .chat(
            &[ChatMessage::user(ctx.user_message.clone())],
            Some(&prompt),
            &[],
        )
        .await
    {
        Ok(resp) => resp.content.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "team router failed; falling back to first agent");
            String::new()
        }
    };

    let answer_lower = answer.to_lowercase();
    let index = resources
        .iter()
        .position(|r| {
            if answer_lower.is_empty() {
                return false;
            }
            let name = r.agent.name.to_lowercase();
            answer_lower.contains(&name) || name.contains(&answer_lower)
        })
        .unwrap_or(0);
    let selected = resources.swap_remove(index);

    sink.emit(StreamEvent::AgentStep {
        agent_id: selected.agent.id.clone(),
        agent_name: selected.agent.name.clone(),
        step: "responding".into(),
    })
    .await;

    stream_selected(ctx, selected, sink).await;
}

/// Streams `selected` through the standard tool loop with its own system
/// prompt.
async fn stream_selected(ctx: TeamContext, selected: AgentResources, sink: &EventSink) {
    let toolbox =
        McpToolbox::connect(&selected.mcp_servers, ctx.settings.mcp_call_timeout).await;
    let mut static_tools = selected.tools.clone();
    static_tools.extend(toolbox.tool_schemas());

    let system_prompt = selected.agent.system_prompt.clone();
    let tool_loop = ToolLoop {
        store: ctx.store,
        gate: ctx.gate,
        dynamic: ctx.dynamic,
        executor: ctx.executor,
        settings: ctx.settings,
        provider: selected.provider,
        provider_kind: selected.provider_record.kind.as_str().to_string(),
        agent: selected.agent,
        session_id: ctx.session.id,
        owner_id: ctx.session.owner_id,
        system_prompt,
        static_tools,
        hitl_tools: selected.hitl_tools,
        toolbox,
        edit_target: ctx.edit_target,
        history_texts: ctx.history_texts,
        started: ctx.started,
    };
    tool_loop.run(ctx.messages, sink).await;
}

async fn route(ctx: TeamContext, resources: Vec<AgentResources>, sink: &EventSink) {
    sink.emit(StreamEvent::AgentStep {
        agent_id: String::new(),
        agent_name: "Router".into(),
        step: "routing".into(),
    })
    .await;

    // All agents answer in parallel with their own blocking tool loops.
    let owner_id = ctx.session.owner_id.clone();
    let tasks = resources.iter().map(|r| {
        let messages = ctx.messages.clone();
        let executor = ctx.executor.clone();
        let settings = ctx.settings.clone();
        let owner_id = owner_id.clone();
        async move {
            let toolbox = McpToolbox::connect(&r.mcp_servers, settings.mcp_call_timeout).await;
            let mut tools = r.tools.clone();
            tools.extend(toolbox.tool_schemas());
            let result = run_blocking_loop(
                &r.provider,
                messages,
                Some(&r.agent.system_prompt),
                &tools,
                &toolbox,
                &executor,
                &owner_id,
                settings.max_tool_rounds,
            )
            .await;
            (r.agent.id.clone(), r.agent.name.clone(), result)
        }
    });
    let results = join_all(tasks).await;

    let mut responses: Vec<(String, String, String)> = Vec::new();
    for (agent_id, agent_name, result) in results {
        match result {
            Ok(content) => {
                sink.emit(StreamEvent::AgentStep {
                    agent_id: agent_id.clone(),
                    agent_name: agent_name.clone(),
                    step: "completed".into(),
                })
                .await;
                responses.push((agent_id, agent_name, content));
            }
            Err(e) => warn!(agent = %agent_name, error = %e, "route-mode agent failed"),
        }
    }
    if responses.is_empty() {
        sink.emit(StreamEvent::Error {
            error: "All agents failed to respond".into(),
        })
        .await;
        return;
    }

    let synth = &resources[0];
    let responses_text: Vec<String> = responses
        .iter()
        .map(|(_, name, content)| format!("**{}:**\n{}", name, content))
        .collect();
    let synth_messages = vec![
        ChatMessage::user(ctx.user_message.clone()),
        ChatMessage::user(format!(
            "Here are the responses from different specialists:\n\n{}",
            responses_text.join("\n\n")
        )),
    ];

    sink.emit(StreamEvent::AgentStep {
        agent_id: String::new(),
        agent_name: "Synthesizer".into(),
        step: "synthesizing".into(),
    })
    .await;

    let mut full_content = String::new();
    let mut stream = synth
        .provider
        .stream_chat(&synth_messages, Some(SYNTHESIS_PROMPT), &[])
        .await;
    use futures::StreamExt;
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Content(text) => {
                full_content.push_str(&text);
                sink.emit(StreamEvent::ContentDelta { content: text }).await;
            }
            StreamChunk::Error(e) => {
                sink.emit(StreamEvent::Error { error: e }).await;
                return;
            }
            StreamChunk::Done(_) => break,
            StreamChunk::Reasoning(_) | StreamChunk::ToolCall(_) => {}
        }
    }

    let contributing: Vec<serde_json::Value> = responses
        .iter()
        .map(|(id, name, _)| json!({"id": id, "name": name}))
        .collect();
    let metadata = MessageMetadata {
        model: Some(synth.provider.model_id().to_string()),
        provider: Some(synth.provider_record.kind.as_str().to_string()),
        latency_ms: Some(ctx.started.elapsed().as_millis() as u64),
        team_mode: Some("route".into()),
        contributing_agents: Some(json!(contributing)),
        ..Default::default()
    };
    let message = StoredMessage {
        id: new_id(),
        session_id: ctx.session.id.clone(),
        role: Role::Assistant,
        content: MessageContent::Text(full_content.clone()),
        agent_id: Some(synth.agent.id.clone()),
        reasoning: None,
        metadata: metadata.clone(),
        attachment_ids: None,
        rating: None,
        created_at: Utc::now(),
    };
    if let Err(e) = ctx.store.insert_message(&message).await {
        warn!(error = %e, "failed to persist route-mode reply");
    }

    sink.emit(StreamEvent::MessageComplete(json!({
        "id": message.id,
        "session_id": ctx.session.id,
        "role": "assistant",
        "content": full_content,
        "agent_id": synth.agent.id,
        "metadata": metadata,
        "created_at": message.created_at.to_rfc3339(),
    })))
    .await;
    sink.emit(StreamEvent::Done).await;
}

async fn collaborate(ctx: TeamContext, resources: Vec<AgentResources>, sink: &EventSink) {
    let mut accumulated: Vec<(String, String)> = Vec::new();
    let total = resources.len();
    let owner_id = ctx.session.owner_id.clone();

    let mut final_resources = None;
    for (i, r) in resources.into_iter().enumerate() {
        let is_last = i == total - 1;
        sink.emit(StreamEvent::AgentStep {
            agent_id: r.agent.id.clone(),
            agent_name: r.agent.name.clone(),
            step: "responding".into(),
        })
        .await;

        if is_last {
            final_resources = Some(r);
            break;
        }

        let mut agent_messages = ctx.messages.clone();
        if !accumulated.is_empty() {
            agent_messages.push(collaboration_context(&accumulated));
        }
        let toolbox = McpToolbox::connect(&r.mcp_servers, ctx.settings.mcp_call_timeout).await;
        let mut tools = r.tools.clone();
        tools.extend(toolbox.tool_schemas());
        match run_blocking_loop(
            &r.provider,
            agent_messages,
            Some(&r.agent.system_prompt),
            &tools,
            &toolbox,
            &ctx.executor,
            &owner_id,
            ctx.settings.max_tool_rounds,
        )
        .await
        {
            Ok(content) => accumulated.push((r.agent.name.clone(), content)),
            Err(e) => {
                warn!(agent = %r.agent.name, error = %e, "collaborate-mode agent failed");
            }
        }
    }

    let Some(final_agent) = final_resources else {
        sink.emit(StreamEvent::Error {
            error: "team has no agents".into(),
        })
        .await;
        return;
    };

    let mut ctx = ctx;
    if !accumulated.is_empty() {
        ctx.messages.push(collaboration_context(&accumulated));
    }
    stream_selected(ctx, final_agent, sink).await;
}

fn collaboration_context(accumulated: &[(String, String)]) -> ChatMessage {
    let context_text: Vec<String> = accumulated
        .iter()
        .map(|(name, content)| format!("[{} said]: {}", name, content))
        .collect();
    ChatMessage::user(format!(
        "Previous team members have provided these inputs:\n\n{}\n\nPlease build on their work to provide your contribution.",
        context_text.join("\n\n")
    ))
}
