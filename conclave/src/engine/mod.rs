//! The stream engine: one chat turn from request to `done`.
//!
//! [`StreamEngine::chat_turn`] loads the session, persists the user message
//! (attachments classified, images inlined as data-URI parts, documents
//! extracted and indexed for session RAG), assembles the prompt (long-term
//! memories, artifact context, KB retrieval), triggers background memory
//! reflection for an unprocessed prior session, and then drives the tool
//! loop — or the team dispatcher for team-bound sessions — emitting the
//! event stream the caller forwards over SSE.
//!
//! The out-of-scope HTTP router participates through two calls:
//! [`StreamEngine::resolve_hitl`] and [`StreamEngine::resolve_proposal`],
//! which update the persisted row and signal the waiting generator.

pub mod context;
pub mod elements;
pub mod infer;
pub mod prompts;
pub mod team;
pub mod trace;
pub mod turn;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use chrono::Utc;
use serde_json::json;
use sse_event::{KbRef, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::approval::{ApprovalGate, Decision, GateKind};
use crate::artifact::{self, EditTarget};
use crate::engine::turn::ToolLoop;
use crate::entity::{
    classify_attachment, new_id, Agent, ApprovalStatus, Attachment, AttachmentKind, HitlApproval,
    McpServer, MessageMetadata, ProposalStatus, ProviderConfig, Session, SessionBinding,
    StoredMessage, ToolDefinition, ToolProposal,
};
use crate::error::EngineError;
use crate::mcp::McpToolbox;
use crate::memory::{memory_injection_block, Reflector, MEMORY_CAP};
use crate::message::{ChatMessage, ContentPart, MessageContent, Role};
use crate::provider::{ChatProvider, ToolSchema};
use crate::rag::{HashEmbedder, IndexKey, RagService};
use crate::store::SqliteStore;
use crate::tools::{tool_to_schema, DynamicToolsets, ToolExecutor};
use env_config::RuntimeSettings;

/// Event channel capacity per turn.
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Session-RAG hits injected per turn.
const SESSION_RAG_TOP_K: usize = 5;
/// Per-KB hits injected per turn.
const KB_RAG_TOP_K: usize = 3;

/// Sending half of a turn's event stream. Emission to a closed receiver is
/// silently dropped: closing the stream stops delivery, never the turn.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, ReceiverStream::new(rx))
    }

    pub async fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Pull side of a turn's event stream.
pub type EventStream = ReceiverStream<StreamEvent>;

/// One inbound attachment: a data URI plus identity.
#[derive(Clone, Debug)]
pub struct IncomingAttachment {
    pub filename: String,
    pub media_type: String,
    /// `data:<media>;base64,<payload>` as sent by clients.
    pub data: String,
}

/// One chat turn request.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    pub attachments: Vec<IncomingAttachment>,
}

/// Everything needed to run one agent.
pub struct AgentResources {
    pub agent: Agent,
    pub provider_record: ProviderConfig,
    pub provider: Arc<dyn ChatProvider>,
    pub tools: Vec<ToolSchema>,
    pub hitl_tools: HashSet<String>,
    pub mcp_servers: Vec<McpServer>,
}

/// Builds a provider adapter from its stored record. Swappable so tests and
/// embedders can inject scripted providers.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderConfig, Option<&str>) -> Arc<dyn ChatProvider> + Send + Sync>;

/// The engine and its shared resources.
pub struct StreamEngine {
    store: Arc<SqliteStore>,
    gate: Arc<ApprovalGate>,
    dynamic: Arc<DynamicToolsets>,
    executor: Arc<ToolExecutor>,
    rag: Arc<RagService>,
    settings: RuntimeSettings,
    provider_factory: ProviderFactory,
}

impl StreamEngine {
    /// Builds an engine with the default (offline) embedder for RAG. Swap it
    /// with [`with_rag`](Self::with_rag) for OpenAI embeddings.
    pub fn new(store: Arc<SqliteStore>, settings: RuntimeSettings) -> Self {
        let executor = Arc::new(ToolExecutor::new(
            store.clone(),
            settings.python_bin.clone(),
            settings.http_tool_timeout,
        ));
        let rag = Arc::new(RagService::new(
            settings.indexes_root.clone(),
            Arc::new(HashEmbedder::default()),
        ));
        let stream_timeout = settings.stream_timeout;
        let health_timeout = settings.health_timeout;
        Self {
            store,
            gate: Arc::new(ApprovalGate::new()),
            dynamic: Arc::new(DynamicToolsets::new()),
            executor,
            rag,
            settings,
            provider_factory: Arc::new(move |config, model_override| {
                crate::provider::factory::build_provider_with_timeouts(
                    config,
                    model_override,
                    stream_timeout,
                    health_timeout,
                )
            }),
        }
    }

    pub fn with_rag(mut self, rag: Arc<RagService>) -> Self {
        self.rag = rag;
        self
    }

    /// Replaces how provider adapters are built (tests, custom gateways).
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn rag(&self) -> &Arc<RagService> {
        &self.rag
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub(crate) fn dynamic(&self) -> &Arc<DynamicToolsets> {
        &self.dynamic
    }

    pub(crate) fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// Process-start recovery: deny/reject pending rows left by a prior run.
    pub async fn recover(&self) -> Result<(usize, usize), EngineError> {
        Ok(self.store.recover_pending().await?)
    }

    /// Loads an agent and its provider, tools, and MCP servers.
    pub async fn load_agent_resources(
        &self,
        agent_id: &str,
    ) -> Result<AgentResources, EngineError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("agent {}", agent_id)))?;
        let provider_record = self
            .store
            .get_provider(&agent.provider_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("provider {}", agent.provider_id)))?;
        let provider = (self.provider_factory)(&provider_record, agent.model_id.as_deref());

        let defs: Vec<ToolDefinition> = self.store.get_tools_by_ids(&agent.tool_ids).await?;
        let hitl_tools: HashSet<String> = defs
            .iter()
            .filter(|d| d.requires_confirmation)
            .map(|d| d.name.clone())
            .collect();
        let tools: Vec<ToolSchema> = defs.iter().map(tool_to_schema).collect();

        let mut mcp_servers = Vec::new();
        for id in &agent.mcp_server_ids {
            match self.store.get_mcp_server(id).await? {
                Some(server) => mcp_servers.push(server),
                None => warn!(server = %id, "agent references unknown MCP server"),
            }
        }

        Ok(AgentResources {
            agent,
            provider_record,
            provider,
            tools,
            hitl_tools,
            mcp_servers,
        })
    }

    /// Runs one chat turn. Validation errors surface as `Err`; everything
    /// after that is reported on the stream.
    pub async fn chat_turn(&self, request: TurnRequest) -> Result<EventStream, EngineError> {
        let session = self
            .store
            .get_session(&request.session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session {}", request.session_id)))?;
        if session.owner_id != request.user_id {
            return Err(EngineError::Authorization(
                "session does not belong to caller".into(),
            ));
        }

        let past = self.store.list_messages(&session.id).await?;
        let mut messages: Vec<ChatMessage> = past
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        let history_texts: Vec<String> = past
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.text())
            .collect();

        // Attachments: images become content parts, documents feed session RAG.
        let (image_parts, attachment_ids) = self
            .process_attachments(&session, &request.attachments)
            .await;

        let user_row = StoredMessage {
            id: new_id(),
            session_id: session.id.clone(),
            role: Role::User,
            content: MessageContent::Text(request.message.clone()),
            agent_id: None,
            reasoning: None,
            metadata: MessageMetadata::default(),
            attachment_ids: if attachment_ids.is_empty() {
                None
            } else {
                Some(attachment_ids)
            },
            rating: None,
            created_at: Utc::now(),
        };
        self.store.insert_message(&user_row).await?;

        let edit_target = artifact::extract_edit_target(&request.message);

        match session.binding.clone() {
            SessionBinding::Team(team_id) => {
                let (user_message, _, _) = self
                    .build_user_message(&request, &session, &[], image_parts, &past)
                    .await;
                messages.push(user_message);
                self.team_turn(session, team_id, messages, request, edit_target, history_texts)
                    .await
            }
            SessionBinding::Agent(agent_id) => {
                let resources = self.load_agent_resources(&agent_id).await?;

                // Background reflection for the latest unprocessed session.
                if let Ok(Some(prior)) = self
                    .store
                    .latest_unprocessed_session(&agent_id, &request.user_id, &session.id)
                    .await
                {
                    let reflector = Reflector::new(self.store.clone());
                    let provider = resources.provider.clone();
                    let agent_id = agent_id.clone();
                    let user_id = request.user_id.clone();
                    tokio::spawn(async move {
                        reflector
                            .reflect(&agent_id, &user_id, &prior.id, provider)
                            .await;
                    });
                }

                let (user_message, kb_used, kb_unindexed) = self
                    .build_user_message(
                        &request,
                        &session,
                        &resources.agent.knowledge_base_ids,
                        image_parts,
                        &past,
                    )
                    .await;
                messages.push(user_message);

                let memories = self
                    .store
                    .list_memories(&agent_id, &request.user_id, Some(MEMORY_CAP))
                    .await
                    .unwrap_or_default();
                let system_prompt = format!(
                    "{}{}{}{}",
                    resources.agent.system_prompt,
                    memory_injection_block(&memories),
                    prompts::ARTIFACT_SYSTEM_HINT,
                    build_artifact_context(&history_texts),
                );

                let (sink, stream) = EventSink::channel();
                self.spawn_agent_turn(
                    session,
                    resources,
                    messages,
                    system_prompt,
                    edit_target,
                    history_texts,
                    kb_used,
                    kb_unindexed,
                    sink,
                );
                Ok(stream)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_agent_turn(
        &self,
        session: Session,
        resources: AgentResources,
        mut messages: Vec<ChatMessage>,
        system_prompt: String,
        edit_target: Option<EditTarget>,
        history_texts: Vec<String>,
        kb_used: Vec<KbRef>,
        kb_unindexed: Vec<KbRef>,
        sink: EventSink,
    ) {
        let store = self.store.clone();
        let gate = self.gate.clone();
        let dynamic = self.dynamic.clone();
        let executor = self.executor.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let started = Instant::now();

            // Compaction check before streaming.
            if let Some(event) = context::compact_if_needed(
                &mut messages,
                &resources.provider,
                &store,
                &session.id,
            )
            .await
            {
                sink.emit(event).await;
            }

            // KB advisory events before the first content delta.
            if !kb_used.is_empty() {
                sink.emit(StreamEvent::KbContext { kbs: kb_used }).await;
            }
            if !kb_unindexed.is_empty() {
                sink.emit(StreamEvent::KbWarning { kbs: kb_unindexed }).await;
            }

            // MCP connections are opened lazily per request and held for the
            // whole loop; failures only cost that server's tools.
            let toolbox =
                McpToolbox::connect(&resources.mcp_servers, settings.mcp_call_timeout).await;
            let mut static_tools = resources.tools.clone();
            static_tools.extend(toolbox.tool_schemas());

            let owner_id = session.owner_id.clone();
            let provider_kind = resources.provider_record.kind.as_str().to_string();
            let tool_loop = ToolLoop {
                store,
                gate,
                dynamic,
                executor,
                settings,
                provider: resources.provider,
                provider_kind,
                agent: resources.agent,
                session_id: session.id,
                owner_id,
                system_prompt,
                static_tools,
                hitl_tools: resources.hitl_tools,
                toolbox,
                edit_target,
                history_texts,
                started,
            };
            tool_loop.run(messages, &sink).await;
        });
    }

    async fn team_turn(
        &self,
        session: Session,
        team_id: String,
        messages: Vec<ChatMessage>,
        request: TurnRequest,
        edit_target: Option<EditTarget>,
        history_texts: Vec<String>,
    ) -> Result<EventStream, EngineError> {
        let team = self
            .store
            .get_team(&team_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("team {}", team_id)))?;
        let mut resources = Vec::new();
        for agent_id in &team.agent_ids {
            match self.load_agent_resources(agent_id).await {
                Ok(r) => resources.push(r),
                Err(e) => warn!(agent = %agent_id, error = %e, "skipping team agent"),
            }
        }
        if resources.is_empty() {
            return Err(EngineError::Validation(
                "team has no usable agents".into(),
            ));
        }

        team::run_team_turn(
            self,
            team,
            resources,
            session,
            messages,
            request.message,
            edit_target,
            history_texts,
        )
        .await
    }

    /// Builds the outgoing user message with RAG context, the expanded edit
    /// intent, and any image parts. Returns `(message, used_kbs, unindexed)`.
    async fn build_user_message(
        &self,
        request: &TurnRequest,
        session: &Session,
        kb_ids: &[String],
        image_parts: Vec<ContentPart>,
        past: &[StoredMessage],
    ) -> (ChatMessage, Vec<KbRef>, Vec<KbRef>) {
        let mut message_text = request.message.clone();

        // Expand the edit intent with the current artifact content so the
        // model can produce a patch instead of a rewrite.
        if let Some(target) = artifact::extract_edit_target(&message_text) {
            let assistant_texts: Vec<String> = past
                .iter()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| m.content.text())
                .collect();
            if let Some(current) = artifact::latest_artifact_content(&assistant_texts, &target.id)
            {
                let instruction = artifact::strip_edit_prefix(&message_text);
                message_text = format!(
                    "[EDIT ARTIFACT id=\"{}\" title=\"{}\" type=\"{}\"]\n\nCurrent content:\n```{}\n{}\n```\n\n{}",
                    target.id,
                    target.title,
                    target.artifact_type,
                    target.artifact_type,
                    current,
                    instruction.trim(),
                );
            }
        }

        let mut rag_context = String::new();

        // Session-level RAG: documents uploaded in this session.
        let session_key = IndexKey::Session(session.id.clone());
        if self.rag.has_index(&session_key) {
            let hits = self
                .rag
                .search(&session_key, &message_text, SESSION_RAG_TOP_K)
                .await;
            if !hits.is_empty() {
                let chunks: Vec<String> = hits
                    .iter()
                    .map(|h| {
                        let name = h.metadata["filename"].as_str().unwrap_or("document");
                        format!("[From {}]:\n{}", name, h.text)
                    })
                    .collect();
                rag_context.push_str(&format!(
                    "\n\nRelevant context from uploaded documents:\n{}",
                    chunks.join("\n\n")
                ));
            }
        }

        // Knowledge-base RAG with advisory metadata.
        let mut used = Vec::new();
        let mut unindexed = Vec::new();
        let mut kb_chunks = Vec::new();
        for kb_id in kb_ids {
            let name = self
                .store
                .get_knowledge_base(kb_id)
                .await
                .ok()
                .flatten()
                .map(|kb| kb.name)
                .unwrap_or_else(|| kb_id.clone());
            let key = IndexKey::Kb(kb_id.clone());
            if !self.rag.has_index(&key) {
                unindexed.push(KbRef {
                    id: kb_id.clone(),
                    name,
                });
                continue;
            }
            let hits = self.rag.search(&key, &message_text, KB_RAG_TOP_K).await;
            if hits.is_empty() {
                continue;
            }
            used.push(KbRef {
                id: kb_id.clone(),
                name: name.clone(),
            });
            for h in hits {
                let doc = h.metadata["doc_name"].as_str().unwrap_or(&name).to_string();
                kb_chunks.push(format!("[KB:{}]:\n{}", doc, h.text));
            }
        }
        if !kb_chunks.is_empty() {
            rag_context.push_str(&format!(
                "\n\nRelevant context from knowledge bases:\n{}",
                kb_chunks.join("\n\n")
            ));
        }

        let message = if !image_parts.is_empty() {
            let mut parts = vec![ContentPart::Text {
                text: format!("{}{}", message_text, rag_context),
            }];
            parts.extend(image_parts);
            ChatMessage::user_parts(parts)
        } else {
            ChatMessage::user(format!("{}{}", message_text, rag_context))
        };
        (message, used, unindexed)
    }

    /// Stores attachments, returning image content parts and row ids.
    async fn process_attachments(
        &self,
        session: &Session,
        attachments: &[IncomingAttachment],
    ) -> (Vec<ContentPart>, Vec<String>) {
        let mut image_parts = Vec::new();
        let mut ids = Vec::new();
        for att in attachments {
            let Some(bytes) = decode_data_uri(&att.data) else {
                warn!(file = %att.filename, "failed to decode attachment data URI");
                continue;
            };
            let kind = classify_attachment(&att.media_type, &att.filename);

            let storage_handle = match self.save_upload(&session.id, &att.filename, &bytes) {
                Ok(path) => path,
                Err(e) => {
                    warn!(file = %att.filename, error = %e, "failed to store upload");
                    continue;
                }
            };
            let record = Attachment {
                id: new_id(),
                session_id: session.id.clone(),
                owner_id: session.owner_id.clone(),
                filename: att.filename.clone(),
                media_type: att.media_type.clone(),
                kind,
                storage_handle,
                created_at: Utc::now(),
            };
            if let Err(e) = self.store.put_attachment(&record).await {
                warn!(file = %att.filename, error = %e, "failed to persist attachment row");
                continue;
            }
            ids.push(record.id);

            match kind {
                AttachmentKind::Image => image_parts.push(ContentPart::ImageUrl {
                    image_url: att.data.clone(),
                }),
                AttachmentKind::Document => {
                    let text =
                        crate::rag::extract_text(&bytes, &att.filename, &att.media_type);
                    if !text.trim().is_empty() {
                        let key = IndexKey::Session(session.id.clone());
                        let meta = json!({
                            "filename": att.filename,
                            "media_type": att.media_type,
                        });
                        if let Err(e) = self.rag.index_document(&key, &text, meta).await {
                            warn!(file = %att.filename, error = %e, "failed to index document");
                        }
                    }
                }
            }
        }
        (image_parts, ids)
    }

    fn save_upload(
        &self,
        session_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, String> {
        let dir = self.settings.uploads_root.join(session_id);
        std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
        let safe_name: String = filename
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let path = dir.join(format!("{}_{}", new_id(), safe_name));
        std::fs::write(&path, bytes).map_err(|e| e.to_string())?;
        Ok(path.to_string_lossy().into_owned())
    }

    /// Router entry: resolve a HITL approval. The row transitions exactly
    /// once; a second call (or an unknown id) is NotFound, surfaced as 404.
    pub async fn resolve_hitl(
        &self,
        user_id: &str,
        approval_id: &str,
        approve: bool,
    ) -> Result<HitlApproval, EngineError> {
        let approval = self
            .store
            .get_hitl_approval(approval_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval {}", approval_id)))?;
        let session = self
            .store
            .get_session(&approval.session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session {}", approval.session_id)))?;
        if session.owner_id != user_id {
            return Err(EngineError::Authorization(
                "approval does not belong to caller".into(),
            ));
        }
        let status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        let row = self.store.resolve_hitl_approval(approval_id, status).await?;
        let decision = if approve {
            Decision::Approved
        } else {
            Decision::Denied
        };
        let delivered = self.gate.resolve(
            GateKind::Hitl,
            &row.session_id,
            &row.tool_call_id,
            decision,
        );
        debug!(approval = %approval_id, approve, delivered, "hitl resolved");
        Ok(row)
    }

    /// Router entry: resolve a tool proposal. Approval upserts the tool by
    /// `(owner, name)` and unlocks it for the rest of the session.
    pub async fn resolve_proposal(
        &self,
        user_id: &str,
        proposal_id: &str,
        approve: bool,
    ) -> Result<ToolProposal, EngineError> {
        let proposal = self
            .store
            .get_tool_proposal(proposal_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("proposal {}", proposal_id)))?;
        let session = self
            .store
            .get_session(&proposal.session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session {}", proposal.session_id)))?;
        if session.owner_id != user_id {
            return Err(EngineError::Authorization(
                "proposal does not belong to caller".into(),
            ));
        }

        let mut tool_id = None;
        if approve {
            let tool = ToolDefinition {
                id: new_id(),
                owner_id: session.owner_id.clone(),
                name: proposal.name.clone(),
                description: proposal.description.clone(),
                parameters: proposal.parameters.clone(),
                handler_kind: proposal.handler_kind,
                handler_config: proposal
                    .handler_config
                    .clone()
                    .unwrap_or_else(|| json!({})),
                requires_confirmation: false,
                is_active: true,
            };
            let stored = self.store.upsert_tool_by_name(&tool).await?;
            tool_id = Some(stored.id);
            self.dynamic.add(&proposal.session_id, &proposal.name);
        }

        let status = if approve {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        let row = self
            .store
            .resolve_tool_proposal(proposal_id, status, tool_id)
            .await?;
        let decision = if approve {
            Decision::Approved
        } else {
            Decision::Denied
        };
        let delivered = self.gate.resolve(
            GateKind::Proposal,
            &row.session_id,
            &row.tool_call_id,
            decision,
        );
        debug!(proposal = %proposal_id, approve, delivered, "proposal resolved");
        Ok(row)
    }

    /// Deletes a session. If it is bound to an agent and still unprocessed,
    /// one final best-effort memory reflection runs first.
    pub async fn delete_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), EngineError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("session {}", session_id)))?;
        if session.owner_id != user_id {
            return Err(EngineError::Authorization(
                "session does not belong to caller".into(),
            ));
        }
        if !session.memory_processed {
            if let SessionBinding::Agent(agent_id) = &session.binding {
                if let Ok(resources) = self.load_agent_resources(agent_id).await {
                    Reflector::new(self.store.clone())
                        .reflect(agent_id, user_id, session_id, resources.provider)
                        .await;
                }
            }
        }
        self.rag
            .delete_index(&IndexKey::Session(session_id.to_string()));
        self.dynamic.clear_session(session_id);
        self.store.delete_session(session_id).await?;
        Ok(())
    }
}

/// `## EXISTING ARTIFACTS` context block so the model reuses ids.
fn build_artifact_context(assistant_texts: &[String]) -> String {
    let mut seen: Vec<(String, String)> = Vec::new();
    for text in assistant_texts {
        if !text.contains("<artifact") {
            continue;
        }
        for artifact in artifact::scan_artifacts(text, None) {
            match seen.iter_mut().find(|(id, _)| *id == artifact.id) {
                Some(entry) => entry.1 = artifact.title,
                None => seen.push((artifact.id, artifact.title)),
            }
        }
    }
    if seen.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "## EXISTING ARTIFACTS — YOU MUST REUSE THESE IDs FOR ANY EDITS".to_string(),
        "The following artifacts already exist in this session.".to_string(),
        "If the user asks you to change, update, improve, or build on any of them, use the EXACT id shown below. Do NOT invent a new id.".to_string(),
    ];
    for (id, title) in seen {
        lines.push(format!(
            "- id=\"{}\"  title=\"{}\"  ← USE THIS id to update this artifact",
            id, title
        ));
    }
    format!("\n{}\n", lines.join("\n"))
}

/// Decodes a `data:<media>;base64,<payload>` URI. Bare base64 is accepted
/// for tolerant clients.
fn decode_data_uri(data: &str) -> Option<Vec<u8>> {
    let payload = match data.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => payload,
        _ => data,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: artifact context lists ids with latest titles.
    #[test]
    fn artifact_context_lists_ids() {
        let history = vec![
            r#"<artifact id="lp" title="Old" type="html">a</artifact>"#.to_string(),
            r#"<artifact id="lp" title="Landing" type="html">b</artifact>"#.to_string(),
        ];
        let block = build_artifact_context(&history);
        assert!(block.contains("id=\"lp\""));
        assert!(block.contains("title=\"Landing\""));
        assert!(!block.contains("title=\"Old\""));
        assert!(build_artifact_context(&[]).is_empty());
    }

    /// **Scenario**: data URIs decode; bare base64 is tolerated; garbage is
    /// rejected.
    #[test]
    fn data_uri_decoding() {
        assert_eq!(
            decode_data_uri("data:text/plain;base64,aGVsbG8=").unwrap(),
            b"hello"
        );
        assert_eq!(decode_data_uri("aGVsbG8=").unwrap(), b"hello");
        assert!(decode_data_uri("data:text/plain;base64,!!!").is_none());
    }
}
