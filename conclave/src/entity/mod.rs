//! Persisted data model.
//!
//! Entities mirror the store tables one-to-one. Ids are opaque strings
//! (UUID v4 unless imported); timestamps are UTC. CRUD surfaces live in
//! [`crate::store`]; this module is data plus small invariant helpers.
//!
//! # Main types
//!
//! - [`Agent`], [`Team`], [`ProviderConfig`]: what a session can be bound to
//!   and how its LLM is reached.
//! - [`Session`], [`StoredMessage`], [`Attachment`]: one durable conversation.
//! - [`ToolDefinition`], [`McpServer`]: callable capabilities.
//! - [`AgentMemory`]: durable facts distilled from finished sessions.
//! - [`HitlApproval`], [`ToolProposal`]: human-gated decisions.
//! - [`TraceSpan`]: one recorded LLM/tool/MCP/workflow-step activity.
//! - Workflow types live in [`workflow`](crate::entity::workflow).

pub mod workflow;

pub use workflow::{
    NodeKind, RunStatus, StepResult, Workflow, WorkflowRun, WorkflowSchedule, WorkflowStep,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generates a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Account role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

/// Per-user capability flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub create_agents: bool,
    #[serde(default)]
    pub create_tools: bool,
    #[serde(default)]
    pub create_teams: bool,
    #[serde(default)]
    pub create_workflows: bool,
    #[serde(default)]
    pub create_knowledge_bases: bool,
    #[serde(default)]
    pub manage_providers: bool,
    #[serde(default)]
    pub manage_mcp_servers: bool,
}

/// A tenant account. Credential verification is the router's concern; the
/// engine only needs the id for ownership scoping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub credentials_hash: String,
    pub role: UserRole,
    pub permissions: Permissions,
    pub created_at: DateTime<Utc>,
}

/// Supported provider wire protocols.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Google,
    Ollama,
    Openrouter,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Custom => "custom",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::Openai),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            "ollama" => Ok(Self::Ollama),
            "openrouter" => Ok(Self::Openrouter),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown provider type: {}", other)),
        }
    }
}

/// Sampling knobs forwarded to the provider when set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// A configured upstream LLM endpoint. `api_key` is stored encrypted by the
/// (out-of-scope) router; the engine receives it decrypted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub owner_id: String,
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

/// An agent definition: prompt, provider, and referenced capabilities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Shown to the team router when picking an agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    pub provider_id: String,
    /// Overrides the provider's default model when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub mcp_server_ids: Vec<String>,
    #[serde(default)]
    pub knowledge_base_ids: Vec<String>,
    /// Tool names that always require human approval for this agent.
    #[serde(default)]
    pub hitl_tool_names: Vec<String>,
    #[serde(default)]
    pub allow_tool_creation: bool,
    #[serde(default)]
    pub config: Value,
}

/// Team dispatch mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamMode {
    Coordinate,
    Route,
    Collaborate,
}

/// An ordered group of agents answering as one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub mode: TeamMode,
    pub agent_ids: Vec<String>,
}

/// Tool handler kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Python,
    Http,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Python => "python",
            HandlerKind::Http => "http",
        }
    }
}

/// A stored tool definition. Name is unique per owner; proposal approval
/// upserts on `(owner_id, name)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    pub parameters: Value,
    pub handler_kind: HandlerKind,
    /// `{code}` for python, `{url, method, headers}` for http.
    pub handler_config: Value,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// MCP transport configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: std::collections::HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: std::collections::HashMap<String, String>,
    },
}

/// A configured external MCP tool server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct McpServer {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransport,
}

/// What a session is bound to. Immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "entity_id", rename_all = "snake_case")]
pub enum SessionBinding {
    Agent(String),
    Team(String),
}

/// A durable conversation bound to one agent or team.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    #[serde(flatten)]
    pub binding: SessionBinding,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    #[serde(default)]
    pub memory_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata recorded on a persisted assistant message.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    /// Set on partial messages persisted after a mid-stream failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set on the synthetic system row written by context compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_summarized: Option<usize>,
    /// Team-mode replies record how they were produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributing_agents: Option<Value>,
}

/// One persisted message row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: crate::message::Role,
    pub content: crate::message::MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Reasoning trace blocks (`[{type: "thinking", content}]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(default)]
    pub metadata: MessageMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i8>,
    pub created_at: DateTime<Utc>,
}

/// Attachment classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Document,
}

/// Classifies an upload from its media type and filename.
pub fn classify_attachment(media_type: &str, filename: &str) -> AttachmentKind {
    let lower = filename.to_lowercase();
    if media_type.starts_with("image/")
        || [".png", ".jpg", ".jpeg", ".gif", ".webp"]
            .iter()
            .any(|ext| lower.ends_with(ext))
    {
        AttachmentKind::Image
    } else {
        AttachmentKind::Document
    }
}

/// A stored upload referenced from a message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub session_id: String,
    pub owner_id: String,
    pub filename: String,
    pub media_type: String,
    pub kind: AttachmentKind,
    /// Opaque storage handle (filesystem path under the uploads root, or an
    /// object-store id).
    pub storage_handle: String,
    pub created_at: DateTime<Utc>,
}

/// A named collection of indexed documents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub shared: bool,
}

/// Kind of stored KB document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbDocumentKind {
    Text,
    File,
}

/// One document inside a knowledge base.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KbDocument {
    pub id: String,
    pub kb_id: String,
    pub kind: KbDocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_handle: Option<String>,
    #[serde(default)]
    pub indexed: bool,
}

/// Memory fact category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Preference,
    Context,
    Decision,
    Correction,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Preference => "preference",
            MemoryCategory::Context => "context",
            MemoryCategory::Decision => "decision",
            MemoryCategory::Correction => "correction",
        }
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preference" => Ok(Self::Preference),
            "context" => Ok(Self::Context),
            "decision" => Ok(Self::Decision),
            "correction" => Ok(Self::Correction),
            other => Err(format!("unknown memory category: {}", other)),
        }
    }
}

/// A durable fact about one user, scoped to one agent. Unique by
/// `(agent_id, user_id, key)`; later facts overwrite older ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentMemory {
    pub agent_id: String,
    pub user_id: String,
    pub key: String,
    pub value: String,
    pub category: MemoryCategory,
    /// In `[0, 1]`; low-confidence facts are evicted first.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// HITL approval status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

/// A pending (or resolved) human decision about one gated tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HitlApproval {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    /// Arguments JSON as produced by the model.
    pub tool_arguments: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

/// Tool proposal status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
}

/// A model-initiated request to create a new tool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolProposal {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub handler_kind: HandlerKind,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_config: Option<Value>,
    pub status: ProposalStatus,
    /// Set when approval created/updated a tool definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Span kind for trace records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    LlmCall,
    ToolCall,
    McpCall,
    WorkflowStep,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::LlmCall => "llm_call",
            SpanKind::ToolCall => "tool_call",
            SpanKind::McpCall => "mcp_call",
            SpanKind::WorkflowStep => "workflow_step",
        }
    }
}

/// One recorded activity: an LLM round, a tool or MCP call, or a workflow
/// step. `sequence` is contiguous from 0 within one generator invocation;
/// `message_id` is back-filled after the assistant message is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceSpan {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub kind: SpanKind,
    pub name: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    pub duration_ms: u64,
    pub status: String,
    /// First 500 chars of the input.
    pub input_preview: String,
    /// First 500 chars of the output.
    pub output_preview: String,
    pub sequence: u32,
    pub round_number: u32,
    pub created_at: DateTime<Utc>,
}
