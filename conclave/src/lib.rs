//! # Conclave
//!
//! A multi-tenant control plane for LLM agents. Clients submit a
//! conversation turn against a persistent **session** bound to an agent or
//! a team and receive a live stream of structured events: text and
//! reasoning deltas, tool invocations and results, approval prompts,
//! context summaries, and a terminal message record. Agents also compose
//! into **workflows** — DAGs of steps — executed ad hoc or on a cron
//! schedule.
//!
//! ## Subsystems
//!
//! - [`provider`]: one capability ([`ChatProvider`]) over the OpenAI,
//!   Anthropic, Gemini, and Ollama wire protocols; streaming returns a pull
//!   sequence of tagged [`StreamChunk`]s with usage normalized to
//!   input/output tokens and inline `<think>` reasoning extracted.
//! - [`tools`]: python/http tool handlers behind [`ToolExecutor`]; every
//!   failure feeds back to the model as `{"error": ...}` JSON.
//! - [`mcp`]: stdio and Streamable-HTTP sessions to external tool servers;
//!   discovered tools are exposed as `mcp__<server>__<tool>`.
//! - [`rag`]: per-session and per-KB chunked vector indexes persisted to
//!   disk, with flat and (feature `hnsw`) approximate-graph backends.
//! - [`memory`]: background reflection distilling finished sessions into
//!   durable `(agent, user, key)` facts, capped with low-confidence
//!   eviction.
//! - [`approval`]: the single rendezvous primitive behind both HITL tool
//!   approvals and dynamic tool-creation proposals.
//! - [`engine`]: the stream engine — compaction, RAG and memory injection,
//!   the tool loop, inline element detection (plans, previews, artifacts),
//!   team dispatch, and trace spans with message back-fill.
//! - [`workflow`]: sequential and parallel-DAG execution with condition
//!   routing and mirrored run snapshots.
//! - [`schedule`]: the cron engine firing workflows on 5-field expressions.
//! - [`store`]: SQLite persistence for every entity, including the startup
//!   recovery that auto-denies stale pending approvals.
//!
//! Event taxonomy and SSE framing live in the `sse-event` crate;
//! environment/TOML configuration in `config` (imported as `env_config`).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conclave::engine::{StreamEngine, TurnRequest};
//! use conclave::store::SqliteStore;
//! use env_config::RuntimeSettings;
//! use tokio_stream::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::new("conclave.db")?);
//! let engine = StreamEngine::new(store, RuntimeSettings::from_env());
//! engine.recover().await?;
//!
//! let mut events = engine
//!     .chat_turn(TurnRequest {
//!         session_id: "sess-1".into(),
//!         user_id: "user-1".into(),
//!         message: "hello".into(),
//!         attachments: vec![],
//!     })
//!     .await?;
//! while let Some(event) = events.next().await {
//!     print!("{}", sse_event::sse_frame(&event));
//! }
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod artifact;
pub mod engine;
pub mod entity;
pub mod error;
pub mod mcp;
pub mod memory;
pub mod message;
pub mod provider;
pub mod rag;
pub mod schedule;
pub mod store;
pub mod tools;
pub mod workflow;

pub use approval::{ApprovalGate, Decision, GateKind, PendingDecision, WaitOutcome};
pub use artifact::{EditTarget, FoundArtifact};
pub use engine::{
    AgentResources, EventSink, EventStream, IncomingAttachment, ProviderFactory, StreamEngine,
    TurnRequest,
};
pub use entity::{
    Agent, AgentMemory, ApprovalStatus, Attachment, AttachmentKind, HandlerKind, HitlApproval,
    KbDocument, KnowledgeBase, McpServer, McpTransport, MemoryCategory, MessageMetadata,
    NodeKind, Permissions, ProposalStatus, ProviderConfig, ProviderKind, RunStatus,
    SamplingConfig, Session, SessionBinding, SpanKind, StoredMessage, Team, TeamMode,
    ToolDefinition, ToolProposal, TraceSpan, User, UserRole, Workflow, WorkflowRun,
    WorkflowSchedule, WorkflowStep,
};
pub use error::EngineError;
pub use mcp::{format_mcp_name, is_mcp_name, parse_mcp_name, McpError, McpToolbox};
pub use memory::{Reflector, MEMORY_CAP};
pub use message::{ChatMessage, ContentPart, MessageContent, Role};
pub use provider::{
    build_provider, build_provider_with_timeouts, AnthropicProvider, ChatProvider, ChunkStream,
    GeminiProvider, MockProvider,
    ModelInfo, OllamaProvider, OpenAiProvider, ProviderError, ProviderResponse, StreamChunk,
    TokenUsage, ToolCallRequest, ToolSchema,
};
pub use rag::{Embedder, HashEmbedder, IndexKey, OpenAiEmbedder, RagService, SearchHit};
pub use schedule::{next_fire, parse_cron, Scheduler};
pub use store::{SqliteStore, StoreError};
pub use tools::{DynamicToolsets, ToolExecutor, CREATE_TOOL_NAME};
pub use workflow::WorkflowExecutor;

/// When running `cargo test -p conclave`, initializes tracing from
/// `RUST_LOG` so unit tests can print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
