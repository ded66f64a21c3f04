//! Shared fixtures: a seeded store, an engine whose provider factory hands
//! back a scripted mock, and event-collection helpers.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::StreamExt;

use conclave::engine::{EventStream, StreamEngine};
use conclave::entity::{new_id, SamplingConfig};
use conclave::provider::{ChatProvider, MockProvider};
use conclave::{
    Agent, ProviderConfig, ProviderKind, Session, SessionBinding, SqliteStore,
};
use env_config::RuntimeSettings;
use sse_event::StreamEvent;

pub struct Fixture {
    pub _dir: tempfile::TempDir,
    pub store: Arc<SqliteStore>,
    pub engine: Arc<StreamEngine>,
    pub mock: Arc<MockProvider>,
    pub session_id: String,
    pub agent_id: String,
    pub user_id: String,
}

pub fn test_settings(dir: &tempfile::TempDir) -> RuntimeSettings {
    RuntimeSettings {
        database_path: dir.path().join("conclave.db"),
        uploads_root: dir.path().join("uploads"),
        indexes_root: dir.path().join("indexes"),
        python_bin: "python3".into(),
        stream_timeout: Duration::from_secs(120),
        health_timeout: Duration::from_secs(15),
        mcp_call_timeout: Duration::from_secs(30),
        http_tool_timeout: Duration::from_secs(30),
        approval_timeout: Duration::from_secs(600),
        max_tool_rounds: 10,
    }
}

/// Builds a store seeded with one provider, one agent, and one session, and
/// an engine that always hands out `mock` as the provider adapter.
pub async fn fixture(model: &str) -> Fixture {
    fixture_with(model, |agent| agent).await
}

pub async fn fixture_with(
    model: &str,
    customize: impl FnOnce(Agent) -> Agent,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new(dir.path().join("conclave.db")).unwrap());
    let mock = Arc::new(MockProvider::new(model));

    let user_id = "user-1".to_string();
    let provider_id = new_id();
    store
        .put_provider(&ProviderConfig {
            id: provider_id.clone(),
            owner_id: user_id.clone(),
            kind: ProviderKind::Openai,
            base_url: None,
            api_key: Some("test-key".into()),
            model_id: model.to_string(),
            sampling: SamplingConfig::default(),
        })
        .await
        .unwrap();

    let agent_id = new_id();
    let agent = customize(Agent {
        id: agent_id.clone(),
        owner_id: user_id.clone(),
        name: "Assistant".into(),
        description: None,
        system_prompt: "You are helpful.".into(),
        provider_id,
        model_id: None,
        tool_ids: vec![],
        mcp_server_ids: vec![],
        knowledge_base_ids: vec![],
        hitl_tool_names: vec![],
        allow_tool_creation: false,
        config: serde_json::json!({}),
    });
    store.put_agent(&agent).await.unwrap();

    let session_id = new_id();
    store
        .put_session(&Session {
            id: session_id.clone(),
            owner_id: user_id.clone(),
            binding: SessionBinding::Agent(agent_id.clone()),
            title: String::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            memory_processed: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let factory_mock: Arc<MockProvider> = mock.clone();
    let engine = Arc::new(
        StreamEngine::new(store.clone(), test_settings(&dir)).with_provider_factory(Arc::new(
            move |_config, _model| factory_mock.clone() as Arc<dyn ChatProvider>,
        )),
    );

    Fixture {
        _dir: dir,
        store,
        engine,
        mock,
        session_id,
        agent_id,
        user_id,
    }
}

/// Drains the stream to completion (done or error), bounded by a timeout.
pub async fn collect_all(mut stream: EventStream) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let next = tokio::time::timeout_at(deadline, stream.next()).await;
        match next {
            Ok(Some(event)) => {
                let terminal = matches!(event, StreamEvent::Done | StreamEvent::Error { .. });
                events.push(event);
                if terminal {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for events; got {:?}", events),
        }
    }
    events
}

/// Reads events until `pred` matches, returning everything seen so far.
pub async fn collect_until(
    stream: &mut EventStream,
    pred: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let next = tokio::time::timeout_at(deadline, stream.next()).await;
        match next {
            Ok(Some(event)) => {
                let hit = pred(&event);
                events.push(event);
                if hit {
                    return events;
                }
            }
            Ok(None) => panic!("stream ended before predicate matched; got {:?}", events),
            Err(_) => panic!("timed out before predicate matched; got {:?}", events),
        }
    }
}

pub fn event_names(events: &[StreamEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}
