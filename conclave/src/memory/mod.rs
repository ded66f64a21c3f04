//! Background distillation of finished sessions into durable agent memories.
//!
//! Triggered when a new request arrives for an agent that has an earlier
//! unprocessed session, and as a best-effort final pass on session deletion.
//! The session is marked processed *first* so concurrent triggers cannot
//! double-reflect. All failures log and return — reflection never surfaces
//! to the requesting user.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::artifact::strip_artifact_blocks;
use crate::engine::prompts::MEMORY_REFLECTION_PROMPT;
use crate::entity::{AgentMemory, MemoryCategory};
use crate::message::Role;
use crate::provider::ChatProvider;
use crate::store::SqliteStore;

/// Maximum facts kept per `(agent, user)`.
pub const MEMORY_CAP: usize = 50;
/// Maximum new facts accepted per reflection.
pub const MAX_FACTS_PER_REFLECTION: usize = 5;
/// Messages fed into the reflection transcript.
const TRANSCRIPT_MESSAGES: usize = 40;
/// Per-message transcript cap in characters.
const TRANSCRIPT_CHAR_CAP: usize = 2000;

/// Distills one session into memories.
pub struct Reflector {
    store: Arc<SqliteStore>,
}

impl Reflector {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Runs one reflection pass. Never returns an error to the caller.
    pub async fn reflect(
        &self,
        agent_id: &str,
        user_id: &str,
        session_id: &str,
        provider: Arc<dyn ChatProvider>,
    ) {
        if let Err(e) = self
            .reflect_inner(agent_id, user_id, session_id, provider)
            .await
        {
            warn!(session = session_id, error = %e, "memory reflection failed");
        }
    }

    async fn reflect_inner(
        &self,
        agent_id: &str,
        user_id: &str,
        session_id: &str,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<(), String> {
        // Mark processed immediately to prevent re-processing.
        self.store
            .set_memory_processed(session_id, true)
            .await
            .map_err(|e| e.to_string())?;

        let messages = self
            .store
            .recent_dialogue(session_id, TRANSCRIPT_MESSAGES)
            .await
            .map_err(|e| e.to_string())?;
        if messages.len() < 2 {
            return Ok(());
        }

        let mut transcript_parts = Vec::new();
        for m in &messages {
            let text = m.content.text();
            if text.trim().is_empty() {
                continue;
            }
            let label = match m.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
                _ => continue,
            };
            let cleaned = strip_artifact_blocks(&text);
            if cleaned.is_empty() {
                continue;
            }
            let capped: String = cleaned.chars().take(TRANSCRIPT_CHAR_CAP).collect();
            transcript_parts.push(format!("{}: {}", label, capped));
        }
        let transcript = transcript_parts.join("\n\n");
        if transcript.trim().is_empty() {
            return Ok(());
        }

        let existing = self
            .store
            .list_memories(agent_id, user_id, None)
            .await
            .map_err(|e| e.to_string())?;
        let existing_pairs: Vec<Value> = existing
            .iter()
            .map(|m| serde_json::json!({"key": m.key, "value": m.value}))
            .collect();
        let existing_json =
            serde_json::to_string(&existing_pairs).unwrap_or_else(|_| "[]".to_string());

        let user_prompt = format!(
            "Existing memories (do not duplicate):\n{}\n\nConversation to reflect on:\n{}",
            existing_json, transcript
        );
        let response = provider
            .chat(
                &[crate::message::ChatMessage::user(user_prompt)],
                Some(MEMORY_REFLECTION_PROMPT),
                &[],
            )
            .await
            .map_err(|e| e.to_string())?;

        let extracted = parse_facts(&response.content);
        if extracted.is_empty() {
            return Ok(());
        }

        // Evict low-confidence facts before inserting past the cap.
        let total = self
            .store
            .count_memories(agent_id, user_id)
            .await
            .map_err(|e| e.to_string())?;
        let overflow = (total + extracted.len()).saturating_sub(MEMORY_CAP);
        if overflow > 0 {
            self.store
                .evict_low_confidence(agent_id, user_id, overflow)
                .await
                .map_err(|e| e.to_string())?;
        }

        let stored = extracted.len();
        let now = Utc::now();
        for fact in extracted {
            let memory = AgentMemory {
                agent_id: agent_id.to_string(),
                user_id: user_id.to_string(),
                key: fact.key,
                value: fact.value,
                category: fact.category,
                confidence: fact.confidence,
                source_session_id: Some(session_id.to_string()),
                created_at: now,
                updated_at: now,
            };
            self.store
                .upsert_memory(&memory)
                .await
                .map_err(|e| e.to_string())?;
        }
        info!(
            agent = agent_id,
            session = session_id,
            facts = stored,
            "memory reflection stored facts"
        );
        Ok(())
    }
}

struct ExtractedFact {
    key: String,
    value: String,
    category: MemoryCategory,
    confidence: f64,
}

/// Parses the model's reply into at most [`MAX_FACTS_PER_REFLECTION`] facts.
/// Tolerates markdown code fences around the array; anything else malformed
/// yields no facts.
fn parse_facts(raw: &str) -> Vec<ExtractedFact> {
    let mut text = raw.trim();
    if text.starts_with("```") {
        // Take the fenced body, dropping an optional language hint.
        let inner = text.trim_start_matches("```");
        let inner = inner.strip_prefix("json").unwrap_or(inner);
        text = match inner.find("```") {
            Some(end) => &inner[..end],
            None => inner,
        };
    }
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(text.trim()) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| {
            let key = item.get("key")?.as_str()?.trim().to_string();
            let value = item.get("value")?.as_str()?.trim().to_string();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            let category = item
                .get("category")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .unwrap_or(MemoryCategory::Context);
            let confidence = item
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            Some(ExtractedFact {
                key,
                value,
                category,
                confidence,
            })
        })
        .take(MAX_FACTS_PER_REFLECTION)
        .collect()
}

/// Renders the `## What I know about you:` block for system-prompt
/// injection, newest facts first.
pub fn memory_injection_block(memories: &[AgentMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = memories
        .iter()
        .map(|m| format!("- [{}] {}", m.category.as_str(), m.value))
        .collect();
    format!("\n\n## What I know about you:\n{}", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{MessageMetadata, Session, SessionBinding, StoredMessage};
    use crate::message::MessageContent;
    use crate::provider::MockProvider;

    async fn seeded_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("t.db")).unwrap());
        store
            .put_session(&Session {
                id: "s1".into(),
                owner_id: "u1".into(),
                binding: SessionBinding::Agent("a1".into()),
                title: String::new(),
                total_input_tokens: 0,
                total_output_tokens: 0,
                memory_processed: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        (dir, store)
    }

    async fn add_dialogue(store: &SqliteStore, texts: &[(&str, Role)]) {
        for (i, (text, role)) in texts.iter().enumerate() {
            store
                .insert_message(&StoredMessage {
                    id: crate::entity::new_id(),
                    session_id: "s1".into(),
                    role: *role,
                    content: MessageContent::Text(text.to_string()),
                    agent_id: None,
                    reasoning: None,
                    metadata: MessageMetadata::default(),
                    attachment_ids: None,
                    rating: None,
                    created_at: Utc::now() + chrono::Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }
    }

    /// **Scenario**: a well-formed reflection reply stores facts and marks the
    /// session processed.
    #[tokio::test]
    async fn reflection_stores_facts() {
        let (_dir, store) = seeded_store().await;
        add_dialogue(
            &store,
            &[
                ("I prefer dark mode everywhere", Role::User),
                ("Noted, dark mode it is.", Role::Assistant),
            ],
        )
        .await;

        let provider = Arc::new(MockProvider::with_text(
            "m",
            r#"[{"key": "ui_theme", "value": "prefers dark mode", "confidence": 0.9, "category": "preference"}]"#,
        ));
        Reflector::new(store.clone())
            .reflect("a1", "u1", "s1", provider)
            .await;

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert!(session.memory_processed);
        let facts = store.list_memories("a1", "u1", None).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "ui_theme");
        assert_eq!(facts[0].category, MemoryCategory::Preference);
    }

    /// **Scenario**: fewer than two messages skips the LLM entirely but still
    /// marks processed.
    #[tokio::test]
    async fn short_session_skips_reflection() {
        let (_dir, store) = seeded_store().await;
        add_dialogue(&store, &[("hi", Role::User)]).await;
        let provider = Arc::new(MockProvider::with_text("m", "[]"));
        Reflector::new(store.clone())
            .reflect("a1", "u1", "s1", provider)
            .await;
        assert!(store.get_session("s1").await.unwrap().unwrap().memory_processed);
        assert_eq!(store.count_memories("a1", "u1").await.unwrap(), 0);
    }

    /// **Scenario**: artifact content in the transcript is stripped before the
    /// LLM sees it; a reply quoting artifact ids is still stored verbatim as
    /// the model's fact.
    #[tokio::test]
    async fn artifacts_never_reach_transcript() {
        let (_dir, store) = seeded_store().await;
        add_dialogue(
            &store,
            &[
                ("make a page", Role::User),
                (
                    "<artifact id=\"lp\" title=\"L\" type=\"html\">SECRET_BODY</artifact> done",
                    Role::Assistant,
                ),
            ],
        )
        .await;

        let provider = Arc::new(MockProvider::with_text("m", "[]"));
        let p = provider.clone();
        Reflector::new(store.clone())
            .reflect("a1", "u1", "s1", provider)
            .await;
        let seen = p.last_messages.lock().unwrap().clone();
        assert!(!seen[0].text().contains("SECRET_BODY"));
        assert!(seen[0].text().contains("[artifact content omitted]"));
    }

    /// **Scenario**: fact parsing caps at 5, tolerates fences, defaults
    /// category/confidence, and drops empty keys.
    #[test]
    fn parse_facts_contract() {
        let raw = r#"```json
[
  {"key": "a", "value": "1"},
  {"key": "b", "value": "2", "confidence": 2.5, "category": "decision"},
  {"key": "", "value": "dropped"},
  {"key": "c", "value": "3"},
  {"key": "d", "value": "4"},
  {"key": "e", "value": "5"},
  {"key": "f", "value": "6"}
]
```"#;
        let facts = parse_facts(raw);
        assert_eq!(facts.len(), 5);
        assert_eq!(facts[0].category, MemoryCategory::Context);
        assert_eq!(facts[0].confidence, 1.0);
        assert_eq!(facts[1].category, MemoryCategory::Decision);
        assert_eq!(facts[1].confidence, 1.0, "confidence clamps to [0,1]");
        assert!(parse_facts("not json").is_empty());
    }

    /// **Scenario**: the injection block lists category-tagged values.
    #[test]
    fn injection_block_format() {
        let memory = AgentMemory {
            agent_id: "a".into(),
            user_id: "u".into(),
            key: "k".into(),
            value: "prefers dark mode".into(),
            category: MemoryCategory::Preference,
            confidence: 1.0,
            source_session_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let block = memory_injection_block(&[memory]);
        assert!(block.starts_with("\n\n## What I know about you:\n"));
        assert!(block.contains("- [preference] prefers dark mode"));
        assert!(memory_injection_block(&[]).is_empty());
    }
}
