//! Message rows and attachments.

use rusqlite::{params, Row};

use crate::entity::{Attachment, MessageMetadata, StoredMessage};
use crate::message::{MessageContent, Role};
use crate::store::{sql_to_ts, ts_to_sql, SqliteStore, StoreError};

fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get("role")?;
    let content: String = row.get("content")?;
    let reasoning: Option<String> = row.get("reasoning")?;
    let metadata: Option<String> = row.get("metadata")?;
    let attachment_ids: Option<String> = row.get("attachment_ids")?;
    let created: String = row.get("created_at")?;
    Ok(StoredMessage {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        role: role.parse().unwrap_or(Role::User),
        content: serde_json::from_str(&content)
            .unwrap_or_else(|_| MessageContent::Text(content.clone())),
        agent_id: row.get("agent_id")?,
        reasoning: reasoning.and_then(|s| serde_json::from_str(&s).ok()),
        metadata: metadata
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(MessageMetadata::default),
        attachment_ids: attachment_ids.and_then(|s| serde_json::from_str(&s).ok()),
        rating: row.get("rating")?,
        created_at: sql_to_ts(&created),
    })
}

impl SqliteStore {
    pub async fn insert_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let m = message.clone();
        let content = serde_json::to_string(&m.content)?;
        let reasoning = m
            .reasoning
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = serde_json::to_string(&m.metadata)?;
        let attachment_ids = m
            .attachment_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages
                 (id, session_id, role, content, agent_id, reasoning, metadata,
                  attachment_ids, rating, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    m.id,
                    m.session_id,
                    m.role.as_str(),
                    content,
                    m.agent_id,
                    reasoning,
                    metadata,
                    attachment_ids,
                    m.rating,
                    ts_to_sql(m.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// All messages of a session, oldest first.
    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![id], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// The most recent `limit` user/assistant messages, oldest first.
    /// Reflection input.
    pub async fn recent_dialogue(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages
                 WHERE session_id = ?1 AND role IN ('user', 'assistant')
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt
                .query_map(params![id, limit as i64], row_to_message)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    pub async fn put_attachment(&self, attachment: &Attachment) -> Result<(), StoreError> {
        let a = attachment.clone();
        let data = serde_json::to_string(&a)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO attachments (id, session_id, owner_id, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![a.id, a.session_id, a.owner_id, data],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn msg(session: &str, role: Role, text: &str, at_offset_secs: i64) -> StoredMessage {
        StoredMessage {
            id: crate::entity::new_id(),
            session_id: session.into(),
            role,
            content: MessageContent::Text(text.into()),
            agent_id: None,
            reasoning: None,
            metadata: MessageMetadata::default(),
            attachment_ids: None,
            rating: None,
            created_at: Utc::now() + Duration::seconds(at_offset_secs),
        }
    }

    /// **Scenario**: messages list in chronological order with content intact.
    #[tokio::test]
    async fn list_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.insert_message(&msg("s1", Role::User, "one", 0)).await.unwrap();
        store
            .insert_message(&msg("s1", Role::Assistant, "two", 1))
            .await
            .unwrap();
        store.insert_message(&msg("s2", Role::User, "other", 2)).await.unwrap();

        let messages = store.list_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content.text(), "one");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    /// **Scenario**: recent_dialogue keeps the newest N, excludes system rows,
    /// and returns oldest-first.
    #[tokio::test]
    async fn recent_dialogue_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        for i in 0..5 {
            store
                .insert_message(&msg("s1", Role::User, &format!("m{}", i), i))
                .await
                .unwrap();
        }
        store
            .insert_message(&msg("s1", Role::System, "compacted", 6))
            .await
            .unwrap();

        let recent = store.recent_dialogue("s1", 3).await.unwrap();
        assert_eq!(
            recent.iter().map(|m| m.content.text()).collect::<Vec<_>>(),
            vec!["m2", "m3", "m4"]
        );
    }

    /// **Scenario**: metadata and reasoning survive the round trip.
    #[tokio::test]
    async fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        let mut m = msg("s1", Role::Assistant, "hi", 0);
        m.metadata = MessageMetadata {
            model: Some("gpt-4o".into()),
            latency_ms: Some(42),
            ..Default::default()
        };
        m.reasoning = Some(serde_json::json!([{"type": "thinking", "content": "hmm"}]));
        store.insert_message(&m).await.unwrap();

        let back = store.list_messages("s1").await.unwrap().remove(0);
        assert_eq!(back.metadata.model.as_deref(), Some("gpt-4o"));
        assert_eq!(back.reasoning.unwrap()[0]["content"], "hmm");
    }
}
