//! Agent memory rows: upsert by `(agent, user, key)`, capped with
//! low-confidence eviction.

use rusqlite::{params, Row};

use crate::entity::{AgentMemory, MemoryCategory};
use crate::store::{sql_to_ts, ts_to_sql, SqliteStore, StoreError};

fn row_to_memory(row: &Row) -> rusqlite::Result<AgentMemory> {
    let category: String = row.get("category")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(AgentMemory {
        agent_id: row.get("agent_id")?,
        user_id: row.get("user_id")?,
        key: row.get("key")?,
        value: row.get("value")?,
        category: category.parse().unwrap_or(MemoryCategory::Context),
        confidence: row.get("confidence")?,
        source_session_id: row.get("source_session_id")?,
        created_at: sql_to_ts(&created),
        updated_at: sql_to_ts(&updated),
    })
}

impl SqliteStore {
    /// Upserts one fact; an existing `(agent, user, key)` row keeps its
    /// `created_at` and takes the new value, category, confidence, and source.
    pub async fn upsert_memory(&self, memory: &AgentMemory) -> Result<(), StoreError> {
        let m = memory.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO agent_memories
                 (agent_id, user_id, key, value, category, confidence,
                  source_session_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT (agent_id, user_id, key) DO UPDATE SET
                   value = excluded.value,
                   category = excluded.category,
                   confidence = excluded.confidence,
                   source_session_id = excluded.source_session_id,
                   updated_at = excluded.updated_at",
                params![
                    m.agent_id,
                    m.user_id,
                    m.key,
                    m.value,
                    m.category.as_str(),
                    m.confidence,
                    m.source_session_id,
                    ts_to_sql(m.created_at),
                    ts_to_sql(m.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Facts for `(agent, user)`, newest first, optionally limited.
    pub async fn list_memories(
        &self,
        agent_id: &str,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AgentMemory>, StoreError> {
        let agent_id = agent_id.to_string();
        let user_id = user_id.to_string();
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM agent_memories
                 WHERE agent_id = ?1 AND user_id = ?2
                 ORDER BY created_at DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![agent_id, user_id, limit], row_to_memory)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn count_memories(&self, agent_id: &str, user_id: &str) -> Result<usize, StoreError> {
        let agent_id = agent_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM agent_memories WHERE agent_id = ?1 AND user_id = ?2",
                params![agent_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// Deletes up to `count` memories with confidence below 0.5, oldest
    /// first. Returns how many were removed.
    pub async fn evict_low_confidence(
        &self,
        agent_id: &str,
        user_id: &str,
        count: usize,
    ) -> Result<usize, StoreError> {
        let agent_id = agent_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM agent_memories WHERE rowid IN (
                     SELECT rowid FROM agent_memories
                     WHERE agent_id = ?1 AND user_id = ?2 AND confidence < 0.5
                     ORDER BY created_at ASC LIMIT ?3
                 )",
                params![agent_id, user_id, count as i64],
            )?;
            Ok(removed)
        })
        .await
    }
}
