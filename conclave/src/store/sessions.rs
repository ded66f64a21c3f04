//! Session rows: binding, token totals, memory-processed flag.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::entity::{Session, SessionBinding};
use crate::store::{sql_to_ts, ts_to_sql, SqliteStore, StoreError};

fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
    let entity_type: String = row.get("entity_type")?;
    let entity_id: String = row.get("entity_id")?;
    let binding = if entity_type == "team" {
        SessionBinding::Team(entity_id)
    } else {
        SessionBinding::Agent(entity_id)
    };
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(Session {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        binding,
        title: row.get("title")?,
        total_input_tokens: row.get::<_, i64>("total_input_tokens")? as u64,
        total_output_tokens: row.get::<_, i64>("total_output_tokens")? as u64,
        memory_processed: row.get::<_, i64>("memory_processed")? != 0,
        created_at: sql_to_ts(&created),
        updated_at: sql_to_ts(&updated),
    })
}

impl SqliteStore {
    pub async fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        let s = session.clone();
        self.with_conn(move |conn| {
            let (entity_type, entity_id) = match &s.binding {
                SessionBinding::Agent(id) => ("agent", id.clone()),
                SessionBinding::Team(id) => ("team", id.clone()),
            };
            conn.execute(
                "INSERT OR REPLACE INTO sessions
                 (id, owner_id, entity_type, entity_id, title, total_input_tokens,
                  total_output_tokens, memory_processed, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    s.id,
                    s.owner_id,
                    entity_type,
                    entity_id,
                    s.title,
                    s.total_input_tokens as i64,
                    s.total_output_tokens as i64,
                    s.memory_processed as i64,
                    ts_to_sql(s.created_at),
                    ts_to_sql(s.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM sessions WHERE id = ?1",
                    params![id],
                    row_to_session,
                )
                .optional()?)
        })
        .await
    }

    /// Adds one turn's usage to the running totals and returns the new
    /// `(total_input, total_output)`.
    pub async fn add_session_tokens(
        &self,
        session_id: &str,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Result<(u64, u64), StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET
                   total_input_tokens = total_input_tokens + ?2,
                   total_output_tokens = total_output_tokens + ?3,
                   updated_at = ?4
                 WHERE id = ?1",
                params![
                    id,
                    input_tokens as i64,
                    output_tokens as i64,
                    ts_to_sql(Utc::now())
                ],
            )?;
            let totals = conn.query_row(
                "SELECT total_input_tokens, total_output_tokens FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                    ))
                },
            )?;
            Ok(totals)
        })
        .await
    }

    pub async fn set_memory_processed(
        &self,
        session_id: &str,
        processed: bool,
    ) -> Result<(), StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET memory_processed = ?2 WHERE id = ?1",
                params![id, processed as i64],
            )?;
            Ok(())
        })
        .await
    }

    /// Most recently updated unprocessed agent session for `(agent, user)`,
    /// excluding the current one. Drives background memory reflection.
    pub async fn latest_unprocessed_session(
        &self,
        agent_id: &str,
        user_id: &str,
        exclude_session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        let agent_id = agent_id.to_string();
        let user_id = user_id.to_string();
        let exclude = exclude_session_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM sessions
                     WHERE entity_type = 'agent' AND entity_id = ?1 AND owner_id = ?2
                       AND memory_processed = 0 AND id != ?3
                     ORDER BY updated_at DESC LIMIT 1",
                    params![agent_id, user_id, exclude],
                    row_to_session,
                )
                .optional()?)
        })
        .await
    }

    /// Removes a session and its dependent rows. The caller is responsible
    /// for running a final memory reflection first when required.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
            tx.execute("DELETE FROM attachments WHERE session_id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM hitl_approvals WHERE session_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM tool_proposals WHERE session_id = ?1",
                params![id],
            )?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::new_id;

    fn session(id: &str, agent: &str, processed: bool) -> Session {
        Session {
            id: id.into(),
            owner_id: "u1".into(),
            binding: SessionBinding::Agent(agent.into()),
            title: String::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
            memory_processed: processed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// **Scenario**: token totals accumulate across turns.
    #[tokio::test]
    async fn token_totals_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.put_session(&session("s1", "a1", false)).await.unwrap();

        let (i, o) = store.add_session_tokens("s1", 10, 5).await.unwrap();
        assert_eq!((i, o), (10, 5));
        let (i, o) = store.add_session_tokens("s1", 7, 3).await.unwrap();
        assert_eq!((i, o), (17, 8));

        let back = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(back.total_input_tokens, 17);
    }

    /// **Scenario**: reflection lookup skips the current session and
    /// processed ones.
    #[tokio::test]
    async fn latest_unprocessed_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.put_session(&session("cur", "a1", false)).await.unwrap();
        store.put_session(&session("old", "a1", false)).await.unwrap();
        store.put_session(&session("done", "a1", true)).await.unwrap();
        store.put_session(&session(&new_id(), "a2", false)).await.unwrap();

        let found = store
            .latest_unprocessed_session("a1", "u1", "cur")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "old");

        store.set_memory_processed("old", true).await.unwrap();
        assert!(store
            .latest_unprocessed_session("a1", "u1", "cur")
            .await
            .unwrap()
            .is_none());
    }

    /// **Scenario**: binding round-trips through entity_type/entity_id columns.
    #[tokio::test]
    async fn team_binding_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        let mut s = session("s2", "ignored", false);
        s.binding = SessionBinding::Team("team-9".into());
        store.put_session(&s).await.unwrap();
        let back = store.get_session("s2").await.unwrap().unwrap();
        assert_eq!(back.binding, SessionBinding::Team("team-9".into()));
    }
}
