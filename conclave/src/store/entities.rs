//! JSON-blob entity rows: users, providers, agents, teams, MCP servers,
//! tools, knowledge bases.
//!
//! Tools additionally carry real `owner_id`/`name` columns to enforce the
//! per-owner name uniqueness that proposal approval upserts against.

use rusqlite::{params, OptionalExtension};

use crate::entity::{
    Agent, KbDocument, KnowledgeBase, McpServer, ProviderConfig, Team, ToolDefinition, User,
};
use crate::store::{SqliteStore, StoreError};

macro_rules! blob_accessors {
    ($put:ident, $get:ident, $table:literal, $ty:ty) => {
        pub async fn $put(&self, entity: &$ty) -> Result<(), StoreError> {
            let id = entity.id.clone();
            let owner = entity.owner_id.clone();
            let data = serde_json::to_string(entity)?;
            self.with_conn(move |conn| {
                conn.execute(
                    concat!(
                        "INSERT OR REPLACE INTO ",
                        $table,
                        " (id, owner_id, data) VALUES (?1, ?2, ?3)"
                    ),
                    params![id, owner, data],
                )?;
                Ok(())
            })
            .await
        }

        pub async fn $get(&self, id: &str) -> Result<Option<$ty>, StoreError> {
            let id = id.to_string();
            let data: Option<String> = self
                .with_conn(move |conn| {
                    Ok(conn
                        .query_row(
                            concat!("SELECT data FROM ", $table, " WHERE id = ?1"),
                            params![id],
                            |row| row.get(0),
                        )
                        .optional()?)
                })
                .await?;
            match data {
                Some(s) => Ok(Some(serde_json::from_str(&s)?)),
                None => Ok(None),
            }
        }
    };
}

impl SqliteStore {
    blob_accessors!(put_provider, get_provider, "providers", ProviderConfig);
    blob_accessors!(put_agent, get_agent, "agents", Agent);
    blob_accessors!(put_team, get_team, "teams", Team);
    blob_accessors!(put_mcp_server, get_mcp_server, "mcp_servers", McpServer);
    blob_accessors!(
        put_knowledge_base,
        get_knowledge_base,
        "knowledge_bases",
        KnowledgeBase
    );

    pub async fn put_user(&self, user: &User) -> Result<(), StoreError> {
        let id = user.id.clone();
        let data = serde_json::to_string(user)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO users (id, data) VALUES (?1, ?2)",
                params![id, data],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let id = id.to_string();
        let data: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM users WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a tool by id.
    pub async fn put_tool(&self, tool: &ToolDefinition) -> Result<(), StoreError> {
        let id = tool.id.clone();
        let owner = tool.owner_id.clone();
        let name = tool.name.clone();
        let active = tool.is_active;
        let data = serde_json::to_string(tool)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tools (id, owner_id, name, is_active, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, owner, name, active as i64, data],
            )?;
            Ok(())
        })
        .await
    }

    /// Upserts by `(owner_id, name)`, keeping the existing id when the name is
    /// already taken. Returns the stored definition (with the effective id).
    pub async fn upsert_tool_by_name(
        &self,
        tool: &ToolDefinition,
    ) -> Result<ToolDefinition, StoreError> {
        let mut tool = tool.clone();
        if let Some(existing) = self.get_tool_by_name(&tool.owner_id, &tool.name).await? {
            tool.id = existing.id;
        }
        self.put_tool(&tool).await?;
        Ok(tool)
    }

    pub async fn get_tool(&self, id: &str) -> Result<Option<ToolDefinition>, StoreError> {
        let id = id.to_string();
        let data: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT data FROM tools WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Active tool with this exact name, scoped to one owner.
    pub async fn get_tool_by_name(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<ToolDefinition>, StoreError> {
        let owner_id = owner_id.to_string();
        let name = name.to_string();
        let data: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM tools
                         WHERE owner_id = ?1 AND name = ?2 AND is_active = 1",
                        params![owner_id, name],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Active tools among the given ids, in id-list order.
    pub async fn get_tools_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<ToolDefinition>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(tool) = self.get_tool(id).await? {
                if tool.is_active {
                    out.push(tool);
                }
            }
        }
        Ok(out)
    }

    pub async fn put_kb_document(&self, doc: &KbDocument) -> Result<(), StoreError> {
        let id = doc.id.clone();
        let kb_id = doc.kb_id.clone();
        let indexed = doc.indexed;
        let data = serde_json::to_string(doc)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kb_documents (id, kb_id, indexed, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, kb_id, indexed as i64, data],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_kb_documents(&self, kb_id: &str) -> Result<Vec<KbDocument>, StoreError> {
        let kb_id = kb_id.to_string();
        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare("SELECT data FROM kb_documents WHERE kb_id = ?1")?;
                let rows = stmt
                    .query_map(params![kb_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .collect()
    }

    /// True when any document of this KB has been indexed.
    pub async fn kb_has_index(&self, kb_id: &str) -> Result<bool, StoreError> {
        let kb_id = kb_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kb_documents WHERE kb_id = ?1 AND indexed = 1",
                params![kb_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }
}
