//! HITL approval and tool proposal rows.
//!
//! Resolution is guarded: a row transitions out of `pending` exactly once.
//! Resolving an already-resolved (or unknown) row returns
//! [`StoreError::NotFound`], which the router surfaces as 404.

use rusqlite::{params, OptionalExtension, Row};

use crate::entity::{ApprovalStatus, HandlerKind, HitlApproval, ProposalStatus, ToolProposal};
use crate::store::{sql_to_ts, ts_to_sql, SqliteStore, StoreError};

fn approval_status_str(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Denied => "denied",
    }
}

fn parse_approval_status(s: &str) -> ApprovalStatus {
    match s {
        "approved" => ApprovalStatus::Approved,
        "denied" => ApprovalStatus::Denied,
        _ => ApprovalStatus::Pending,
    }
}

fn proposal_status_str(status: ProposalStatus) -> &'static str {
    match status {
        ProposalStatus::Pending => "pending",
        ProposalStatus::Approved => "approved",
        ProposalStatus::Rejected => "rejected",
    }
}

fn parse_proposal_status(s: &str) -> ProposalStatus {
    match s {
        "approved" => ProposalStatus::Approved,
        "rejected" => ProposalStatus::Rejected,
        _ => ProposalStatus::Pending,
    }
}

fn row_to_approval(row: &Row) -> rusqlite::Result<HitlApproval> {
    let status: String = row.get("status")?;
    let created: String = row.get("created_at")?;
    Ok(HitlApproval {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        tool_call_id: row.get("tool_call_id")?,
        tool_name: row.get("tool_name")?,
        tool_arguments: row.get("tool_arguments")?,
        status: parse_approval_status(&status),
        created_at: sql_to_ts(&created),
    })
}

fn row_to_proposal(row: &Row) -> rusqlite::Result<ToolProposal> {
    let status: String = row.get("status")?;
    let handler: String = row.get("handler_kind")?;
    let parameters: String = row.get("parameters")?;
    let handler_config: Option<String> = row.get("handler_config")?;
    let created: String = row.get("created_at")?;
    Ok(ToolProposal {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        tool_call_id: row.get("tool_call_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        handler_kind: if handler == "http" {
            HandlerKind::Http
        } else {
            HandlerKind::Python
        },
        parameters: serde_json::from_str(&parameters).unwrap_or_default(),
        handler_config: handler_config.and_then(|s| serde_json::from_str(&s).ok()),
        status: parse_proposal_status(&status),
        tool_id: row.get("tool_id")?,
        created_at: sql_to_ts(&created),
    })
}

impl SqliteStore {
    pub async fn insert_hitl_approval(&self, approval: &HitlApproval) -> Result<(), StoreError> {
        let a = approval.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO hitl_approvals
                 (id, session_id, tool_call_id, tool_name, tool_arguments, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    a.id,
                    a.session_id,
                    a.tool_call_id,
                    a.tool_name,
                    a.tool_arguments,
                    approval_status_str(a.status),
                    ts_to_sql(a.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_hitl_approval(&self, id: &str) -> Result<Option<HitlApproval>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM hitl_approvals WHERE id = ?1",
                    params![id],
                    row_to_approval,
                )
                .optional()?)
        })
        .await
    }

    /// Transitions a pending approval to `status`. NotFound when the row is
    /// missing or already resolved.
    pub async fn resolve_hitl_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
    ) -> Result<HitlApproval, StoreError> {
        let key = id.to_string();
        let updated = self
            .with_conn({
                let key = key.clone();
                move |conn| {
                    let n = conn.execute(
                        "UPDATE hitl_approvals SET status = ?2
                         WHERE id = ?1 AND status = 'pending'",
                        params![key, approval_status_str(status)],
                    )?;
                    Ok(n)
                }
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "pending approval {} not found",
                key
            )));
        }
        self.get_hitl_approval(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("approval {} not found", key)))
    }

    pub async fn insert_tool_proposal(&self, proposal: &ToolProposal) -> Result<(), StoreError> {
        let p = proposal.clone();
        let parameters = serde_json::to_string(&p.parameters)?;
        let handler_config = p
            .handler_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tool_proposals
                 (id, session_id, tool_call_id, name, description, handler_kind,
                  parameters, handler_config, status, tool_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    p.id,
                    p.session_id,
                    p.tool_call_id,
                    p.name,
                    p.description,
                    p.handler_kind.as_str(),
                    parameters,
                    handler_config,
                    proposal_status_str(p.status),
                    p.tool_id,
                    ts_to_sql(p.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_tool_proposal(&self, id: &str) -> Result<Option<ToolProposal>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM tool_proposals WHERE id = ?1",
                    params![id],
                    row_to_proposal,
                )
                .optional()?)
        })
        .await
    }

    /// Transitions a pending proposal to `status`, optionally recording the
    /// tool definition it produced. NotFound when missing or already resolved.
    pub async fn resolve_tool_proposal(
        &self,
        id: &str,
        status: ProposalStatus,
        tool_id: Option<String>,
    ) -> Result<ToolProposal, StoreError> {
        let key = id.to_string();
        let updated = self
            .with_conn({
                let key = key.clone();
                move |conn| {
                    let n = conn.execute(
                        "UPDATE tool_proposals SET status = ?2, tool_id = ?3
                         WHERE id = ?1 AND status = 'pending'",
                        params![key, proposal_status_str(status), tool_id],
                    )?;
                    Ok(n)
                }
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "pending proposal {} not found",
                key
            )));
        }
        self.get_tool_proposal(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("proposal {} not found", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approval(id: &str) -> HitlApproval {
        HitlApproval {
            id: id.into(),
            session_id: "s1".into(),
            tool_call_id: "call_1".into(),
            tool_name: "send_email".into(),
            tool_arguments: r#"{"to": "bob@x"}"#.into(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// **Scenario**: resolving a pending approval succeeds exactly once; the
    /// second attempt is NotFound (the 404 path).
    #[tokio::test]
    async fn resolve_approval_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.insert_hitl_approval(&approval("ap1")).await.unwrap();

        let resolved = store
            .resolve_hitl_approval("ap1", ApprovalStatus::Denied)
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Denied);

        let err = store
            .resolve_hitl_approval("ap1", ApprovalStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    /// **Scenario**: startup recovery denies/rejects all pending rows.
    #[tokio::test]
    async fn recover_pending_denies_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        store.insert_hitl_approval(&approval("ap1")).await.unwrap();
        store
            .insert_tool_proposal(&ToolProposal {
                id: "tp1".into(),
                session_id: "s1".into(),
                tool_call_id: "call_2".into(),
                name: "reverse_string".into(),
                description: None,
                handler_kind: HandlerKind::Python,
                parameters: serde_json::json!({"type": "object"}),
                handler_config: None,
                status: ProposalStatus::Pending,
                tool_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(store.recover_pending().await.unwrap(), (1, 1));
        let ap = store.get_hitl_approval("ap1").await.unwrap().unwrap();
        assert_eq!(ap.status, ApprovalStatus::Denied);
        let tp = store.get_tool_proposal("tp1").await.unwrap().unwrap();
        assert_eq!(tp.status, ProposalStatus::Rejected);
    }

    /// **Scenario**: proposal handler config round-trips as JSON.
    #[tokio::test]
    async fn proposal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).unwrap();
        let p = ToolProposal {
            id: "tp2".into(),
            session_id: "s1".into(),
            tool_call_id: "call_3".into(),
            name: "fetch".into(),
            description: Some("http fetch".into()),
            handler_kind: HandlerKind::Http,
            parameters: serde_json::json!({"type": "object"}),
            handler_config: Some(serde_json::json!({"url": "https://api.example.com"})),
            status: ProposalStatus::Pending,
            tool_id: None,
            created_at: Utc::now(),
        };
        store.insert_tool_proposal(&p).await.unwrap();
        let back = store.get_tool_proposal("tp2").await.unwrap().unwrap();
        assert_eq!(back.handler_kind, HandlerKind::Http);
        assert_eq!(
            back.handler_config.unwrap()["url"],
            "https://api.example.com"
        );
    }
}
