//! Workflow definitions, run snapshots, and schedules.

use rusqlite::{params, OptionalExtension, Row};

use crate::entity::workflow::{validate_acyclic, RunStatus, Workflow, WorkflowRun, WorkflowSchedule};
use crate::store::{sql_to_ts, ts_to_sql, SqliteStore, StoreError};

fn parse_run_status(s: &str) -> RunStatus {
    match s {
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Running,
    }
}

fn row_to_run(row: &Row) -> rusqlite::Result<WorkflowRun> {
    let status: String = row.get("status")?;
    let steps: String = row.get("steps")?;
    let created: String = row.get("created_at")?;
    let completed: Option<String> = row.get("completed_at")?;
    Ok(WorkflowRun {
        id: row.get("id")?,
        workflow_id: row.get("workflow_id")?,
        owner_id: row.get("owner_id")?,
        session_id: row.get("session_id")?,
        status: parse_run_status(&status),
        steps: serde_json::from_str(&steps).unwrap_or_default(),
        input: row.get("input")?,
        final_output: row.get("final_output")?,
        error: row.get("error")?,
        created_at: sql_to_ts(&created),
        completed_at: completed.map(|s| sql_to_ts(&s)),
    })
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<WorkflowSchedule> {
    let last: Option<String> = row.get("last_run_at")?;
    let next: Option<String> = row.get("next_run_at")?;
    Ok(WorkflowSchedule {
        id: row.get("id")?,
        workflow_id: row.get("workflow_id")?,
        owner_id: row.get("owner_id")?,
        cron_expression: row.get("cron_expression")?,
        input: row.get("input")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        last_run_at: last.map(|s| sql_to_ts(&s)),
        next_run_at: next.map(|s| sql_to_ts(&s)),
    })
}

impl SqliteStore {
    /// Saves a workflow after validating that its step ids form a DAG.
    pub async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        validate_acyclic(&workflow.steps).map_err(StoreError::Storage)?;
        let id = workflow.id.clone();
        let owner = workflow.owner_id.clone();
        let data = serde_json::to_string(workflow)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO workflows (id, owner_id, data) VALUES (?1, ?2, ?3)",
                params![id, owner, data],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let id = id.to_string();
        let data: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM workflows WHERE id = ?1",
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

    /// Writes the whole run row; the executor calls this on every snapshot
    /// change so reconnecting clients can read current state.
    pub async fn put_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let r = run.clone();
        let steps = serde_json::to_string(&r.steps)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO workflow_runs
                 (id, workflow_id, owner_id, session_id, status, steps, input,
                  final_output, error, created_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    r.id,
                    r.workflow_id,
                    r.owner_id,
                    r.session_id,
                    r.status.as_str(),
                    steps,
                    r.input,
                    r.final_output,
                    r.error,
                    ts_to_sql(r.created_at),
                    r.completed_at.map(ts_to_sql),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM workflow_runs WHERE id = ?1",
                    params![id],
                    row_to_run,
                )
                .optional()?)
        })
        .await
    }

    pub async fn put_schedule(&self, schedule: &WorkflowSchedule) -> Result<(), StoreError> {
        let s = schedule.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO workflow_schedules
                 (id, workflow_id, owner_id, cron_expression, input, is_active,
                  last_run_at, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    s.id,
                    s.workflow_id,
                    s.owner_id,
                    s.cron_expression,
                    s.input,
                    s.is_active as i64,
                    s.last_run_at.map(ts_to_sql),
                    s.next_run_at.map(ts_to_sql),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<WorkflowSchedule>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM workflow_schedules WHERE id = ?1",
                    params![id],
                    row_to_schedule,
                )
                .optional()?)
        })
        .await
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM workflow_schedules WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    /// Active schedules, for startup re-registration.
    pub async fn list_active_schedules(&self) -> Result<Vec<WorkflowSchedule>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM workflow_schedules WHERE is_active = 1")?;
            let rows = stmt
                .query_map([], row_to_schedule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn set_schedule_runs(
        &self,
        id: &str,
        last_run_at: Option<chrono::DateTime<chrono::Utc>>,
        next_run_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE workflow_schedules SET last_run_at = ?2, next_run_at = ?3 WHERE id = ?1",
                params![id, last_run_at.map(ts_to_sql), next_run_at.map(ts_to_sql)],
            )?;
            Ok(())
        })
        .await
    }
}
