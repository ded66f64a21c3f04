//! Durable cron engine: one job per workflow schedule.
//!
//! Schedules live in the store; the scheduler re-registers every active one
//! on startup and keeps one timer task per schedule. Job semantics follow
//! the classic cron-runner defaults: missed firings coalesce into one, a
//! firing more than the grace window late is skipped, and at most one
//! instance per schedule runs at a time (the timer task itself awaits the
//! run). Fired jobs execute the non-streaming workflow variant, which still
//! writes trace spans, then update `last_run_at`/`next_run_at`.
//!
//! Single-process by design: nothing arbitrates between two schedulers
//! sharing a store.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::entity::workflow::WorkflowSchedule;
use crate::error::EngineError;
use crate::store::SqliteStore;
use crate::workflow::WorkflowExecutor;

/// Firings later than this are skipped rather than run.
const MISFIRE_GRACE_SECS: i64 = 60;

/// Parses a 5-field POSIX cron expression.
///
/// The underlying schedule type wants a seconds field; a literal `0` is
/// prepended so `* * * * *` means "every minute at :00".
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, EngineError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(EngineError::Validation(format!(
            "expected 5-field cron expression, got: {:?}",
            expression
        )));
    }
    cron::Schedule::from_str(&format!("0 {}", expression))
        .map_err(|e| EngineError::Validation(format!("invalid cron expression: {}", e)))
}

/// Next fire time strictly after `after`.
pub fn next_fire(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, EngineError> {
    let schedule = parse_cron(expression)?;
    Ok(schedule.after(&after).next())
}

/// The scheduler: cron timers driving workflow runs.
pub struct Scheduler {
    store: Arc<SqliteStore>,
    executor: Arc<WorkflowExecutor>,
    jobs: DashMap<String, JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(store: Arc<SqliteStore>, executor: Arc<WorkflowExecutor>) -> Self {
        Self {
            store,
            executor,
            jobs: DashMap::new(),
        }
    }

    /// Registers one job per active schedule. Called once on process start.
    pub async fn start(&self) -> Result<usize, EngineError> {
        let schedules = self.store.list_active_schedules().await?;
        let count = schedules.len();
        for schedule in schedules {
            if let Err(e) = self.register(schedule).await {
                warn!(error = %e, "failed to register schedule");
            }
        }
        info!(jobs = count, "scheduler started");
        Ok(count)
    }

    /// Creates or replaces a schedule: validates the cron expression,
    /// persists the row, and (re)starts its timer task.
    pub async fn upsert_schedule(&self, schedule: WorkflowSchedule) -> Result<(), EngineError> {
        parse_cron(&schedule.cron_expression)?;
        let mut schedule = schedule;
        schedule.next_run_at = next_fire(&schedule.cron_expression, Utc::now())?;
        self.store.put_schedule(&schedule).await?;
        self.unregister(&schedule.id);
        if schedule.is_active {
            self.register(schedule).await?;
        }
        Ok(())
    }

    /// Removes a schedule and stops its job.
    pub async fn remove_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
        self.unregister(schedule_id);
        self.store.delete_schedule(schedule_id).await?;
        Ok(())
    }

    fn unregister(&self, schedule_id: &str) {
        if let Some((_, handle)) = self.jobs.remove(schedule_id) {
            handle.abort();
        }
    }

    /// True while a timer task exists for this schedule.
    pub fn is_registered(&self, schedule_id: &str) -> bool {
        self.jobs.contains_key(schedule_id)
    }

    async fn register(&self, schedule: WorkflowSchedule) -> Result<(), EngineError> {
        let cron_schedule = parse_cron(&schedule.cron_expression)?;
        let store = self.store.clone();
        let executor = self.executor.clone();
        let schedule_id = schedule.id.clone();

        let handle = tokio::spawn(async move {
            loop {
                // Compute the next fire from *now*: anything missed while the
                // previous run was in flight coalesces into this one target.
                let Some(target) = cron_schedule.after(&Utc::now()).next() else {
                    warn!(schedule = %schedule.id, "cron schedule yields no future firings");
                    return;
                };
                let _ = store
                    .set_schedule_runs(&schedule.id, schedule_last_run(&store, &schedule.id).await, Some(target))
                    .await;

                let wait = (target - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                // Skip firings outside the grace window (suspended laptop,
                // long store stall) rather than running them late.
                let lateness = Utc::now() - target;
                if lateness.num_seconds() > MISFIRE_GRACE_SECS {
                    warn!(schedule = %schedule.id, late_secs = lateness.num_seconds(), "skipping misfired run");
                    continue;
                }

                // Re-read so deactivated rows stop firing without a restart.
                match store.get_schedule(&schedule.id).await {
                    Ok(Some(current)) if current.is_active => {
                        info!(schedule = %schedule.id, workflow = %current.workflow_id, "firing scheduled workflow");
                        let result = executor
                            .run_workflow_blocking(
                                &current.owner_id,
                                &current.workflow_id,
                                current.input.clone(),
                            )
                            .await;
                        if let Err(e) = &result {
                            warn!(schedule = %schedule.id, error = %e, "scheduled run failed");
                        }
                        let next = cron_schedule.after(&Utc::now()).next();
                        let _ = store
                            .set_schedule_runs(&schedule.id, Some(Utc::now()), next)
                            .await;
                    }
                    Ok(Some(_)) | Ok(None) => {
                        info!(schedule = %schedule.id, "schedule gone or inactive; stopping job");
                        return;
                    }
                    Err(e) => {
                        warn!(schedule = %schedule.id, error = %e, "schedule lookup failed");
                    }
                }
            }
        });
        self.jobs.insert(schedule_id, handle);
        Ok(())
    }
}

async fn schedule_last_run(store: &Arc<SqliteStore>, id: &str) -> Option<DateTime<Utc>> {
    store
        .get_schedule(id)
        .await
        .ok()
        .flatten()
        .and_then(|s| s.last_run_at)
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.jobs.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// **Scenario**: 5-field expressions parse; other arities are rejected.
    #[test]
    fn parse_cron_arity() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9 * * 1-5").is_ok());
        assert!(matches!(
            parse_cron("* * * *"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            parse_cron("0 * * * * *"),
            Err(EngineError::Validation(_))
        ));
        assert!(parse_cron("61 * * * *").is_err());
    }

    /// **Scenario**: next_fire lands on the expected wall-clock minute.
    #[test]
    fn next_fire_weekday_morning() {
        // 2026-01-01 is a Thursday.
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let next = next_fire("0 9 * * 1-5", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap());

        // Friday 10:00 rolls over the weekend to Monday.
        let after = Utc.with_ymd_and_hms(2026, 1, 2, 10, 0, 0).unwrap();
        let next = next_fire("0 9 * * 1-5", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
    }

    /// **Scenario**: every-minute schedules fire at second zero.
    #[test]
    fn next_fire_every_minute() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 15).unwrap();
        let next = next_fire("* * * * *", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 31, 0).unwrap());
    }
}
