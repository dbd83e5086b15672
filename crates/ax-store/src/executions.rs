//! Execution rows: dispatch upserts, worker status transitions, listings,
//! and the monthly KPI rollup.

use chrono::{DateTime, Utc};
use serde::Serialize;

use ax_core::types::{Execution, ExecutionStatus, TestRecord};

use crate::store::{enum_from_sql, enum_to_sql, StoreDb};
use crate::tenants::parse_ts;
use crate::StoreError;

const EXECUTION_COLS: &str = "task_id, org_id, source, status, image, command, folder, \
     start_time, end_time, config, tests, output, trigger_kind, group_name, batch_id, \
     cycle_id, cycle_item_id, ingest_meta, deleted_at";

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        task_id: row.get(0)?,
        org_id: row.get(1)?,
        source: enum_from_sql(&row.get::<_, String>(2)?),
        status: enum_from_sql(&row.get::<_, String>(3)?),
        image: row.get(4)?,
        command: row.get(5)?,
        folder: row.get(6)?,
        start_time: parse_ts(&row.get::<_, String>(7)?),
        end_time: row.get::<_, Option<String>>(8)?.map(|s| parse_ts(&s)),
        config: serde_json::from_str(&row.get::<_, String>(9)?).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
        tests: serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default(),
        output: row.get(11)?,
        trigger: enum_from_sql(&row.get::<_, String>(12)?),
        group_name: row.get(13)?,
        batch_id: row.get(14)?,
        cycle_id: row.get(15)?,
        cycle_item_id: row.get(16)?,
        ingest_meta: row
            .get::<_, Option<String>>(17)?
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        deleted_at: row.get::<_, Option<String>>(18)?.map(|s| parse_ts(&s)),
    })
}

// ---------------------------------------------------------------------------
// Patch + KPI types
// ---------------------------------------------------------------------------

/// Partial update applied by worker callbacks and ingest teardown.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub tests: Option<Vec<TestRecord>>,
}

/// Monthly execution rollup for one organization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiReport {
    pub total_runs: u64,
    pub passed_runs: u64,
    pub finished_runs: u64,
    /// Percentage with one decimal, 0 when nothing finished.
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    /// `YYYY-MM`.
    pub period: String,
}

impl StoreDb {
    // -----------------------------------------------------------------------
    // Upsert + lookup
    // -----------------------------------------------------------------------

    /// Insert or replace by `(task_id, org_id)`.
    ///
    /// Re-dispatching an existing task id resets the row to the new PENDING
    /// state; workers de-duplicate by task id on their side.
    pub async fn upsert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let e = execution.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO executions
                     (task_id, org_id, source, status, image, command, folder, start_time,
                      end_time, config, tests, output, trigger_kind, group_name, batch_id,
                      cycle_id, cycle_item_id, ingest_meta, deleted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                             ?15, ?16, ?17, ?18, ?19)
                     ON CONFLICT(task_id, org_id) DO UPDATE SET
                        source = excluded.source,
                        status = excluded.status,
                        image = excluded.image,
                        command = excluded.command,
                        folder = excluded.folder,
                        start_time = excluded.start_time,
                        end_time = excluded.end_time,
                        config = excluded.config,
                        tests = excluded.tests,
                        output = excluded.output,
                        trigger_kind = excluded.trigger_kind,
                        group_name = excluded.group_name,
                        batch_id = excluded.batch_id,
                        cycle_id = excluded.cycle_id,
                        cycle_item_id = excluded.cycle_item_id,
                        ingest_meta = excluded.ingest_meta,
                        deleted_at = NULL",
                    rusqlite::params![
                        e.task_id,
                        e.org_id,
                        enum_to_sql(&e.source),
                        enum_to_sql(&e.status),
                        e.image,
                        e.command,
                        e.folder,
                        e.start_time.to_rfc3339(),
                        e.end_time.map(|t| t.to_rfc3339()),
                        serde_json::to_string(&e.config).expect("serialize config"),
                        serde_json::to_string(&e.tests).expect("serialize tests"),
                        e.output,
                        enum_to_sql(&e.trigger),
                        e.group_name,
                        e.batch_id,
                        e.cycle_id,
                        e.cycle_item_id,
                        e.ingest_meta
                            .as_ref()
                            .map(|m| serde_json::to_string(m).expect("serialize meta")),
                        e.deleted_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn get_execution(
        &self,
        org_id: &str,
        task_id: &str,
    ) -> Result<Execution, StoreError> {
        let (org_id, task_id) = (org_id.to_string(), task_id.to_string());
        self.conn
            .call(move |conn| {
                let execution = conn.query_row(
                    &format!(
                        "SELECT {EXECUTION_COLS} FROM executions
                         WHERE org_id = ?1 AND task_id = ?2 AND deleted_at IS NULL"
                    ),
                    [org_id, task_id],
                    execution_from_row,
                )?;
                Ok(execution)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Newest-first page of an organization's executions.
    pub async fn list_executions(
        &self,
        org_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Execution>, StoreError> {
        let org_id = org_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLS} FROM executions
                     WHERE org_id = ?1 AND deleted_at IS NULL
                     ORDER BY start_time DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt.query_map(
                    rusqlite::params![org_id, limit, offset],
                    execution_from_row,
                )?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Apply a worker/teardown patch and return the updated row.
    ///
    /// Terminal rows keep their status and end time; only the annotation
    /// fields (`output`, `tests`) still apply.
    pub async fn patch_execution(
        &self,
        org_id: &str,
        task_id: &str,
        patch: ExecutionPatch,
    ) -> Result<Execution, StoreError> {
        let (org_id, task_id) = (org_id.to_string(), task_id.to_string());
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut current = tx.query_row(
                    &format!(
                        "SELECT {EXECUTION_COLS} FROM executions
                         WHERE org_id = ?1 AND task_id = ?2 AND deleted_at IS NULL"
                    ),
                    [&org_id, &task_id],
                    execution_from_row,
                )?;

                let frozen = current.status.is_terminal();
                if !frozen {
                    if let Some(status) = patch.status {
                        current.status = status;
                    }
                    if let Some(end_time) = patch.end_time {
                        current.end_time = Some(end_time);
                    }
                }
                if let Some(output) = patch.output {
                    current.output = Some(output);
                }
                if let Some(tests) = patch.tests {
                    current.tests = tests;
                }

                tx.execute(
                    "UPDATE executions
                     SET status = ?1, end_time = ?2, output = ?3, tests = ?4
                     WHERE org_id = ?5 AND task_id = ?6",
                    rusqlite::params![
                        enum_to_sql(&current.status),
                        current.end_time.map(|t| t.to_rfc3339()),
                        current.output,
                        serde_json::to_string(&current.tests).expect("serialize tests"),
                        org_id,
                        task_id,
                    ],
                )?;
                tx.commit()?;
                Ok(current)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn soft_delete_execution(
        &self,
        org_id: &str,
        task_id: &str,
    ) -> Result<(), StoreError> {
        let (org_id, task_id) = (org_id.to_string(), task_id.to_string());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE executions SET deleted_at = ?1
                     WHERE org_id = ?2 AND task_id = ?3 AND deleted_at IS NULL",
                    rusqlite::params![Utc::now().to_rfc3339(), org_id, task_id],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Counters + KPIs
    // -----------------------------------------------------------------------

    /// Executions started at or after `since` (plan enforcement window).
    pub async fn count_runs_since(
        &self,
        org_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let org_id = org_id.to_string();
        let since = since.to_rfc3339();
        self.conn
            .call(move |conn| {
                let n: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM executions
                     WHERE org_id = ?1 AND start_time >= ?2 AND deleted_at IS NULL",
                    [org_id, since],
                    |row| row.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Monthly rollup over non-deleted executions starting at `month_start`.
    pub async fn kpis(
        &self,
        org_id: &str,
        month_start: DateTime<Utc>,
        period: &str,
    ) -> Result<KpiReport, StoreError> {
        let org_id = org_id.to_string();
        let since = month_start.to_rfc3339();
        let period = period.to_string();
        self.conn
            .call(move |conn| {
                let (total, passed, finished, avg_ms): (u64, u64, u64, Option<f64>) = conn
                    .query_row(
                        "SELECT
                            COUNT(*),
                            COUNT(*) FILTER (WHERE status = 'PASSED'),
                            COUNT(*) FILTER (WHERE status IN
                                ('PASSED', 'FAILED', 'ERROR', 'UNSTABLE')),
                            AVG((julianday(end_time) - julianday(start_time)) * 86400000.0)
                                FILTER (WHERE end_time IS NOT NULL)
                         FROM executions
                         WHERE org_id = ?1 AND start_time >= ?2 AND deleted_at IS NULL",
                        [org_id, since],
                        |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        },
                    )?;

                let success_rate = if finished == 0 {
                    0.0
                } else {
                    (passed as f64 / finished as f64 * 1000.0).round() / 10.0
                };

                Ok(KpiReport {
                    total_runs: total,
                    passed_runs: passed,
                    finished_runs: finished,
                    success_rate,
                    avg_duration_ms: avg_ms.unwrap_or(0.0).max(0.0).round() as u64,
                    period,
                })
            })
            .await
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::types::{
        Environment, ExecConfig, ExecutionSource, Organization, Plan, Trigger,
    };
    use chrono::Duration;

    fn execution(org_id: &str, task_id: &str) -> Execution {
        Execution {
            task_id: task_id.into(),
            org_id: org_id.into(),
            source: ExecutionSource::AgnoxHosted,
            status: ExecutionStatus::Pending,
            image: "agnox/runner:1".into(),
            command: "run".into(),
            folder: None,
            start_time: Utc::now(),
            end_time: None,
            config: ExecConfig::new(Environment::Staging),
            tests: vec![],
            output: None,
            trigger: Trigger::Manual,
            group_name: None,
            batch_id: None,
            cycle_id: None,
            cycle_item_id: None,
            ingest_meta: None,
            deleted_at: None,
        }
    }

    async fn db() -> StoreDb {
        let db = StoreDb::open_in_memory().await.unwrap();
        let org = Organization::new("Acme", "acme", Plan::Team);
        db.create_organization(&org).await.unwrap();
        db
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row() {
        let db = db().await;
        db.upsert_execution(&execution("org-a", "t1")).await.unwrap();
        db.upsert_execution(&execution("org-a", "t1")).await.unwrap();
        let listed = db.list_executions("org-a", 50, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn listing_is_org_scoped() {
        let db = db().await;
        db.upsert_execution(&execution("org-a", "t1")).await.unwrap();
        db.upsert_execution(&execution("org-b", "t2")).await.unwrap();

        let a = db.list_executions("org-a", 50, 0).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].task_id, "t1");
        assert!(matches!(
            db.get_execution("org-a", "t2").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn patch_transitions_and_freezes_terminal() {
        let db = db().await;
        db.upsert_execution(&execution("org-a", "t1")).await.unwrap();

        let updated = db
            .patch_execution(
                "org-a",
                "t1",
                ExecutionPatch {
                    status: Some(ExecutionStatus::Passed),
                    end_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ExecutionStatus::Passed);

        // A later status write must not thaw the terminal row…
        let frozen = db
            .patch_execution(
                "org-a",
                "t1",
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    output: Some("late logs".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // …but annotations still land.
        assert_eq!(frozen.status, ExecutionStatus::Passed);
        assert_eq!(frozen.output.as_deref(), Some("late logs"));
    }

    #[tokio::test]
    async fn soft_delete_hides_row() {
        let db = db().await;
        db.upsert_execution(&execution("org-a", "t1")).await.unwrap();
        db.soft_delete_execution("org-a", "t1").await.unwrap();
        assert!(db.list_executions("org-a", 50, 0).await.unwrap().is_empty());
        assert!(matches!(
            db.soft_delete_execution("org-a", "t1").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn cross_tenant_delete_is_not_found() {
        let db = db().await;
        db.upsert_execution(&execution("org-a", "t1")).await.unwrap();
        assert!(matches!(
            db.soft_delete_execution("org-b", "t1").await,
            Err(StoreError::NotFound)
        ));
        // Row unchanged.
        assert!(db.get_execution("org-a", "t1").await.is_ok());
    }

    #[tokio::test]
    async fn kpi_rollup_counts_and_rates() {
        let db = db().await;
        let month_start = Utc::now() - Duration::days(1);

        for (task, status) in [
            ("t1", ExecutionStatus::Passed),
            ("t2", ExecutionStatus::Passed),
            ("t3", ExecutionStatus::Failed),
            ("t4", ExecutionStatus::Running),
        ] {
            let mut e = execution("org-a", task);
            e.status = status;
            if status.is_terminal() {
                e.end_time = Some(e.start_time + Duration::seconds(10));
            }
            db.upsert_execution(&e).await.unwrap();
        }

        let kpi = db.kpis("org-a", month_start, "2026-08").await.unwrap();
        assert_eq!(kpi.total_runs, 4);
        assert_eq!(kpi.passed_runs, 2);
        assert_eq!(kpi.finished_runs, 3);
        assert_eq!(kpi.success_rate, 66.7);
        assert!(kpi.avg_duration_ms >= 9_000 && kpi.avg_duration_ms <= 11_000);
        assert_eq!(kpi.period, "2026-08");
    }

    #[tokio::test]
    async fn kpi_rollup_empty_org() {
        let db = db().await;
        let kpi = db
            .kpis("org-a", Utc::now() - Duration::days(1), "2026-08")
            .await
            .unwrap();
        assert_eq!(kpi.total_runs, 0);
        assert_eq!(kpi.success_rate, 0.0);
        assert_eq!(kpi.avg_duration_ms, 0);
    }

    #[tokio::test]
    async fn run_counter_respects_window() {
        let db = db().await;
        let mut old = execution("org-a", "old");
        old.start_time = Utc::now() - Duration::days(60);
        db.upsert_execution(&old).await.unwrap();
        db.upsert_execution(&execution("org-a", "new")).await.unwrap();

        let since = Utc::now() - Duration::days(30);
        assert_eq!(db.count_runs_since("org-a", since).await.unwrap(), 1);
    }
}
